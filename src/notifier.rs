// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Recharge Notifier
//!
//! Background task that delivers queued game recharge records to the game
//! backend and marks them notified.
//!
//! A record is marked only after its delivery succeeded; a failed delivery
//! stays queued and is retried on the next sweep, so the backend must treat
//! `recharge_id` as an idempotency key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CustodyResult;
use crate::storage::{GameRecharge, LedgerDb, RechargeRepository};

/// Default interval between notification sweeps.
const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_secs(10);

/// Records delivered per sweep.
const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
#[error("recharge notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivery channel to the game backend.
#[async_trait]
pub trait RechargeNotifier: Send + Sync {
    async fn notify(&self, recharge: &GameRecharge) -> Result<(), NotifyError>;
}

/// Notifier that only writes a structured log line per recharge.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl RechargeNotifier for LogNotifier {
    async fn notify(&self, recharge: &GameRecharge) -> Result<(), NotifyError> {
        info!(
            recharge_id = recharge.recharge_id,
            username = %recharge.username,
            payer = %recharge.payer_username,
            asset = %recharge.asset,
            amount = recharge.amount,
            "Game recharge"
        );
        Ok(())
    }
}

pub struct RechargeDispatcher {
    db: Arc<LedgerDb>,
    notifier: Arc<dyn RechargeNotifier>,
    interval: Duration,
    batch_size: usize,
}

impl RechargeDispatcher {
    pub fn new(db: Arc<LedgerDb>, notifier: Arc<dyn RechargeNotifier>) -> Self {
        Self {
            db,
            notifier,
            interval: DEFAULT_NOTIFY_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the dispatch loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(dispatcher.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Recharge dispatcher starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Recharge dispatcher shutting down");
                    return;
                }
            }

            if let Err(e) = self.dispatch_once().await {
                warn!(error = %e, "Recharge dispatch sweep failed");
            }
        }
    }

    /// Deliver one batch. Returns how many records were marked notified.
    pub async fn dispatch_once(&self) -> CustodyResult<usize> {
        let pending = self
            .db
            .read(|txn| RechargeRepository::new(txn).pending(self.batch_size))?;

        let mut delivered = 0;
        for recharge in &pending {
            if let Err(e) = self.notifier.notify(recharge).await {
                warn!(
                    recharge_id = recharge.recharge_id,
                    error = %e,
                    "Recharge notification failed, will retry"
                );
                continue;
            }
            self.db
                .write(|txn| RechargeRepository::new(txn).mark_notified(recharge.recharge_id))?;
            delivered += 1;
        }
        Ok(delivered)
    }
}
