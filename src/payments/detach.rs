// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bounded wait, unbounded completion.
//!
//! A mission runs in its own task and reports over a single-slot channel.
//! The caller waits at most `wait`; past that it gets `Timeout` while the
//! task keeps going. A result nobody waits for any more is logged.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{CustodyError, CustodyResult};

pub async fn bounded_wait<T, F>(
    wait: Duration,
    kind: &'static str,
    mission_id: u64,
    task: F,
) -> CustodyResult<T>
where
    T: Send + 'static,
    F: Future<Output = CustodyResult<T>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = task.await;
        if let Err(unclaimed) = tx.send(result) {
            match unclaimed {
                Ok(_) => info!(kind, mission_id, "Mission completed after the caller stopped waiting"),
                Err(e) => warn!(
                    kind,
                    mission_id,
                    reason = e.reason_code(),
                    error = %e,
                    "Mission failed after the caller stopped waiting"
                ),
            }
        }
    });

    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CustodyError::Internal(format!(
            "{kind} mission {mission_id} ended without reporting"
        ))),
        Err(_) => {
            info!(
                kind,
                mission_id,
                wait_ms = wait.as_millis() as u64,
                "Caller wait expired, mission continues in the background"
            );
            Err(CustodyError::Timeout)
        }
    }
}
