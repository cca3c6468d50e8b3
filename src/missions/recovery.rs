// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Mission Recovery
//!
//! Background task that resumes missions left unfinished by a crash, a
//! caller timeout or a driver that gave up its lease.
//!
//! ## Strategy
//!
//! On start and then every `interval` (default 30 s) the task:
//! 1. Lists all non-terminal inside and outside missions.
//! 2. Skips missions driven by this process or leased by another driver
//!    whose lease has not expired.
//! 3. Spawns a driver for each remaining mission, which continues it from
//!    its persisted state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{drive, Mission, MissionContext};
use crate::error::{CustodyError, CustodyResult};
use crate::storage::{InsideMission, LedgerDbError, MissionLease, MissionRepository, OutsideMission};

/// Default interval between recovery sweeps.
const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

pub struct MissionRecovery {
    ctx: Arc<MissionContext>,
    interval: Duration,
}

impl MissionRecovery {
    pub fn new(ctx: Arc<MissionContext>) -> Self {
        Self {
            ctx,
            interval: DEFAULT_RECOVERY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the recovery loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(recovery.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Mission recovery starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Mission recovery shutting down");
                return;
            }

            if let Err(e) = self.recover_once() {
                warn!(error = %e, "Mission recovery sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Mission recovery shutting down");
                    return;
                }
            }
        }
    }

    /// Spawn drivers for every resumable mission. Returns how many were
    /// spawned.
    pub fn recover_once(&self) -> CustodyResult<usize> {
        let (inside, outside) = self.ctx.db.read(|txn| {
            let repo = MissionRepository::new(txn);
            Ok::<_, LedgerDbError>((
                repo.list_unfinished::<InsideMission>()?,
                repo.list_unfinished::<OutsideMission>()?,
            ))
        })?;

        let mut spawned = 0;
        for mission in inside {
            if self.resumable::<InsideMission>(mission.mission_id, mission.lease.as_ref()) {
                self.spawn::<InsideMission>(mission.mission_id);
                spawned += 1;
            }
        }
        for mission in outside {
            if self.resumable::<OutsideMission>(mission.mission_id, mission.lease.as_ref()) {
                self.spawn::<OutsideMission>(mission.mission_id);
                spawned += 1;
            }
        }

        if spawned > 0 {
            info!(count = spawned, "Resuming unfinished missions");
        }
        Ok(spawned)
    }

    fn resumable<M: Mission>(&self, mission_id: u64, lease: Option<&MissionLease>) -> bool {
        if self.ctx.is_in_flight(M::KIND, mission_id) {
            return false;
        }
        lease.map_or(true, |lease| lease.expires_at <= Utc::now())
    }

    fn spawn<M: Mission>(&self, mission_id: u64) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            match drive::<M>(&ctx, mission_id).await {
                Ok(_) => info!(kind = M::KIND, mission_id, "Recovered mission completed"),
                Err(CustodyError::MissionBusy(_)) => {
                    debug!(kind = M::KIND, mission_id, "Mission picked up elsewhere")
                }
                Err(e) => warn!(
                    kind = M::KIND,
                    mission_id,
                    reason = e.reason_code(),
                    error = %e,
                    "Recovered mission did not succeed"
                ),
            }
        });
    }
}
