// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Mission Drivers
//!
//! Inside and outside transfers run as persisted state machines. Each
//! transition is one storage transaction that moves money *and* writes the
//! mission's next state, so a crash between two transitions leaves the
//! mission exactly where the ledger is.
//!
//! ## Driver Loop
//!
//! [`drive`] claims the mission's lease, then repeatedly executes the
//! transition for the current state:
//!
//! - a transition that succeeds has already persisted its next state
//! - a domain error in a state where nothing has moved yet ends the mission
//!   as `Done`, with the error stored
//! - any other error bumps `retries`, stores the error and backs off; at
//!   [`MAX_MISSION_RETRIES`] the mission becomes `Abandoned`
//!
//! Missions left unfinished by a crash are picked up by [`MissionRecovery`].

pub mod inside;
pub mod outside;
pub mod recovery;

pub use recovery::MissionRecovery;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::CustodyConfig;
use crate::error::{CustodyError, CustodyResult};
use crate::limits::{LimitEngine, LimitReservation};
use crate::rail::PaymentRail;
use crate::session::SessionPool;
use crate::storage::{LedgerDb, LimitKey, MissionRepository, StoredMission};

/// Retry ceiling after which a mission is abandoned.
pub const MAX_MISSION_RETRIES: u32 = 30;

/// How long a driver's claim on a mission stays valid without renewal.
pub const MISSION_LEASE_TTL: Duration = Duration::from_secs(60);

/// Base delay between two attempts of a failing transition.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Everything a transition may touch.
pub struct MissionContext {
    pub db: Arc<LedgerDb>,
    pub sessions: Arc<SessionPool>,
    pub limits: Arc<LimitEngine>,
    pub rail: Arc<dyn PaymentRail>,
    pub config: Arc<CustodyConfig>,
    /// Lease owner name of this process.
    pub driver_id: String,
    pub retry_backoff: Duration,
    /// Missions currently driven by this process.
    in_flight: Mutex<HashSet<(&'static str, u64)>>,
}

impl MissionContext {
    pub fn new(
        db: Arc<LedgerDb>,
        sessions: Arc<SessionPool>,
        limits: Arc<LimitEngine>,
        rail: Arc<dyn PaymentRail>,
        config: Arc<CustodyConfig>,
    ) -> Self {
        Self {
            db,
            sessions,
            limits,
            rail,
            config,
            driver_id: format!("driver-{}", uuid::Uuid::new_v4()),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Apply the daily limit consumption of a booked transfer.
    ///
    /// Runs off the driver; a failure is only logged.
    pub(crate) fn commit_limit(&self, username: &str, key: LimitKey, amount: u64, day: NaiveDate) {
        let limits = self.limits.clone();
        let reservation = LimitReservation::new(username, key, amount, day);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = limits.commit(&reservation) {
                tracing::warn!(
                    username = %reservation.username,
                    asset = %reservation.key.asset,
                    amount = reservation.amount,
                    error = %e,
                    "Failed to commit transfer limit"
                );
            }
        });
    }

    /// Whether this process is driving the mission right now.
    pub fn is_in_flight(&self, kind: &'static str, mission_id: u64) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(&(kind, mission_id)))
            .unwrap_or(false)
    }

    fn enter_flight(&self, kind: &'static str, mission_id: u64) -> CustodyResult<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| CustodyError::Internal("mission registry poisoned".to_string()))?;
        if !set.insert((kind, mission_id)) {
            return Err(CustodyError::MissionBusy(mission_id));
        }
        Ok(InFlight {
            ctx: self,
            key: (kind, mission_id),
        })
    }

    fn backoff(&self, retries: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(retries)
            .min(MAX_RETRY_BACKOFF)
    }
}

struct InFlight<'a> {
    ctx: &'a MissionContext,
    key: (&'static str, u64),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.ctx.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

/// A mission kind the driver can execute.
#[async_trait]
pub trait Mission: StoredMission + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn state_name(&self) -> &'static str;

    /// Whether an error in the current state may end the mission: true only
    /// while no value has moved.
    fn can_fail(&self) -> bool;

    fn is_success(&self) -> bool;

    fn is_abandoned(&self) -> bool;

    fn last_error(&self) -> Option<&str>;

    fn fail(&mut self, reason: String);

    /// Record a failed attempt; returns the new retry count.
    fn retry(&mut self, reason: String) -> u32;

    fn abandon(&mut self);

    /// Execute the transition of the current state.
    ///
    /// Every transaction the step commits also persists the mission, so
    /// `self` always matches the stored mission, on success and on error.
    async fn step(&mut self, ctx: &MissionContext) -> CustodyResult<()>;

    /// Hook run after a successful transition, outside any transaction.
    fn after_step(&self, _ctx: &MissionContext, _from: &'static str) {}
}

/// Drive a mission to a terminal state.
///
/// Returns the successful mission, the error that ended it in this run, or
/// `MissionFailed` / `MissionAbandoned` for a mission that ended earlier.
pub async fn drive<M: Mission>(ctx: &MissionContext, mission_id: u64) -> CustodyResult<M> {
    let _flight = ctx.enter_flight(M::KIND, mission_id)?;
    let mut failure: Option<CustodyError> = None;

    let mission = loop {
        let Some(mut mission) = claim::<M>(ctx, mission_id)? else {
            break load_terminal::<M>(ctx, mission_id)?;
        };

        let from = mission.state_name();
        match mission.step(ctx).await {
            Ok(()) => {
                tracing::debug!(
                    kind = M::KIND,
                    mission_id,
                    from,
                    to = mission.state_name(),
                    "Mission advanced"
                );
                mission.after_step(ctx, from);
                if mission.is_terminal() {
                    break mission;
                }
            }
            Err(e) if !e.is_retryable() && mission.can_fail() => {
                tracing::info!(
                    kind = M::KIND,
                    mission_id,
                    state = from,
                    reason = e.reason_code(),
                    error = %e,
                    "Mission failed"
                );
                mission.fail(e.to_string());
                persist(ctx, &mut mission)?;
                failure = Some(e);
                break mission;
            }
            Err(e) => {
                let retries = mission.retry(e.to_string());
                if retries >= MAX_MISSION_RETRIES {
                    mission.abandon();
                    tracing::error!(
                        kind = M::KIND,
                        mission_id,
                        state = from,
                        retries,
                        error = %e,
                        "Mission abandoned after retry ceiling, operator action required"
                    );
                    persist(ctx, &mut mission)?;
                    break mission;
                }
                tracing::warn!(
                    kind = M::KIND,
                    mission_id,
                    state = from,
                    retries,
                    error = %e,
                    "Mission transition failed, retrying"
                );
                persist(ctx, &mut mission)?;
                tokio::time::sleep(ctx.backoff(retries)).await;
            }
        }
    };

    release::<M>(ctx, mission_id);

    if let Some(e) = failure {
        return Err(e);
    }
    if mission.is_success() {
        Ok(mission)
    } else if mission.is_abandoned() {
        Err(CustodyError::MissionAbandoned(mission_id))
    } else {
        Err(CustodyError::MissionFailed {
            id: mission_id,
            reason: mission.last_error().unwrap_or("unknown").to_string(),
        })
    }
}

/// Take or renew the lease. `None` when the mission is terminal.
fn claim<M: Mission>(ctx: &MissionContext, mission_id: u64) -> CustodyResult<Option<M>> {
    let ttl = chrono::Duration::from_std(MISSION_LEASE_TTL)
        .map_err(|e| CustodyError::Internal(format!("lease ttl: {e}")))?;
    let claimed = ctx.db.write(|txn| {
        MissionRepository::new(txn).claim::<M>(mission_id, &ctx.driver_id, ttl)
    });
    match claimed {
        Ok(Some(mission)) => Ok(Some(mission)),
        Ok(None) => {
            let current = ctx
                .db
                .read(|txn| MissionRepository::new(txn).get::<M>(mission_id))?;
            match current {
                Some(m) if m.is_terminal() => Ok(None),
                Some(_) => Err(CustodyError::MissionBusy(mission_id)),
                None => Err(CustodyError::MissionNotFound(mission_id)),
            }
        }
        Err(crate::storage::LedgerDbError::NotFound(_)) => {
            Err(CustodyError::MissionNotFound(mission_id))
        }
        Err(e) => Err(e.into()),
    }
}

fn load_terminal<M: Mission>(ctx: &MissionContext, mission_id: u64) -> CustodyResult<M> {
    ctx.db
        .read(|txn| MissionRepository::new(txn).get::<M>(mission_id))?
        .ok_or(CustodyError::MissionNotFound(mission_id))
}

fn persist<M: Mission>(ctx: &MissionContext, mission: &mut M) -> CustodyResult<()> {
    ctx.db
        .write(|txn| MissionRepository::new(txn).put(mission))?;
    Ok(())
}

fn release<M: Mission>(ctx: &MissionContext, mission_id: u64) {
    let released = ctx
        .db
        .write(|txn| MissionRepository::new(txn).release::<M>(mission_id, &ctx.driver_id));
    if let Err(e) = released {
        tracing::warn!(kind = M::KIND, mission_id, error = %e, "Failed to release mission lease");
    }
}
