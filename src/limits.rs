// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Limit Engine
//!
//! Daily transfer quotas per (asset, direction), leveled by a per-user risk
//! tier.
//!
//! ## Rules
//!
//! - No limit type configured for the pair: unlimited.
//! - User level defaults to [`DEFAULT_LIMIT_LEVEL`]; level `0` blocks all
//!   transfers (`LimitEntirely`), as does a level with no matching tier.
//! - The day's counter is created from the user's current tier on first use
//!   each calendar day (UTC).
//! - A check fails with `LimitExceeded` when the usable amount is below the
//!   requested amount or no transfer is left, and with `TooFrequent` when
//!   the previous transfer was less than [`MIN_TRANSFER_INTERVAL`] ago.
//! - Counters are only decremented by [`LimitEngine::commit`], after the
//!   ledger mutation the check guarded has been applied.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use crate::error::{CustodyError, CustodyResult};
use crate::storage::{LedgerDb, LimitBill, LimitKey, LimitRepository, LimitType};

pub const DEFAULT_LIMIT_LEVEL: u32 = 1;
pub const MIN_TRANSFER_INTERVAL: Duration = Duration::from_secs(5);

/// A passed check, to be committed once the transfer is booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitReservation {
    pub username: String,
    pub key: LimitKey,
    pub amount: u64,
    pub day: NaiveDate,
}

impl LimitReservation {
    pub fn new(username: impl Into<String>, key: LimitKey, amount: u64, day: NaiveDate) -> Self {
        Self {
            username: username.into(),
            key,
            amount,
            day,
        }
    }
}

pub struct LimitEngine {
    db: Arc<LedgerDb>,
    critical: Mutex<()>,
    min_interval: Duration,
}

impl LimitEngine {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        Self {
            db,
            critical: Mutex::new(()),
            min_interval: MIN_TRANSFER_INTERVAL,
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    fn enter(&self) -> CustodyResult<MutexGuard<'_, ()>> {
        self.critical
            .lock()
            .map_err(|_| CustodyError::Internal("limit engine lock poisoned".to_string()))
    }

    /// Verify that `amount` fits today's quota.
    ///
    /// Returns `None` when the pair is not limited.
    pub fn check_and_reserve(
        &self,
        username: &str,
        key: &LimitKey,
        amount: u64,
    ) -> CustodyResult<Option<LimitReservation>> {
        let _critical = self.enter()?;
        let today = Utc::now().date_naive();

        let bill = self.db.write(|txn| {
            let repo = LimitRepository::new(txn);
            let Some(limit_type) = repo.limit_type(key)? else {
                return Ok(None);
            };
            if let Some(bill) = repo.limit_bill(username, key, today)? {
                return Ok(Some(bill));
            }
            let bill = open_day(&repo, &limit_type, username, today)?;
            repo.put_limit_bill(&bill)?;
            Ok::<_, CustodyError>(Some(bill))
        })?;

        let Some(bill) = bill else {
            return Ok(None);
        };

        if bill.level == 0 {
            return Err(CustodyError::LimitEntirely);
        }
        if let Some(last) = bill.last_used_at {
            let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
            if elapsed < self.min_interval {
                return Err(CustodyError::TooFrequent);
            }
        }
        if bill.usable_amount < amount || bill.usable_count == 0 {
            return Err(CustodyError::LimitExceeded {
                usable_amount: bill.usable_amount,
                usable_count: bill.usable_count,
                requested: amount,
            });
        }

        Ok(Some(LimitReservation {
            username: username.to_string(),
            key: key.clone(),
            amount,
            day: today,
        }))
    }

    /// Consume a reservation: decrement the day's counter and stamp it.
    ///
    /// Returns `None` when the pair is not limited (any more).
    pub fn commit(&self, reservation: &LimitReservation) -> CustodyResult<Option<LimitBill>> {
        let _critical = self.enter()?;
        let bill = self.db.write(|txn| {
            let repo = LimitRepository::new(txn);
            let existing = repo.limit_bill(&reservation.username, &reservation.key, reservation.day)?;
            let mut bill = match existing {
                Some(bill) => bill,
                None => match repo.limit_type(&reservation.key)? {
                    Some(limit_type) => {
                        open_day(&repo, &limit_type, &reservation.username, reservation.day)?
                    }
                    None => return Ok(None),
                },
            };
            bill.usable_amount = bill.usable_amount.saturating_sub(reservation.amount);
            bill.usable_count = bill.usable_count.saturating_sub(1);
            bill.last_used_at = Some(Utc::now());
            repo.put_limit_bill(&bill)?;
            Ok::<_, CustodyError>(Some(bill))
        })?;
        if let Some(bill) = &bill {
            tracing::debug!(
                username = %reservation.username,
                asset = %reservation.key.asset,
                direction = reservation.key.direction.as_str(),
                usable_amount = bill.usable_amount,
                usable_count = bill.usable_count,
                "Limit committed"
            );
        }
        Ok(bill)
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    pub fn set_limit_type(&self, limit_type: &LimitType) -> CustodyResult<()> {
        let _critical = self.enter()?;
        self.db
            .write(|txn| LimitRepository::new(txn).put_limit_type(limit_type))?;
        Ok(())
    }

    pub fn limit_types(&self) -> CustodyResult<Vec<LimitType>> {
        Ok(self
            .db
            .read(|txn| LimitRepository::new(txn).list_limit_types())?)
    }

    /// Change a user's tier. Takes effect from the next calendar day's
    /// counter.
    pub fn set_user_level(&self, username: &str, key: &LimitKey, level: u32) -> CustodyResult<()> {
        let _critical = self.enter()?;
        self.db
            .write(|txn| LimitRepository::new(txn).set_user_level(username, key, level))?;
        tracing::info!(username, asset = %key.asset, direction = key.direction.as_str(), level, "Limit level changed");
        Ok(())
    }

    /// Today's counter, if the user has used the pair today.
    pub fn usage(&self, username: &str, key: &LimitKey) -> CustodyResult<Option<LimitBill>> {
        let today = Utc::now().date_naive();
        Ok(self
            .db
            .read(|txn| LimitRepository::new(txn).limit_bill(username, key, today))?)
    }
}

/// Fresh counter for `day` from the user's current tier.
fn open_day(
    repo: &LimitRepository<'_, redb::WriteTransaction>,
    limit_type: &LimitType,
    username: &str,
    day: NaiveDate,
) -> CustodyResult<LimitBill> {
    let level = repo
        .user_level(username, &limit_type.key)?
        .unwrap_or(DEFAULT_LIMIT_LEVEL);
    // A level without a tier is stored as level 0: transfers blocked.
    let (level, usable_amount, usable_count) = match limit_type.tier(level) {
        Some(tier) if level > 0 => (level, tier.total_amount, tier.total_count),
        _ => (0, 0, 0),
    };
    Ok(LimitBill {
        username: username.to_string(),
        key: limit_type.key.clone(),
        day,
        level,
        usable_amount,
        usable_count,
        last_used_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Asset;
    use crate::storage::{LimitDirection, LimitLevel};

    fn engine() -> (LimitEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        let engine = LimitEngine::new(db);
        engine
            .set_limit_type(&LimitType {
                key: key(),
                levels: vec![LimitLevel {
                    level: 1,
                    total_amount: 1000,
                    total_count: 5,
                }],
            })
            .unwrap();
        (engine, dir)
    }

    fn key() -> LimitKey {
        LimitKey::new(Asset::Native, LimitDirection::Local)
    }

    #[test]
    fn unconfigured_pair_is_unlimited() {
        let (engine, _dir) = engine();
        let outside = LimitKey::new(Asset::Native, LimitDirection::Outside);
        assert!(engine
            .check_and_reserve("alice", &outside, u64::MAX)
            .unwrap()
            .is_none());
        let replay = LimitReservation::new("alice", outside, 10, Utc::now().date_naive());
        assert!(engine.commit(&replay).unwrap().is_none());
    }

    #[test]
    fn breach_is_rejected_without_consuming_quota() {
        let (engine, _dir) = engine();
        let err = engine.check_and_reserve("alice", &key(), 1200).unwrap_err();
        assert!(matches!(
            err,
            CustodyError::LimitExceeded {
                usable_amount: 1000,
                usable_count: 5,
                requested: 1200
            }
        ));
        let usage = engine.usage("alice", &key()).unwrap().unwrap();
        assert_eq!((usage.usable_amount, usage.usable_count), (1000, 5));
    }

    #[test]
    fn commit_decrements_and_enforces_interval() {
        let (engine, _dir) = engine();
        let reservation = engine.check_and_reserve("alice", &key(), 400).unwrap().unwrap();
        let bill = engine.commit(&reservation).unwrap().unwrap();
        assert_eq!((bill.usable_amount, bill.usable_count), (600, 4));

        assert!(matches!(
            engine.check_and_reserve("alice", &key(), 10),
            Err(CustodyError::TooFrequent)
        ));
    }

    #[test]
    fn count_exhaustion_blocks_transfers() {
        let (engine, _dir) = engine();
        let engine = engine.with_min_interval(Duration::ZERO);
        for _ in 0..5 {
            let r = engine.check_and_reserve("alice", &key(), 1).unwrap().unwrap();
            engine.commit(&r).unwrap();
        }
        assert!(matches!(
            engine.check_and_reserve("alice", &key(), 1),
            Err(CustodyError::LimitExceeded { usable_count: 0, .. })
        ));
    }

    #[test]
    fn level_zero_and_missing_tier_block_entirely() {
        let (engine, _dir) = engine();
        engine.set_user_level("bob", &key(), 0).unwrap();
        assert!(matches!(
            engine.check_and_reserve("bob", &key(), 1),
            Err(CustodyError::LimitEntirely)
        ));

        engine
            .set_limit_type(&LimitType {
                key: LimitKey::new(Asset::Native, LimitDirection::Outside),
                levels: vec![LimitLevel {
                    level: 2,
                    total_amount: 10,
                    total_count: 1,
                }],
            })
            .unwrap();
        assert!(matches!(
            engine.check_and_reserve(
                "carol",
                &LimitKey::new(Asset::Native, LimitDirection::Outside),
                1
            ),
            Err(CustodyError::LimitEntirely)
        ));
    }
}
