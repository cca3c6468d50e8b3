// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Daily transfer limit configuration and per-user counters.

use chrono::{DateTime, NaiveDate, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use super::super::ledger_db::{
    composite_key, put_json, LedgerDbResult, LedgerRead, LIMIT_BILLS, LIMIT_TYPES,
    USER_LIMIT_LEVELS,
};
use crate::models::Asset;

/// Route of a limited transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitDirection {
    /// Transfer to another user of the custodian.
    Local,
    /// Transfer leaving the custodian over the payment rail.
    Outside,
}

impl LimitDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDirection::Local => "local",
            LimitDirection::Outside => "outside",
        }
    }
}

/// (asset, direction) pair a limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitKey {
    pub asset: Asset,
    pub direction: LimitDirection,
}

impl LimitKey {
    pub fn new(asset: Asset, direction: LimitDirection) -> Self {
        Self { asset, direction }
    }

    fn storage_key(&self) -> String {
        composite_key(&[self.asset.key(), self.direction.as_str()])
    }
}

/// Quota of one risk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitLevel {
    pub level: u32,
    pub total_amount: u64,
    pub total_count: u32,
}

/// Tier table of one (asset, direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitType {
    pub key: LimitKey,
    pub levels: Vec<LimitLevel>,
}

impl LimitType {
    /// Quota for `level`: the exact tier, else the highest tier below it.
    pub fn tier(&self, level: u32) -> Option<LimitLevel> {
        self.levels
            .iter()
            .filter(|tier| tier.level <= level && tier.level > 0)
            .max_by_key(|tier| tier.level)
            .copied()
    }
}

/// Per-user counter for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitBill {
    pub username: String,
    pub key: LimitKey,
    pub day: NaiveDate,
    pub level: u32,
    pub usable_amount: u64,
    pub usable_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserLevel {
    level: u32,
}

fn user_key(username: &str, key: &LimitKey) -> String {
    composite_key(&[username, key.storage_key().as_str()])
}

fn bill_key(username: &str, key: &LimitKey, day: NaiveDate) -> String {
    composite_key(&[
        user_key(username, key).as_str(),
        day.format("%Y-%m-%d").to_string().as_str(),
    ])
}

pub struct LimitRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> LimitRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn limit_type(&self, key: &LimitKey) -> LedgerDbResult<Option<LimitType>> {
        self.txn.get_json(LIMIT_TYPES, &key.storage_key())
    }

    pub fn list_limit_types(&self) -> LedgerDbResult<Vec<LimitType>> {
        self.txn.scan_json(LIMIT_TYPES, "")
    }

    pub fn user_level(&self, username: &str, key: &LimitKey) -> LedgerDbResult<Option<u32>> {
        Ok(self
            .txn
            .get_json::<UserLevel>(USER_LIMIT_LEVELS, &user_key(username, key))?
            .map(|l| l.level))
    }

    /// Today's counter (the "created today" lookup).
    pub fn limit_bill(
        &self,
        username: &str,
        key: &LimitKey,
        day: NaiveDate,
    ) -> LedgerDbResult<Option<LimitBill>> {
        self.txn.get_json(LIMIT_BILLS, &bill_key(username, key, day))
    }
}

impl<'t> LimitRepository<'t, WriteTransaction> {
    pub fn put_limit_type(&self, limit_type: &LimitType) -> LedgerDbResult<()> {
        put_json(self.txn, LIMIT_TYPES, &limit_type.key.storage_key(), limit_type)
    }

    pub fn set_user_level(&self, username: &str, key: &LimitKey, level: u32) -> LedgerDbResult<()> {
        put_json(
            self.txn,
            USER_LIMIT_LEVELS,
            &user_key(username, key),
            &UserLevel { level },
        )
    }

    pub fn put_limit_bill(&self, bill: &LimitBill) -> LedgerDbResult<()> {
        put_json(
            self.txn,
            LIMIT_BILLS,
            &bill_key(&bill.username, &bill.key, bill.day),
            bill,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LedgerDb;

    fn tiers() -> LimitType {
        LimitType {
            key: LimitKey::new(Asset::Native, LimitDirection::Local),
            levels: vec![
                LimitLevel {
                    level: 1,
                    total_amount: 1000,
                    total_count: 5,
                },
                LimitLevel {
                    level: 3,
                    total_amount: 50_000,
                    total_count: 50,
                },
            ],
        }
    }

    #[test]
    fn tier_falls_back_to_highest_lower_level() {
        let limit_type = tiers();
        assert_eq!(limit_type.tier(1).map(|t| t.total_amount), Some(1000));
        assert_eq!(limit_type.tier(2).map(|t| t.total_amount), Some(1000));
        assert_eq!(limit_type.tier(7).map(|t| t.total_amount), Some(50_000));
        assert!(limit_type.tier(0).is_none());
    }

    #[test]
    fn limit_bills_are_keyed_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();
        let key = LimitKey::new(Asset::Native, LimitDirection::Local);
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let bill = LimitBill {
            username: "alice".to_string(),
            key: key.clone(),
            day: today,
            level: 1,
            usable_amount: 700,
            usable_count: 4,
            last_used_at: None,
        };
        db.write(|txn| LimitRepository::new(txn).put_limit_bill(&bill))
            .unwrap();

        let (found, next_day) = db
            .read(|txn| {
                let repo = LimitRepository::new(txn);
                Ok::<_, crate::storage::LedgerDbError>((
                    repo.limit_bill("alice", &key, today)?,
                    repo.limit_bill("alice", &key, tomorrow)?,
                ))
            })
            .unwrap();
        assert_eq!(found, Some(bill));
        assert!(next_day.is_none());
    }
}
