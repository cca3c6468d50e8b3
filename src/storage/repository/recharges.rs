// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Game recharge records awaiting external notification.

use chrono::{DateTime, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use super::super::ledger_db::{
    id_key, next_id, put_json, LedgerDbError, LedgerDbResult, LedgerRead, RECHARGES,
};
use crate::models::Asset;

/// Value received by a game-settlement account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameRecharge {
    pub recharge_id: u64,
    /// Receiving game-settlement user.
    pub username: String,
    /// Paying user.
    pub payer_username: String,
    pub asset: Asset,
    pub amount: u64,
    pub bill_id: u64,
    pub mission_id: u64,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
}

pub struct RechargeRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> RechargeRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    /// Records not yet delivered, oldest first.
    pub fn pending(&self, limit: usize) -> LedgerDbResult<Vec<GameRecharge>> {
        let all: Vec<GameRecharge> = self.txn.scan_json(RECHARGES, "")?;
        Ok(all.into_iter().filter(|r| !r.notified).take(limit).collect())
    }
}

impl<'t> RechargeRepository<'t, WriteTransaction> {
    pub fn insert(&self, mut recharge: GameRecharge) -> LedgerDbResult<GameRecharge> {
        recharge.recharge_id = next_id(self.txn, "recharges")?;
        put_json(self.txn, RECHARGES, &id_key(recharge.recharge_id), &recharge)?;
        Ok(recharge)
    }

    pub fn mark_notified(&self, recharge_id: u64) -> LedgerDbResult<()> {
        let key = id_key(recharge_id);
        let mut recharge: GameRecharge = self
            .txn
            .get_json(RECHARGES, &key)?
            .ok_or_else(|| LedgerDbError::NotFound(format!("Recharge {recharge_id}")))?;
        recharge.notified = true;
        recharge.notified_at = Some(Utc::now());
        put_json(self.txn, RECHARGES, &key, &recharge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LedgerDb;

    #[test]
    fn notified_records_leave_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();

        let draft = GameRecharge {
            recharge_id: 0,
            username: "game".to_string(),
            payer_username: "alice".to_string(),
            asset: Asset::Native,
            amount: 500,
            bill_id: 3,
            mission_id: 1,
            notified: false,
            created_at: Utc::now(),
            notified_at: None,
        };
        let (a, _b) = db
            .write(|txn| {
                let repo = RechargeRepository::new(txn);
                Ok::<_, LedgerDbError>((repo.insert(draft.clone())?, repo.insert(draft.clone())?))
            })
            .unwrap();

        db.write(|txn| RechargeRepository::new(txn).mark_notified(a.recharge_id))
            .unwrap();

        let pending = db
            .read(|txn| RechargeRepository::new(txn).pending(10))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].recharge_id, a.recharge_id);
    }
}
