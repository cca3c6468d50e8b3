// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Aggregate balances and their audit trail.

use chrono::Utc;
use redb::WriteTransaction;

use super::super::ledger_db::{
    composite_key, id_key, next_id, put_json, LedgerDbResult, LedgerRead, BALANCES,
    BALANCE_CHANGES,
};
use crate::models::{AggregateBalance, Asset, BalanceChange};

fn balance_key(account_id: u64, asset: &Asset) -> String {
    composite_key(&[id_key(account_id).as_str(), asset.key()])
}

fn change_prefix(account_id: u64, asset: &Asset) -> String {
    format!("{}|", balance_key(account_id, asset))
}

pub struct BalanceRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> BalanceRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    /// Current balance; an account that never held the asset has zero.
    pub fn get(&self, account_id: u64, asset: &Asset) -> LedgerDbResult<AggregateBalance> {
        Ok(self
            .txn
            .get_json(BALANCES, &balance_key(account_id, asset))?
            .unwrap_or_else(|| AggregateBalance {
                account_id,
                asset: asset.clone(),
                amount: 0,
                updated_at: Utc::now(),
            }))
    }

    pub fn list_for_account(&self, account_id: u64) -> LedgerDbResult<Vec<AggregateBalance>> {
        self.txn
            .scan_json(BALANCES, &format!("{}|", id_key(account_id)))
    }

    /// Every stored balance row (reporting).
    pub fn list_all(&self) -> LedgerDbResult<Vec<AggregateBalance>> {
        self.txn.scan_json(BALANCES, "")
    }

    /// Audit rows for one account × asset, oldest first.
    pub fn changes(&self, account_id: u64, asset: &Asset) -> LedgerDbResult<Vec<BalanceChange>> {
        self.txn
            .scan_json(BALANCE_CHANGES, &change_prefix(account_id, asset))
    }
}

impl<'t> BalanceRepository<'t, WriteTransaction> {
    pub fn put(&self, balance: &AggregateBalance) -> LedgerDbResult<()> {
        put_json(
            self.txn,
            BALANCES,
            &balance_key(balance.account_id, &balance.asset),
            balance,
        )
    }

    /// Append an audit row, assigning its id.
    pub fn record_change(&self, mut change: BalanceChange) -> LedgerDbResult<BalanceChange> {
        change.change_id = next_id(self.txn, "balance_changes")?;
        let key = format!(
            "{}{}",
            change_prefix(change.account_id, &change.asset),
            id_key(change.change_id)
        );
        put_json(self.txn, BALANCE_CHANGES, &key, &change)?;
        Ok(change)
    }
}
