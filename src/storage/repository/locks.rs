// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Lock balances and lock bills.

use chrono::Utc;
use redb::WriteTransaction;

use super::super::ledger_db::{
    composite_key, id_key, next_id, put_json, LedgerDbResult, LedgerRead, LOCK_BALANCES,
    LOCK_BILLS,
};
use crate::models::{Asset, LockBalance, LockBill};

fn balance_key(lock_account_id: u64, asset: &Asset) -> String {
    composite_key(&[id_key(lock_account_id).as_str(), asset.key()])
}

fn bill_key(lock_account_id: u64, idempotency_key: &str) -> String {
    composite_key(&[id_key(lock_account_id).as_str(), idempotency_key])
}

pub struct LockRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> LockRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    /// Locked balance; zero when nothing was ever locked.
    pub fn balance(&self, lock_account_id: u64, asset: &Asset) -> LedgerDbResult<LockBalance> {
        Ok(self
            .txn
            .get_json(LOCK_BALANCES, &balance_key(lock_account_id, asset))?
            .unwrap_or_else(|| LockBalance {
                lock_account_id,
                asset: asset.clone(),
                amount: 0,
                tag1: 0,
                updated_at: Utc::now(),
            }))
    }

    pub fn list_all_balances(&self) -> LedgerDbResult<Vec<LockBalance>> {
        self.txn.scan_json(LOCK_BALANCES, "")
    }

    pub fn bill(&self, lock_account_id: u64, idempotency_key: &str) -> LedgerDbResult<Option<LockBill>> {
        self.txn
            .get_json(LOCK_BILLS, &bill_key(lock_account_id, idempotency_key))
    }
}

impl<'t> LockRepository<'t, WriteTransaction> {
    pub fn put_balance(&self, balance: &LockBalance) -> LedgerDbResult<()> {
        put_json(
            self.txn,
            LOCK_BALANCES,
            &balance_key(balance.lock_account_id, &balance.asset),
            balance,
        )
    }

    /// Insert a lock bill under its (lock account, idempotency key).
    ///
    /// Returns `None` when the key was already used for this lock account.
    pub fn insert_bill(&self, mut bill: LockBill) -> LedgerDbResult<Option<LockBill>> {
        if self
            .bill(bill.lock_account_id, &bill.idempotency_key)?
            .is_some()
        {
            return Ok(None);
        }
        bill.lock_bill_id = next_id(self.txn, "lock_bills")?;
        put_json(
            self.txn,
            LOCK_BILLS,
            &bill_key(bill.lock_account_id, &bill.idempotency_key),
            &bill,
        )?;
        Ok(Some(bill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockBillKind, LockTag};
    use crate::storage::LedgerDb;

    fn lock_bill(key: &str) -> LockBill {
        LockBill {
            lock_bill_id: 0,
            lock_account_id: 4,
            asset: Asset::Native,
            idempotency_key: key.to_string(),
            kind: LockBillKind::Lock,
            amount: 50,
            tag: LockTag::Ordinary,
            balance_bill_id: 1,
            counterparty_account_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lock_bill_keys_are_unique_per_lock_account() {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();

        let first = db
            .write(|txn| LockRepository::new(txn).insert_bill(lock_bill("order-1")))
            .unwrap();
        let repeat = db
            .write(|txn| LockRepository::new(txn).insert_bill(lock_bill("order-1")))
            .unwrap();
        assert!(first.is_some());
        assert!(repeat.is_none());

        let mut other_account = lock_bill("order-1");
        other_account.lock_account_id = 5;
        let other = db
            .write(|txn| LockRepository::new(txn).insert_bill(other_account))
            .unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn missing_lock_balance_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();
        let balance = db
            .read(|txn| LockRepository::new(txn).balance(9, &Asset::Native))
            .unwrap();
        assert_eq!((balance.amount, balance.tag1), (0, 0));
    }
}
