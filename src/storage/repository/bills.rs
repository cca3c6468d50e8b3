// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bill repository: the append-only ledger entries.
//!
//! Bills are never deleted. The only mutation after insert is moving an
//! `unknown` bill to its final state.

use chrono::Utc;
use redb::WriteTransaction;

use super::super::ledger_db::{
    id_key, index_bill, next_id, put_json, LedgerDbError, LedgerDbResult, LedgerRead, BILLS,
};
use crate::models::{Bill, BillState};

/// One page of an account's bill history.
#[derive(Debug, Clone, Default)]
pub struct BillPage {
    pub bills: Vec<Bill>,
    pub next_cursor: Option<String>,
}

pub struct BillRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> BillRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn get(&self, bill_id: u64) -> LedgerDbResult<Option<Bill>> {
        self.txn.get_json(BILLS, &id_key(bill_id))
    }

    /// Newest-first bills of an account, optionally restricted to one asset.
    pub fn list_by_account(
        &self,
        account_id: u64,
        asset_key: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> LedgerDbResult<BillPage> {
        let page = self
            .txn
            .scan_bill_index(account_id, asset_key, cursor, limit)?;

        let mut bills = Vec::with_capacity(page.entries.len());
        for (bill_id, _) in &page.entries {
            if let Some(bill) = self.get(*bill_id)? {
                bills.push(bill);
            }
        }

        Ok(BillPage {
            bills,
            next_cursor: page.next_cursor,
        })
    }
}

impl<'t> BillRepository<'t, WriteTransaction> {
    /// Persist a new bill, assigning its id and indexing it under its account.
    pub fn insert(&self, mut bill: Bill) -> LedgerDbResult<Bill> {
        bill.bill_id = next_id(self.txn, "bills")?;
        put_json(self.txn, BILLS, &id_key(bill.bill_id), &bill)?;
        index_bill(
            self.txn,
            bill.account_id,
            bill.created_at.timestamp_micros(),
            bill.bill_id,
            bill.asset.key(),
        )?;
        Ok(bill)
    }

    /// Move a bill to a final state.
    ///
    /// Bills that are already final are returned unchanged.
    pub fn finalize(&self, bill_id: u64, state: BillState) -> LedgerDbResult<Bill> {
        let mut bill = self
            .get(bill_id)?
            .ok_or_else(|| LedgerDbError::NotFound(format!("Bill {bill_id}")))?;

        if bill.state.is_final() {
            if bill.state != state {
                tracing::warn!(
                    bill_id,
                    current = ?bill.state,
                    requested = ?state,
                    "Ignoring state change on final bill"
                );
            }
            return Ok(bill);
        }

        bill.state = state;
        bill.updated_at = Utc::now();
        put_json(self.txn, BILLS, &id_key(bill_id), &bill)?;
        Ok(bill)
    }
}
