// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Balance ledger primitives.
//!
//! Each primitive appends a bill, moves the aggregate balance and appends
//! the matching balance change, all inside the caller's write transaction.

use chrono::Utc;
use redb::WriteTransaction;

use crate::error::{CustodyError, CustodyResult};
use crate::models::{
    AggregateBalance, Asset, BalanceChange, Bill, BillState, BillType, ChangeType, Direction,
};
use crate::storage::{BalanceRepository, BillRepository};

/// Description of one balance movement.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    pub bill_type: BillType,
    pub change_type: ChangeType,
    pub invoice: Option<String>,
    pub payment_hash: Option<String>,
    pub server_fee: u64,
    pub type_ext: Option<String>,
    pub state: BillState,
}

impl LedgerEntry {
    /// Entry recorded as `success` unless changed with [`Self::with_state`].
    pub fn new(
        account_id: u64,
        asset: Asset,
        amount: u64,
        bill_type: BillType,
        change_type: ChangeType,
    ) -> Self {
        Self {
            account_id,
            asset,
            amount,
            bill_type,
            change_type,
            invoice: None,
            payment_hash: None,
            server_fee: 0,
            type_ext: None,
            state: BillState::Success,
        }
    }

    pub fn with_invoice(mut self, invoice: impl Into<String>) -> Self {
        self.invoice = Some(invoice.into());
        self
    }

    pub fn with_optional_invoice(mut self, invoice: Option<String>) -> Self {
        self.invoice = invoice;
        self
    }

    pub fn with_payment_hash(mut self, payment_hash: impl Into<String>) -> Self {
        self.payment_hash = Some(payment_hash.into());
        self
    }

    pub fn with_optional_payment_hash(mut self, payment_hash: Option<String>) -> Self {
        self.payment_hash = payment_hash;
        self
    }

    pub fn with_server_fee(mut self, fee: u64) -> Self {
        self.server_fee = fee;
        self
    }

    pub fn with_type_ext(mut self, type_ext: impl Into<String>) -> Self {
        self.type_ext = Some(type_ext.into());
        self
    }

    pub fn with_state(mut self, state: BillState) -> Self {
        self.state = state;
        self
    }
}

pub struct BalanceLedger<'t> {
    txn: &'t WriteTransaction,
}

impl<'t> BalanceLedger<'t> {
    pub fn new(txn: &'t WriteTransaction) -> Self {
        Self { txn }
    }

    /// Bill (in) + balance increase + change row.
    pub fn credit(&self, entry: LedgerEntry) -> CustodyResult<Bill> {
        self.apply(entry, Direction::In)
    }

    /// Bill (out) + balance decrease + change row.
    ///
    /// Fails with `InsufficientFunds` when the balance is below the amount.
    pub fn debit(&self, entry: LedgerEntry) -> CustodyResult<Bill> {
        self.apply(entry, Direction::Out)
    }

    /// Move a fee from `payer_account_id` to the house account.
    ///
    /// Returns the payer's fee bill and the house's income bill, or `None`
    /// for a zero fee.
    pub fn pay_fee(
        &self,
        payer_account_id: u64,
        house_account_id: u64,
        asset: &Asset,
        fee: u64,
        reference: Option<String>,
    ) -> CustodyResult<Option<(Bill, Bill)>> {
        if fee == 0 {
            return Ok(None);
        }
        let paid = self.debit(
            LedgerEntry::new(
                payer_account_id,
                asset.clone(),
                fee,
                BillType::Fee,
                ChangeType::Fee,
            )
            .with_optional_invoice(reference.clone()),
        )?;
        let income = self.credit(
            LedgerEntry::new(
                house_account_id,
                asset.clone(),
                fee,
                BillType::Fee,
                ChangeType::FeeIncome,
            )
            .with_optional_invoice(reference),
        )?;
        Ok(Some((paid, income)))
    }

    pub fn balance(&self, account_id: u64, asset: &Asset) -> CustodyResult<u64> {
        Ok(BalanceRepository::new(self.txn).get(account_id, asset)?.amount)
    }

    fn apply(&self, entry: LedgerEntry, direction: Direction) -> CustodyResult<Bill> {
        if entry.amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        let magnitude = i64::try_from(entry.amount)
            .map_err(|_| CustodyError::InvalidAmount(format!("amount {} too large", entry.amount)))?;

        let balances = BalanceRepository::new(self.txn);
        let current = balances.get(entry.account_id, &entry.asset)?;

        let (new_amount, delta) = match direction {
            Direction::In => {
                let new_amount = current.amount.checked_add(entry.amount).ok_or_else(|| {
                    CustodyError::InvalidAmount("balance overflow".to_string())
                })?;
                (new_amount, magnitude)
            }
            Direction::Out => {
                if current.amount < entry.amount {
                    return Err(CustodyError::InsufficientFunds {
                        asset: entry.asset.clone(),
                        available: current.amount,
                        required: entry.amount,
                    });
                }
                (current.amount - entry.amount, -magnitude)
            }
        };

        let now = Utc::now();
        let bill = BillRepository::new(self.txn).insert(Bill {
            bill_id: 0,
            account_id: entry.account_id,
            asset: entry.asset.clone(),
            bill_type: entry.bill_type,
            direction,
            amount: entry.amount,
            unit: entry.asset.unit().to_string(),
            invoice: entry.invoice,
            payment_hash: entry.payment_hash,
            state: entry.state,
            server_fee: entry.server_fee,
            type_ext: entry.type_ext,
            created_at: now,
            updated_at: now,
        })?;

        balances.put(&AggregateBalance {
            account_id: entry.account_id,
            asset: entry.asset.clone(),
            amount: new_amount,
            updated_at: now,
        })?;

        balances.record_change(BalanceChange {
            change_id: 0,
            account_id: entry.account_id,
            asset: entry.asset,
            delta,
            balance_after: new_amount,
            direction,
            bill_id: bill.bill_id,
            change_type: entry.change_type,
            created_at: now,
        })?;

        Ok(bill)
    }
}
