// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Registry of invoices and addresses issued by the custodian.
//!
//! A payment whose target is found here with status `outstanding` stays
//! inside the custodian.

use chrono::{DateTime, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use super::super::ledger_db::{put_json, LedgerDbError, LedgerDbResult, LedgerRead, LOCAL_INVOICES};
use crate::models::Asset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvoiceKind {
    /// Lightning invoice
    Invoice,
    /// Taproot-Assets address
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Outstanding,
    Paid,
}

/// An invoice or address issued to one of our users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalInvoice {
    /// Encoded invoice or address string.
    pub reference: String,
    pub kind: InvoiceKind,
    pub username: String,
    pub account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

pub struct InvoiceRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> InvoiceRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn get(&self, reference: &str) -> LedgerDbResult<Option<LocalInvoice>> {
        self.txn.get_json(LOCAL_INVOICES, reference)
    }
}

impl<'t> InvoiceRepository<'t, WriteTransaction> {
    pub fn put(&self, invoice: &LocalInvoice) -> LedgerDbResult<()> {
        put_json(self.txn, LOCAL_INVOICES, &invoice.reference, invoice)
    }

    /// Mark an invoice paid. Paying an already paid invoice is a no-op.
    pub fn mark_paid(&self, reference: &str) -> LedgerDbResult<LocalInvoice> {
        let mut invoice = self
            .get(reference)?
            .ok_or_else(|| LedgerDbError::NotFound(format!("Invoice {reference}")))?;
        if invoice.status == InvoiceStatus::Paid {
            return Ok(invoice);
        }
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(Utc::now());
        self.put(&invoice)?;
        Ok(invoice)
    }
}
