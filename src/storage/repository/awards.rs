// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Award inventory, grants and their idempotency keys.

use chrono::{DateTime, Utc};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use super::super::ledger_db::{
    id_key, insert_unique_json, next_id, put_json, LedgerDbResult, LedgerRead, AWARDS,
    AWARD_EXT, AWARD_IDEMPOTENT, AWARD_INVENTORY,
};
use crate::models::Asset;

/// Finite stock of value that can be granted for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardInventory {
    pub asset: Asset,
    pub remaining: u64,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// A completed grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAward {
    pub award_id: u64,
    pub username: String,
    pub account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Bills produced by a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAwardExt {
    pub award_id: u64,
    /// Credit bill of the award on the user's normal account.
    pub bill_id: u64,
    /// Lock bill when part of the grant was locked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_bill_id: Option<u64>,
    pub locked_amount: u64,
    /// `offer-award` debit on the house account.
    pub house_bill_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AwardIdempotent {
    idempotency_key: String,
    award_id: u64,
}

pub struct AwardRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> AwardRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn inventory(&self, asset: &Asset) -> LedgerDbResult<Option<AwardInventory>> {
        self.txn.get_json(AWARD_INVENTORY, asset.key())
    }

    pub fn list_inventory(&self) -> LedgerDbResult<Vec<AwardInventory>> {
        self.txn.scan_json(AWARD_INVENTORY, "")
    }

    pub fn award(&self, award_id: u64) -> LedgerDbResult<Option<AccountAward>> {
        self.txn.get_json(AWARDS, &id_key(award_id))
    }

    /// Award previously granted under `idempotency_key`.
    pub fn award_by_key(&self, idempotency_key: &str) -> LedgerDbResult<Option<AccountAward>> {
        match self
            .txn
            .get_json::<AwardIdempotent>(AWARD_IDEMPOTENT, idempotency_key)?
        {
            Some(row) => self.award(row.award_id),
            None => Ok(None),
        }
    }

    pub fn ext(&self, award_id: u64) -> LedgerDbResult<Option<AccountAwardExt>> {
        self.txn.get_json(AWARD_EXT, &id_key(award_id))
    }
}

impl<'t> AwardRepository<'t, WriteTransaction> {
    pub fn put_inventory(&self, inventory: &AwardInventory) -> LedgerDbResult<()> {
        put_json(self.txn, AWARD_INVENTORY, inventory.asset.key(), inventory)
    }

    pub fn next_award_id(&self) -> LedgerDbResult<u64> {
        next_id(self.txn, "awards")
    }

    /// Reserve an idempotency key for `award_id`.
    ///
    /// Returns `false` when the key is already taken.
    pub fn claim_key(&self, idempotency_key: &str, award_id: u64) -> LedgerDbResult<bool> {
        insert_unique_json(
            self.txn,
            AWARD_IDEMPOTENT,
            idempotency_key,
            &AwardIdempotent {
                idempotency_key: idempotency_key.to_string(),
                award_id,
            },
        )
    }

    pub fn insert_award(&self, award: &AccountAward) -> LedgerDbResult<()> {
        put_json(self.txn, AWARDS, &id_key(award.award_id), award)
    }

    pub fn insert_ext(&self, ext: &AccountAwardExt) -> LedgerDbResult<()> {
        put_json(self.txn, AWARD_EXT, &id_key(ext.award_id), ext)
    }
}
