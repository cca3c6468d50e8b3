// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Award Engine
//!
//! Grants value from a finite per-asset inventory, exactly once per
//! idempotency key. Every grant is mirrored by an `offer-award` debit on the
//! house account, so awards never create value.
//!
//! A grant runs in one write transaction:
//!
//! 1. reject a key that was already used
//! 2. check the inventory switch and stock, then decrement it
//! 3. credit the user (and optionally lock part of the grant)
//! 4. debit the house account
//! 5. store the award, its idempotency row and the bill links
//!
//! Any failure discards all of it.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{CustodyError, CustodyResult};
use crate::ledger::{BalanceLedger, LedgerEntry, LockLedger, LockRequest};
use crate::models::{Asset, BillType, ChangeType, LockTag};
use crate::session::SessionPool;
use crate::storage::{AccountAward, AccountAwardExt, AwardInventory, AwardRepository, LedgerDb};

#[derive(Debug, Clone)]
pub struct AwardRequest {
    pub username: String,
    pub asset: Asset,
    pub amount: u64,
    pub memo: Option<String>,
    pub idempotency_key: String,
    /// Portion of the grant moved straight into the lock account.
    pub lock: Option<(u64, LockTag)>,
}

impl AwardRequest {
    pub fn new(
        username: impl Into<String>,
        asset: Asset,
        amount: u64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            asset,
            amount,
            memo: None,
            idempotency_key: idempotency_key.into(),
            lock: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_lock(mut self, amount: u64, tag: LockTag) -> Self {
        self.lock = Some((amount, tag));
        self
    }
}

/// A completed grant and the bills it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardGrant {
    pub award: AccountAward,
    pub ext: AccountAwardExt,
}

pub struct AwardEngine {
    db: Arc<LedgerDb>,
    sessions: Arc<SessionPool>,
}

impl AwardEngine {
    pub fn new(db: Arc<LedgerDb>, sessions: Arc<SessionPool>) -> Self {
        Self { db, sessions }
    }

    pub fn grant(&self, request: &AwardRequest) -> CustodyResult<AwardGrant> {
        if request.amount == 0 {
            return Err(CustodyError::InvalidAmount("award must be positive".to_string()));
        }
        if let Some((locked, _)) = request.lock {
            if locked == 0 || locked > request.amount {
                return Err(CustodyError::InvalidAmount(format!(
                    "locked part {locked} must be within the award {}",
                    request.amount
                )));
            }
        }

        let user = self.sessions.resolve(&request.username)?;
        let house = self.sessions.resolve(self.sessions.system_username())?;

        let grant = self.db.write(|txn| {
            let awards = AwardRepository::new(txn);
            if awards.award_by_key(&request.idempotency_key)?.is_some() {
                return Err(CustodyError::RepeatedLockId(request.idempotency_key.clone()));
            }

            let mut inventory = awards
                .inventory(&request.asset)?
                .ok_or_else(|| CustodyError::AwardInventoryDisabled(request.asset.clone()))?;
            if !inventory.enabled {
                return Err(CustodyError::AwardInventoryDisabled(request.asset.clone()));
            }
            if inventory.remaining < request.amount {
                return Err(CustodyError::AwardInventoryExhausted {
                    asset: request.asset.clone(),
                    remaining: inventory.remaining,
                    requested: request.amount,
                });
            }
            inventory.remaining -= request.amount;
            inventory.updated_at = Utc::now();
            awards.put_inventory(&inventory)?;

            let award_id = awards.next_award_id()?;
            if !awards.claim_key(&request.idempotency_key, award_id)? {
                return Err(CustodyError::RepeatedLockId(request.idempotency_key.clone()));
            }

            let ledger = BalanceLedger::new(txn);
            let credit = LedgerEntry::new(
                user.account.account_id,
                request.asset.clone(),
                request.amount,
                BillType::Award,
                ChangeType::Award,
            )
            .with_optional_invoice(request.memo.clone())
            .with_type_ext("award");
            let bill = ledger.credit(credit)?;

            let (lock_bill_id, locked_amount) = match request.lock {
                Some((locked, tag)) => {
                    let lock_bill = LockLedger::new(txn).lock(
                        &user.account,
                        &user.lock_account,
                        &LockRequest::new(
                            request.asset.clone(),
                            locked,
                            format!("award:{}", request.idempotency_key),
                            tag,
                        ),
                    )?;
                    (Some(lock_bill.lock_bill_id), locked)
                }
                None => (None, 0),
            };

            let house_bill = ledger
                .debit(
                    LedgerEntry::new(
                        house.account.account_id,
                        request.asset.clone(),
                        request.amount,
                        BillType::OfferAward,
                        ChangeType::OfferAward,
                    )
                    .with_invoice(request.username.clone())
                    .with_type_ext("award"),
                )
                .map_err(|e| match e {
                    CustodyError::InsufficientFunds { asset, required, .. } => {
                        CustodyError::InsufficientHouseFunds { asset, required }
                    }
                    other => other,
                })?;

            let award = AccountAward {
                award_id,
                username: request.username.clone(),
                account_id: user.account.account_id,
                asset: request.asset.clone(),
                amount: request.amount,
                memo: request.memo.clone(),
                idempotency_key: request.idempotency_key.clone(),
                created_at: Utc::now(),
            };
            let ext = AccountAwardExt {
                award_id,
                bill_id: bill.bill_id,
                lock_bill_id,
                locked_amount,
                house_bill_id: house_bill.bill_id,
            };
            awards.insert_award(&award)?;
            awards.insert_ext(&ext)?;
            Ok(AwardGrant { award, ext })
        })?;

        tracing::info!(
            award_id = grant.award.award_id,
            username = %request.username,
            asset = %request.asset,
            amount = request.amount,
            locked = grant.ext.locked_amount,
            "Award granted"
        );
        Ok(grant)
    }

    // -------------------------------------------------------------------------
    // Inventory administration
    // -------------------------------------------------------------------------

    pub fn set_inventory(&self, asset: &Asset, remaining: u64, enabled: bool) -> CustodyResult<AwardInventory> {
        let inventory = AwardInventory {
            asset: asset.clone(),
            remaining,
            enabled,
            updated_at: Utc::now(),
        };
        self.db
            .write(|txn| AwardRepository::new(txn).put_inventory(&inventory))?;
        tracing::info!(asset = %asset, remaining, enabled, "Award inventory updated");
        Ok(inventory)
    }

    pub fn inventory(&self) -> CustodyResult<Vec<AwardInventory>> {
        Ok(self
            .db
            .read(|txn| AwardRepository::new(txn).list_inventory())?)
    }

    pub fn award_by_key(&self, idempotency_key: &str) -> CustodyResult<Option<AwardGrant>> {
        self.db.read(|txn| {
            let repo = AwardRepository::new(txn);
            let Some(award) = repo.award_by_key(idempotency_key)? else {
                return Ok(None);
            };
            let ext = repo.ext(award.award_id)?.ok_or_else(|| {
                CustodyError::Internal(format!("award {} has no bill links", award.award_id))
            })?;
            Ok(Some(AwardGrant { award, ext }))
        })
    }
}
