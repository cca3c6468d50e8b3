// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Lock ledger: frozen funds held in a user's lock account.
//!
//! Locked funds carry a restricted sub-portion `tag1`. An ordinary request
//! may only touch `amount - tag1`; a restricted request may touch all of it
//! and consumes the restricted portion first. `tag1 <= amount` holds after
//! every operation.

use chrono::Utc;
use redb::WriteTransaction;

use super::balance::{BalanceLedger, LedgerEntry};
use crate::error::{CustodyError, CustodyResult};
use crate::models::{
    Account, Asset, BillType, ChangeType, LockAccount, LockBalance, LockBill, LockBillKind, LockTag,
};
use crate::storage::LockRepository;

/// One lock-ledger request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub asset: Asset,
    pub amount: u64,
    pub idempotency_key: String,
    pub tag: LockTag,
}

impl LockRequest {
    pub fn new(asset: Asset, amount: u64, idempotency_key: impl Into<String>, tag: LockTag) -> Self {
        Self {
            asset,
            amount,
            idempotency_key: idempotency_key.into(),
            tag,
        }
    }
}

pub struct LockLedger<'t> {
    txn: &'t WriteTransaction,
}

impl<'t> LockLedger<'t> {
    pub fn new(txn: &'t WriteTransaction) -> Self {
        Self { txn }
    }

    /// Move funds from the normal balance into the lock account.
    pub fn lock(
        &self,
        account: &Account,
        lock_account: &LockAccount,
        request: &LockRequest,
    ) -> CustodyResult<LockBill> {
        self.ensure_fresh_key(lock_account, request)?;

        let bill = BalanceLedger::new(self.txn).debit(
            LedgerEntry::new(
                account.account_id,
                request.asset.clone(),
                request.amount,
                BillType::LockUnlock,
                ChangeType::Lock,
            )
            .with_invoice(request.idempotency_key.clone())
            .with_type_ext("lock"),
        )?;

        let repo = LockRepository::new(self.txn);
        let mut balance = repo.balance(lock_account.lock_account_id, &request.asset)?;
        balance.amount = balance
            .amount
            .checked_add(request.amount)
            .ok_or_else(|| CustodyError::InvalidAmount("lock balance overflow".to_string()))?;
        if request.tag == LockTag::Restricted {
            balance.tag1 += request.amount;
        }
        balance.updated_at = Utc::now();
        repo.put_balance(&balance)?;

        self.record(lock_account, request, LockBillKind::Lock, bill.bill_id, None)
    }

    /// Release locked funds back to the normal balance.
    pub fn unlock(
        &self,
        account: &Account,
        lock_account: &LockAccount,
        request: &LockRequest,
    ) -> CustodyResult<LockBill> {
        self.ensure_fresh_key(lock_account, request)?;
        self.release(lock_account, request)?;

        let bill = BalanceLedger::new(self.txn).credit(
            LedgerEntry::new(
                account.account_id,
                request.asset.clone(),
                request.amount,
                BillType::LockUnlock,
                ChangeType::Unlock,
            )
            .with_invoice(request.idempotency_key.clone())
            .with_type_ext("unlock"),
        )?;

        self.record(lock_account, request, LockBillKind::Unlock, bill.bill_id, None)
    }

    /// Pay `receiver` straight out of the payer's locked funds.
    pub fn transfer_while_locked(
        &self,
        lock_account: &LockAccount,
        receiver: &Account,
        request: &LockRequest,
    ) -> CustodyResult<LockBill> {
        if receiver.account_id == lock_account.account_id {
            return Err(CustodyError::SelfPayment);
        }
        self.ensure_fresh_key(lock_account, request)?;
        self.release(lock_account, request)?;

        let bill = BalanceLedger::new(self.txn).credit(
            LedgerEntry::new(
                receiver.account_id,
                request.asset.clone(),
                request.amount,
                BillType::Transfer,
                ChangeType::LockedTransferIn,
            )
            .with_invoice(lock_account.username.clone())
            .with_type_ext("locked-transfer"),
        )?;

        self.record(
            lock_account,
            request,
            LockBillKind::TransferOut,
            bill.bill_id,
            Some(receiver.account_id),
        )
    }

    fn ensure_fresh_key(&self, lock_account: &LockAccount, request: &LockRequest) -> CustodyResult<()> {
        if request.amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        let used = LockRepository::new(self.txn)
            .bill(lock_account.lock_account_id, &request.idempotency_key)?
            .is_some();
        if used {
            return Err(CustodyError::RepeatedLockId(request.idempotency_key.clone()));
        }
        Ok(())
    }

    /// Take `request.amount` out of the lock balance, honouring the tag.
    fn release(&self, lock_account: &LockAccount, request: &LockRequest) -> CustodyResult<LockBalance> {
        let repo = LockRepository::new(self.txn);
        let mut balance = repo.balance(lock_account.lock_account_id, &request.asset)?;

        let releasable = balance.releasable(request.tag);
        if request.amount > releasable {
            return Err(CustodyError::InsufficientLockedFunds {
                asset: request.asset.clone(),
                available: releasable,
                required: request.amount,
            });
        }

        balance.amount -= request.amount;
        if request.tag == LockTag::Restricted {
            balance.tag1 = balance.tag1.saturating_sub(request.amount);
        }
        balance.updated_at = Utc::now();
        repo.put_balance(&balance)?;
        Ok(balance)
    }

    fn record(
        &self,
        lock_account: &LockAccount,
        request: &LockRequest,
        kind: LockBillKind,
        balance_bill_id: u64,
        counterparty_account_id: Option<u64>,
    ) -> CustodyResult<LockBill> {
        LockRepository::new(self.txn)
            .insert_bill(LockBill {
                lock_bill_id: 0,
                lock_account_id: lock_account.lock_account_id,
                asset: request.asset.clone(),
                idempotency_key: request.idempotency_key.clone(),
                kind,
                amount: request.amount,
                tag: request.tag,
                balance_bill_id,
                counterparty_account_id,
                created_at: Utc::now(),
            })?
            .ok_or_else(|| CustodyError::RepeatedLockId(request.idempotency_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountRole;
    use crate::storage::{AccountRepository, BalanceRepository, LedgerDb};

    struct Fixture {
        db: LedgerDb,
        alice: Account,
        alice_lock: LockAccount,
        bob: Account,
        _dir: tempfile::TempDir,
    }

    fn fixture(funds: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();
        let (alice, alice_lock, bob) = db
            .write(|txn| {
                let repo = AccountRepository::new(txn);
                let alice = repo.ensure_account("alice", AccountRole::Normal)?;
                let alice_lock = repo.ensure_lock_account(&alice)?;
                let bob = repo.ensure_account("bob", AccountRole::Normal)?;
                BalanceLedger::new(txn).credit(LedgerEntry::new(
                    alice.account_id,
                    Asset::Native,
                    funds,
                    BillType::Award,
                    ChangeType::Award,
                ))?;
                Ok::<_, CustodyError>((alice, alice_lock, bob))
            })
            .unwrap();
        Fixture {
            db,
            alice,
            alice_lock,
            bob,
            _dir: dir,
        }
    }

    fn req(amount: u64, key: &str, tag: LockTag) -> LockRequest {
        LockRequest::new(Asset::Native, amount, key, tag)
    }

    fn lock_balance(f: &Fixture) -> LockBalance {
        f.db.read(|txn| LockRepository::new(txn).balance(f.alice_lock.lock_account_id, &Asset::Native))
            .unwrap()
    }

    fn free_balance(f: &Fixture, account_id: u64) -> u64 {
        f.db.read(|txn| BalanceRepository::new(txn).get(account_id, &Asset::Native))
            .unwrap()
            .amount
    }

    #[test]
    fn lock_moves_funds_and_tracks_tag1() {
        let f = fixture(1000);
        f.db.write(|txn| {
            let ledger = LockLedger::new(txn);
            ledger.lock(&f.alice, &f.alice_lock, &req(300, "l1", LockTag::Ordinary))?;
            ledger.lock(&f.alice, &f.alice_lock, &req(200, "l2", LockTag::Restricted))
        })
        .unwrap();

        let lock = lock_balance(&f);
        assert_eq!((lock.amount, lock.tag1), (500, 200));
        assert_eq!(free_balance(&f, f.alice.account_id), 500);
    }

    #[test]
    fn repeated_key_is_rejected() {
        let f = fixture(1000);
        f.db.write(|txn| {
            LockLedger::new(txn).lock(&f.alice, &f.alice_lock, &req(100, "same", LockTag::Ordinary))
        })
        .unwrap();
        let again = f.db.write(|txn| {
            LockLedger::new(txn).lock(&f.alice, &f.alice_lock, &req(100, "same", LockTag::Ordinary))
        });
        assert!(matches!(again, Err(CustodyError::RepeatedLockId(_))));
        assert_eq!(free_balance(&f, f.alice.account_id), 900);
    }

    #[test]
    fn ordinary_unlock_cannot_touch_restricted_funds() {
        let f = fixture(1000);
        f.db.write(|txn| {
            let ledger = LockLedger::new(txn);
            ledger.lock(&f.alice, &f.alice_lock, &req(100, "l1", LockTag::Ordinary))?;
            ledger.lock(&f.alice, &f.alice_lock, &req(100, "l2", LockTag::Restricted))
        })
        .unwrap();

        let denied = f.db.write(|txn| {
            LockLedger::new(txn).unlock(&f.alice, &f.alice_lock, &req(150, "u1", LockTag::Ordinary))
        });
        assert!(matches!(
            denied,
            Err(CustodyError::InsufficientLockedFunds {
                available: 100,
                required: 150,
                ..
            })
        ));

        f.db.write(|txn| {
            LockLedger::new(txn).unlock(&f.alice, &f.alice_lock, &req(150, "u2", LockTag::Restricted))
        })
        .unwrap();
        let lock = lock_balance(&f);
        assert_eq!((lock.amount, lock.tag1), (50, 0));
        assert!(lock.tag1 <= lock.amount);
        assert_eq!(free_balance(&f, f.alice.account_id), 950);
    }

    #[test]
    fn transfer_while_locked_credits_receiver() {
        let f = fixture(1000);
        let bill = f
            .db
            .write(|txn| {
                let ledger = LockLedger::new(txn);
                ledger.lock(&f.alice, &f.alice_lock, &req(400, "l1", LockTag::Ordinary))?;
                ledger.transfer_while_locked(&f.alice_lock, &f.bob, &req(250, "t1", LockTag::Ordinary))
            })
            .unwrap();

        assert_eq!(bill.kind, LockBillKind::TransferOut);
        assert_eq!(bill.counterparty_account_id, Some(f.bob.account_id));
        assert_eq!(lock_balance(&f).amount, 150);
        assert_eq!(free_balance(&f, f.bob.account_id), 250);
        assert_eq!(free_balance(&f, f.alice.account_id), 600);
    }
}
