// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger
//!
//! Balance and lock ledger primitives ([`BalanceLedger`], [`LockLedger`])
//! operate inside a caller's write transaction. [`LedgerService`] wraps
//! them for callers that work with usernames: it resolves sessions, opens
//! one transaction per operation and serves the read-side queries
//! (balances, history, reconciliation and the reserve report).

pub mod balance;
pub mod lock;

pub use balance::{BalanceLedger, LedgerEntry};
pub use lock::{LockLedger, LockRequest};

use std::sync::Arc;

use serde::Serialize;

use crate::error::{CustodyError, CustodyResult};
use crate::models::{AggregateBalance, Asset, LockBalance, LockBill};
use crate::rail::PaymentRail;
use crate::session::SessionPool;
use crate::storage::{
    AccountRepository, BalanceRepository, BillPage, BillRepository, LedgerDb, LockRepository,
};

/// Default and maximum page size of [`LedgerService::history`].
pub const DEFAULT_HISTORY_PAGE: usize = 20;
pub const MAX_HISTORY_PAGE: usize = 100;

/// Result of comparing a balance with its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub account_id: u64,
    pub asset: Asset,
    pub balance: u64,
    pub change_sum: i64,
    pub change_count: usize,
    pub consistent: bool,
}

/// On-chain holdings against what the custodian owes its users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReserveReport {
    pub on_chain_sats: u64,
    pub free_liabilities: u64,
    pub locked_liabilities: u64,
    pub total_liabilities: u64,
    /// `on_chain_sats - total_liabilities`; negative means under-reserved.
    pub surplus: i128,
}

pub struct LedgerService {
    db: Arc<LedgerDb>,
    sessions: Arc<SessionPool>,
}

impl LedgerService {
    pub fn new(db: Arc<LedgerDb>, sessions: Arc<SessionPool>) -> Self {
        Self { db, sessions }
    }

    // -------------------------------------------------------------------------
    // Lock operations
    // -------------------------------------------------------------------------

    pub fn lock(&self, username: &str, request: &LockRequest) -> CustodyResult<LockBill> {
        let session = self.sessions.resolve(username)?;
        let bill = self.db.write(|txn| {
            LockLedger::new(txn).lock(&session.account, &session.lock_account, request)
        })?;
        tracing::info!(
            username,
            asset = %request.asset,
            amount = request.amount,
            key = %request.idempotency_key,
            "Funds locked"
        );
        Ok(bill)
    }

    pub fn unlock(&self, username: &str, request: &LockRequest) -> CustodyResult<LockBill> {
        let session = self.sessions.resolve(username)?;
        let bill = self.db.write(|txn| {
            LockLedger::new(txn).unlock(&session.account, &session.lock_account, request)
        })?;
        tracing::info!(
            username,
            asset = %request.asset,
            amount = request.amount,
            key = %request.idempotency_key,
            "Funds unlocked"
        );
        Ok(bill)
    }

    pub fn transfer_while_locked(
        &self,
        payer: &str,
        receiver: &str,
        request: &LockRequest,
    ) -> CustodyResult<LockBill> {
        let payer_session = self.sessions.resolve(payer)?;
        let receiver_session = self.sessions.resolve(receiver)?;
        let bill = self.db.write(|txn| {
            LockLedger::new(txn).transfer_while_locked(
                &payer_session.lock_account,
                &receiver_session.account,
                request,
            )
        })?;
        tracing::info!(
            payer,
            receiver,
            asset = %request.asset,
            amount = request.amount,
            "Locked funds transferred"
        );
        Ok(bill)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn balance(&self, username: &str, asset: &Asset) -> CustodyResult<AggregateBalance> {
        let session = self.sessions.resolve(username)?;
        self.db.read(|txn| {
            Ok(BalanceRepository::new(txn).get(session.account.account_id, asset)?)
        })
    }

    pub fn balances(&self, username: &str) -> CustodyResult<Vec<AggregateBalance>> {
        let session = self.sessions.resolve(username)?;
        self.db.read(|txn| {
            Ok(BalanceRepository::new(txn).list_for_account(session.account.account_id)?)
        })
    }

    pub fn lock_balance(&self, username: &str, asset: &Asset) -> CustodyResult<LockBalance> {
        let session = self.sessions.resolve(username)?;
        self.db.read(|txn| {
            Ok(LockRepository::new(txn).balance(session.lock_account.lock_account_id, asset)?)
        })
    }

    /// Check that the audit trail of one balance sums up to the balance.
    pub fn reconcile(&self, account_id: u64, asset: &Asset) -> CustodyResult<Reconciliation> {
        let report = self.db.read(|txn| {
            let repo = BalanceRepository::new(txn);
            let balance = repo.get(account_id, asset)?;
            let changes = repo.changes(account_id, asset)?;
            let change_sum: i64 = changes.iter().map(|c| c.delta).sum();
            Ok::<_, CustodyError>(Reconciliation {
                account_id,
                asset: asset.clone(),
                balance: balance.amount,
                change_sum,
                change_count: changes.len(),
                consistent: i64::try_from(balance.amount).ok() == Some(change_sum),
            })
        })?;
        if !report.consistent {
            tracing::error!(
                account_id,
                asset = %asset,
                balance = report.balance,
                change_sum = report.change_sum,
                "Balance does not match its change history"
            );
        }
        Ok(report)
    }

    /// Newest-first bills of a user, optionally for one asset.
    pub fn history(
        &self,
        username: &str,
        asset: Option<&Asset>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> CustodyResult<BillPage> {
        let session = self.sessions.resolve(username)?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_PAGE)
            .clamp(1, MAX_HISTORY_PAGE);
        self.db.read(|txn| {
            Ok(BillRepository::new(txn).list_by_account(
                session.account.account_id,
                asset.map(Asset::key),
                cursor,
                limit,
            )?)
        })
    }

    /// Compare the node's on-chain balance with native-coin liabilities.
    ///
    /// Funds held by the house, free or locked, are the custodian's own and
    /// are not counted as liabilities.
    pub async fn reserve_report(&self, rail: &dyn PaymentRail) -> CustodyResult<ReserveReport> {
        let house = self.sessions.system_username().to_string();
        let (free_liabilities, locked_liabilities) = self.db.read(|txn| {
            let accounts = AccountRepository::new(txn);
            let house_lock = accounts.lock_account(&house)?.map(|l| l.lock_account_id);
            let house_ids: Vec<u64> = accounts
                .list_accounts()?
                .into_iter()
                .filter(|a| a.username == house)
                .map(|a| a.account_id)
                .collect();

            let free: u64 = BalanceRepository::new(txn)
                .list_all()?
                .into_iter()
                .filter(|b| b.asset.is_native() && !house_ids.contains(&b.account_id))
                .map(|b| b.amount)
                .sum();
            let locked: u64 = LockRepository::new(txn)
                .list_all_balances()?
                .into_iter()
                .filter(|b| b.asset.is_native() && Some(b.lock_account_id) != house_lock)
                .map(|b| b.amount)
                .sum();
            Ok::<_, CustodyError>((free, locked))
        })?;

        let on_chain_sats = rail.on_chain_balance().await?;
        let total_liabilities = free_liabilities + locked_liabilities;
        let report = ReserveReport {
            on_chain_sats,
            free_liabilities,
            locked_liabilities,
            total_liabilities,
            surplus: i128::from(on_chain_sats) - i128::from(total_liabilities),
        };
        if report.surplus < 0 {
            tracing::warn!(
                on_chain_sats,
                total_liabilities,
                "On-chain reserve below custodial liabilities"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillType, ChangeType, LockTag};
    use crate::rail::MemoryRail;
    use std::time::Duration;

    fn service() -> (LedgerService, Arc<LedgerDb>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        db.write(|txn| {
            let repo = AccountRepository::new(txn);
            for name in ["house", "alice", "bob"] {
                repo.register_user(name)?;
            }
            Ok::<_, crate::storage::LedgerDbError>(())
        })
        .unwrap();
        let sessions = Arc::new(SessionPool::new(
            db.clone(),
            16,
            Duration::from_secs(60),
            Duration::ZERO,
            "house",
        ));
        (LedgerService::new(db.clone(), sessions), db, dir)
    }

    fn fund(service: &LedgerService, db: &LedgerDb, username: &str, amount: u64) -> u64 {
        let session = service.sessions.resolve(username).unwrap();
        db.write(|txn| {
            BalanceLedger::new(txn).credit(LedgerEntry::new(
                session.account.account_id,
                Asset::Native,
                amount,
                BillType::Award,
                ChangeType::Award,
            ))
        })
        .unwrap();
        session.account.account_id
    }

    #[test]
    fn lock_roundtrip_through_usernames() {
        let (service, db, _dir) = service();
        fund(&service, &db, "alice", 500);

        service
            .lock("alice", &LockRequest::new(Asset::Native, 200, "k1", LockTag::Ordinary))
            .unwrap();
        assert_eq!(service.balance("alice", &Asset::Native).unwrap().amount, 300);
        assert_eq!(service.lock_balance("alice", &Asset::Native).unwrap().amount, 200);

        service
            .transfer_while_locked(
                "alice",
                "bob",
                &LockRequest::new(Asset::Native, 50, "k2", LockTag::Ordinary),
            )
            .unwrap();
        service
            .unlock("alice", &LockRequest::new(Asset::Native, 150, "k3", LockTag::Ordinary))
            .unwrap();

        assert_eq!(service.balance("alice", &Asset::Native).unwrap().amount, 450);
        assert_eq!(service.balance("bob", &Asset::Native).unwrap().amount, 50);
        assert_eq!(service.lock_balance("alice", &Asset::Native).unwrap().amount, 0);
    }

    #[test]
    fn reconcile_and_history() {
        let (service, db, _dir) = service();
        let alice = fund(&service, &db, "alice", 100);
        fund(&service, &db, "alice", 40);

        let report = service.reconcile(alice, &Asset::Native).unwrap();
        assert!(report.consistent);
        assert_eq!(report.balance, 140);
        assert_eq!(report.change_count, 2);

        let page = service.history("alice", None, None, Some(1)).unwrap();
        assert_eq!(page.bills.len(), 1);
        assert_eq!(page.bills[0].amount, 40);
        let next = service
            .history("alice", Some(&Asset::Native), page.next_cursor.as_deref(), Some(1))
            .unwrap();
        assert_eq!(next.bills[0].amount, 100);
    }

    #[tokio::test]
    async fn reserve_report_excludes_house_funds() {
        let (service, db, _dir) = service();
        fund(&service, &db, "alice", 700);
        fund(&service, &db, "house", 5_000);
        service
            .lock("alice", &LockRequest::new(Asset::Native, 200, "k1", LockTag::Ordinary))
            .unwrap();
        service
            .lock("house", &LockRequest::new(Asset::Native, 1_000, "h1", LockTag::Ordinary))
            .unwrap();

        let rail = MemoryRail::new();
        rail.set_on_chain_balance(600);
        let report = service.reserve_report(&rail).await.unwrap();
        assert_eq!(report.free_liabilities, 500);
        assert_eq!(report.locked_liabilities, 200);
        assert_eq!(report.surplus, -100);
    }
}
