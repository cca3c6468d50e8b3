// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixture for unit tests: a temporary ledger with registered users
//! and every service wired over an in-memory rail.

use std::sync::Arc;
use std::time::Duration;

use crate::awards::AwardEngine;
use crate::config::CustodyConfig;
use crate::error::CustodyError;
use crate::ledger::{BalanceLedger, LedgerEntry, LedgerService};
use crate::limits::LimitEngine;
use crate::missions::MissionContext;
use crate::models::{Asset, BillType, ChangeType};
use crate::payments::PaymentFacade;
use crate::rail::{MemoryRail, PaymentRail};
use crate::session::SessionPool;
use crate::storage::{BalanceRepository, LedgerDb, LockRepository};

pub(crate) const TEST_USERS: [&str; 5] = ["house", "alice", "bob", "carol", "game"];

pub(crate) struct TestHarness {
    pub db: Arc<LedgerDb>,
    pub sessions: Arc<SessionPool>,
    pub limits: Arc<LimitEngine>,
    pub rail: Arc<MemoryRail>,
    pub config: Arc<CustodyConfig>,
    pub ctx: Arc<MissionContext>,
    pub ledger: LedgerService,
    pub awards: AwardEngine,
    pub payments: PaymentFacade,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut CustodyConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CustodyConfig {
            data_dir: dir.path().to_path_buf(),
            house_username: "house".to_string(),
            game_settlement_users: vec!["game".to_string()],
            pay_cooldown: Duration::ZERO,
            pay_wait: Duration::from_secs(5),
            local_transfer_fee: 10,
            outside_service_fee: 100,
            ..CustodyConfig::default()
        };
        adjust(&mut config);
        let config = Arc::new(config);

        let db = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        let sessions = Arc::new(SessionPool::new(
            db.clone(),
            config.session_pool_capacity,
            config.session_idle,
            config.pay_cooldown,
            config.house_username.clone(),
        ));
        for username in TEST_USERS {
            sessions.register_user(username).unwrap();
        }

        let limits = Arc::new(LimitEngine::new(db.clone()).with_min_interval(Duration::ZERO));
        let rail = Arc::new(MemoryRail::new());
        let ctx = Arc::new(
            MissionContext::new(
                db.clone(),
                sessions.clone(),
                limits.clone(),
                rail.clone() as Arc<dyn PaymentRail>,
                config.clone(),
            )
            .with_retry_backoff(Duration::ZERO),
        );

        Self {
            ledger: LedgerService::new(db.clone(), sessions.clone()),
            awards: AwardEngine::new(db.clone(), sessions.clone()),
            payments: PaymentFacade::new(ctx.clone()),
            db,
            sessions,
            limits,
            rail,
            config,
            ctx,
            _dir: dir,
        }
    }

    /// Credit `amount` sats to the user's normal account.
    pub fn fund(&self, username: &str, amount: u64) {
        self.fund_asset(username, &Asset::Native, amount);
    }

    pub fn fund_asset(&self, username: &str, asset: &Asset, amount: u64) {
        let account_id = self.sessions.resolve(username).unwrap().account.account_id;
        self.db
            .write(|txn| {
                BalanceLedger::new(txn).credit(LedgerEntry::new(
                    account_id,
                    asset.clone(),
                    amount,
                    BillType::Award,
                    ChangeType::Award,
                ))
            })
            .unwrap();
    }

    /// Free native balance of the user's normal account.
    pub fn balance(&self, username: &str) -> u64 {
        self.asset_balance(username, &Asset::Native)
    }

    pub fn asset_balance(&self, username: &str, asset: &Asset) -> u64 {
        self.ledger.balance(username, asset).unwrap().amount
    }

    /// Every native sat held in custody, free and locked.
    pub fn total_native(&self) -> u64 {
        self.db
            .read(|txn| {
                let free: u64 = BalanceRepository::new(txn)
                    .list_all()?
                    .iter()
                    .filter(|b| b.asset.is_native())
                    .map(|b| b.amount)
                    .sum();
                let locked: u64 = LockRepository::new(txn)
                    .list_all_balances()?
                    .iter()
                    .filter(|b| b.asset.is_native())
                    .map(|b| b.amount)
                    .sum();
                Ok::<_, CustodyError>(free + locked)
            })
            .unwrap()
    }
}
