// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::awards::AwardEngine;
use crate::config::CustodyConfig;
use crate::error::CustodyResult;
use crate::ledger::LedgerService;
use crate::limits::LimitEngine;
use crate::missions::MissionContext;
use crate::payments::PaymentFacade;
use crate::rail::PaymentRail;
use crate::session::SessionPool;
use crate::storage::{LedgerDb, LEDGER_DB_FILE};

/// Every long-lived service of the custodian, shared by the API layer and
/// the background tasks.
#[derive(Clone)]
pub struct CustodyState {
    pub config: Arc<CustodyConfig>,
    pub db: Arc<LedgerDb>,
    pub sessions: Arc<SessionPool>,
    pub limits: Arc<LimitEngine>,
    pub ledger: Arc<LedgerService>,
    pub awards: Arc<AwardEngine>,
    pub missions: Arc<MissionContext>,
    pub payments: Arc<PaymentFacade>,
}

impl CustodyState {
    /// Open the ledger under `config.data_dir` and wire the services over
    /// `rail`. The house user is registered on first start.
    pub fn open(config: CustodyConfig, rail: Arc<dyn PaymentRail>) -> CustodyResult<Self> {
        let db = Arc::new(LedgerDb::open(&config.data_dir.join(LEDGER_DB_FILE))?);
        Self::with_db(config, db, rail)
    }

    pub fn with_db(
        config: CustodyConfig,
        db: Arc<LedgerDb>,
        rail: Arc<dyn PaymentRail>,
    ) -> CustodyResult<Self> {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionPool::new(
            db.clone(),
            config.session_pool_capacity,
            config.session_idle,
            config.pay_cooldown,
            config.house_username.clone(),
        ));
        sessions.register_user(&config.house_username)?;

        let limits = Arc::new(LimitEngine::new(db.clone()));
        let missions = Arc::new(MissionContext::new(
            db.clone(),
            sessions.clone(),
            limits.clone(),
            rail,
            config.clone(),
        ));

        Ok(Self {
            ledger: Arc::new(LedgerService::new(db.clone(), sessions.clone())),
            awards: Arc::new(AwardEngine::new(db.clone(), sessions.clone())),
            payments: Arc::new(PaymentFacade::new(missions.clone())),
            config,
            db,
            sessions,
            limits,
            missions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Asset;
    use crate::rail::MemoryRail;

    #[tokio::test]
    async fn reopening_keeps_balances() {
        let dir = tempfile::tempdir().unwrap();
        let config = CustodyConfig {
            data_dir: dir.path().to_path_buf(),
            ..CustodyConfig::default()
        };

        {
            let state = CustodyState::open(config.clone(), Arc::new(MemoryRail::new())).unwrap();
            state.sessions.register_user("alice").unwrap();
            let invoice = state
                .payments
                .apply_pay_req("alice", &Asset::Native, 500, None)
                .await
                .unwrap();
            state
                .payments
                .settle_incoming(&invoice.reference, &Asset::Native, 0)
                .unwrap();
        }

        let state = CustodyState::open(config, Arc::new(MemoryRail::new())).unwrap();
        assert_eq!(
            state.ledger.balance("alice", &Asset::Native).unwrap().amount,
            500
        );
        assert!(state.sessions.resolve(&state.config.house_username).is_ok());
    }
}
