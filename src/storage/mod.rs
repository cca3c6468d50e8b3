// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Storage Module
//!
//! Persistent storage for the custody ledger, backed by a single redb file
//! under `DATA_DIR`.
//!
//! ## Storage Layout
//!
//! ```text
//! /data/
//!   ledger.redb    # All ledger tables (see `ledger_db`)
//! ```
//!
//! ## Important Notes
//!
//! - Every multi-row mutation runs in one write transaction via
//!   [`LedgerDb::write`]; repositories never commit on their own
//! - redb admits one writer at a time, so balance mutations are serialized
//! - Bills and balance changes are append-only

pub mod ledger_db;
pub mod repository;

pub use ledger_db::{LedgerDb, LedgerDbError, LedgerDbResult, LedgerRead};
pub use repository::{
    AccountAward, AccountAwardExt, AccountRepository, AwardInventory, AwardRepository,
    BalanceRepository, BillPage, BillRepository, GameRecharge, InsideMission,
    InsideMissionState, InvoiceKind, InvoiceRepository, InvoiceStatus, LimitBill, LimitDirection,
    LimitKey, LimitLevel, LimitRepository, LimitType, LocalInvoice, LockRepository, MissionLease,
    MissionRepository, OutsideMission, OutsideMissionState, OutsideMissionType,
    RechargeRepository, StoredMission,
};

/// File name of the ledger database inside the data directory.
pub const LEDGER_DB_FILE: &str = "ledger.redb";
