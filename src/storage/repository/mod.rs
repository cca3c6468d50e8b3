// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer providing typed access to the ledger database.
//!
//! Each repository wraps a transaction. Lookups are available on any
//! [`LedgerRead`](super::LedgerRead) transaction; mutations are only
//! available when the repository wraps a `WriteTransaction`, so they always
//! commit or abort together with the rest of the caller's transaction.

pub mod accounts;
pub mod awards;
pub mod balances;
pub mod bills;
pub mod invoices;
pub mod limits;
pub mod locks;
pub mod missions;
pub mod recharges;

pub use accounts::AccountRepository;
pub use awards::{AccountAward, AccountAwardExt, AwardInventory, AwardRepository};
pub use balances::BalanceRepository;
pub use bills::{BillPage, BillRepository};
pub use invoices::{InvoiceKind, InvoiceRepository, InvoiceStatus, LocalInvoice};
pub use limits::{LimitBill, LimitDirection, LimitKey, LimitLevel, LimitRepository, LimitType};
pub use locks::LockRepository;
pub use missions::{
    InsideMission, InsideMissionState, MissionLease, MissionRepository, OutsideMission,
    OutsideMissionState, OutsideMissionType, StoredMission,
};
pub use recharges::{GameRecharge, RechargeRepository};
