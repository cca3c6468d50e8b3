// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Custody - Custodial Bitcoin / Lightning / Taproot-Assets Ledger
//!
//! Accounting and payment-execution core of a custodial wallet: per-user
//! balances and lock balances, inside (ledger-only) and outside (payment
//! rail) payment missions, daily limits and exactly-once awards.
//!
//! ## Modules
//!
//! - `session` - Account directory and per-user payment gates
//! - `ledger` - Balance and lock ledger primitives
//! - `limits` - Daily per-user transfer limits
//! - `awards` - Idempotent award grants
//! - `missions` - Inside/outside payment state machines and recovery
//! - `payments` - Payment façade used by the API layer
//! - `rail` - Payment rail abstraction (Lightning / Taproot-Assets nodes)
//! - `notifier` - Game recharge notifications
//! - `storage` - Embedded ledger database (redb)

pub mod awards;
pub mod config;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod missions;
pub mod models;
pub mod notifier;
pub mod payments;
pub mod rail;
pub mod session;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;
