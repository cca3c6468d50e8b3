// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Data Models
//!
//! Shared record types persisted by the ledger storage layer. Every value
//! moved by the custodian is described by a [`Bill`] (one directional entry)
//! and mirrored by a [`BalanceChange`] (the audit row of the aggregate
//! balance it touched).
//!
//! ## Amounts
//!
//! Amounts are unsigned integers in the smallest unit of their asset:
//! satoshis for the native coin, base units for Taproot assets.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Asset
// =============================================================================

/// Key used for the native coin in composite storage keys.
pub const NATIVE_ASSET_KEY: &str = "btc";

/// Asset held in custody.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    /// Native coin (BTC, denominated in sats)
    Native,
    /// Taproot asset identified by its hex asset id
    Taproot(String),
}

impl Asset {
    /// Build an asset from a nullable asset id (`None` ⇒ native coin).
    pub fn from_asset_id(asset_id: Option<&str>) -> Self {
        match asset_id {
            Some(id) if !id.is_empty() && id != NATIVE_ASSET_KEY => Asset::Taproot(id.to_string()),
            _ => Asset::Native,
        }
    }

    /// Stable key used in storage keys.
    pub fn key(&self) -> &str {
        match self {
            Asset::Native => NATIVE_ASSET_KEY,
            Asset::Taproot(id) => id,
        }
    }

    /// The asset id, `None` for the native coin.
    pub fn asset_id(&self) -> Option<&str> {
        match self {
            Asset::Native => None,
            Asset::Taproot(id) => Some(id),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }

    /// Unit label recorded on bills.
    pub fn unit(&self) -> &'static str {
        match self {
            Asset::Native => "sat",
            Asset::Taproot(_) => "unit",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// =============================================================================
// Users & Accounts
// =============================================================================

/// Enabled/disabled switch shared by users and accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Role of an account. A user owns at most one account per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountRole {
    Normal,
    Locked,
    GameReceive,
    Pool,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Normal => "normal",
            AccountRole::Locked => "locked",
            AccountRole::GameReceive => "game-receive",
            AccountRole::Pool => "pool",
        }
    }
}

/// A registered custodial user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A balance-holding account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_id: u64,
    pub username: String,
    pub role: AccountRole,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

/// Shadow account holding the locked funds of a normal account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockAccount {
    pub lock_account_id: u64,
    pub username: String,
    /// The normal account this lock account shadows.
    pub account_id: u64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Bills
// =============================================================================

/// Direction of a bill relative to its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Business category of a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillType {
    Transfer,
    Fee,
    LockUnlock,
    Award,
    OfferAward,
    PendingOrder,
    Replace,
    Refund,
}

/// Lifecycle of a bill. `Success` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillState {
    #[default]
    Unknown,
    Success,
    Failed,
}

impl BillState {
    pub fn is_final(&self) -> bool {
        !matches!(self, BillState::Unknown)
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bill {
    pub bill_id: u64,
    pub account_id: u64,
    pub asset: Asset,
    pub bill_type: BillType,
    pub direction: Direction,
    pub amount: u64,
    pub unit: String,
    /// Free-form reference (invoice, address, memo or counterparty).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    pub state: BillState,
    pub server_fee: u64,
    /// Reporting tag (e.g. "award", "game-recharge").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_ext: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Balances
// =============================================================================

/// Current spendable balance of one account for one asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateBalance {
    pub account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    pub updated_at: DateTime<Utc>,
}

/// Cause of an aggregate balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    Fee,
    FeeIncome,
    PayLocal,
    ReceiveLocal,
    PayOutside,
    ReceiveOutside,
    OutsideRefund,
    Award,
    OfferAward,
    Lock,
    Unlock,
    LockedTransferIn,
    GameRecharge,
}

/// Audit row written alongside every aggregate balance mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceChange {
    pub change_id: u64,
    pub account_id: u64,
    pub asset: Asset,
    /// Signed delta applied to the balance.
    pub delta: i64,
    pub balance_after: u64,
    pub direction: Direction,
    pub bill_id: u64,
    pub change_type: ChangeType,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Locks
// =============================================================================

/// Sub-tag of a lock request. `Restricted` funds count towards `tag1`
/// and can only be released by a `Restricted` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockTag {
    #[default]
    Ordinary,
    Restricted,
}

/// Locked funds of one lock account for one asset.
///
/// Invariant: `tag1 <= amount`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockBalance {
    pub lock_account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    pub tag1: u64,
    pub updated_at: DateTime<Utc>,
}

impl LockBalance {
    /// Amount a request with the given tag may release.
    pub fn releasable(&self, tag: LockTag) -> u64 {
        match tag {
            LockTag::Restricted => self.amount,
            LockTag::Ordinary => self.amount - self.tag1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockBillKind {
    Lock,
    Unlock,
    TransferOut,
}

/// Record of one lock-ledger operation, unique per (lock account, key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockBill {
    pub lock_bill_id: u64,
    pub lock_account_id: u64,
    pub asset: Asset,
    pub idempotency_key: String,
    pub kind: LockBillKind,
    pub amount: u64,
    pub tag: LockTag,
    /// Normal-ledger bill produced by this operation.
    pub balance_bill_id: u64,
    /// Receiving account for `TransferOut`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_account_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}
