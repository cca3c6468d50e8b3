// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Domain errors of the custody core.
//!
//! Errors fall into seven classes: identity, funds, idempotency, limit,
//! reference, infrastructure and timeout. Everything except infrastructure
//! and timeout is raised before any ledger mutation happens.

use crate::models::Asset;
use crate::rail::RailError;
use crate::storage::LedgerDbError;

#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    // -- identity --
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("user {0} is locked")]
    UserLocked(String),

    #[error("session pool is full, try again later")]
    PoolFull,

    // -- funds --
    #[error("insufficient funds: balance {available} {asset}, required {required}")]
    InsufficientFunds {
        asset: Asset,
        available: u64,
        required: u64,
    },

    #[error("insufficient locked funds: releasable {available} {asset}, required {required}")]
    InsufficientLockedFunds {
        asset: Asset,
        available: u64,
        required: u64,
    },

    #[error("house account cannot cover {required} {asset}")]
    InsufficientHouseFunds { asset: Asset, required: u64 },

    // -- idempotency --
    #[error("idempotency key {0} was already used")]
    RepeatedLockId(String),

    // -- limit --
    #[error("daily limit exceeded: usable {usable_amount} ({usable_count} transfers left), requested {requested}")]
    LimitExceeded {
        usable_amount: u64,
        usable_count: u32,
        requested: u64,
    },

    #[error("transfers too frequent, wait a few seconds")]
    TooFrequent,

    #[error("transfers are disabled for this account")]
    LimitEntirely,

    // -- reference --
    #[error("invalid payment reference: {0}")]
    InvalidReference(String),

    #[error("asset mismatch: expected {expected}, got {actual}")]
    AssetMismatch { expected: Asset, actual: Asset },

    #[error("invoice already paid")]
    InvoiceAlreadyPaid,

    #[error("cannot pay yourself")]
    SelfPayment,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("award inventory for {0} is disabled")]
    AwardInventoryDisabled(Asset),

    #[error("award inventory for {asset} exhausted: remaining {remaining}, requested {requested}")]
    AwardInventoryExhausted {
        asset: Asset,
        remaining: u64,
        requested: u64,
    },

    // -- payment gate --
    #[error("a payment was just made, retry in {retry_after_secs}s")]
    PaymentBusy { retry_after_secs: u64 },

    // -- missions --
    #[error("mission {0} not found")]
    MissionNotFound(u64),

    #[error("mission {0} is being driven by another worker")]
    MissionBusy(u64),

    #[error("mission {id} failed: {reason}")]
    MissionFailed { id: u64, reason: String },

    #[error("mission {0} abandoned after too many retries")]
    MissionAbandoned(u64),

    // -- infrastructure --
    #[error("payment rail error: {0}")]
    Rail(#[from] RailError),

    #[error("service busy: {0}")]
    Storage(#[from] LedgerDbError),

    #[error("internal error: {0}")]
    Internal(String),

    // -- timeout --
    #[error("payment is still processing, try checking history")]
    Timeout,
}

pub type CustodyResult<T> = Result<T, CustodyError>;

impl CustodyError {
    /// Stable reason code for API consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CustodyError::UserNotFound(_) => "user_not_found",
            CustodyError::UserLocked(_) => "user_locked",
            CustodyError::PoolFull => "pool_full",
            CustodyError::InsufficientFunds { .. } => "insufficient_funds",
            CustodyError::InsufficientLockedFunds { .. } => "insufficient_locked_funds",
            CustodyError::InsufficientHouseFunds { .. } => "insufficient_house_funds",
            CustodyError::RepeatedLockId(_) => "repeated_lock_id",
            CustodyError::LimitExceeded { .. } => "limit_exceeded",
            CustodyError::TooFrequent => "too_frequent",
            CustodyError::LimitEntirely => "limit_entirely",
            CustodyError::InvalidReference(_) => "invalid_reference",
            CustodyError::AssetMismatch { .. } => "asset_mismatch",
            CustodyError::InvoiceAlreadyPaid => "invoice_already_paid",
            CustodyError::SelfPayment => "self_payment",
            CustodyError::InvalidAmount(_) => "invalid_amount",
            CustodyError::AwardInventoryDisabled(_) => "award_inventory_disabled",
            CustodyError::AwardInventoryExhausted { .. } => "award_inventory_exhausted",
            CustodyError::PaymentBusy { .. } => "payment_busy",
            CustodyError::MissionNotFound(_) => "mission_not_found",
            CustodyError::MissionBusy(_) => "mission_busy",
            CustodyError::MissionFailed { .. } => "mission_failed",
            CustodyError::MissionAbandoned(_) => "mission_abandoned",
            CustodyError::Rail(_) => "rail_error",
            CustodyError::Storage(_) => "service_busy",
            CustodyError::Internal(_) => "internal_error",
            CustodyError::Timeout => "timeout",
        }
    }

    /// Infrastructure failures: a mission that hits one stays in its
    /// current state and is retried on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            CustodyError::Storage(_) | CustodyError::Internal(_) => true,
            CustodyError::Rail(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_snake_case() {
        let errors = [
            CustodyError::PoolFull,
            CustodyError::TooFrequent,
            CustodyError::InsufficientFunds {
                asset: Asset::Native,
                available: 1,
                required: 2,
            },
            CustodyError::Storage(LedgerDbError::NotFound("x".into())),
        ];
        for err in errors {
            let code = err.reason_code();
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{code}");
        }
    }

    #[test]
    fn timeout_points_to_history() {
        assert!(CustodyError::Timeout
            .to_string()
            .contains("try checking history"));
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(CustodyError::Storage(LedgerDbError::NotFound("x".into())).is_retryable());
        assert!(CustodyError::Rail(RailError::Unavailable("down".into())).is_retryable());
        assert!(!CustodyError::Rail(RailError::PaymentFailed("no route".into())).is_retryable());
        assert!(!CustodyError::InsufficientFunds {
            asset: Asset::Native,
            available: 0,
            required: 1,
        }
        .is_retryable());
        assert!(!CustodyError::LimitEntirely.is_retryable());
    }
}
