// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Rail
//!
//! Capability surface of the external Lightning / Taproot-Assets nodes.
//! The custody core never speaks a node protocol directly; it only calls
//! [`PaymentRail`]. Production deployments plug in a node-backed
//! implementation, tests and local runs use [`MemoryRail`].
//!
//! ## Correlation
//!
//! Every outbound payment is identified by a correlation hash known
//! *before* the payment is attempted:
//!
//! - invoice payments use the invoice's payment hash
//! - keysend payments use `sha256(preimage)`, the preimage being chosen
//!   by the caller
//! - asset address sends use the `correlation_id` returned by
//!   [`PaymentRail::decode_address`]
//!
//! This lets a restarted driver ask [`PaymentRail::payment_status`] whether
//! a payment it may have issued went through.

mod memory;

pub use memory::MemoryRail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::Asset;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RailError {
    /// Node unreachable or overloaded; the call may be retried.
    #[error("payment rail unavailable: {0}")]
    Unavailable(String),

    /// The payment was attempted and definitely failed.
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("routing fee {fee} exceeds limit {limit}")]
    FeeLimitExceeded { fee: u64, limit: u64 },

    #[error("amount {amount} exceeds limit {limit}")]
    AmountLimitExceeded { amount: u64, limit: u64 },
}

impl RailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RailError::Unavailable(_))
    }
}

/// Decoded Lightning invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInvoice {
    pub invoice: String,
    pub payment_hash: String,
    /// `0` for amountless invoices.
    pub amount: u64,
    pub asset: Asset,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Decoded Taproot-Assets address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedAddress {
    pub address: String,
    pub asset: Asset,
    pub amount: u64,
    pub correlation_id: String,
}

/// Invoice created on our node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub invoice: String,
    pub payment_hash: String,
}

/// Result of a successful outbound payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment_hash: String,
    /// Fee actually paid to the network.
    pub fee: u64,
}

/// What the rail knows about a payment identified by its correlation hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum PaymentStatus {
    Succeeded { fee: u64 },
    Failed,
    InFlight,
    /// The rail has never seen this payment.
    Unknown,
}

#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Pay a Lightning invoice, refusing to spend more than the limits.
    async fn pay_invoice(
        &self,
        invoice: &str,
        amount_limit: u64,
        fee_limit: u64,
    ) -> Result<PaymentOutcome, RailError>;

    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice, RailError>;

    async fn decode_address(&self, address: &str) -> Result<DecodedAddress, RailError>;

    async fn create_invoice(
        &self,
        asset: &Asset,
        amount: u64,
        memo: Option<&str>,
    ) -> Result<CreatedInvoice, RailError>;

    async fn create_address(&self, asset_id: &str, amount: u64) -> Result<String, RailError>;

    /// Send assets to one or more Taproot-Assets addresses in one transfer.
    async fn send_assets_to(&self, addresses: &[String]) -> Result<PaymentOutcome, RailError>;

    /// Confirmed on-chain balance of the node wallet, in sats.
    async fn on_chain_balance(&self) -> Result<u64, RailError>;

    /// Spontaneous payment to `dest_pubkey` settled by `preimage` (hex).
    async fn keysend_payment(
        &self,
        asset: &Asset,
        amount: u64,
        dest_pubkey: &str,
        preimage: &str,
        channel: Option<u64>,
    ) -> Result<PaymentOutcome, RailError>;

    async fn payment_status(&self, payment_hash: &str) -> Result<PaymentStatus, RailError>;
}

/// Hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fresh random 32-byte keysend preimage (hex).
pub fn new_preimage() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    hex::encode(bytes)
}

/// Payment hash settled by a hex preimage.
pub fn preimage_hash(preimage: &str) -> Result<String, RailError> {
    let bytes = hex::decode(preimage)
        .map_err(|e| RailError::InvalidReference(format!("preimage: {e}")))?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimages_are_unique_and_hash_consistently() {
        let a = new_preimage();
        let b = new_preimage();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(preimage_hash(&a).unwrap(), preimage_hash(&a).unwrap());
        assert!(preimage_hash("zz").is_err());
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(RailError::Unavailable("x".into()).is_transient());
        assert!(!RailError::PaymentFailed("x".into()).is_transient());
        assert!(!RailError::FeeLimitExceeded { fee: 2, limit: 1 }.is_transient());
    }
}
