// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory payment rail.
//!
//! Behaves like a single node that issues invoices and addresses, and
//! "pays" anything it has decoded. Failures, outages, latency and routing
//! fees can be scripted, which is how the mission drivers are exercised.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    preimage_hash, sha256_hex, CreatedInvoice, DecodedAddress, DecodedInvoice, PaymentOutcome,
    PaymentRail, PaymentStatus, RailError,
};
use crate::models::Asset;

const INVOICE_PREFIX: &str = "lnmem1";
const ADDRESS_PREFIX: &str = "taprtmem1";
const NODE_PUBKEY: &str = "02memoryrail";

#[derive(Default)]
struct MemoryRailState {
    invoices: HashMap<String, DecodedInvoice>,
    addresses: HashMap<String, DecodedAddress>,
    payments: HashMap<String, PaymentStatus>,
    counter: u64,
    on_chain_balance: u64,
    routing_fee: u64,
    failures_remaining: u32,
    unavailable: bool,
    payment_delay: Duration,
    payment_attempts: u64,
}

pub struct MemoryRail {
    state: Mutex<MemoryRailState>,
}

impl MemoryRail {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryRailState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryRailState>, RailError> {
        self.state
            .lock()
            .map_err(|_| RailError::Unavailable("memory rail state poisoned".to_string()))
    }

    /// Routing fee charged on every successful payment.
    pub fn set_routing_fee(&self, fee: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.routing_fee = fee;
        }
    }

    /// Fail the next `count` payment attempts with `PaymentFailed`.
    pub fn fail_next_payments(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures_remaining = count;
        }
    }

    /// Make every call return `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Delay applied to every payment before it settles.
    pub fn set_payment_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.payment_delay = delay;
        }
    }

    pub fn set_on_chain_balance(&self, sats: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.on_chain_balance = sats;
        }
    }

    /// Record a payment as already settled (simulates a payment that went
    /// through right before a crash).
    pub fn mark_settled(&self, payment_hash: &str, fee: u64) {
        if let Ok(mut state) = self.state.lock() {
            state
                .payments
                .insert(payment_hash.to_string(), PaymentStatus::Succeeded { fee });
        }
    }

    /// Number of payment attempts that reached the rail.
    pub fn payment_attempts(&self) -> u64 {
        self.state.lock().map(|s| s.payment_attempts).unwrap_or(0)
    }

    fn next_reference(state: &mut MemoryRailState, prefix: &str) -> String {
        state.counter += 1;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{prefix}{}{}", state.counter, &nonce[..12])
    }

    /// Common settle path: checks outage and scripted failures, then
    /// records the outcome under `payment_hash`.
    async fn settle(&self, payment_hash: &str, fee_limit: u64) -> Result<PaymentOutcome, RailError> {
        let delay = {
            let mut state = self.state()?;
            if state.unavailable {
                return Err(RailError::Unavailable("node offline".to_string()));
            }
            if let Some(PaymentStatus::Succeeded { .. }) = state.payments.get(payment_hash) {
                return Err(RailError::PaymentFailed("already paid".to_string()));
            }
            state.payment_attempts += 1;
            state
                .payments
                .insert(payment_hash.to_string(), PaymentStatus::InFlight);
            state.payment_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state()?;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            state
                .payments
                .insert(payment_hash.to_string(), PaymentStatus::Failed);
            return Err(RailError::PaymentFailed("no route".to_string()));
        }

        let fee = state.routing_fee;
        if fee > fee_limit {
            state
                .payments
                .insert(payment_hash.to_string(), PaymentStatus::Failed);
            return Err(RailError::FeeLimitExceeded {
                fee,
                limit: fee_limit,
            });
        }

        state
            .payments
            .insert(payment_hash.to_string(), PaymentStatus::Succeeded { fee });
        Ok(PaymentOutcome {
            payment_hash: payment_hash.to_string(),
            fee,
        })
    }
}

impl Default for MemoryRail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentRail for MemoryRail {
    async fn pay_invoice(
        &self,
        invoice: &str,
        amount_limit: u64,
        fee_limit: u64,
    ) -> Result<PaymentOutcome, RailError> {
        let decoded = self.decode_invoice(invoice).await?;
        if decoded.amount > amount_limit {
            return Err(RailError::AmountLimitExceeded {
                amount: decoded.amount,
                limit: amount_limit,
            });
        }
        self.settle(&decoded.payment_hash, fee_limit).await
    }

    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice, RailError> {
        let state = self.state()?;
        state
            .invoices
            .get(invoice)
            .cloned()
            .ok_or_else(|| RailError::InvalidReference(format!("unknown invoice {invoice}")))
    }

    async fn decode_address(&self, address: &str) -> Result<DecodedAddress, RailError> {
        let state = self.state()?;
        state
            .addresses
            .get(address)
            .cloned()
            .ok_or_else(|| RailError::InvalidReference(format!("unknown address {address}")))
    }

    async fn create_invoice(
        &self,
        asset: &Asset,
        amount: u64,
        memo: Option<&str>,
    ) -> Result<CreatedInvoice, RailError> {
        let mut state = self.state()?;
        let invoice = Self::next_reference(&mut state, INVOICE_PREFIX);
        let payment_hash = sha256_hex(invoice.as_bytes());
        state.invoices.insert(
            invoice.clone(),
            DecodedInvoice {
                invoice: invoice.clone(),
                payment_hash: payment_hash.clone(),
                amount,
                asset: asset.clone(),
                destination: NODE_PUBKEY.to_string(),
                memo: memo.map(str::to_string),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        );
        Ok(CreatedInvoice {
            invoice,
            payment_hash,
        })
    }

    async fn create_address(&self, asset_id: &str, amount: u64) -> Result<String, RailError> {
        let mut state = self.state()?;
        let address = Self::next_reference(&mut state, ADDRESS_PREFIX);
        state.addresses.insert(
            address.clone(),
            DecodedAddress {
                address: address.clone(),
                asset: Asset::from_asset_id(Some(asset_id)),
                amount,
                correlation_id: sha256_hex(address.as_bytes()),
            },
        );
        Ok(address)
    }

    async fn send_assets_to(&self, addresses: &[String]) -> Result<PaymentOutcome, RailError> {
        let first = addresses
            .first()
            .ok_or_else(|| RailError::InvalidReference("no addresses".to_string()))?;
        let mut decoded = Vec::with_capacity(addresses.len());
        for address in addresses {
            decoded.push(self.decode_address(address).await?);
        }
        let correlation = if decoded.len() == 1 {
            decoded[0].correlation_id.clone()
        } else {
            sha256_hex(addresses.join(",").as_bytes())
        };
        tracing::debug!(first = %first, count = decoded.len(), "Memory rail asset send");
        self.settle(&correlation, u64::MAX).await
    }

    async fn on_chain_balance(&self) -> Result<u64, RailError> {
        let state = self.state()?;
        if state.unavailable {
            return Err(RailError::Unavailable("node offline".to_string()));
        }
        Ok(state.on_chain_balance)
    }

    async fn keysend_payment(
        &self,
        _asset: &Asset,
        amount: u64,
        dest_pubkey: &str,
        preimage: &str,
        _channel: Option<u64>,
    ) -> Result<PaymentOutcome, RailError> {
        if amount == 0 || dest_pubkey.is_empty() {
            return Err(RailError::InvalidReference(
                "keysend needs an amount and destination".to_string(),
            ));
        }
        let payment_hash = preimage_hash(preimage)?;
        self.settle(&payment_hash, u64::MAX).await
    }

    async fn payment_status(&self, payment_hash: &str) -> Result<PaymentStatus, RailError> {
        let state = self.state()?;
        if state.unavailable {
            return Err(RailError::Unavailable("node offline".to_string()));
        }
        Ok(state
            .payments
            .get(payment_hash)
            .copied()
            .unwrap_or(PaymentStatus::Unknown))
    }
}
