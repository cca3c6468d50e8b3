// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Façade
//!
//! Entry points used by the API layer to move money on behalf of a user.
//!
//! ## Send flow
//!
//! 1. Acquire the user's payment gate (refused during the cooldown).
//! 2. Classify the reference: an outstanding invoice or address issued by
//!    this custodian is paid inside, anything the rail can decode is paid
//!    outside.
//! 3. Check the daily limit and the payer's funds. Nothing is written when
//!    either check fails.
//! 4. Persist the mission and drive it in a detached task. The caller waits
//!    at most `pay_wait`; the gate stays held until the mission finishes.
//!
//! ## Fee limits
//!
//! | Route | Routing fee limit | Service fee |
//! |-------|-------------------|-------------|
//! | inside | none | `local_transfer_fee` |
//! | invoice, keysend | 1 % of the amount, at least 10 sats | `outside_service_fee` |
//! | asset address | `ASSET_SEND_FEE_LIMIT` | `outside_service_fee` |
//!
//! All fees are charged in the native coin.

pub mod detach;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::{CustodyError, CustodyResult};
use crate::ledger::{BalanceLedger, LedgerEntry, LedgerService};
use crate::missions::inside;
use crate::missions::outside::{self, OutsideTarget};
use crate::missions::{drive, Mission, MissionContext};
use crate::models::{Account, AccountRole, Asset, Bill, BillType, ChangeType};
use crate::rail::{new_preimage, preimage_hash, PaymentStatus, RailError};
use crate::session::{PayPermit, UserSession};
use crate::storage::{
    BalanceRepository, BillPage, InsideMission, InsideMissionState, InvoiceKind,
    InvoiceRepository, InvoiceStatus, LimitDirection, LimitKey, LocalInvoice, MissionRepository,
    OutsideMission, OutsideMissionState, OutsideMissionType,
};

use self::detach::bounded_wait;

/// Routing fee limit floor for invoices and keysend, in sats.
pub const MIN_ROUTING_FEE_LIMIT: u64 = 10;

/// Routing fee limit for Taproot-Assets address sends, in sats.
pub const ASSET_SEND_FEE_LIMIT: u64 = 2_000;

/// Terminal mission returned to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "route", rename_all = "lowercase")]
pub enum PaymentReceipt {
    Inside(InsideMission),
    Outside(OutsideMission),
}

impl PaymentReceipt {
    pub fn mission_id(&self) -> u64 {
        match self {
            PaymentReceipt::Inside(m) => m.mission_id,
            PaymentReceipt::Outside(m) => m.mission_id,
        }
    }
}

/// Where a classified payment goes.
enum Route {
    Inside {
        receiver: String,
        asset: Asset,
        amount: u64,
        invoice: String,
    },
    Outside {
        asset: Asset,
        amount: u64,
        target: OutsideTarget,
        fee_limit: u64,
    },
}

fn routing_fee_limit(amount: u64) -> u64 {
    (amount / 100).max(MIN_ROUTING_FEE_LIMIT)
}

pub struct PaymentFacade {
    ctx: Arc<MissionContext>,
    ledger: LedgerService,
}

impl PaymentFacade {
    pub fn new(ctx: Arc<MissionContext>) -> Self {
        let ledger = LedgerService::new(ctx.db.clone(), ctx.sessions.clone());
        Self { ctx, ledger }
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Create a Lightning invoice payable to `username`.
    pub async fn apply_pay_req(
        &self,
        username: &str,
        asset: &Asset,
        amount: u64,
        memo: Option<&str>,
    ) -> CustodyResult<LocalInvoice> {
        if amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        let session = self.ctx.sessions.resolve(username)?;
        let created = self.ctx.rail.create_invoice(asset, amount, memo).await?;

        let invoice = LocalInvoice {
            reference: created.invoice,
            kind: InvoiceKind::Invoice,
            username: session.username().to_string(),
            account_id: session.account.account_id,
            asset: asset.clone(),
            amount,
            payment_hash: Some(created.payment_hash),
            memo: memo.map(str::to_string),
            status: InvoiceStatus::Outstanding,
            created_at: Utc::now(),
            paid_at: None,
        };
        self.ctx
            .db
            .write(|txn| InvoiceRepository::new(txn).put(&invoice))?;

        info!(
            username = %invoice.username,
            asset = %asset,
            amount,
            "Invoice issued"
        );
        Ok(invoice)
    }

    /// Create a Taproot-Assets address payable to `username`.
    pub async fn apply_address(
        &self,
        username: &str,
        asset: &Asset,
        amount: u64,
    ) -> CustodyResult<LocalInvoice> {
        let asset_id = asset.asset_id().ok_or_else(|| {
            CustodyError::InvalidReference("addresses are issued for taproot assets only".to_string())
        })?;
        if amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        let session = self.ctx.sessions.resolve(username)?;
        let address = self.ctx.rail.create_address(asset_id, amount).await?;
        let decoded = self.ctx.rail.decode_address(&address).await?;

        let invoice = LocalInvoice {
            reference: address,
            kind: InvoiceKind::Address,
            username: session.username().to_string(),
            account_id: session.account.account_id,
            asset: asset.clone(),
            amount,
            payment_hash: Some(decoded.correlation_id),
            memo: None,
            status: InvoiceStatus::Outstanding,
            created_at: Utc::now(),
            paid_at: None,
        };
        self.ctx
            .db
            .write(|txn| InvoiceRepository::new(txn).put(&invoice))?;

        info!(
            username = %invoice.username,
            asset = %asset,
            amount,
            "Address issued"
        );
        Ok(invoice)
    }

    /// Credit an incoming rail payment to the owner of a local invoice.
    ///
    /// `amount` of `0` credits the invoice amount. Returns `None` when the
    /// invoice was already settled.
    pub fn settle_incoming(
        &self,
        reference: &str,
        asset: &Asset,
        amount: u64,
    ) -> CustodyResult<Option<Bill>> {
        let bill = self.ctx.db.write(|txn| {
            let invoices = InvoiceRepository::new(txn);
            let local = invoices.get(reference)?.ok_or_else(|| {
                CustodyError::InvalidReference(format!("unknown local reference {reference}"))
            })?;
            if local.status == InvoiceStatus::Paid {
                return Ok(None);
            }
            if &local.asset != asset {
                return Err(CustodyError::AssetMismatch {
                    expected: local.asset,
                    actual: asset.clone(),
                });
            }

            let received = if amount == 0 { local.amount } else { amount };
            if received < local.amount {
                return Err(CustodyError::InvalidAmount(format!(
                    "received {received}, invoice requests {}",
                    local.amount
                )));
            }

            let bill = BalanceLedger::new(txn).credit(
                LedgerEntry::new(
                    local.account_id,
                    local.asset.clone(),
                    received,
                    BillType::Transfer,
                    ChangeType::ReceiveOutside,
                )
                .with_invoice(reference)
                .with_optional_payment_hash(local.payment_hash.clone())
                .with_type_ext(match local.kind {
                    InvoiceKind::Invoice => "invoice",
                    InvoiceKind::Address => "asset-address",
                }),
            )?;
            invoices.mark_paid(reference)?;
            Ok::<_, CustodyError>(Some(bill))
        })?;

        match &bill {
            Some(bill) => info!(
                bill_id = bill.bill_id,
                account_id = bill.account_id,
                amount = bill.amount,
                "Incoming payment settled"
            ),
            None => info!(reference, "Incoming payment already settled, replay ignored"),
        }
        Ok(bill)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Pay an invoice or address on behalf of `username`.
    pub async fn send_payment(&self, username: &str, reference: &str) -> CustodyResult<PaymentReceipt> {
        let session = self.ctx.sessions.resolve(username)?;
        let permit = session.gate.acquire().await?;

        match self.classify(&session, reference).await? {
            Route::Inside {
                receiver,
                asset,
                amount,
                invoice,
            } => {
                self.start_inside(&session, permit, &receiver, asset, amount, Some(invoice))
                    .await
            }
            Route::Outside {
                asset,
                amount,
                target,
                fee_limit,
            } => {
                self.start_outside(&session, permit, asset, amount, target, fee_limit)
                    .await
            }
        }
    }

    /// Transfer directly to another user of this custodian.
    pub async fn send_payment_to_user(
        &self,
        payer: &str,
        receiver: &str,
        asset: &Asset,
        amount: u64,
    ) -> CustodyResult<PaymentReceipt> {
        if amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        let session = self.ctx.sessions.resolve(payer)?;
        let permit = session.gate.acquire().await?;
        self.start_inside(&session, permit, receiver, asset.clone(), amount, None)
            .await
    }

    /// Spontaneous native payment to a node pubkey.
    pub async fn send_keysend(
        &self,
        username: &str,
        dest_pubkey: &str,
        amount: u64,
    ) -> CustodyResult<PaymentReceipt> {
        if amount == 0 {
            return Err(CustodyError::InvalidAmount("amount must be positive".to_string()));
        }
        if dest_pubkey.trim().is_empty() {
            return Err(CustodyError::InvalidReference("missing destination".to_string()));
        }
        let session = self.ctx.sessions.resolve(username)?;
        let permit = session.gate.acquire().await?;

        let preimage = new_preimage();
        let target = OutsideTarget {
            mission_type: OutsideMissionType::Keysend,
            target: dest_pubkey.to_string(),
            payment_hash: preimage_hash(&preimage)?,
            preimage: Some(preimage),
        };
        self.start_outside(
            &session,
            permit,
            Asset::Native,
            amount,
            target,
            routing_fee_limit(amount),
        )
        .await
    }

    async fn classify(&self, session: &UserSession, reference: &str) -> CustodyResult<Route> {
        let local = self
            .ctx
            .db
            .read(|txn| InvoiceRepository::new(txn).get(reference))?;
        if let Some(local) = local {
            if local.status == InvoiceStatus::Paid {
                return Err(CustodyError::InvoiceAlreadyPaid);
            }
            if local.username == session.username() {
                return Err(CustodyError::SelfPayment);
            }
            return Ok(Route::Inside {
                receiver: local.username,
                asset: local.asset,
                amount: local.amount,
                invoice: local.reference,
            });
        }

        let rail = &self.ctx.rail;
        let route = match rail.decode_invoice(reference).await {
            Ok(decoded) => {
                if decoded.amount == 0 {
                    return Err(CustodyError::InvalidAmount(
                        "amountless invoices are not supported".to_string(),
                    ));
                }
                if decoded.expires_at <= Utc::now() {
                    return Err(CustodyError::InvalidReference("invoice expired".to_string()));
                }
                Route::Outside {
                    asset: decoded.asset,
                    amount: decoded.amount,
                    fee_limit: routing_fee_limit(decoded.amount),
                    target: OutsideTarget {
                        mission_type: OutsideMissionType::Invoice,
                        target: reference.to_string(),
                        payment_hash: decoded.payment_hash,
                        preimage: None,
                    },
                }
            }
            Err(RailError::InvalidReference(_)) => {
                let decoded = rail.decode_address(reference).await.map_err(|e| match e {
                    RailError::InvalidReference(_) => CustodyError::InvalidReference(
                        "not a payable invoice or address".to_string(),
                    ),
                    other => other.into(),
                })?;
                if decoded.amount == 0 {
                    return Err(CustodyError::InvalidAmount("address carries no amount".to_string()));
                }
                Route::Outside {
                    asset: decoded.asset,
                    amount: decoded.amount,
                    fee_limit: ASSET_SEND_FEE_LIMIT,
                    target: OutsideTarget {
                        mission_type: OutsideMissionType::AssetAddress,
                        target: reference.to_string(),
                        payment_hash: decoded.correlation_id,
                        preimage: None,
                    },
                }
            }
            Err(e) => return Err(e.into()),
        };

        // A payment the rail already knows about is not ours to make.
        if let Route::Outside { target, .. } = &route {
            match rail.payment_status(&target.payment_hash).await? {
                PaymentStatus::Succeeded { .. } | PaymentStatus::InFlight => {
                    return Err(CustodyError::InvoiceAlreadyPaid)
                }
                PaymentStatus::Failed | PaymentStatus::Unknown => {}
            }
        }
        Ok(route)
    }

    async fn start_inside(
        &self,
        session: &UserSession,
        permit: PayPermit,
        receiver: &str,
        asset: Asset,
        amount: u64,
        invoice: Option<String>,
    ) -> CustodyResult<PaymentReceipt> {
        if receiver == session.username() {
            return Err(CustodyError::SelfPayment);
        }
        let receiver_account = self.receiving_account(receiver)?;
        let fee = self.ctx.config.local_transfer_fee;

        self.ensure_funds(session, &[(&asset, amount), (&Asset::Native, fee)])?;
        self.ctx.limits.check_and_reserve(
            session.username(),
            &LimitKey::new(asset.clone(), LimitDirection::Local),
            amount,
        )?;

        let mission = self.ctx.db.write(|txn| {
            MissionRepository::new(txn).insert(inside::draft(
                &session.account,
                &receiver_account,
                asset.clone(),
                amount,
                fee,
                Asset::Native,
                invoice.clone(),
            ))
        })?;
        info!(
            mission_id = mission.mission_id,
            payer = %session.username(),
            receiver,
            asset = %asset,
            amount,
            "Inside payment started"
        );

        self.dispatch::<InsideMission>(permit, mission.mission_id)
            .await
            .map(PaymentReceipt::Inside)
    }

    async fn start_outside(
        &self,
        session: &UserSession,
        permit: PayPermit,
        asset: Asset,
        amount: u64,
        target: OutsideTarget,
        fee_limit: u64,
    ) -> CustodyResult<PaymentReceipt> {
        let service_fee = self.ctx.config.outside_service_fee;
        let max_fees = fee_limit.saturating_add(service_fee);

        self.ensure_funds(session, &[(&asset, amount), (&Asset::Native, max_fees)])?;
        self.ctx.limits.check_and_reserve(
            session.username(),
            &LimitKey::new(asset.clone(), LimitDirection::Outside),
            amount,
        )?;

        let mission_type = target.mission_type;
        let mission = self.ctx.db.write(|txn| {
            MissionRepository::new(txn).insert(outside::draft(
                &session.account,
                asset.clone(),
                target,
                amount,
                fee_limit,
                service_fee,
            ))
        })?;
        info!(
            mission_id = mission.mission_id,
            username = %session.username(),
            mission_type = mission_type.as_str(),
            asset = %asset,
            amount,
            fee_limit,
            "Outside payment started"
        );

        self.dispatch::<OutsideMission>(permit, mission.mission_id)
            .await
            .map(PaymentReceipt::Outside)
    }

    /// Drive the mission detached; the permit is released when it ends.
    async fn dispatch<M: Mission>(&self, mut permit: PayPermit, mission_id: u64) -> CustodyResult<M> {
        permit.mark_dispatched();
        let ctx = self.ctx.clone();
        bounded_wait(self.ctx.config.pay_wait, M::KIND, mission_id, async move {
            let _permit = permit;
            drive::<M>(&ctx, mission_id).await
        })
        .await
    }

    fn receiving_account(&self, username: &str) -> CustodyResult<Account> {
        if self.ctx.config.is_game_settlement_user(username) {
            self.ctx
                .sessions
                .resolve_account(username, AccountRole::GameReceive)
        } else {
            Ok(self.ctx.sessions.resolve(username)?.account.clone())
        }
    }

    /// Fail with `InsufficientFunds` unless every requirement is covered.
    /// Requirements on the same asset add up.
    fn ensure_funds(&self, session: &UserSession, needs: &[(&Asset, u64)]) -> CustodyResult<()> {
        let mut totals: Vec<(&Asset, u64)> = Vec::with_capacity(needs.len());
        for &(asset, amount) in needs {
            if amount == 0 {
                continue;
            }
            match totals.iter_mut().find(|(a, _)| *a == asset) {
                Some((_, total)) => *total = total.saturating_add(amount),
                None => totals.push((asset, amount)),
            }
        }

        let account_id = session.account.account_id;
        self.ctx.db.read(|txn| {
            let balances = BalanceRepository::new(txn);
            for &(asset, required) in &totals {
                let available = balances.get(account_id, asset)?.amount;
                if available < required {
                    return Err(CustodyError::InsufficientFunds {
                        asset: asset.clone(),
                        available,
                        required,
                    });
                }
            }
            Ok(())
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_transaction_history(
        &self,
        username: &str,
        asset: Option<&Asset>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> CustodyResult<BillPage> {
        self.ledger.history(username, asset, cursor, limit)
    }

    pub fn inside_missions(
        &self,
        state: Option<InsideMissionState>,
    ) -> CustodyResult<Vec<InsideMission>> {
        let missions = self
            .ctx
            .db
            .read(|txn| MissionRepository::new(txn).list::<InsideMission>())?;
        Ok(missions
            .into_iter()
            .filter(|m| state.map_or(true, |s| m.state == s))
            .collect())
    }

    pub fn outside_missions(
        &self,
        state: Option<OutsideMissionState>,
    ) -> CustodyResult<Vec<OutsideMission>> {
        let missions = self
            .ctx
            .db
            .read(|txn| MissionRepository::new(txn).list::<OutsideMission>())?;
        Ok(missions
            .into_iter()
            .filter(|m| state.map_or(true, |s| m.state == s))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillState, Direction};
    use crate::rail::PaymentRail;
    use crate::storage::{LimitLevel, LimitType};
    use crate::testing::TestHarness;
    use std::time::Duration;

    fn bills(h: &TestHarness, username: &str) -> Vec<Bill> {
        h.payments
            .get_transaction_history(username, None, None, None)
            .unwrap()
            .bills
    }

    #[tokio::test]
    async fn local_transfer_moves_amount_and_fee() {
        let h = TestHarness::new();
        h.fund("alice", 1000);

        let receipt = h
            .payments
            .send_payment_to_user("alice", "bob", &Asset::Native, 300)
            .await
            .unwrap();
        let PaymentReceipt::Inside(mission) = receipt else {
            panic!("expected an inside payment");
        };
        assert_eq!(mission.state, InsideMissionState::Success);

        assert_eq!(h.balance("alice"), 690);
        assert_eq!(h.balance("bob"), 300);
        assert_eq!(h.balance("house"), h.config.local_transfer_fee);

        let alice = bills(&h, "alice");
        assert!(alice.iter().any(|b| b.bill_type == BillType::Transfer
            && b.direction == Direction::Out
            && b.amount == 300
            && b.state == BillState::Success));
        assert!(alice
            .iter()
            .any(|b| b.bill_type == BillType::Fee && b.direction == Direction::Out && b.amount == 10));
        let bob = bills(&h, "bob");
        assert!(bob
            .iter()
            .any(|b| b.direction == Direction::In && b.amount == 300));
    }

    #[tokio::test]
    async fn limit_breach_is_rejected_without_mutation() {
        let h = TestHarness::new();
        h.fund("alice", 5000);
        let key = LimitKey::new(Asset::Native, LimitDirection::Local);
        h.limits
            .set_limit_type(&LimitType {
                key: key.clone(),
                levels: vec![LimitLevel {
                    level: 1,
                    total_amount: 1000,
                    total_count: 5,
                }],
            })
            .unwrap();
        h.limits.set_user_level("alice", &key, 1).unwrap();

        let result = h
            .payments
            .send_payment_to_user("alice", "bob", &Asset::Native, 1200)
            .await;
        assert!(matches!(
            result,
            Err(CustodyError::LimitExceeded {
                usable_amount: 1000,
                requested: 1200,
                ..
            })
        ));
        assert_eq!(h.balance("alice"), 5000);
        assert_eq!(h.balance("bob"), 0);
        assert!(h.payments.inside_missions(None).unwrap().is_empty());

        h.payments
            .send_payment_to_user("alice", "bob", &Asset::Native, 400)
            .await
            .unwrap();
        // The limit is committed off the payment path.
        let mut usage = None;
        for _ in 0..50 {
            usage = h.limits.usage("alice", &key).unwrap();
            if usage.as_ref().is_some_and(|u| u.usable_count == 4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let usage = usage.unwrap();
        assert_eq!(usage.usable_amount, 600);
        assert_eq!(usage.usable_count, 4);
    }

    #[tokio::test]
    async fn timeout_leaves_the_mission_running() {
        let h = TestHarness::with_config(|c| c.pay_wait = Duration::from_millis(50));
        h.fund("alice", 10_000);
        h.rail.set_payment_delay(Duration::from_millis(300));
        let created = h.rail.create_invoice(&Asset::Native, 1000, None).await.unwrap();

        let result = h.payments.send_payment("alice", &created.invoice).await;
        assert!(matches!(result, Err(CustodyError::Timeout)));

        // The gate stays held until the mission ends.
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            h.payments.send_payment_to_user("alice", "bob", &Asset::Native, 1),
        )
        .await;
        assert!(second.is_err());

        let mut state = OutsideMissionState::Pending;
        for _ in 0..100 {
            let missions = h.payments.outside_missions(None).unwrap();
            state = missions[0].state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, OutsideMissionState::Success);
        assert_eq!(h.balance("alice"), 10_000 - 1000 - 100);
    }

    #[tokio::test]
    async fn local_invoice_is_paid_inside_once() {
        let h = TestHarness::new();
        h.fund("alice", 1000);
        h.fund("carol", 1000);
        let invoice = h
            .payments
            .apply_pay_req("bob", &Asset::Native, 250, Some("coffee"))
            .await
            .unwrap();

        assert!(matches!(
            h.payments.send_payment("bob", &invoice.reference).await,
            Err(CustodyError::SelfPayment)
        ));

        let receipt = h
            .payments
            .send_payment("alice", &invoice.reference)
            .await
            .unwrap();
        assert!(matches!(receipt, PaymentReceipt::Inside(_)));
        assert_eq!(h.balance("bob"), 250);
        assert_eq!(h.balance("alice"), 1000 - 250 - 10);
        assert_eq!(h.rail.payment_attempts(), 0);

        assert!(matches!(
            h.payments.send_payment("carol", &invoice.reference).await,
            Err(CustodyError::InvoiceAlreadyPaid)
        ));
        assert_eq!(h.balance("carol"), 1000);
    }

    #[tokio::test]
    async fn external_invoice_goes_outside() {
        let h = TestHarness::new();
        h.fund("alice", 10_000);
        h.rail.set_routing_fee(4);
        let created = h.rail.create_invoice(&Asset::Native, 2000, None).await.unwrap();

        let receipt = h.payments.send_payment("alice", &created.invoice).await.unwrap();
        let PaymentReceipt::Outside(mission) = receipt else {
            panic!("expected an outside payment");
        };
        assert_eq!(mission.state, OutsideMissionState::Success);
        assert_eq!(mission.fee_limit, 20);
        assert_eq!(h.balance("alice"), 10_000 - 2000 - 104);
        assert_eq!(h.balance("house"), 104);

        assert!(matches!(
            h.payments.send_payment("alice", &created.invoice).await,
            Err(CustodyError::InvoiceAlreadyPaid)
        ));
    }

    #[tokio::test]
    async fn invoice_can_be_paid_after_a_failed_attempt() {
        let h = TestHarness::new();
        h.fund("alice", 10_000);
        h.rail.fail_next_payments(1);
        let created = h.rail.create_invoice(&Asset::Native, 2000, None).await.unwrap();

        assert!(matches!(
            h.payments.send_payment("alice", &created.invoice).await,
            Err(CustodyError::MissionFailed { .. })
        ));
        assert_eq!(h.balance("alice"), 10_000);

        let receipt = h.payments.send_payment("alice", &created.invoice).await.unwrap();
        let PaymentReceipt::Outside(mission) = receipt else {
            panic!("expected an outside payment");
        };
        assert_eq!(mission.state, OutsideMissionState::Success);
        assert_eq!(h.rail.payment_attempts(), 2);
        assert_eq!(h.balance("alice"), 10_000 - 2000 - 100);
    }

    #[tokio::test]
    async fn unpayable_references_are_rejected() {
        let h = TestHarness::new();
        h.fund("alice", 10_000);

        assert!(matches!(
            h.payments.send_payment("alice", "lnbc-garbage").await,
            Err(CustodyError::InvalidReference(_))
        ));

        let amountless = h.rail.create_invoice(&Asset::Native, 0, None).await.unwrap();
        assert!(matches!(
            h.payments.send_payment("alice", &amountless.invoice).await,
            Err(CustodyError::InvalidAmount(_))
        ));

        let big = h.rail.create_invoice(&Asset::Native, 20_000, None).await.unwrap();
        assert!(matches!(
            h.payments.send_payment("alice", &big.invoice).await,
            Err(CustodyError::InsufficientFunds { .. })
        ));
        assert_eq!(h.balance("alice"), 10_000);
        assert!(h.payments.outside_missions(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_address_is_sent_as_assets() {
        let h = TestHarness::new();
        let token = Asset::Taproot("ab".repeat(32));
        h.fund("alice", 5000);
        h.fund_asset("alice", &token, 80);
        let address = h.rail.create_address(token.asset_id().unwrap(), 30).await.unwrap();

        let receipt = h.payments.send_payment("alice", &address).await.unwrap();
        let PaymentReceipt::Outside(mission) = receipt else {
            panic!("expected an outside payment");
        };
        assert_eq!(mission.mission_type, OutsideMissionType::AssetAddress);
        assert_eq!(mission.fee_limit, ASSET_SEND_FEE_LIMIT);
        assert_eq!(h.asset_balance("alice", &token), 50);
        assert_eq!(h.balance("alice"), 5000 - 100);
    }

    #[tokio::test]
    async fn keysend_pays_a_pubkey() {
        let h = TestHarness::new();
        h.fund("alice", 5000);

        let receipt = h
            .payments
            .send_keysend("alice", "02abcdef", 1000)
            .await
            .unwrap();
        let PaymentReceipt::Outside(mission) = receipt else {
            panic!("expected an outside payment");
        };
        assert_eq!(mission.state, OutsideMissionState::Success);
        assert!(mission.preimage.is_some());
        assert_eq!(h.balance("alice"), 5000 - 1000 - 100);
    }

    #[tokio::test]
    async fn incoming_settlement_is_applied_once() {
        let h = TestHarness::new();
        let invoice = h
            .payments
            .apply_pay_req("bob", &Asset::Native, 700, None)
            .await
            .unwrap();

        let token = Asset::Taproot("ef".repeat(32));
        assert!(matches!(
            h.payments.settle_incoming(&invoice.reference, &token, 700),
            Err(CustodyError::AssetMismatch { .. })
        ));

        let bill = h
            .payments
            .settle_incoming(&invoice.reference, &Asset::Native, 0)
            .unwrap()
            .unwrap();
        assert_eq!(bill.amount, 700);
        assert_eq!(h.balance("bob"), 700);

        assert!(h
            .payments
            .settle_incoming(&invoice.reference, &Asset::Native, 0)
            .unwrap()
            .is_none());
        assert_eq!(h.balance("bob"), 700);

        assert!(matches!(
            h.payments.settle_incoming("unknown", &Asset::Native, 10),
            Err(CustodyError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn address_payment_between_users_stays_inside() {
        let h = TestHarness::new();
        let token = Asset::Taproot("cd".repeat(32));
        h.fund("alice", 100);
        h.fund_asset("alice", &token, 40);
        let address = h.payments.apply_address("bob", &token, 15).await.unwrap();

        h.payments.send_payment("alice", &address.reference).await.unwrap();
        assert_eq!(h.asset_balance("bob", &token), 15);
        assert_eq!(h.asset_balance("alice", &token), 25);
        assert_eq!(h.balance("alice"), 90);

        assert!(matches!(
            h.payments.apply_address("bob", &Asset::Native, 15).await,
            Err(CustodyError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn game_settlement_user_is_paid_on_its_receive_account() {
        let h = TestHarness::new();
        h.fund("alice", 1000);
        h.payments
            .send_payment_to_user("alice", "game", &Asset::Native, 200)
            .await
            .unwrap();

        // The normal account of the game user is untouched.
        assert_eq!(h.balance("game"), 0);
        let receive = h
            .sessions
            .resolve_account("game", AccountRole::GameReceive)
            .unwrap();
        let credited = h
            .db
            .read(|txn| BalanceRepository::new(txn).get(receive.account_id, &Asset::Native))
            .unwrap();
        assert_eq!(credited.amount, 200);
    }

    #[tokio::test]
    async fn cooldown_refuses_back_to_back_payments() {
        let h = TestHarness::with_config(|c| c.pay_cooldown = Duration::from_secs(20));
        h.fund("alice", 1000);

        h.payments
            .send_payment_to_user("alice", "bob", &Asset::Native, 100)
            .await
            .unwrap();
        assert!(matches!(
            h.payments
                .send_payment_to_user("alice", "bob", &Asset::Native, 100)
                .await,
            Err(CustodyError::PaymentBusy { .. })
        ));

        // A refused validation does not start a cooldown.
        assert!(h
            .payments
            .send_payment_to_user("carol", "bob", &Asset::Native, 100)
            .await
            .is_err());
        h.fund("carol", 1000);
        h.payments
            .send_payment_to_user("carol", "bob", &Asset::Native, 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_transfers_conserve_native_funds() {
        let h = Arc::new(TestHarness::new());
        for user in ["alice", "bob", "carol"] {
            h.fund(user, 1000);
        }
        let before = h.total_native();

        let mut tasks = Vec::new();
        for (payer, receiver) in [("alice", "bob"), ("bob", "carol"), ("carol", "alice")] {
            for _ in 0..5 {
                let h = h.clone();
                tasks.push(tokio::spawn(async move {
                    h.payments
                        .send_payment_to_user(payer, receiver, &Asset::Native, 50)
                        .await
                }));
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.total_native(), before);
        assert_eq!(h.balance("house"), 15 * 10);
        let alice = h.sessions.resolve("alice").unwrap().account.account_id;
        assert!(h.ledger.reconcile(alice, &Asset::Native).unwrap().consistent);
    }
}
