// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outside missions: transfers executed on the external payment rail.
//!
//! `Pending -> NotPayFee -> Success`, failure sink `Done`.
//!
//! - `Pending`: debit the payer (bill state `unknown`), then pay on the rail.
//!   Before paying, the rail is asked whether a payment with the mission's
//!   correlation hash already exists, so a restarted driver never pays
//!   twice. A `Failed` status is only trusted once this mission has itself
//!   reached the rail; a failure left by an earlier payment of the same
//!   invoice is paid over. A definite rail failure refunds the payer and
//!   marks the bill `failed`; an outage is retried.
//! - `NotPayFee`: charge the realized routing fee plus the service fee to
//!   the house, mark the bill `success`. The daily limit is committed once
//!   this step succeeded.

use async_trait::async_trait;
use chrono::Utc;

use super::{Mission, MissionContext};
use crate::error::{CustodyError, CustodyResult};
use crate::ledger::{BalanceLedger, LedgerEntry};
use crate::models::{Account, Asset, BillState, BillType, ChangeType};
use crate::rail::{PaymentStatus, RailError};
use crate::storage::{
    BillRepository, LimitDirection, LimitKey, MissionRepository, OutsideMission,
    OutsideMissionState, OutsideMissionType,
};

/// Target and correlation of an outside payment.
#[derive(Debug, Clone)]
pub struct OutsideTarget {
    pub mission_type: OutsideMissionType,
    /// Invoice, address or destination pubkey.
    pub target: String,
    pub payment_hash: String,
    /// Keysend only.
    pub preimage: Option<String>,
}

/// Fresh `Pending` mission; the id is assigned on insert.
pub fn draft(
    account: &Account,
    asset: Asset,
    target: OutsideTarget,
    amount: u64,
    fee_limit: u64,
    service_fee: u64,
) -> OutsideMission {
    let now = Utc::now();
    OutsideMission {
        mission_id: 0,
        username: account.username.clone(),
        account_id: account.account_id,
        asset,
        mission_type: target.mission_type,
        target: target.target,
        payment_hash: Some(target.payment_hash),
        preimage: target.preimage,
        amount,
        fee_limit,
        realized_fee: 0,
        service_fee,
        fee_asset: Asset::Native,
        bill_id: None,
        rail_attempted: false,
        state: OutsideMissionState::Pending,
        retries: 0,
        last_error: None,
        lease: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Mission for OutsideMission {
    const KIND: &'static str = "outside";

    fn state_name(&self) -> &'static str {
        match self.state {
            OutsideMissionState::Pending => "pending",
            OutsideMissionState::NotPayFee => "not-pay-fee",
            OutsideMissionState::Success => "success",
            OutsideMissionState::Done => "done",
            OutsideMissionState::Abandoned => "abandoned",
        }
    }

    fn can_fail(&self) -> bool {
        self.state == OutsideMissionState::Pending && self.bill_id.is_none()
    }

    fn is_success(&self) -> bool {
        self.state == OutsideMissionState::Success
    }

    fn is_abandoned(&self) -> bool {
        self.state == OutsideMissionState::Abandoned
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, reason: String) {
        self.state = OutsideMissionState::Done;
        self.last_error = Some(reason);
    }

    fn retry(&mut self, reason: String) -> u32 {
        self.retries += 1;
        self.last_error = Some(reason);
        self.retries
    }

    fn abandon(&mut self) {
        self.state = OutsideMissionState::Abandoned;
    }

    async fn step(&mut self, ctx: &MissionContext) -> CustodyResult<()> {
        match self.state {
            OutsideMissionState::Pending => {
                if self.bill_id.is_none() {
                    *self = self.debit(ctx)?;
                }
                *self = self.execute(ctx).await?;
            }
            OutsideMissionState::NotPayFee => {
                *self = self.charge_fees(ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn after_step(&self, ctx: &MissionContext, from: &'static str) {
        if from == "not-pay-fee" && self.state == OutsideMissionState::Success {
            ctx.commit_limit(
                &self.username,
                LimitKey::new(self.asset.clone(), LimitDirection::Outside),
                self.amount,
                self.created_at.date_naive(),
            );
        }
    }
}

impl OutsideMission {
    fn correlation(&self) -> CustodyResult<&str> {
        self.payment_hash.as_deref().ok_or_else(|| {
            CustodyError::Internal(format!("outside mission {} has no payment hash", self.mission_id))
        })
    }

    fn debit(&self, ctx: &MissionContext) -> CustodyResult<OutsideMission> {
        let payment_hash = self.correlation()?.to_string();
        ctx.db.write(|txn| {
            let mut next = self.clone();
            let bill = BalanceLedger::new(txn).debit(
                LedgerEntry::new(
                    self.account_id,
                    self.asset.clone(),
                    self.amount,
                    BillType::Transfer,
                    ChangeType::PayOutside,
                )
                .with_invoice(self.target.clone())
                .with_payment_hash(payment_hash)
                .with_server_fee(self.service_fee)
                .with_state(BillState::Unknown)
                .with_type_ext(self.mission_type.as_str()),
            )?;
            next.bill_id = Some(bill.bill_id);
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }

    async fn execute(&mut self, ctx: &MissionContext) -> CustodyResult<OutsideMission> {
        let payment_hash = self.correlation()?;

        match ctx.rail.payment_status(payment_hash).await? {
            PaymentStatus::Succeeded { fee } => {
                tracing::info!(
                    mission_id = self.mission_id,
                    payment_hash,
                    "Payment already settled on the rail"
                );
                return self.mark_paid(ctx, fee);
            }
            PaymentStatus::Failed if self.rail_attempted => {
                return self.refund(ctx, "payment failed on the rail".to_string());
            }
            PaymentStatus::InFlight => {
                return Err(RailError::Unavailable("payment still in flight".to_string()).into());
            }
            PaymentStatus::Failed | PaymentStatus::Unknown => {}
        }

        if !self.rail_attempted {
            *self = self.mark_attempted(ctx)?;
        }
        self.pay(ctx).await
    }

    async fn pay(&self, ctx: &MissionContext) -> CustodyResult<OutsideMission> {
        let outcome = match self.mission_type {
            OutsideMissionType::Invoice => {
                ctx.rail
                    .pay_invoice(&self.target, self.amount, self.fee_limit)
                    .await
            }
            OutsideMissionType::AssetAddress => {
                ctx.rail
                    .send_assets_to(std::slice::from_ref(&self.target))
                    .await
            }
            OutsideMissionType::Keysend => {
                let preimage = self.preimage.as_deref().ok_or_else(|| {
                    CustodyError::Internal(format!("keysend mission {} has no preimage", self.mission_id))
                })?;
                ctx.rail
                    .keysend_payment(&self.asset, self.amount, &self.target, preimage, None)
                    .await
            }
        };

        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    mission_id = self.mission_id,
                    payment_hash = %outcome.payment_hash,
                    fee = outcome.fee,
                    "Outside payment settled"
                );
                self.mark_paid(ctx, outcome.fee)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                tracing::info!(mission_id = self.mission_id, error = %e, "Outside payment failed");
                self.refund(ctx, e.to_string())
            }
        }
    }

    fn mark_attempted(&self, ctx: &MissionContext) -> CustodyResult<OutsideMission> {
        ctx.db.write(|txn| {
            let mut next = self.clone();
            next.rail_attempted = true;
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }

    fn mark_paid(&self, ctx: &MissionContext, fee: u64) -> CustodyResult<OutsideMission> {
        ctx.db.write(|txn| {
            let mut next = self.clone();
            next.realized_fee = fee;
            next.state = OutsideMissionState::NotPayFee;
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }

    /// Give the payer the debited amount back and close the mission.
    fn refund(&self, ctx: &MissionContext, reason: String) -> CustodyResult<OutsideMission> {
        let refunded = ctx.db.write(|txn| {
            let mut next = self.clone();
            BalanceLedger::new(txn).credit(
                LedgerEntry::new(
                    self.account_id,
                    self.asset.clone(),
                    self.amount,
                    BillType::Refund,
                    ChangeType::OutsideRefund,
                )
                .with_invoice(self.target.clone())
                .with_optional_payment_hash(self.payment_hash.clone())
                .with_type_ext(self.mission_type.as_str()),
            )?;
            if let Some(bill_id) = self.bill_id {
                BillRepository::new(txn).finalize(bill_id, BillState::Failed)?;
            }
            next.state = OutsideMissionState::Done;
            next.last_error = Some(reason.clone());
            MissionRepository::new(txn).put(&mut next)?;
            Ok::<_, CustodyError>(next)
        })?;
        tracing::info!(
            mission_id = self.mission_id,
            username = %self.username,
            amount = self.amount,
            reason = %reason,
            "Outside payment refunded"
        );
        Ok(refunded)
    }

    fn charge_fees(&self, ctx: &MissionContext) -> CustodyResult<OutsideMission> {
        let house = ctx.sessions.resolve(ctx.sessions.system_username())?;
        let total_fee = self.realized_fee.saturating_add(self.service_fee);
        ctx.db.write(|txn| {
            let mut next = self.clone();
            BalanceLedger::new(txn).pay_fee(
                self.account_id,
                house.account.account_id,
                &self.fee_asset,
                total_fee,
                Some(self.target.clone()),
            )?;
            if let Some(bill_id) = self.bill_id {
                BillRepository::new(txn).finalize(bill_id, BillState::Success)?;
            }
            next.state = OutsideMissionState::Success;
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::missions::drive;
    use crate::rail::PaymentRail;
    use crate::testing::TestHarness;

    async fn invoice_mission(h: &TestHarness, amount: u64) -> (u64, String) {
        let created = h.rail.create_invoice(&Asset::Native, amount, None).await.unwrap();
        let payer = h.sessions.resolve("alice").unwrap();
        let mission = h
            .db
            .write(|txn| {
                MissionRepository::new(txn).insert(draft(
                    &payer.account,
                    Asset::Native,
                    OutsideTarget {
                        mission_type: OutsideMissionType::Invoice,
                        target: created.invoice.clone(),
                        payment_hash: created.payment_hash.clone(),
                        preimage: None,
                    },
                    amount,
                    50,
                    100,
                ))
            })
            .unwrap();
        (mission.mission_id, created.payment_hash)
    }

    fn bill_state(h: &TestHarness, bill_id: u64) -> BillState {
        h.db.read(|txn| BillRepository::new(txn).get(bill_id))
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn successful_payment_charges_routing_and_service_fee() {
        let h = TestHarness::new();
        h.fund("alice", 10_000);
        h.rail.set_routing_fee(7);
        let (id, _) = invoice_mission(&h, 1_000).await;

        let mission: OutsideMission = drive(&h.ctx, id).await.unwrap();
        assert_eq!(mission.state, OutsideMissionState::Success);
        assert_eq!(mission.realized_fee, 7);
        assert_eq!(h.balance("alice"), 10_000 - 1_000 - 107);
        assert_eq!(h.balance("house"), 107);
        assert_eq!(bill_state(&h, mission.bill_id.unwrap()), BillState::Success);
    }

    #[tokio::test]
    async fn rail_failure_refunds_the_payer() {
        let h = TestHarness::new();
        h.fund("alice", 5_000);
        h.rail.fail_next_payments(1);
        let (id, _) = invoice_mission(&h, 1_000).await;

        let result = drive::<OutsideMission>(&h.ctx, id).await;
        assert!(matches!(result, Err(CustodyError::MissionFailed { .. })));

        let stored: OutsideMission = h
            .db
            .read(|txn| MissionRepository::new(txn).get(id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, OutsideMissionState::Done);
        assert_eq!(bill_state(&h, stored.bill_id.unwrap()), BillState::Failed);
        assert_eq!(h.balance("alice"), 5_000);
        assert_eq!(h.balance("house"), 0);
        assert!(stored.rail_attempted);
    }

    #[tokio::test]
    async fn earlier_failure_of_the_same_invoice_is_paid_over() {
        let h = TestHarness::new();
        h.fund("alice", 5_000);
        h.rail.fail_next_payments(1);
        let (first, _) = invoice_mission(&h, 1_000).await;
        let first: OutsideMission = h
            .db
            .read(|txn| MissionRepository::new(txn).get(first))
            .unwrap()
            .unwrap();
        assert!(drive::<OutsideMission>(&h.ctx, first.mission_id).await.is_err());

        let payer = h.sessions.resolve("alice").unwrap();
        let retry = h
            .db
            .write(|txn| {
                MissionRepository::new(txn).insert(draft(
                    &payer.account,
                    Asset::Native,
                    OutsideTarget {
                        mission_type: OutsideMissionType::Invoice,
                        target: first.target.clone(),
                        payment_hash: first.payment_hash.clone().unwrap(),
                        preimage: None,
                    },
                    1_000,
                    50,
                    100,
                ))
            })
            .unwrap();

        let done: OutsideMission = drive(&h.ctx, retry.mission_id).await.unwrap();
        assert_eq!(done.state, OutsideMissionState::Success);
        assert_eq!(h.rail.payment_attempts(), 2);
        assert_eq!(h.balance("alice"), 5_000 - 1_000 - 100);
    }

    #[tokio::test]
    async fn resume_after_crash_does_not_pay_twice() {
        let h = TestHarness::new();
        h.fund("alice", 5_000);
        let (id, payment_hash) = invoice_mission(&h, 1_000).await;

        // Debit happened and the payment went out, then the process died.
        let mut mission: OutsideMission = h
            .db
            .read(|txn| MissionRepository::new(txn).get(id))
            .unwrap()
            .unwrap();
        mission = mission.debit(&h.ctx).unwrap();
        assert!(mission.bill_id.is_some());
        h.rail.mark_settled(&payment_hash, 3);

        let resumed: OutsideMission = drive(&h.ctx, id).await.unwrap();
        assert_eq!(resumed.state, OutsideMissionState::Success);
        assert_eq!(h.rail.payment_attempts(), 0);
        assert_eq!(h.balance("alice"), 5_000 - 1_000 - 103);
    }

    #[tokio::test]
    async fn outage_is_retried_until_abandoned() {
        let h = TestHarness::new();
        h.fund("alice", 5_000);
        let (id, _) = invoice_mission(&h, 1_000).await;
        h.rail.set_unavailable(true);

        let result = drive::<OutsideMission>(&h.ctx, id).await;
        assert!(matches!(result, Err(CustodyError::MissionAbandoned(m)) if m == id));

        let stored: OutsideMission = h
            .db
            .read(|txn| MissionRepository::new(txn).get(id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, OutsideMissionState::Abandoned);
        assert_eq!(stored.retries, crate::missions::MAX_MISSION_RETRIES);
        // The debit stays booked with an unknown outcome for the operator.
        assert_eq!(bill_state(&h, stored.bill_id.unwrap()), BillState::Unknown);
    }

    #[tokio::test]
    async fn keysend_settles_with_the_stored_preimage() {
        let h = TestHarness::new();
        h.fund("alice", 5_000);
        let payer = h.sessions.resolve("alice").unwrap();
        let preimage = crate::rail::new_preimage();
        let payment_hash = crate::rail::preimage_hash(&preimage).unwrap();
        let mission = h
            .db
            .write(|txn| {
                MissionRepository::new(txn).insert(draft(
                    &payer.account,
                    Asset::Native,
                    OutsideTarget {
                        mission_type: OutsideMissionType::Keysend,
                        target: "02remote".to_string(),
                        payment_hash: payment_hash.clone(),
                        preimage: Some(preimage),
                    },
                    500,
                    10,
                    100,
                ))
            })
            .unwrap();

        let done: OutsideMission = drive(&h.ctx, mission.mission_id).await.unwrap();
        assert_eq!(done.state, OutsideMissionState::Success);
        assert_eq!(
            h.rail.payment_status(&payment_hash).await.unwrap(),
            PaymentStatus::Succeeded { fee: 0 }
        );
        assert_eq!(h.balance("alice"), 5_000 - 500 - 100);
    }
}
