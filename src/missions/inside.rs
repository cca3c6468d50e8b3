// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Inside missions: transfers between two users of the custodian.
//!
//! `Pending -> Paid -> Success`, failure sink `Done`.
//!
//! - `Pending`: debit the payer, move the transfer fee to the house, mark a
//!   paid local invoice, record the payer bill. The daily limit is committed
//!   once this step succeeded.
//! - `Paid`: credit the receiver, settle the payer bill, queue a recharge
//!   record for game-settlement receivers.

use async_trait::async_trait;
use chrono::Utc;

use super::{Mission, MissionContext};
use crate::error::{CustodyError, CustodyResult};
use crate::ledger::{BalanceLedger, LedgerEntry};
use crate::models::{Account, AccountRole, Asset, BillState, BillType, ChangeType};
use crate::storage::{
    BillRepository, GameRecharge, InsideMission, InsideMissionState, InvoiceRepository,
    InvoiceStatus, LimitDirection, LimitKey, MissionRepository, RechargeRepository,
};

/// Fresh `Pending` mission; the id is assigned on insert.
#[allow(clippy::too_many_arguments)]
pub fn draft(
    payer: &Account,
    receiver: &Account,
    asset: Asset,
    amount: u64,
    fee: u64,
    fee_asset: Asset,
    invoice: Option<String>,
) -> InsideMission {
    let now = Utc::now();
    InsideMission {
        mission_id: 0,
        payer_username: payer.username.clone(),
        payer_account_id: payer.account_id,
        receiver_username: receiver.username.clone(),
        receiver_account_id: receiver.account_id,
        asset,
        amount,
        fee,
        fee_asset,
        invoice,
        payer_bill_id: None,
        receiver_bill_id: None,
        state: InsideMissionState::Pending,
        retries: 0,
        last_error: None,
        lease: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl Mission for InsideMission {
    const KIND: &'static str = "inside";

    fn state_name(&self) -> &'static str {
        match self.state {
            InsideMissionState::Pending => "pending",
            InsideMissionState::Paid => "paid",
            InsideMissionState::Success => "success",
            InsideMissionState::Done => "done",
            InsideMissionState::Abandoned => "abandoned",
        }
    }

    fn can_fail(&self) -> bool {
        self.state == InsideMissionState::Pending
    }

    fn is_success(&self) -> bool {
        self.state == InsideMissionState::Success
    }

    fn is_abandoned(&self) -> bool {
        self.state == InsideMissionState::Abandoned
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, reason: String) {
        self.state = InsideMissionState::Done;
        self.last_error = Some(reason);
    }

    fn retry(&mut self, reason: String) -> u32 {
        self.retries += 1;
        self.last_error = Some(reason);
        self.retries
    }

    fn abandon(&mut self) {
        self.state = InsideMissionState::Abandoned;
    }

    async fn step(&mut self, ctx: &MissionContext) -> CustodyResult<()> {
        let next = match self.state {
            InsideMissionState::Pending => self.pay(ctx)?,
            InsideMissionState::Paid => self.deliver(ctx)?,
            _ => return Ok(()),
        };
        *self = next;
        Ok(())
    }

    fn after_step(&self, ctx: &MissionContext, from: &'static str) {
        if from == "pending" && self.state == InsideMissionState::Paid {
            ctx.commit_limit(
                &self.payer_username,
                LimitKey::new(self.asset.clone(), LimitDirection::Local),
                self.amount,
                self.created_at.date_naive(),
            );
        }
    }
}

impl InsideMission {
    fn pay(&self, ctx: &MissionContext) -> CustodyResult<InsideMission> {
        let house = ctx.sessions.resolve(ctx.sessions.system_username())?;
        let reference = self.invoice.clone().unwrap_or_else(|| self.receiver_username.clone());

        ctx.db.write(|txn| {
            let mut next = self.clone();
            let ledger = BalanceLedger::new(txn);

            let bill = ledger.debit(
                LedgerEntry::new(
                    self.payer_account_id,
                    self.asset.clone(),
                    self.amount,
                    BillType::Transfer,
                    ChangeType::PayLocal,
                )
                .with_invoice(reference.clone())
                .with_server_fee(self.fee)
                .with_state(BillState::Unknown)
                .with_type_ext("inside"),
            )?;
            ledger.pay_fee(
                self.payer_account_id,
                house.account.account_id,
                &self.fee_asset,
                self.fee,
                Some(reference),
            )?;

            if let Some(invoice) = &self.invoice {
                let invoices = InvoiceRepository::new(txn);
                match invoices.get(invoice)? {
                    Some(local) if local.status == InvoiceStatus::Paid => {
                        return Err(CustodyError::InvoiceAlreadyPaid);
                    }
                    Some(_) => {
                        invoices.mark_paid(invoice)?;
                    }
                    None => return Err(CustodyError::InvalidReference(invoice.clone())),
                }
            }

            next.payer_bill_id = Some(bill.bill_id);
            next.state = InsideMissionState::Paid;
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }

    fn deliver(&self, ctx: &MissionContext) -> CustodyResult<InsideMission> {
        let game_settlement = ctx.config.is_game_settlement_user(&self.receiver_username);
        let receiver = if game_settlement {
            ctx.sessions
                .resolve_account(&self.receiver_username, AccountRole::GameReceive)?
        } else {
            ctx.sessions.resolve(&self.receiver_username)?.account.clone()
        };

        ctx.db.write(|txn| {
            let mut next = self.clone();
            let bill = BalanceLedger::new(txn).credit(
                LedgerEntry::new(
                    receiver.account_id,
                    self.asset.clone(),
                    self.amount,
                    BillType::Transfer,
                    ChangeType::ReceiveLocal,
                )
                .with_optional_invoice(self.invoice.clone())
                .with_type_ext("inside"),
            )?;
            if let Some(payer_bill_id) = self.payer_bill_id {
                BillRepository::new(txn).finalize(payer_bill_id, BillState::Success)?;
            }

            if game_settlement {
                let recharge = RechargeRepository::new(txn).insert(GameRecharge {
                    recharge_id: 0,
                    username: self.receiver_username.clone(),
                    payer_username: self.payer_username.clone(),
                    asset: self.asset.clone(),
                    amount: self.amount,
                    bill_id: bill.bill_id,
                    mission_id: self.mission_id,
                    notified: false,
                    created_at: Utc::now(),
                    notified_at: None,
                })?;
                tracing::info!(
                    recharge_id = recharge.recharge_id,
                    mission_id = self.mission_id,
                    receiver = %self.receiver_username,
                    "Game recharge queued"
                );
            }

            next.receiver_account_id = receiver.account_id;
            next.receiver_bill_id = Some(bill.bill_id);
            next.state = InsideMissionState::Success;
            MissionRepository::new(txn).put(&mut next)?;
            Ok(next)
        })
    }
}
