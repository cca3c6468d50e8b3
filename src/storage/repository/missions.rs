// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted inside and outside missions.
//!
//! Missions are written after every state transition and never deleted.
//! A driver must hold the mission's lease before executing a transition.

use chrono::{DateTime, Duration, Utc};
use redb::WriteTransaction;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::super::ledger_db::{
    id_key, next_id, put_json, JsonTable, LedgerDbError, LedgerDbResult, LedgerRead,
    INSIDE_MISSIONS, OUTSIDE_MISSIONS,
};
use crate::models::Asset;

// =============================================================================
// Types
// =============================================================================

/// Exclusive claim of a driver on a mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionLease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsideMissionState {
    Pending,
    Paid,
    Success,
    /// Failed with the error stored on the mission.
    Done,
    /// Gave up after the retry ceiling.
    Abandoned,
}

impl InsideMissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Done | Self::Abandoned)
    }
}

/// Transfer between two users of the custodian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsideMission {
    pub mission_id: u64,
    pub payer_username: String,
    pub payer_account_id: u64,
    pub receiver_username: String,
    pub receiver_account_id: u64,
    pub asset: Asset,
    pub amount: u64,
    pub fee: u64,
    pub fee_asset: Asset,
    /// Local invoice or address being paid, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_bill_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_bill_id: Option<u64>,
    pub state: InsideMissionState,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<MissionLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutsideMissionState {
    Pending,
    /// Paid on the rail, fees not yet charged.
    NotPayFee,
    Success,
    Done,
    Abandoned,
}

impl OutsideMissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Done | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutsideMissionType {
    /// Lightning invoice payment.
    Invoice,
    /// Taproot-Assets address send.
    AssetAddress,
    /// Spontaneous payment to a node pubkey.
    Keysend,
}

impl OutsideMissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutsideMissionType::Invoice => "invoice",
            OutsideMissionType::AssetAddress => "asset-address",
            OutsideMissionType::Keysend => "keysend",
        }
    }
}

/// Transfer executed on the external payment rail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutsideMission {
    pub mission_id: u64,
    pub username: String,
    pub account_id: u64,
    pub asset: Asset,
    pub mission_type: OutsideMissionType,
    /// Invoice, address or destination pubkey.
    pub target: String,
    /// Correlation hash used to query the rail after a restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    /// Keysend preimage (hex), chosen before the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub amount: u64,
    pub fee_limit: u64,
    pub realized_fee: u64,
    pub service_fee: u64,
    pub fee_asset: Asset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_id: Option<u64>,
    /// Set right before this mission first hands the payment to the rail.
    /// Until then a `Failed` status under the same hash belongs to an
    /// earlier attempt by someone else.
    #[serde(default)]
    pub rail_attempted: bool,
    pub state: OutsideMissionState,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<MissionLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Common view of both mission kinds for storage and leasing.
pub trait StoredMission: Serialize + DeserializeOwned {
    const TABLE: JsonTable;
    const SEQUENCE: &'static str;

    fn mission_id(&self) -> u64;
    fn set_mission_id(&mut self, id: u64);
    fn lease_mut(&mut self) -> &mut Option<MissionLease>;
    fn is_terminal(&self) -> bool;
    fn touch(&mut self);
}

impl StoredMission for InsideMission {
    const TABLE: JsonTable = INSIDE_MISSIONS;
    const SEQUENCE: &'static str = "inside_missions";

    fn mission_id(&self) -> u64 {
        self.mission_id
    }
    fn set_mission_id(&mut self, id: u64) {
        self.mission_id = id;
    }
    fn lease_mut(&mut self) -> &mut Option<MissionLease> {
        &mut self.lease
    }
    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl StoredMission for OutsideMission {
    const TABLE: JsonTable = OUTSIDE_MISSIONS;
    const SEQUENCE: &'static str = "outside_missions";

    fn mission_id(&self) -> u64 {
        self.mission_id
    }
    fn set_mission_id(&mut self, id: u64) {
        self.mission_id = id;
    }
    fn lease_mut(&mut self) -> &mut Option<MissionLease> {
        &mut self.lease
    }
    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Repository
// =============================================================================

pub struct MissionRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> MissionRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn get<M: StoredMission>(&self, mission_id: u64) -> LedgerDbResult<Option<M>> {
        self.txn.get_json(M::TABLE, &id_key(mission_id))
    }

    pub fn list<M: StoredMission>(&self) -> LedgerDbResult<Vec<M>> {
        self.txn.scan_json(M::TABLE, "")
    }

    /// Missions that still have work to do.
    pub fn list_unfinished<M: StoredMission>(&self) -> LedgerDbResult<Vec<M>> {
        Ok(self
            .list::<M>()?
            .into_iter()
            .filter(|m| !m.is_terminal())
            .collect())
    }
}

impl<'t> MissionRepository<'t, WriteTransaction> {
    /// Persist a new mission, assigning its id.
    pub fn insert<M: StoredMission>(&self, mut mission: M) -> LedgerDbResult<M> {
        mission.set_mission_id(next_id(self.txn, M::SEQUENCE)?);
        put_json(self.txn, M::TABLE, &id_key(mission.mission_id()), &mission)?;
        Ok(mission)
    }

    pub fn put<M: StoredMission>(&self, mission: &mut M) -> LedgerDbResult<()> {
        mission.touch();
        put_json(self.txn, M::TABLE, &id_key(mission.mission_id()), mission)
    }

    /// Take the lease on a mission for `owner`.
    ///
    /// Returns `None` when the mission is terminal or leased by another
    /// owner whose lease has not expired.
    pub fn claim<M: StoredMission>(
        &self,
        mission_id: u64,
        owner: &str,
        ttl: Duration,
    ) -> LedgerDbResult<Option<M>> {
        let mut mission: M = self
            .get(mission_id)?
            .ok_or_else(|| LedgerDbError::NotFound(format!("Mission {mission_id}")))?;
        if mission.is_terminal() {
            return Ok(None);
        }

        let now = Utc::now();
        if let Some(lease) = mission.lease_mut() {
            if lease.owner != owner && lease.expires_at > now {
                return Ok(None);
            }
        }
        *mission.lease_mut() = Some(MissionLease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        });
        self.put(&mut mission)?;
        Ok(Some(mission))
    }

    /// Drop `owner`'s lease, if it still holds it.
    pub fn release<M: StoredMission>(&self, mission_id: u64, owner: &str) -> LedgerDbResult<()> {
        let Some(mut mission) = self.get::<M>(mission_id)? else {
            return Ok(());
        };
        let held = matches!(mission.lease_mut(), Some(lease) if lease.owner == owner);
        if held {
            *mission.lease_mut() = None;
            self.put(&mut mission)?;
        }
        Ok(())
    }
}
