// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded ledger database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! JSON-valued tables are keyed by `&str`. Numeric ids are zero-padded to
//! 20 digits so that lexical order equals numeric order, and composite keys
//! join their parts with `|`.
//!
//! - `users`: username → User
//! - `accounts`: `username|role` → Account, `account_ids`: id → Account
//! - `lock_accounts`: username → LockAccount
//! - `balances`: `account_id|asset` → AggregateBalance
//! - `balance_changes`: `account_id|asset|change_id` → BalanceChange
//! - `bills`: bill_id → Bill, `account_bill_index`: byte key → asset key
//! - `lock_balances`: `lock_account_id|asset` → LockBalance
//! - `lock_bills`: `lock_account_id|idempotency_key` → LockBill
//! - `inside_missions` / `outside_missions`: mission_id → mission
//! - `award_inventory`, `awards`, `award_idempotent`, `award_ext`
//! - `limit_types`, `user_limit_levels`, `limit_bills`
//! - `local_invoices`: invoice/address → LocalInvoice
//! - `recharges`: recharge_id → GameRecharge
//! - `sequences`: name → last allocated id
//!
//! Every mutation runs inside [`LedgerDb::write`]: the closure's writes are
//! committed together when it returns `Ok` and discarded when it returns
//! `Err`. redb admits a single writer at a time, which serializes all
//! balance mutations.

use std::path::Path;

use base64ct::{Base64UrlUnpadded, Encoding};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};

// =============================================================================
// Table Definitions
// =============================================================================

/// A table holding JSON documents under string keys.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

pub(crate) const USERS: JsonTable = TableDefinition::new("users");
pub(crate) const ACCOUNTS: JsonTable = TableDefinition::new("accounts");
pub(crate) const ACCOUNT_IDS: JsonTable = TableDefinition::new("account_ids");
pub(crate) const LOCK_ACCOUNTS: JsonTable = TableDefinition::new("lock_accounts");
pub(crate) const BALANCES: JsonTable = TableDefinition::new("balances");
pub(crate) const BALANCE_CHANGES: JsonTable = TableDefinition::new("balance_changes");
pub(crate) const BILLS: JsonTable = TableDefinition::new("bills");
pub(crate) const LOCK_BALANCES: JsonTable = TableDefinition::new("lock_balances");
pub(crate) const LOCK_BILLS: JsonTable = TableDefinition::new("lock_bills");
pub(crate) const INSIDE_MISSIONS: JsonTable = TableDefinition::new("inside_missions");
pub(crate) const OUTSIDE_MISSIONS: JsonTable = TableDefinition::new("outside_missions");
pub(crate) const AWARD_INVENTORY: JsonTable = TableDefinition::new("award_inventory");
pub(crate) const AWARDS: JsonTable = TableDefinition::new("awards");
pub(crate) const AWARD_IDEMPOTENT: JsonTable = TableDefinition::new("award_idempotent");
pub(crate) const AWARD_EXT: JsonTable = TableDefinition::new("award_ext");
pub(crate) const LIMIT_TYPES: JsonTable = TableDefinition::new("limit_types");
pub(crate) const USER_LIMIT_LEVELS: JsonTable = TableDefinition::new("user_limit_levels");
pub(crate) const LIMIT_BILLS: JsonTable = TableDefinition::new("limit_bills");
pub(crate) const LOCAL_INVOICES: JsonTable = TableDefinition::new("local_invoices");
pub(crate) const RECHARGES: JsonTable = TableDefinition::new("recharges");

/// Index: `account_id_be | !created_micros_be | !bill_id_be` → asset key.
/// The inverted timestamp and id make a forward scan return newest bills
/// first, including bills created within the same microsecond.
const ACCOUNT_BILL_INDEX: TableDefinition<&[u8], &str> =
    TableDefinition::new("account_bill_index");

/// Id sequences: name → last allocated value.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const JSON_TABLES: [JsonTable; 20] = [
    USERS,
    ACCOUNTS,
    ACCOUNT_IDS,
    LOCK_ACCOUNTS,
    BALANCES,
    BALANCE_CHANGES,
    BILLS,
    LOCK_BALANCES,
    LOCK_BILLS,
    INSIDE_MISSIONS,
    OUTSIDE_MISSIONS,
    AWARD_INVENTORY,
    AWARDS,
    AWARD_IDEMPOTENT,
    AWARD_EXT,
    LIMIT_TYPES,
    USER_LIMIT_LEVELS,
    LIMIT_BILLS,
    LOCAL_INVOICES,
    RECHARGES,
];

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerDbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type LedgerDbResult<T> = Result<T, LedgerDbError>;

// =============================================================================
// Key Helpers
// =============================================================================

/// Zero-padded id so lexical order matches numeric order.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// Join key parts with `|`.
pub fn composite_key(parts: &[&str]) -> String {
    parts.join("|")
}

/// Build a composite key for the account_bill_index table.
fn make_bill_index_key(account_id: u64, created_micros: i64, bill_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&account_id.to_be_bytes());
    // Invert timestamp for descending order (newest first)
    key.extend_from_slice(&(!created_micros as u64).to_be_bytes());
    key.extend_from_slice(&(!bill_id).to_be_bytes());
    key
}

fn bill_id_from_index_key(key: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = key.get(16..24)?.try_into().ok()?;
    Some(!u64::from_be_bytes(tail))
}

/// Opaque pagination cursor (url-safe base64 of an index key).
pub fn encode_cursor(key: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(key)
}

pub fn decode_cursor(cursor: &str) -> Option<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(cursor).ok()
}

/// One page of an account's bill index.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    /// `(bill_id, asset_key)` newest first.
    pub entries: Vec<(u64, String)>,
    pub next_cursor: Option<String>,
}

// =============================================================================
// Read Access
// =============================================================================

/// Read operations available on both read and write transactions, so that
/// repositories can share lookups between query paths and mutation paths.
pub trait LedgerRead {
    /// Fetch and decode one JSON document.
    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str)
        -> LedgerDbResult<Option<T>>;

    /// Decode every document whose key starts with `prefix` (in key order).
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str)
        -> LedgerDbResult<Vec<T>>;

    /// Page through an account's bill index, optionally keeping only one asset.
    fn scan_bill_index(
        &self,
        account_id: u64,
        asset_key: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> LedgerDbResult<IndexPage>;
}

fn get_in<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> LedgerDbResult<Option<T>> {
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn scan_in<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> LedgerDbResult<Vec<T>> {
    let mut out = Vec::new();
    for entry in table.range(prefix..)? {
        let (key, value) = entry?;
        if !key.value().starts_with(prefix) {
            break;
        }
        out.push(serde_json::from_slice(value.value())?);
    }
    Ok(out)
}

fn scan_index_in(
    table: &impl ReadableTable<&'static [u8], &'static str>,
    account_id: u64,
    asset_key: Option<&str>,
    cursor: Option<&str>,
    limit: usize,
) -> LedgerDbResult<IndexPage> {
    let prefix = account_id.to_be_bytes().to_vec();
    let end = account_id
        .checked_add(1)
        .map(|next| next.to_be_bytes().to_vec())
        .unwrap_or_else(|| vec![0xFF; 25]);

    // Resume after the cursor key, or from the start of the account prefix
    let (start, skip_first) = match cursor.and_then(decode_cursor) {
        Some(key) if key.starts_with(&prefix) => (key, true),
        _ => (prefix.clone(), false),
    };

    let mut page = IndexPage::default();
    let mut last_key: Option<Vec<u8>> = None;
    let mut skip = skip_first;

    for entry in table.range(start.as_slice()..end.as_slice())? {
        let (key, value) = entry?;
        let key_bytes = key.value().to_vec();

        // Skip the cursor entry itself
        if skip {
            skip = false;
            if key_bytes == start {
                continue;
            }
        }

        if let Some(filter) = asset_key {
            if value.value() != filter {
                continue;
            }
        }

        if let Some(bill_id) = bill_id_from_index_key(&key_bytes) {
            page.entries.push((bill_id, value.value().to_string()));
            last_key = Some(key_bytes);
        }

        if page.entries.len() >= limit {
            break;
        }
    }

    if page.entries.len() >= limit {
        page.next_cursor = last_key.map(|k| encode_cursor(&k));
    }
    Ok(page)
}

impl LedgerRead for ReadTransaction {
    fn get_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> LedgerDbResult<Option<T>> {
        let table = self.open_table(table)?;
        get_in(&table, key)
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> LedgerDbResult<Vec<T>> {
        let table = self.open_table(table)?;
        scan_in(&table, prefix)
    }

    fn scan_bill_index(
        &self,
        account_id: u64,
        asset_key: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> LedgerDbResult<IndexPage> {
        let table = self.open_table(ACCOUNT_BILL_INDEX)?;
        scan_index_in(&table, account_id, asset_key, cursor, limit)
    }
}

impl LedgerRead for WriteTransaction {
    fn get_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> LedgerDbResult<Option<T>> {
        let table = self.open_table(table)?;
        get_in(&table, key)
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> LedgerDbResult<Vec<T>> {
        let table = self.open_table(table)?;
        scan_in(&table, prefix)
    }

    fn scan_bill_index(
        &self,
        account_id: u64,
        asset_key: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> LedgerDbResult<IndexPage> {
        let table = self.open_table(ACCOUNT_BILL_INDEX)?;
        scan_index_in(&table, account_id, asset_key, cursor, limit)
    }
}

// =============================================================================
// Write Helpers
// =============================================================================

/// Insert or replace a JSON document.
pub(crate) fn put_json<T: Serialize>(
    txn: &WriteTransaction,
    table: JsonTable,
    key: &str,
    value: &T,
) -> LedgerDbResult<()> {
    let json = serde_json::to_vec(value)?;
    let mut table = txn.open_table(table)?;
    table.insert(key, json.as_slice())?;
    Ok(())
}

/// Insert a JSON document only if the key is free.
///
/// Returns `false` when the key already exists; this is the unique
/// constraint used for idempotency keys.
pub(crate) fn insert_unique_json<T: Serialize>(
    txn: &WriteTransaction,
    table: JsonTable,
    key: &str,
    value: &T,
) -> LedgerDbResult<bool> {
    let json = serde_json::to_vec(value)?;
    let mut table = txn.open_table(table)?;
    let exists = table.get(key)?.is_some();
    if exists {
        return Ok(false);
    }
    table.insert(key, json.as_slice())?;
    Ok(true)
}

/// Allocate the next id of a named sequence (ids start at 1).
pub(crate) fn next_id(txn: &WriteTransaction, sequence: &str) -> LedgerDbResult<u64> {
    let mut table = txn.open_table(SEQUENCES)?;
    let current = table.get(sequence)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next)?;
    Ok(next)
}

/// Register a bill in its account's newest-first index.
pub(crate) fn index_bill(
    txn: &WriteTransaction,
    account_id: u64,
    created_micros: i64,
    bill_id: u64,
    asset_key: &str,
) -> LedgerDbResult<()> {
    let key = make_bill_index_key(account_id, created_micros, bill_id);
    let mut table = txn.open_table(ACCOUNT_BILL_INDEX)?;
    table.insert(key.as_slice(), asset_key)?;
    Ok(())
}

// =============================================================================
// LedgerDb
// =============================================================================

/// Embedded ACID ledger database.
pub struct LedgerDb {
    db: Database,
}

impl LedgerDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> LedgerDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            for table in JSON_TABLES {
                let _ = write_txn.open_table(table)?;
            }
            let _ = write_txn.open_table(ACCOUNT_BILL_INDEX)?;
            let _ = write_txn.open_table(SEQUENCES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`; aborts (discarding every write made by
    /// `f`) when it returns `Err`.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&WriteTransaction) -> Result<T, E>,
        E: From<LedgerDbError>,
    {
        let txn = self.db.begin_write().map_err(LedgerDbError::from)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(LedgerDbError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::warn!(error = %abort_err, "Failed to abort ledger transaction");
                }
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTransaction) -> Result<T, E>,
        E: From<LedgerDbError>,
    {
        let txn = self.db.begin_read().map_err(LedgerDbError::from)?;
        f(&txn)
    }
}

// =============================================================================
// Tests
// =============================================================================
