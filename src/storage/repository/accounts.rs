// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User, account and lock-account records.
//!
//! Accounts are created lazily: the first resolution of a registered user
//! creates its account for the requested role and, for normal accounts, the
//! shadow lock account.

use chrono::Utc;
use redb::WriteTransaction;

use super::super::ledger_db::{
    composite_key, id_key, next_id, put_json, LedgerDbResult, LedgerRead, ACCOUNTS, ACCOUNT_IDS,
    LOCK_ACCOUNTS, USERS,
};
use crate::models::{Account, AccountRole, AccountStatus, LockAccount, User};

/// Repository for users and their accounts.
pub struct AccountRepository<'t, R> {
    txn: &'t R,
}

impl<'t, R: LedgerRead> AccountRepository<'t, R> {
    pub fn new(txn: &'t R) -> Self {
        Self { txn }
    }

    pub fn user(&self, username: &str) -> LedgerDbResult<Option<User>> {
        self.txn.get_json(USERS, username)
    }

    pub fn account(&self, username: &str, role: AccountRole) -> LedgerDbResult<Option<Account>> {
        self.txn
            .get_json(ACCOUNTS, &composite_key(&[username, role.as_str()]))
    }

    pub fn account_by_id(&self, account_id: u64) -> LedgerDbResult<Option<Account>> {
        self.txn.get_json(ACCOUNT_IDS, &id_key(account_id))
    }

    pub fn lock_account(&self, username: &str) -> LedgerDbResult<Option<LockAccount>> {
        self.txn.get_json(LOCK_ACCOUNTS, username)
    }

    /// List every account (admin/reporting view).
    pub fn list_accounts(&self) -> LedgerDbResult<Vec<Account>> {
        self.txn.scan_json(ACCOUNT_IDS, "")
    }
}

impl<'t> AccountRepository<'t, WriteTransaction> {
    /// Register a user. Returns the existing record if already registered.
    pub fn register_user(&self, username: &str) -> LedgerDbResult<User> {
        if let Some(existing) = self.user(username)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let user = User {
            username: username.to_string(),
            status: AccountStatus::Enabled,
            created_at: now,
            updated_at: now,
        };
        put_json(self.txn, USERS, username, &user)?;
        Ok(user)
    }

    pub fn update_user(&self, user: &User) -> LedgerDbResult<()> {
        put_json(self.txn, USERS, &user.username, user)
    }

    /// Fetch the account for `role`, creating it on first access.
    pub fn ensure_account(&self, username: &str, role: AccountRole) -> LedgerDbResult<Account> {
        if let Some(existing) = self.account(username, role)? {
            return Ok(existing);
        }
        let account = Account {
            account_id: next_id(self.txn, "accounts")?,
            username: username.to_string(),
            role,
            status: AccountStatus::Enabled,
            created_at: Utc::now(),
        };
        put_json(
            self.txn,
            ACCOUNTS,
            &composite_key(&[username, role.as_str()]),
            &account,
        )?;
        put_json(self.txn, ACCOUNT_IDS, &id_key(account.account_id), &account)?;
        Ok(account)
    }

    /// Fetch the lock account shadowing `account`, creating it on first access.
    pub fn ensure_lock_account(&self, account: &Account) -> LedgerDbResult<LockAccount> {
        if let Some(existing) = self.lock_account(&account.username)? {
            return Ok(existing);
        }
        let lock_account = LockAccount {
            lock_account_id: next_id(self.txn, "lock_accounts")?,
            username: account.username.clone(),
            account_id: account.account_id,
            created_at: Utc::now(),
        };
        put_json(self.txn, LOCK_ACCOUNTS, &account.username, &lock_account)?;
        Ok(lock_account)
    }
}
