// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the custody core. Configuration is loaded from the environment
//! at startup by [`CustodyConfig::from_env`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the ledger database | `/data` |
//! | `HOUSE_USERNAME` | System account receiving fees and funding awards | `custody-house` |
//! | `GAME_SETTLEMENT_USERS` | Comma separated game-settlement receivers | empty |
//! | `SESSION_POOL_CAPACITY` | Maximum cached user sessions | `2000` |
//! | `SESSION_IDLE_SECS` | Idle time before a session is evicted | `180` |
//! | `PAY_COOLDOWN_SECS` | Minimum gap between two payments of one user | `20` |
//! | `PAY_WAIT_SECS` | How long a caller waits for a payment result | `30` |
//! | `LOCAL_TRANSFER_FEE` | Fee of an inside transfer (sats) | `10` |
//! | `OUTSIDE_SERVICE_FEE` | Fixed service fee of an outside payment (sats) | `100` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable name for the data directory path.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Environment variable name for the house (system) account.
///
/// The house account collects every fee and funds every award. Its session
/// is never evicted from the pool.
pub const HOUSE_USERNAME_ENV: &str = "HOUSE_USERNAME";

/// Environment variable name for the game-settlement receiver list.
pub const GAME_SETTLEMENT_USERS_ENV: &str = "GAME_SETTLEMENT_USERS";

pub const SESSION_POOL_CAPACITY_ENV: &str = "SESSION_POOL_CAPACITY";
pub const SESSION_IDLE_SECS_ENV: &str = "SESSION_IDLE_SECS";
pub const PAY_COOLDOWN_SECS_ENV: &str = "PAY_COOLDOWN_SECS";
pub const PAY_WAIT_SECS_ENV: &str = "PAY_WAIT_SECS";
pub const LOCAL_TRANSFER_FEE_ENV: &str = "LOCAL_TRANSFER_FEE";
pub const OUTSIDE_SERVICE_FEE_ENV: &str = "OUTSIDE_SERVICE_FEE";

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_HOUSE_USERNAME: &str = "custody-house";
pub const DEFAULT_SESSION_POOL_CAPACITY: usize = 2000;
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(180);
pub const DEFAULT_PAY_COOLDOWN: Duration = Duration::from_secs(20);
pub const DEFAULT_PAY_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCAL_TRANSFER_FEE: u64 = 10;
pub const DEFAULT_OUTSIDE_SERVICE_FEE: u64 = 100;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub data_dir: PathBuf,
    pub house_username: String,
    pub game_settlement_users: Vec<String>,
    pub session_pool_capacity: usize,
    pub session_idle: Duration,
    pub pay_cooldown: Duration,
    pub pay_wait: Duration,
    pub local_transfer_fee: u64,
    pub outside_service_fee: u64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            house_username: DEFAULT_HOUSE_USERNAME.to_string(),
            game_settlement_users: Vec::new(),
            session_pool_capacity: DEFAULT_SESSION_POOL_CAPACITY,
            session_idle: DEFAULT_SESSION_IDLE,
            pay_cooldown: DEFAULT_PAY_COOLDOWN,
            pay_wait: DEFAULT_PAY_WAIT,
            local_transfer_fee: DEFAULT_LOCAL_TRANSFER_FEE,
            outside_service_fee: DEFAULT_OUTSIDE_SERVICE_FEE,
        }
    }
}

impl CustodyConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            house_username: lookup(HOUSE_USERNAME_ENV)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.house_username),
            game_settlement_users: lookup(GAME_SETTLEMENT_USERS_ENV)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            session_pool_capacity: parse_or(
                &lookup,
                SESSION_POOL_CAPACITY_ENV,
                defaults.session_pool_capacity,
            ),
            session_idle: Duration::from_secs(parse_or(
                &lookup,
                SESSION_IDLE_SECS_ENV,
                defaults.session_idle.as_secs(),
            )),
            pay_cooldown: Duration::from_secs(parse_or(
                &lookup,
                PAY_COOLDOWN_SECS_ENV,
                defaults.pay_cooldown.as_secs(),
            )),
            pay_wait: Duration::from_secs(parse_or(
                &lookup,
                PAY_WAIT_SECS_ENV,
                defaults.pay_wait.as_secs(),
            )),
            local_transfer_fee: parse_or(
                &lookup,
                LOCAL_TRANSFER_FEE_ENV,
                defaults.local_transfer_fee,
            ),
            outside_service_fee: parse_or(
                &lookup,
                OUTSIDE_SERVICE_FEE_ENV,
                defaults.outside_service_fee,
            ),
        }
    }

    /// Whether `username` receives game settlements.
    pub fn is_game_settlement_user(&self, username: &str) -> bool {
        self.game_settlement_users.iter().any(|u| u == username)
    }
}

fn parse_or<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "Invalid configuration value, using default");
                default
            }
        },
        None => default,
    }
}
