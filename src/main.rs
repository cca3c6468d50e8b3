// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::env;
use std::sync::Arc;

use relational_custody::config::{CustodyConfig, LOG_FORMAT_ENV};
use relational_custody::missions::MissionRecovery;
use relational_custody::notifier::{LogNotifier, RechargeDispatcher};
use relational_custody::rail::MemoryRail;
use relational_custody::session::SessionSweeper;
use relational_custody::state::CustodyState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = CustodyConfig::from_env();
    info!(
        data_dir = %config.data_dir.display(),
        house = %config.house_username,
        game_settlement_users = config.game_settlement_users.len(),
        "Starting Relational custody core"
    );

    // A deployment wires its node-backed `PaymentRail` implementation here.
    // The in-memory rail settles payments against itself and moves no
    // real funds.
    warn!("No node rail configured, using the in-memory payment rail; payments are not real");
    let rail = Arc::new(MemoryRail::new());

    let state = CustodyState::open(config, rail)?;
    let shutdown = CancellationToken::new();

    let tasks = vec![
        tokio::spawn(SessionSweeper::new(state.sessions.clone()).run(shutdown.clone())),
        tokio::spawn(MissionRecovery::new(state.missions.clone()).run(shutdown.clone())),
        tokio::spawn(
            RechargeDispatcher::new(state.db.clone(), Arc::new(LogNotifier)).run(shutdown.clone()),
        ),
    ];

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Relational custody core stopped");
    Ok(())
}
