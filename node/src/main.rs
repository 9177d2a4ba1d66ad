// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Guild Vault Node
//!
//! Entry point for the `guildvault-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the vault database and serves the
//! HTTP/WS API.
//!
//! Subcommands:
//!
//! - `run`     start serving vaults
//! - `info`    print the vault an owner holds
//! - `log`     print a page of an owner's vault history
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use guildvault::config::TRANSACTION_PAGE_SIZE;
use guildvault::{CreatorIsOwner, OwnerId, StackLimits, VaultConfig, VaultDb, VaultService};

use cli::{Commands, GuildVaultCli};
use logging::LogFormat;
use metrics::VaultMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GuildVaultCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Info(args) => show_info(args),
        Commands::Log(args) => show_log(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens (creating if needed) the sled database under `data_dir`.
fn open_db(data_dir: &Path) -> Result<Arc<VaultDb>> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = VaultDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    Ok(Arc::new(db))
}

/// Serves the API and metrics until a shutdown signal arrives, then flushes
/// every open view.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::SERVE_FILTER, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.storage.data_dir.display(),
        "starting guildvault-node"
    );

    let config = VaultConfig {
        slot_count: args.slot_count,
        stack_limits: StackLimits::default().with_default_max(args.max_stack),
        flush_interval: Duration::from_secs(args.flush_interval_secs.max(1)),
        ..VaultConfig::default()
    };

    // --- Storage and service ---
    let db = open_db(&args.storage.data_dir)?;
    let service = Arc::new(
        VaultService::new(config, Arc::clone(&db), Arc::new(CreatorIsOwner))
            .context("invalid vault configuration")?,
    );
    tracing::info!(vaults = service.vault_count()?, "vault registry loaded");

    // --- Metrics ---
    let vault_metrics =
        Arc::new(VaultMetrics::new().context("failed to register prometheus metrics")?);

    // --- Periodic flush ---
    let flush_service = Arc::clone(&service);
    let flush_metrics = Arc::clone(&vault_metrics);
    let flush_interval = service.config().flush_interval;
    let flush_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        // The first tick fires immediately; nothing is open yet.
        interval.tick().await;
        loop {
            interval.tick().await;
            let service = Arc::clone(&flush_service);
            match tokio::task::spawn_blocking(move || service.flush_all()).await {
                Ok(written) => {
                    flush_metrics.flushed_slots_total.inc_by(written as u64);
                    tracing::debug!(written, "periodic flush");
                }
                Err(e) => tracing::error!(error = %e, "periodic flush task failed"),
            }
        }
    });

    // --- API server ---
    let app_state = api::AppState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service),
        Arc::clone(&vault_metrics),
    );
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!(addr = %api_addr, "API server listening");

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&vault_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    flush_loop.abort();
    let shutdown_service = Arc::clone(&service);
    let written = tokio::task::spawn_blocking(move || shutdown_service.shutdown())
        .await
        .context("shutdown flush task failed")?;
    db.flush().context("failed to flush database")?;
    tracing::info!(written, "guildvault-node stopped");
    Ok(())
}

/// `info --owner`: prints the owner's vault as JSON.
fn show_info(args: cli::InfoArgs) -> Result<()> {
    logging::init_logging(logging::COMMAND_FILTER, LogFormat::Pretty);

    let db = open_db(&args.storage.data_dir)?;
    let service = VaultService::new(VaultConfig::default(), db, Arc::new(CreatorIsOwner))?;
    let owner = OwnerId::new(args.owner);
    let Some(vault) = service.vault_for_owner(&owner)? else {
        println!("{owner} does not have a vault");
        return Ok(());
    };

    let info = service.info(vault.id)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// `log --owner [--page]`: prints one page of the owner's vault history.
fn show_log(args: cli::LogArgs) -> Result<()> {
    logging::init_logging(logging::COMMAND_FILTER, LogFormat::Pretty);

    let db = open_db(&args.storage.data_dir)?;
    let service = VaultService::new(VaultConfig::default(), db, Arc::new(CreatorIsOwner))?;
    let owner = OwnerId::new(args.owner);
    let Some(vault) = service.vault_for_owner(&owner)? else {
        println!("{owner} does not have a vault");
        return Ok(());
    };

    let page = service.transactions_page(vault.id, args.page)?;
    println!("Vault history for {owner} (page {}):", page.page);
    if page.entries.is_empty() {
        println!("  no transactions");
    }
    for tx in &page.entries {
        println!(
            "  {}  {:<8} {:>4} x {:<24} by {}",
            tx.timestamp.format("%Y-%m-%d %H:%M:%S"),
            tx.kind,
            tx.amount,
            tx.material,
            tx.actor_id,
        );
    }
    if page.has_more {
        println!(
            "  more: guildvault-node log --owner {owner} --page {} ({TRANSACTION_PAGE_SIZE} per page)",
            page.page + 1
        );
    }
    Ok(())
}

fn print_version() {
    println!("guildvault-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc           {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
