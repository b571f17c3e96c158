//! Shop Sync - marketplace seller data in a local SQLite file
//!
//! Pulls records from the marketplace API into SQLite and reports on sales.

use clap::Parser;
use rusqlite::Connection;
use shop_sync::config::{parse_timezone, Cli, Command};
use shop_sync::{report, store, MarketplaceClient, RecordKind, SyncEngine, SyncError};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let db_path = cli.db_path();
    log::info!("Database path: {}", db_path.display());

    let conn = match store::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("Failed to open database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match &cli.command {
        Command::Sync { kinds, full } => run_sync(&cli, conn, kinds, *full).await,
        Command::Status => show_status(&conn),
        Command::Report { days, timezone } => show_report(&conn, *days, timezone),
        Command::Purge { kind, id } => run_purge(conn, *kind, id.as_deref()),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sync the requested kinds concurrently. Ok(false) when any kind did not finish.
async fn run_sync(
    cli: &Cli,
    conn: Connection,
    kinds: &[RecordKind],
    full: bool,
) -> shop_sync::Result<bool> {
    let settings = cli.api_settings()?;
    let client = MarketplaceClient::new(settings.base_url, settings.api_token)?;

    // A bad token fails every page, so stop here; anything else is left to the retry policy
    match client.test_connection().await {
        Ok(true) => {}
        Ok(false) => log::warn!("Marketplace API connection check failed, trying anyway"),
        Err(e @ SyncError::Auth(_)) => return Err(e),
        Err(e) => log::warn!("Marketplace API connection check failed: {}", e),
    }

    let engine = SyncEngine::new(Arc::new(client), Arc::new(Mutex::new(conn)))
        .with_retry_policy(cli.retry_policy())
        .with_page_size(cli.page_size);

    // Ctrl-C stops every session at its next page boundary
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, finishing current pages...");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let kinds: Vec<RecordKind> = if kinds.is_empty() {
        RecordKind::ALL.to_vec()
    } else {
        kinds.to_vec()
    };

    let mut all_complete = true;
    for (kind, outcome) in engine.sync_kinds(&kinds, full, Some(&*cancel)).await {
        match outcome {
            Ok(result) => {
                println!(
                    "{:<11} changed {:>5} (created {}, updated {}, deleted {})  unchanged {:>5}  conflicts {:>3}  pages {:>4}",
                    kind.as_str(),
                    result.changed(),
                    result.created,
                    result.updated,
                    result.deleted,
                    result.unchanged,
                    result.conflicts,
                    result.pages
                );
                if let Err(e) = result.ensure_complete() {
                    log::error!("{}", e);
                    all_complete = false;
                }
            }
            Err(e @ SyncError::Auth(_)) => {
                log::error!("{} sync failed: {} (check the API token)", kind, e);
                all_complete = false;
            }
            Err(e) if e.is_fatal() => {
                log::error!("{} sync aborted: {}", kind, e);
                all_complete = false;
            }
            Err(e) => {
                log::warn!("{} sync stopped early: {}", kind, e);
                all_complete = false;
            }
        }
    }

    Ok(all_complete)
}

fn show_status(conn: &Connection) -> shop_sync::Result<bool> {
    let counts = store::record_counts_by_state(conn)?;

    println!("{:<11} {:>8} {:>8} {:>8}  last sync", "kind", "synced", "pending", "conflict");
    for kind in RecordKind::ALL {
        let count_of = |state: shop_sync::SyncState| {
            counts
                .iter()
                .find(|c| c.kind == kind && c.state == state)
                .map(|c| c.count)
                .unwrap_or(0)
        };
        let cursor = store::load_cursor(conn, kind)?;
        let last_sync = cursor
            .last_synced_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!(
            "{:<11} {:>8} {:>8} {:>8}  {}",
            kind.as_str(),
            count_of(shop_sync::SyncState::Synced),
            count_of(shop_sync::SyncState::Pending),
            count_of(shop_sync::SyncState::Conflict),
            last_sync
        );
    }
    Ok(true)
}

fn show_report(conn: &Connection, days: usize, timezone: &str) -> shop_sync::Result<bool> {
    let tz = parse_timezone(timezone)?;
    let report = report::load_report(conn, days, tz)?;
    print!("{}", report);
    Ok(true)
}

fn run_purge(mut conn: Connection, kind: RecordKind, id: Option<&str>) -> shop_sync::Result<bool> {
    match id {
        Some(id) => {
            if store::purge_record(&conn, kind, id)? {
                println!("Removed {} {}", kind, id);
                Ok(true)
            } else {
                println!("No {} with id {}", kind, id);
                Ok(false)
            }
        }
        None => {
            let removed = store::purge_kind(&mut conn, kind)?;
            println!("Removed {} {} record(s); next sync starts from scratch", removed, kind);
            Ok(true)
        }
    }
}
