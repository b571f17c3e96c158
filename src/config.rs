//! Command line and environment configuration

use crate::engine::DEFAULT_PAGE_SIZE;
use crate::error::{Result, SyncError};
use crate::models::RecordKind;
use crate::retry::RetryPolicy;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Marketplace seller tool - syncs shop data to SQLite and reports on sales
#[derive(Parser, Debug)]
#[command(name = "shop_sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(short, long, global = true, default_value_t = default_db_path())]
    pub database: String,

    /// Marketplace API base URL
    #[arg(long, global = true, env = "SHOP_SYNC_BASE_URL")]
    pub base_url: Option<String>,

    /// Marketplace API token
    #[arg(long, global = true, env = "SHOP_SYNC_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Records requested per page
    #[arg(long, global = true, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Requests per page before giving up (first attempt included)
    #[arg(long, global = true, default_value_t = 3)]
    pub max_attempts: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Pull records from the marketplace
    Sync {
        /// Kinds to sync (shop, listing, order, sale_event); all when omitted
        #[arg(short, long = "kind")]
        kinds: Vec<RecordKind>,

        /// Ignore stored cursors and fetch everything again
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Show stored record counts and cursors
    Status,
    /// Sales summary and trend over synced sale events
    Report {
        /// Number of days to cover, ending today
        #[arg(long, default_value_t = 30)]
        days: usize,

        /// Timezone that defines day boundaries
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Remove local records by hand
    Purge {
        #[arg(short, long)]
        kind: RecordKind,

        /// Single record to remove; without it the whole kind and its cursor go
        #[arg(long)]
        id: Option<String>,
    },
}

/// Returns the default database path: ~/.local/share/shop_sync/shop.db
pub fn default_db_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shop_sync")
        .join("shop.db")
        .to_string_lossy()
        .to_string()
}

/// Connection settings for the marketplace API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
    pub api_token: String,
}

impl Cli {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.database)
    }

    /// Base URL and token, both required for talking to the marketplace
    pub fn api_settings(&self) -> Result<ApiSettings> {
        let base_url = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SyncError::Config("no API base URL (--base-url or SHOP_SYNC_BASE_URL)".into())
            })?;
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(SyncError::Config(format!(
                "API base URL must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let api_token = self
            .api_token
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SyncError::Config("no API token (--api-token or SHOP_SYNC_API_TOKEN)".into())
            })?;

        Ok(ApiSettings {
            base_url: base_url.to_string(),
            api_token: api_token.to_string(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}

/// Parse an IANA timezone name such as `Europe/Berlin`
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SyncError::Config(format!("unknown timezone '{}'", name)))
}
