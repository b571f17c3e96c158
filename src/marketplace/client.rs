//! HTTP client for the marketplace REST API

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::MarketplaceApi;
use crate::error::{Result, SyncError};
use crate::models::{Page, RecordKind, RemoteRecord, SyncCursor};
use crate::store::format_timestamp;

const USER_AGENT_VALUE: &str = concat!("shop_sync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page envelope returned by every collection endpoint
#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

/// Marketplace API client authenticated with a bearer token
pub struct MarketplaceClient {
    pub(crate) client: Client,
    pub(crate) api_token: String,
    pub(crate) base_url: String,
}

impl MarketplaceClient {
    /// Creates a client for the API rooted at `base_url`
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let api_token = api_token.into();
        log::info!("Creating marketplace API client for {}", base_url);
        log::debug!("API token length: {}", api_token.len());

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_token,
            base_url,
        })
    }

    fn collection_url(&self, kind: RecordKind) -> String {
        format!("{}/{}", self.base_url, kind.collection())
    }

    /// Checks that the API is reachable and accepts the token.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` for any other status except
    /// auth failures, which are errors.
    pub async fn test_connection(&self) -> Result<bool> {
        let url = self.collection_url(RecordKind::Shop);
        log::debug!("Testing connection at: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .query(&[("limit", "1")])
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SyncError::auth(format!("API rejected token ({})", status)));
        }

        let success = status.is_success();
        if success {
            log::info!("API connection successful");
        } else {
            let body = response.text().await.unwrap_or_default();
            log::warn!("API connection test failed ({}): {}", status, body);
        }
        Ok(success)
    }
}

/// Map a non-success status onto the sync error taxonomy
fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> SyncError {
    match status.as_u16() {
        401 | 403 => SyncError::auth(format!("{}: {}", status, body)),
        429 => SyncError::RateLimited {
            retry_after: retry_after(headers),
        },
        408 | 500..=599 => SyncError::TransientNetwork(format!("{}: {}", status, body)),
        _ => SyncError::HttpStatus(status),
    }
}

/// `Retry-After` in whole seconds; HTTP dates are not supported
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn parse_page(kind: RecordKind, body: &str) -> Result<Page> {
    // a body cut off mid-transfer is worth another request, any other malformed body is not
    let response: PageResponse = serde_json::from_str(body).map_err(|e| {
        if e.is_eof() {
            SyncError::TransientNetwork(format!("truncated {} page: {}", kind, e))
        } else {
            SyncError::Parse(e)
        }
    })?;
    let records = response
        .results
        .into_iter()
        .map(|value| RemoteRecord::from_json(kind, value))
        .collect::<Result<Vec<_>>>()?;

    Ok(Page {
        records,
        next_token: response.next_cursor,
        has_more: response.has_more,
    })
}

#[async_trait]
impl MarketplaceApi for MarketplaceClient {
    async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: &SyncCursor,
        page_size: usize,
    ) -> Result<Page> {
        let url = self.collection_url(kind);

        let mut query: Vec<(&str, String)> = vec![("limit", page_size.to_string())];
        if let Some(token) = &cursor.token {
            query.push(("cursor", token.clone()));
        } else if let Some(updated_after) = cursor.updated_after {
            query.push(("updated_after", format_timestamp(updated_after)));
        }
        log::debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if !status.is_success() {
            log::debug!("{} page request failed ({}): {}", kind, status, body);
            return Err(status_error(status, &headers, &body));
        }

        let page = parse_page(kind, &body)?;
        log::debug!(
            "Fetched {} {} records (has_more: {})",
            page.records.len(),
            kind,
            page.has_more
        );
        Ok(page)
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
