use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use url::Url;
use vibes_core::config::LISTING_SERVICE;
use vibes_core::error::AppError;
use vibes_core::models::ItemSummary;
use vibes_core::traits::{ListFilter, Lister};

use crate::transport_error;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest page the playlistItems endpoint serves.
const MAX_PAGE_SIZE: u32 = 50;

/// Lists the newest uploads of a playlist through the YouTube Data API.
///
/// Each call is one `playlistItems.list` request (1 quota unit upstream).
#[derive(Clone)]
pub struct YouTubeLister {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl YouTubeLister {
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.base_url, timeout)
    }

    fn build(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("vibes/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn request_url(&self, filter: &ListFilter) -> Result<Url, AppError> {
        let mut url = Url::parse(&format!("{}/playlistItems", self.base_url))
            .map_err(|e| AppError::ConfigError(format!("Invalid listing base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("part", "snippet")
            .append_pair("playlistId", &filter.source_id)
            .append_pair(
                "maxResults",
                &filter.max_results.clamp(1, MAX_PAGE_SIZE).to_string(),
            )
            .append_pair("key", &self.api_key);
        Ok(url)
    }
}

// ---- YouTube API types ----

#[derive(Deserialize)]
struct PlaylistPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    snippet: Snippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    #[serde(default)]
    description: String,
    published_at: DateTime<Utc>,
    resource_id: ResourceId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Deserialize)]
struct ApiErrorReason {
    #[serde(default)]
    reason: String,
}

/// Turn one `playlistItems` page into item summaries. Entries without a
/// video id are skipped.
fn parse_page(body: &str) -> Result<Vec<ItemSummary>, AppError> {
    let page: PlaylistPage = serde_json::from_str(body)?;
    Ok(page
        .items
        .into_iter()
        .filter_map(|item| {
            let snippet = item.snippet;
            let id = snippet.resource_id.video_id?;
            Some(ItemSummary {
                url: Some(format!("https://www.youtube.com/watch?v={id}")),
                id,
                title: snippet.title,
                description: snippet.description,
                published_at: snippet.published_at,
            })
        })
        .collect())
}

/// Map a non-success response to the error taxonomy.
fn classify_error(status_code: u16, body: &str) -> AppError {
    let parsed = serde_json::from_str::<ApiError>(body).ok();
    let quota_hit = parsed.as_ref().is_some_and(|e| {
        e.error
            .errors
            .iter()
            .any(|r| r.reason == "quotaExceeded" || r.reason == "dailyLimitExceeded")
    });

    if status_code == 403 && quota_hit {
        return AppError::QuotaExceeded {
            service: LISTING_SERVICE.to_string(),
            requested: 1,
            remaining: 0,
        };
    }
    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }

    let message = parsed
        .map(|e| e.error.message)
        .unwrap_or_else(|| format!("HTTP {status_code}: {body}"));
    AppError::ServiceError {
        message,
        status_code,
        retryable: status_code >= 500,
    }
}

impl Lister for YouTubeLister {
    async fn list_items(&self, filter: &ListFilter) -> Result<Vec<ItemSummary>, AppError> {
        let url = self.request_url(filter)?;
        tracing::debug!(source = %filter.source_id, "Listing playlist");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::TransientCall(format!("Failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }

        let items = parse_page(&body)?;
        tracing::debug!(source = %filter.source_id, items = items.len(), "Playlist listed");
        Ok(items)
    }
}
