use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{FeedSource, FetchError};
use crate::models::{Review, Target};

pub const DEFAULT_BASE_URL: &str = "https://itunes.apple.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 2048;
const FALLBACK_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Build the outbound HTTP client shared by the feed and the alert webhook
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("review-poller/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// App Store customer-review RSS feed, JSON flavour
pub struct ItunesFeed {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct FeedRoot {
    #[serde(default)]
    feed: FeedBody,
}

#[derive(Debug, Default, Deserialize)]
struct FeedBody {
    #[serde(default)]
    entry: Option<Entries>,
}

/// The feed collapses a single entry into a bare object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entries {
    Many(Vec<FeedEntry>),
    One(Box<FeedEntry>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Labeled {
    label: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeedAuthor {
    name: Labeled,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeedEntry {
    id: Labeled,
    updated: Labeled,
    author: FeedAuthor,
    #[serde(rename = "im:rating")]
    rating: Option<Labeled>,
    title: Labeled,
    content: Labeled,
}

impl ItunesFeed {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Per-request timeout, 10s by default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn page_url(&self, target: &Target, page: u32) -> String {
        format!(
            "{}/{}/rss/customerreviews/id={}/sortBy=mostRecent/page={}/json",
            self.base_url, target.country, target.app_id, page
        )
    }
}

#[async_trait]
impl FeedSource for ItunesFeed {
    #[instrument(skip(self, target), fields(key = %target))]
    async fn fetch_page(&self, target: &Target, page: u32) -> Result<Vec<Review>, FetchError> {
        let url = self.page_url(target, page);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.unwrap_or_default();
            let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).into_owned();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let bytes = response.bytes().await?;
        let reviews = parse_feed(&bytes, target, Utc::now())?;

        debug!(page, count = reviews.len(), "Fetched feed page");

        Ok(reviews)
    }
}

/// Parse a feed document into reviews for `target`.
///
/// Entries without a rating describe the app itself and are dropped.
/// Unparseable timestamps become `now`.
pub fn parse_feed(
    bytes: &[u8],
    target: &Target,
    now: DateTime<Utc>,
) -> Result<Vec<Review>, serde_json::Error> {
    let root: FeedRoot = serde_json::from_slice(bytes)?;

    let entries = match root.feed.entry {
        None => Vec::new(),
        Some(Entries::Many(entries)) => entries,
        Some(Entries::One(entry)) => vec![*entry],
    };

    let reviews = entries
        .into_iter()
        .filter_map(|entry| {
            let rating = entry.rating.filter(|r| !r.label.is_empty())?;
            Some(Review {
                id: entry.id.label,
                app_id: target.app_id.clone(),
                country: target.country.clone(),
                author: entry.author.name.label,
                rating: parse_rating(&rating.label),
                title: entry.title.label,
                content: entry.content.label,
                submitted_at: parse_timestamp(&entry.updated.label).unwrap_or(now),
            })
        })
        .collect();

    Ok(reviews)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, FALLBACK_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Keep the decimal digits of the label, ignoring anything else
fn parse_rating(raw: &str) -> u32 {
    raw.chars()
        .filter_map(|c| c.to_digit(10))
        .fold(0u32, |acc, d| acc.saturating_mul(10).saturating_add(d))
}
