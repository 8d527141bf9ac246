use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// An (application, country) pair polled, isolated and stored independently
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub app_id: String,
    pub country: String,
    /// Optional display label, not part of the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Target {
    pub fn new(app_id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            country: country.into(),
            name: None,
        }
    }

    /// Storage and scheduling key: `<appId>-<country>`
    pub fn key(&self) -> String {
        format!("{}-{}", self.app_id, self.country)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.app_id, self.country)
    }
}

/// A customer review as ingested from the feed. Never modified once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub country: String,
    pub author: String,
    pub rating: u32,
    pub title: String,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

/// Identifiers already ingested for one target, in ingestion order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub seen_ids: Vec<String>,
    pub last_poll: DateTime<Utc>,
}

/// The whole state document, keyed by [`Target::key`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub entries: BTreeMap<String, SeenRecord>,
}

// Older state files carry `"seenIds": null` for targets that never had a review.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key() {
        let target = Target::new("595068606", "us");
        assert_eq!(target.key(), "595068606-us");
        assert_eq!(target.to_string(), "595068606-us");
    }

    #[test]
    fn test_review_wire_format() {
        let review = Review {
            id: "r1".to_string(),
            app_id: "1".to_string(),
            country: "us".to_string(),
            author: "alice".to_string(),
            rating: 5,
            title: "Great".to_string(),
            content: "Works".to_string(),
            submitted_at: "2026-01-01T12:00:00Z".parse().unwrap(),
        };

        let json = serde_json::to_value(&review).unwrap();
        assert_eq!(json["appId"], "1");
        assert_eq!(json["submittedAt"], "2026-01-01T12:00:00Z");
    }

    #[test]
    fn test_state_accepts_null_seen_ids() {
        let raw = r#"{"entries":{"1-us":{"seenIds":null,"lastPoll":"2026-01-01T00:00:00Z"}}}"#;
        let state: PersistentState = serde_json::from_str(raw).unwrap();
        assert!(state.entries["1-us"].seen_ids.is_empty());
    }
}
