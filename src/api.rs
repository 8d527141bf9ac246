//! HTTP query surface over the scheduler and the review store.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::models::{Review, Target};
use crate::scheduler::Scheduler;
use crate::store::ReviewStore;

pub const DEFAULT_HOURS: i64 = 48;
/// 90 days
pub const MAX_HOURS: i64 = 90 * 24;

/// Shared handler state
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn ReviewStore>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                error!(error = %format!("{:#}", err), "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetQuery {
    app_id: Option<String>,
    country: Option<String>,
}

impl TargetQuery {
    fn target(&self) -> Result<Target, ApiError> {
        let app_id = self.app_id.as_deref().map(str::trim).unwrap_or_default();
        let country = self.country.as_deref().map(str::trim).unwrap_or_default();
        if app_id.is_empty() || country.is_empty() {
            return Err(ApiError::BadRequest(
                "appId and country are required".to_string(),
            ));
        }
        Ok(Target::new(app_id, country))
    }
}

/// Numeric parameters stay strings so malformed values fall back instead of failing
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewsQuery {
    #[serde(flatten)]
    target: TargetQuery,
    hours: Option<String>,
    min_rating: Option<String>,
}

impl ReviewsQuery {
    fn hours(&self) -> i64 {
        self.hours
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|hours| (1..=MAX_HOURS).contains(hours))
            .unwrap_or(DEFAULT_HOURS)
    }

    fn min_rating(&self) -> Option<u32> {
        self.min_rating
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|rating| (1..=5).contains(rating))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewsResponse {
    pub app_id: String,
    pub country: String,
    pub from: String,
    pub to: String,
    pub count: usize,
    pub reviews: Vec<Review>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/apps", get(list_apps))
        .route("/poll", get(trigger_poll).post(trigger_poll))
        .route("/reviews", get(recent_reviews))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_apps(State(state): State<Arc<ApiState>>) -> Json<Vec<Target>> {
    Json(state.scheduler.targets().to_vec())
}

async fn trigger_poll(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TargetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target = params.target()?;
    state.scheduler.trigger(target);
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "poll started" }))))
}

async fn recent_reviews(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ReviewsQuery>,
) -> Result<Json<ReviewsResponse>, ApiError> {
    let target = params.target.target()?;
    let hours = params.hours();
    let now = Utc::now();
    let horizon = chrono::Duration::hours(hours);

    let mut reviews = state.store.read_recent_at(&target, horizon, now)?;
    if let Some(min_rating) = params.min_rating() {
        reviews.retain(|review| review.rating >= min_rating);
    }

    Ok(Json(ReviewsResponse {
        from: format_ts(now - horizon),
        to: format_ts(now),
        count: reviews.len(),
        app_id: target.app_id,
        country: target.country,
        reviews,
    }))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
