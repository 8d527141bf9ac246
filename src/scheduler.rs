//! Per-target polling.
//!
//! Every configured target gets one long-lived task that polls immediately and
//! then once per interval until shutdown. A poll iteration walks the feed page
//! by page, collecting reviews it has not seen before, and persists them in a
//! single store call once the walk finishes. A page that still fails after
//! retries abandons the whole iteration and counts as one breaker failure.
//!
//! At most one iteration runs per target at a time; overlapping triggers are
//! skipped rather than queued.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::Config;
use crate::feed::itunes::build_client;
use crate::feed::{FeedFetcher, FetchError, ItunesFeed};
use crate::models::Target;
use crate::notifications::NotificationService;
use crate::store::ReviewStore;

pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PAGE_PAUSE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_pages: u32,
    /// Budget for one page, retries included
    pub page_timeout: Duration,
    /// Pause between consecutive pages of one iteration
    pub page_pause: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15 * 60),
            max_pages: DEFAULT_MAX_PAGES,
            page_timeout: DEFAULT_PAGE_TIMEOUT,
            page_pause: DEFAULT_PAGE_PAUSE,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            breaker: config.breaker_config(),
            ..Self::default()
        }
    }
}

/// Result of one [`Scheduler::poll_once`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another iteration for the same target was already running
    Skipped,
    BreakerOpen,
    Completed { new_reviews: usize },
    /// Fetching `page` failed; nothing from this iteration was kept
    FetchFailed { page: u32 },
    PersistFailed,
    /// Shutdown was requested mid-iteration
    Cancelled,
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Skipped => write!(f, "skipped (already running)"),
            PollOutcome::BreakerOpen => write!(f, "skipped (circuit open)"),
            PollOutcome::Completed { new_reviews } => write!(f, "completed, {} new reviews", new_reviews),
            PollOutcome::FetchFailed { page } => write!(f, "failed fetching page {}", page),
            PollOutcome::PersistFailed => write!(f, "failed persisting results"),
            PollOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Read-only view of a target's breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failures: u32,
}

#[derive(Default)]
struct Registry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    running: HashSet<String>,
}

/// Clears the target's in-progress flag when the iteration ends, however it ends
struct RunningGuard<'a> {
    registry: &'a Mutex<Registry>,
    key: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().running.remove(&self.key);
    }
}

pub struct Scheduler {
    targets: Vec<Target>,
    config: SchedulerConfig,
    store: Arc<dyn ReviewStore>,
    fetcher: FeedFetcher,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Scheduler {
    pub fn new(
        targets: Vec<Target>,
        config: SchedulerConfig,
        store: Arc<dyn ReviewStore>,
        fetcher: FeedFetcher,
    ) -> Self {
        Self {
            targets,
            config,
            store,
            fetcher,
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Wire the production feed and alerting from configuration
    pub fn from_config(config: &Config, store: Arc<dyn ReviewStore>) -> Result<Arc<Self>> {
        let client = build_client().context("Failed to build HTTP client")?;

        let alerts = NotificationService::new(client.clone(), config.webhook_url.as_deref());
        if !alerts.is_enabled() {
            info!("No webhook configured, fetch failure alerts disabled");
        }

        let fetcher = FeedFetcher::new(Arc::new(ItunesFeed::new(client)), Arc::new(alerts));

        Ok(Arc::new(Self::new(
            config.apps.clone(),
            SchedulerConfig::from(config),
            store,
            fetcher,
        )))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `None` until the target has been polled at least once
    pub fn breaker_status(&self, target: &Target) -> Option<BreakerStatus> {
        let registry = self.registry.lock();
        registry.breakers.get(&target.key()).map(|breaker| BreakerStatus {
            state: breaker.state(),
            failures: breaker.failures(),
        })
    }

    /// Spawn one polling task per configured target
    pub fn start(self: &Arc<Self>) {
        info!(
            targets = self.targets.len(),
            interval_secs = self.config.poll_interval.as_secs(),
            "Starting scheduler"
        );

        for target in &self.targets {
            let scheduler = Arc::clone(self);
            let target = target.clone();
            self.tasks.spawn(async move { scheduler.run_target(target).await });
        }
    }

    /// Schedule a single poll in the background and return immediately
    pub fn trigger(self: &Arc<Self>, target: Target) {
        debug!(key = %target, "Manual poll requested");
        let scheduler = Arc::clone(self);
        self.tasks.spawn(async move {
            let outcome = scheduler.poll_once(&target).await;
            debug!(key = %target, %outcome, "Manual poll finished");
        });
    }

    /// Cancel every task and wait until they have all returned
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Scheduler stopped");
    }

    async fn run_target(&self, target: Target) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // first tick completes immediately
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = self.poll_once(&target).await;
            debug!(key = %target, %outcome, "Scheduled poll finished");
        }

        debug!(key = %target, "Target task stopped");
    }

    /// Run one poll iteration for `target`
    #[instrument(skip(self, target), fields(key = %target))]
    pub async fn poll_once(&self, target: &Target) -> PollOutcome {
        let key = target.key();

        let (breaker, _running) = {
            let mut registry = self.registry.lock();
            if !registry.running.insert(key.clone()) {
                debug!("Poll already in progress, skipping");
                return PollOutcome::Skipped;
            }
            let breaker = registry
                .breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker)))
                .clone();
            (
                breaker,
                RunningGuard {
                    registry: &self.registry,
                    key,
                },
            )
        };

        if !breaker.allow() {
            warn!(state = %breaker.state(), "Circuit open, skipping poll");
            return PollOutcome::BreakerOpen;
        }

        let mut seen = self.store.seen_set(target);
        let mut fresh = Vec::new();
        let mut new_ids = Vec::new();

        for page in 1..=self.config.max_pages {
            if page > 1 {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        info!(page, "Poll cancelled");
                        return PollOutcome::Cancelled;
                    }
                    _ = sleep(self.config.page_pause) => {}
                }
            }

            let deadline = Instant::now() + self.config.page_timeout;
            let reviews = match self
                .fetcher
                .fetch_page(target, page, &self.shutdown, deadline)
                .await
            {
                Ok(reviews) => reviews,
                Err(FetchError::Cancelled) => {
                    info!(page, "Poll cancelled");
                    return PollOutcome::Cancelled;
                }
                Err(err) => {
                    breaker.failure();
                    warn!(
                        page,
                        error = %err,
                        state = %breaker.state(),
                        discarded = fresh.len(),
                        "Page fetch failed, abandoning poll"
                    );
                    return PollOutcome::FetchFailed { page };
                }
            };
            breaker.success();

            if reviews.is_empty() {
                debug!(page, "Empty page, stopping");
                break;
            }

            let before = fresh.len();
            for review in reviews {
                if seen.insert(review.id.clone()) {
                    new_ids.push(review.id.clone());
                    fresh.push(review);
                }
            }

            if fresh.len() == before {
                debug!(page, "No new reviews on page, stopping");
                break;
            }
        }

        if let Err(err) = self.store.append_reviews(target, &fresh, &new_ids) {
            error!(error = %err, "Failed to persist poll results");
            return PollOutcome::PersistFailed;
        }

        if fresh.is_empty() {
            debug!("Poll complete, no new reviews");
        } else {
            info!(new_reviews = fresh.len(), "Poll complete");
        }

        PollOutcome::Completed {
            new_reviews: fresh.len(),
        }
    }
}
