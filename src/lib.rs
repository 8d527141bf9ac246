pub mod api;
pub mod circuit_breaker;
pub mod config;
pub mod feed;
pub mod models;
pub mod notifications;
pub mod scheduler;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::Config;
pub use feed::{FeedFetcher, FeedSource, FetchError, ItunesFeed, RetryPolicy};
pub use models::*;
pub use notifications::{AlertSink, NotificationService};
pub use scheduler::{BreakerStatus, PollOutcome, Scheduler, SchedulerConfig};
pub use store::{FileStore, ReviewStore};
