pub mod api;
pub mod cluster;
pub mod config;
pub mod db;
pub mod providers;
pub mod reports;
pub mod search;
pub mod stream;
pub mod tokens;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;

use crate::api::rate_limit::RateLimiter;
use crate::providers::ProviderRouter;
use crate::search::LiteratureSearch;
use crate::tokens::TokenLedger;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub providers: Arc<ProviderRouter>,
    pub search: Arc<LiteratureSearch>,
    pub ledger: TokenLedger,
    /// Shared client for non-provider upstream calls (Stripe).
    pub http: reqwest::Client,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let providers = Arc::new(ProviderRouter::from_config(&config.providers));
        let search = Arc::new(LiteratureSearch::from_config(&config.search));
        let ledger = TokenLedger::new(db.clone());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            db,
            providers,
            search,
            ledger,
            http,
            rate_limiter,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
