//! Application context and initialization logic.
//! This module loads configuration, opens the database, applies migrations
//! and loads the resource files. The `AppContext` struct carries the result
//! into the supervisor.

mod error;
mod metrics;

use std::sync::Arc;

pub use error::AppContextError;
pub use metrics::{AppMetrics, Metrics, MetricsSnapshot};

use crate::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    initialization::InitializationService,
    persistence::sqlite::SqliteStateRepository,
    routing::PredicateEvaluator,
};

/// The application context, holding configuration, the database repository
/// and the shared services every component needs.
pub struct AppContext {
    /// Shared application configuration.
    pub config: AppConfig,

    /// The state repository for database interactions.
    pub repo: Arc<SqliteStateRepository>,

    /// Shared counters.
    pub metrics: AppMetrics,

    /// Time source of every time-driven component.
    pub clock: Arc<dyn Clock>,

    /// Shared predicate and template evaluator.
    pub evaluator: Arc<PredicateEvaluator>,
}

/// A builder for the `AppContext`, allowing configuration overrides
/// and step-by-step initialization.
pub struct AppContextBuilder {
    /// Optional configuration directory to load settings from.
    config_dir: Option<String>,

    /// Optional override for the database URL.
    database_url_override: Option<String>,
}

impl AppContextBuilder {
    /// Creates a new `AppContextBuilder` with an optional configuration
    /// directory.
    pub fn new(config_dir: Option<String>) -> Self {
        Self { config_dir, database_url_override: None }
    }

    /// Sets a database URL override.
    pub fn database_url(mut self, url: String) -> Self {
        self.database_url_override = Some(url);
        self
    }

    /// Builds the `AppContext`: loads configuration, opens and migrates the
    /// database, then loads the resource files.
    pub async fn build(self) -> Result<AppContext, AppContextError> {
        tracing::debug!("Loading application configuration...");
        let mut config = AppConfig::new(self.config_dir.as_deref())?;
        tracing::debug!(database_url = %config.database_url, "Configuration loaded.");

        if let Some(db_url) = self.database_url_override {
            tracing::info!(database_url = %db_url, "Overriding database URL.");
            config.database_url = db_url;
        }

        tracing::debug!("Initializing state repository...");
        let repo = Arc::new(SqliteStateRepository::new(&config.database_url).await?);
        repo.run_migrations().await?;
        tracing::info!("Database migrations completed.");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let evaluator = Arc::new(PredicateEvaluator::new());

        InitializationService::new(config.clone(), repo.clone(), evaluator.clone(), clock.clone())
            .run()
            .await?;

        Ok(AppContext { config, repo, metrics: AppMetrics::default(), clock, evaluator })
    }
}
