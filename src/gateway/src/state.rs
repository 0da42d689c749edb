//! Application state and process assembly
//!
//! `initialize` wires the production dependencies (PostgreSQL, optional
//! Redis, worker pools); `assemble` does the dependency injection and is
//! what the test suites call with in-memory parts.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use revwatch_alerting::{AlertDispatcher, DispatcherConfig};
use revwatch_backfill::{
    BackfillEngine, LockManager, MemoryLockManager, MemoryProgressStore, ProgressStore,
    RedisLockManager, RedisProgressStore,
};
use revwatch_breaker::BreakerRegistry;
use revwatch_database::{PgStore, Store};
use revwatch_detection::{default_registry, DetectionEngine};
use revwatch_ingestion::{
    pipeline::run_worker, IdentityResolver, IngestionPipeline, JobQueue, MemoryQueue, RedisQueue,
};
use revwatch_security::CredentialVault;
use revwatch_shared::AppConfig;

use crate::middleware_layer::rate_limit::TokenBucketLimiter;

/// Shared handle the axum handlers clone
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub vault: Arc<CredentialVault>,
    pub breakers: BreakerRegistry,
    pub queue: Arc<dyn JobQueue>,
    pub pipeline: Arc<IngestionPipeline>,
    pub resolver: Arc<IdentityResolver>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub backfill: Arc<BackfillEngine>,
    pub lock_manager: Arc<dyn LockManager>,
    /// Inbound burst guard, keyed per tenant
    pub webhook_limiter: Arc<TokenBucketLimiter>,
    pub api_limiter: Arc<TokenBucketLimiter>,
}

/// Everything `main` needs to run and to drain on shutdown
pub struct Bootstrap {
    pub state: AppState,
    pub worker_handles: Vec<tokio::task::JoinHandle<()>>,
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Production wiring from the environment
    pub async fn initialize(config: AppConfig) -> anyhow::Result<Bootstrap> {
        let store: Arc<dyn Store> = Arc::new(
            PgStore::connect(&config.database_url, config.workers.db_pool_size).await?,
        );
        info!("database connection pool initialized");

        let redis = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.clone())?;
                match redis::aio::ConnectionManager::new(client).await {
                    Ok(manager) => {
                        info!("redis connection manager initialized");
                        Some(manager)
                    }
                    Err(err) => {
                        warn!(error = %err, "redis unavailable, degrading to in-process queue and locks");
                        None
                    }
                }
            }
            None => {
                info!("REDIS_URL not set, using in-process queue and locks");
                None
            }
        };

        let queue: Arc<dyn JobQueue> = match &redis {
            Some(manager) => Arc::new(RedisQueue::new(manager.clone())),
            None => MemoryQueue::new(),
        };
        let lock_manager: Arc<dyn LockManager> = match &redis {
            Some(manager) => Arc::new(RedisLockManager::new(manager.clone())),
            None => Arc::new(MemoryLockManager::new()),
        };
        let progress_store: Arc<dyn ProgressStore> = match &redis {
            Some(manager) => Arc::new(RedisProgressStore::new(manager.clone())),
            None => Arc::new(MemoryProgressStore::new()),
        };

        Self::assemble(config, store, queue, lock_manager, progress_store)
    }

    /// Assemble the state from explicit parts and spawn the worker pools
    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        lock_manager: Arc<dyn LockManager>,
        progress_store: Arc<dyn ProgressStore>,
    ) -> anyhow::Result<Bootstrap> {
        let vault = Arc::new(CredentialVault::new(
            config.credential_encryption_key.as_deref(),
            config.credential_encryption_key_previous.as_deref(),
        )?);
        let breakers = BreakerRegistry::new();

        let (dispatcher, mut worker_handles) = AlertDispatcher::start(
            store.clone(),
            breakers.clone(),
            DispatcherConfig {
                workers: config.workers.alert_workers,
                dashboard_url: config.dashboard_url.clone(),
                slack_bot_token: config.slack_bot_token.clone(),
                ..DispatcherConfig::default()
            },
        );

        let detection = Arc::new(
            DetectionEngine::new(store.clone(), default_registry()).with_sink(dispatcher.clone()),
        );
        let pipeline = Arc::new(IngestionPipeline::new(store.clone(), detection));
        let resolver = Arc::new(IdentityResolver::new(store.clone()));

        let backfill = Arc::new(BackfillEngine::new(
            store.clone(),
            pipeline.clone(),
            vault.clone(),
            progress_store,
            lock_manager.clone(),
            breakers.clone(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        for worker_id in 0..config.workers.ingestion_workers.max(1) {
            worker_handles.push(tokio::spawn(run_worker(
                worker_id,
                queue.clone(),
                pipeline.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!(
            ingestion_workers = config.workers.ingestion_workers.max(1),
            alert_workers = config.workers.alert_workers,
            "worker pools started"
        );

        let state = AppState {
            config: Arc::new(config),
            store,
            vault,
            breakers,
            queue,
            pipeline,
            resolver,
            dispatcher,
            backfill,
            lock_manager,
            webhook_limiter: Arc::new(TokenBucketLimiter::new(300)),
            api_limiter: Arc::new(TokenBucketLimiter::new(120)),
        };

        Ok(Bootstrap {
            state,
            worker_handles,
            shutdown,
        })
    }
}
