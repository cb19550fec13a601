//! The adapter facade: one object composing the repository, query builder,
//! cache, schema registry, resilience manager and performance monitor over
//! whichever backend was configured.

use crate::adapter::{DatabaseAdapter, TransactionScope};
use crate::auth_models;
use crate::batch::BatchOperations;
use crate::collection::CollectionRegistry;
use crate::connection::create_adapter;
use crate::performance::PerformanceMonitor;
use crate::query_builder::QueryBuilder;
use crate::repository::Repository;
use crate::schema::{CollectionSchema, ResolvedSchema};
use crate::transaction::CompensatingScope;
use cache::CacheStore;
use configuration::Config;
use core_types::{DatabaseError, DatabaseResult, ErrorCode, generate_id, normalize_path, validate_id};
use futures::FutureExt;
use parking_lot::Mutex;
use resilience::{AdminNotifier, HealthReport, PoolDiagnostics, ResilienceManager, RetryConfig, TokioSleeper};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Identifier helpers exposed to consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utils;

impl Utils {
    pub fn generate_id(&self) -> String {
        generate_id()
    }

    pub fn validate_id(&self, id: &str) -> bool {
        validate_id(id)
    }

    pub fn normalize_path(&self, path: &str) -> String {
        normalize_path(path)
    }
}

/// Handle passed to a [`Database::transaction`] callback. Repositories
/// obtained from it write through the open transaction and skip the cache.
#[derive(Clone)]
pub struct TransactionContext {
    adapter: Arc<dyn DatabaseAdapter>,
    registry: Arc<CollectionRegistry>,
    monitor: Arc<PerformanceMonitor>,
    touched: Arc<Mutex<BTreeSet<String>>>,
    native: bool,
}

impl TransactionContext {
    pub fn crud<T: DeserializeOwned + Send + Sync>(&self, collection: &str) -> DatabaseResult<Repository<T>> {
        let schema = lookup_schema(&self.registry, collection)?;
        self.touched.lock().insert(collection.to_string());
        Ok(Repository::new(self.adapter.clone(), schema, None, self.monitor.clone()))
    }

    pub fn query<T: DeserializeOwned + Send + Sync>(&self, collection: &str) -> DatabaseResult<QueryBuilder<T>> {
        Ok(self.crud::<T>(collection)?.query())
    }

    /// `false` when rollback is a best-effort compensation.
    pub fn is_native(&self) -> bool {
        self.native
    }
}

fn lookup_schema(registry: &CollectionRegistry, collection: &str) -> DatabaseResult<Arc<ResolvedSchema>> {
    registry.schema(collection).ok_or_else(|| {
        DatabaseError::new(
            ErrorCode::COLLECTION_NOT_FOUND,
            format!("collection '{collection}' is not registered"),
        )
    })
}

pub struct Database {
    adapter: Arc<dyn DatabaseAdapter>,
    registry: Arc<CollectionRegistry>,
    cache: Arc<CacheStore>,
    resilience: Arc<ResilienceManager>,
    notifier: Arc<dyn AdminNotifier>,
    monitor: Arc<PerformanceMonitor>,
    sweep_interval: Option<Duration>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, notifier: Arc<dyn AdminNotifier>) -> Self {
        Self {
            registry: Arc::new(CollectionRegistry::new(adapter.clone())),
            adapter,
            cache: Arc::new(CacheStore::default()),
            resilience: Arc::new(ResilienceManager::default()),
            notifier,
            monitor: Arc::new(PerformanceMonitor::default()),
            sweep_interval: None,
            sweeper: Mutex::new(None),
        }
    }

    /// Builds the adapter and every collaborator from configuration.
    pub fn from_config(config: &Config, notifier: Arc<dyn AdminNotifier>) -> Self {
        let retry = RetryConfig::from(&config.retry);
        let interval = config.cache.sweep_interval_secs;
        Self::new(create_adapter(&config.database), notifier)
            .with_cache(Arc::new(CacheStore::from_settings(&config.cache)))
            .with_resilience(Arc::new(ResilienceManager::new(retry, Arc::new(TokioSleeper))))
            .with_monitor(Arc::new(PerformanceMonitor::from_settings(&config.performance)))
            .with_sweep_interval((interval > 0).then(|| Duration::from_secs(interval)))
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_resilience(mut self, resilience: Arc<ResilienceManager>) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Period of the expired-entry sweep started by `connect`; `None` disables it.
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    // ---- connection ------------------------------------------------------

    /// Connects under the retry policy. When every attempt fails the
    /// reconnection flow runs, and administrators are notified if that fails
    /// too.
    pub async fn connect(&self) -> DatabaseResult<()> {
        let backend = self.adapter.backend();
        let adapter = &self.adapter;
        self.resilience
            .execute_with_recovery(
                "connect",
                || async move {
                    adapter
                        .connect()
                        .await
                        .map_err(|e| e.into_database_error(ErrorCode::CONNECTION_FAILED, format!("connecting to {backend}")))
                },
                || async move {
                    if let Err(e) = adapter.disconnect().await {
                        warn!(error = %e, "Closing the stale connection failed");
                    }
                    adapter
                        .connect()
                        .await
                        .map_err(|e| e.into_database_error(ErrorCode::RECONNECTION_FAILED, format!("reconnecting to {backend}")))
                },
                self.notifier.as_ref(),
            )
            .await?;
        info!(backend = %backend, "Database connected");
        self.start_sweeper();
        Ok(())
    }

    fn start_sweeper(&self) {
        let Some(interval) = self.sweep_interval.filter(|_| self.cache.is_enabled()) else {
            return;
        };
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_none_or(|handle| handle.is_finished()) {
            *sweeper = Some(self.cache.spawn_sweeper(interval));
        }
    }

    pub async fn disconnect(&self) -> DatabaseResult<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.adapter
            .disconnect()
            .await
            .map_err(|e| e.into_database_error(ErrorCode::CONNECTION_FAILED, "disconnecting"))?;
        info!("Database disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    /// Times one ping; healthy iff it succeeds in under a second.
    pub async fn health_check(&self) -> HealthReport {
        let adapter = &self.adapter;
        self.resilience
            .health_check(|| async move {
                adapter
                    .ping()
                    .await
                    .map_err(|e| e.into_database_error(ErrorCode::HEALTH_CHECK_FAILED, "ping"))
            })
            .await
    }

    pub fn pool_diagnostics(&self) -> PoolDiagnostics {
        self.resilience.get_pool_diagnostics(self.adapter.pool_stats())
    }

    pub fn resilience(&self) -> &ResilienceManager {
        &self.resilience
    }

    /// Runs `operation` under the retry policy. Terminal failures are returned.
    pub async fn with_retry<T, E, F, Fut>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.resilience.execute_with_retry(name, operation, None).await
    }

    // ---- data access -----------------------------------------------------

    pub fn crud<T: DeserializeOwned + Send + Sync>(&self, collection: &str) -> DatabaseResult<Repository<T>> {
        let schema = lookup_schema(&self.registry, collection)?;
        Ok(Repository::new(
            self.adapter.clone(),
            schema,
            Some(self.cache.clone()),
            self.monitor.clone(),
        ))
    }

    pub fn query<T: DeserializeOwned + Send + Sync>(&self, collection: &str) -> DatabaseResult<QueryBuilder<T>> {
        Ok(self.crud::<T>(collection)?.query())
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn collection(&self) -> &CollectionRegistry {
        &self.registry
    }

    pub fn batch(&self) -> BatchOperations<'_> {
        BatchOperations::new(self)
    }

    pub fn performance(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn utils(&self) -> Utils {
        Utils
    }

    /// Runs `work` in a transaction. It commits only when `work` returns
    /// `Ok`; an `Err` or a panic rolls everything back.
    ///
    /// On backends without native multi-document transactions (MongoDB) the
    /// writes are applied immediately and rollback replays compensating
    /// writes. Other clients can then observe intermediate state, and a
    /// failure during compensation leaves partial changes behind.
    pub async fn transaction<R, F, Fut>(&self, work: F) -> DatabaseResult<R>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = DatabaseResult<R>>,
    {
        let scope: Box<dyn TransactionScope> = match self.adapter.begin_native().await {
            Ok(Some(scope)) => scope,
            Ok(None) => {
                warn!(
                    backend = %self.adapter.backend(),
                    "No native transactions; falling back to compensating rollback"
                );
                Box::new(CompensatingScope::new(self.adapter.clone()))
            }
            Err(e) => return Err(e.into_database_error(ErrorCode::TRANSACTION_ERROR, "beginning a transaction")),
        };

        let touched = Arc::new(Mutex::new(BTreeSet::new()));
        let context = TransactionContext {
            adapter: scope.adapter(),
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
            touched: touched.clone(),
            native: scope.is_native(),
        };

        let outcome = AssertUnwindSafe(async move { work(context).await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => scope
                .commit()
                .await
                .map(|()| value)
                .map_err(|e| e.into_database_error(ErrorCode::TRANSACTION_ERROR, "committing a transaction")),
            Ok(Err(failure)) => {
                if let Err(e) = scope.rollback().await {
                    error!(error = %e, "Transaction rollback failed");
                }
                Err(failure)
            }
            Err(_) => {
                if let Err(e) = scope.rollback().await {
                    error!(error = %e, "Transaction rollback failed");
                }
                Err(DatabaseError::new(
                    ErrorCode::TRANSACTION_ERROR,
                    "transaction callback panicked; changes were rolled back",
                ))
            }
        };

        for collection in touched.lock().iter() {
            self.cache.invalidate_collection(collection);
        }
        result
    }

    // ---- schema ----------------------------------------------------------

    /// Registers the built-in authentication collections.
    pub async fn setup_auth_models(&self) -> DatabaseResult<()> {
        for schema in auth_models::all() {
            self.registry.create_model(&schema).await.map_err(|e| {
                DatabaseError::new(
                    ErrorCode::AUTH_MODEL_SETUP_FAILED,
                    format!("setting up '{}': {}", schema.id, e.message),
                )
                .with_details(serde_json::json!({ "cause": e.code }))
            })?;
        }
        info!("Authentication models ready");
        Ok(())
    }

    /// Registers the system models and then `schemas`. Finding no content
    /// collections at all is fatal (`NO_COLLECTIONS`): the data model would
    /// be undefined.
    pub async fn initialize(&self, schemas: &[CollectionSchema]) -> DatabaseResult<usize> {
        self.setup_auth_models().await?;
        for schema in schemas {
            self.registry.create_model(schema).await?;
        }
        if schemas.is_empty() {
            return Err(DatabaseError::new(
                ErrorCode::NO_COLLECTIONS,
                "no content collections were found during initialization",
            ));
        }
        let registered = self.registry.len();
        info!(collections = registered, "Data model initialized");
        Ok(registered)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
