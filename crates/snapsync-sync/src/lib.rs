//! Incremental vote sync: watermark resolution, fetch, normalize, persist, repeat.

use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use snapsync_core::{high_water_mark, NormalizePolicy, WatermarkFilter};
use snapsync_source::{
    normalize_batch, FetchOptions, GraphqlVoteSource, HttpClientConfig, SourceError, VoteSource,
    DEFAULT_ENDPOINT, DEFAULT_RECENCY_GUARD, PAGE_SIZE,
};
use snapsync_storage::{PgVoteStore, StoreConfig, StoreError, VoteStore};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snapsync-sync";

/// What the loop does after a failed fetch (remote, guard, or malformed page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorPolicy {
    Continue,
    Terminate,
}

impl FetchErrorPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" | "skip" => Some(Self::Continue),
            "terminate" | "stop" | "exit" => Some(Self::Terminate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncPolicy {
    pub watermark_filter: WatermarkFilter,
    pub recency_guard: Option<Duration>,
    pub normalize: NormalizePolicy,
    pub on_fetch_error: FetchErrorPolicy,
    pub min_interval: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::guarded()
    }
}

impl SyncPolicy {
    /// `created_gte`, ten minute recency guard, lower-cased ids, keep polling on failure.
    pub fn guarded() -> Self {
        Self {
            watermark_filter: WatermarkFilter::Inclusive,
            recency_guard: Some(DEFAULT_RECENCY_GUARD),
            normalize: NormalizePolicy { lowercase: true },
            on_fetch_error: FetchErrorPolicy::Continue,
            min_interval: Duration::from_secs(5),
        }
    }

    /// `created_gt`, no guard, ids stored as delivered, stop on the first failed fetch.
    pub fn legacy() -> Self {
        Self {
            watermark_filter: WatermarkFilter::Exclusive,
            recency_guard: None,
            normalize: NormalizePolicy { lowercase: false },
            on_fetch_error: FetchErrorPolicy::Terminate,
            min_interval: Duration::from_secs(5),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "guarded" => Some(Self::guarded()),
            "legacy" => Some(Self::legacy()),
            _ => None,
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            filter: self.watermark_filter,
            recency_guard: self.recency_guard,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub store_timeout: Duration,
    pub run_migrations: bool,
    pub graphql_url: String,
    pub http: HttpClientConfig,
    pub policy: SyncPolicy,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_timeout = Duration::from_secs(parse_var(&lookup, "SNAPSYNC_DB_TIMEOUT_SECS", 30)?);

        let mut policy = match lookup("SNAPSYNC_POLICY") {
            Some(name) => SyncPolicy::preset(&name)
                .ok_or_else(|| anyhow!("SNAPSYNC_POLICY must be `guarded` or `legacy`, got `{name}`"))?,
            None => SyncPolicy::default(),
        };
        if let Some(value) = lookup("SNAPSYNC_WATERMARK_FILTER") {
            policy.watermark_filter = WatermarkFilter::parse(&value)
                .ok_or_else(|| anyhow!("SNAPSYNC_WATERMARK_FILTER must be `gte` or `gt`, got `{value}`"))?;
        }
        if let Some(value) = lookup("SNAPSYNC_ON_FETCH_ERROR") {
            policy.on_fetch_error = FetchErrorPolicy::parse(&value).ok_or_else(|| {
                anyhow!("SNAPSYNC_ON_FETCH_ERROR must be `continue` or `terminate`, got `{value}`")
            })?;
        }
        if let Some(value) = lookup("SNAPSYNC_RECENCY_GUARD_SECS") {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("parsing SNAPSYNC_RECENCY_GUARD_SECS={value}"))?;
            policy.recency_guard = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(value) = lookup("SNAPSYNC_LOWERCASE") {
            policy.normalize.lowercase = parse_bool(&value)
                .ok_or_else(|| anyhow!("SNAPSYNC_LOWERCASE must be a boolean, got `{value}`"))?;
        }
        policy.min_interval = Duration::from_secs(parse_var(
            &lookup,
            "SNAPSYNC_MIN_INTERVAL_SECS",
            policy.min_interval.as_secs(),
        )?);

        Ok(Self {
            store: StoreConfig {
                database_url: lookup("DATABASE_URL").unwrap_or_else(|| StoreConfig::default().database_url),
                max_connections: parse_var(&lookup, "SNAPSYNC_DB_MAX_CONNECTIONS", 2)?,
                acquire_timeout: db_timeout,
            },
            store_timeout: db_timeout,
            run_migrations: match lookup("SNAPSYNC_RUN_MIGRATIONS") {
                Some(value) => parse_bool(&value)
                    .ok_or_else(|| anyhow!("SNAPSYNC_RUN_MIGRATIONS must be a boolean, got `{value}`"))?,
                None => true,
            },
            graphql_url: lookup("SNAPSYNC_GRAPHQL_URL").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            http: HttpClientConfig {
                timeout: Duration::from_secs(parse_var(&lookup, "SNAPSYNC_HTTP_TIMEOUT_SECS", 20)?),
                user_agent: Some(
                    lookup("SNAPSYNC_USER_AGENT").unwrap_or_else(|| "snapsync/0.1".to_string()),
                ),
            },
            policy,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow!("parsing {key}={value}: {e}")),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("persist failed: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: i64,
    pub fetched: usize,
    pub inserted: u64,
    pub high_water: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub inserted: u64,
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// A full page whose newest vote sits on the watermark cannot advance it.
fn page_is_pinned(fetched: usize, high_water: Option<i64>, watermark: i64) -> bool {
    fetched == PAGE_SIZE && high_water == Some(watermark)
}

/// Derives the next fetch lower bound from the newest stored vote.
pub struct WatermarkResolver {
    store: Arc<dyn VoteStore>,
    timeout: Duration,
}

impl WatermarkResolver {
    pub fn new(store: Arc<dyn VoteStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Epoch seconds of the newest stored vote; `0` when the store is empty or unreadable.
    pub async fn resolve(&self) -> i64 {
        match bounded(self.timeout, self.store.latest_vote()).await {
            Ok(Some(vote)) => vote.created_unix(),
            Ok(None) => 0,
            Err(err) => {
                error!(error = %err, "reading watermark failed; resuming from epoch");
                0
            }
        }
    }
}

pub struct SyncPipeline {
    source: Box<dyn VoteSource>,
    store: Arc<dyn VoteStore>,
    resolver: WatermarkResolver,
    policy: SyncPolicy,
    store_timeout: Duration,
}

impl SyncPipeline {
    pub fn new(source: Box<dyn VoteSource>, store: Arc<dyn VoteStore>, policy: SyncPolicy) -> Self {
        let store_timeout = Duration::from_secs(30);
        Self {
            resolver: WatermarkResolver::new(store.clone(), store_timeout),
            source,
            store,
            policy,
            store_timeout,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self.resolver = WatermarkResolver::new(self.store.clone(), timeout);
        self
    }

    /// Connect to PostgreSQL and the hub as described by `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = connect_store(config).await?;
        let source = GraphqlVoteSource::new(
            config.graphql_url.clone(),
            config.http.clone(),
            config.policy.fetch_options(),
        )?;
        Ok(Self::new(Box::new(source), Arc::new(store), config.policy)
            .with_store_timeout(config.store_timeout))
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &WatermarkResolver {
        &self.resolver
    }

    /// One resolve, fetch, normalize, persist pass.
    pub async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %cycle_id);
        async {
            let started_at = Utc::now();
            let watermark = self.resolver.resolve().await;
            info!(watermark, endpoint = self.source.endpoint(), "fetching votes");

            let raw = self.source.fetch(watermark).await?;
            let votes = normalize_batch(&raw, &self.policy.normalize)?;
            let inserted = bounded(self.store_timeout, self.store.store(&votes)).await?;
            let high_water = high_water_mark(&votes);
            if page_is_pinned(votes.len(), high_water, watermark) {
                warn!(
                    watermark,
                    fetched = votes.len(),
                    "full page shares the watermark second; the next cycle will fetch the same votes"
                );
            }

            info!(
                watermark,
                fetched = votes.len(),
                inserted,
                high_water = high_water.unwrap_or(watermark),
                "votes synced"
            );
            Ok::<_, CycleError>(CycleSummary {
                cycle_id,
                started_at,
                finished_at: Utc::now(),
                watermark,
                fetched: votes.len(),
                inserted,
                high_water,
            })
        }
        .instrument(span)
        .await
    }

    /// Run cycles back to back, at most one per `min_interval`, until `shutdown` resolves.
    ///
    /// Failed cycles are logged and skipped. A failed fetch ends the loop with that
    /// error only under [`FetchErrorPolicy::Terminate`].
    pub async fn run_until<F>(&self, shutdown: F) -> Result<LoopSummary, CycleError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = LoopSummary::default();

        loop {
            let cycle_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles = summary.cycles, "shutdown requested");
                    return Ok(summary);
                }
                outcome = self.run_cycle() => outcome,
            };

            summary.cycles += 1;
            match outcome {
                Ok(cycle) => summary.inserted += cycle.inserted,
                Err(err) => {
                    summary.failed_cycles += 1;
                    match &err {
                        CycleError::Fetch(cause) => error!(error = %cause, "fetch failed; skipping cycle"),
                        CycleError::Persistence(cause) => error!(error = %cause, "persist failed; skipping cycle"),
                    }
                    if matches!(err, CycleError::Fetch(_))
                        && self.policy.on_fetch_error == FetchErrorPolicy::Terminate
                    {
                        warn!("fetch error policy is terminate; stopping sync loop");
                        return Err(err);
                    }
                }
            }

            let remaining = self.policy.min_interval.saturating_sub(cycle_started.elapsed());
            if !remaining.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => {
                        info!(cycles = summary.cycles, "shutdown requested");
                        return Ok(summary);
                    }
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }

    /// Poll until the process is interrupted.
    pub async fn run_forever(&self) -> Result<LoopSummary, CycleError> {
        self.run_until(shutdown_signal()).await
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "installing Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgVoteStore> {
    let store = PgVoteStore::connect(&config.store)
        .await
        .context("connecting to vote store")?;
    if config.run_migrations {
        store.migrate().await.context("running vote store migrations")?;
    }
    Ok(store)
}
