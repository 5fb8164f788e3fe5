//! Core sync logic for dataverse-sync.

use crate::auth::{ClientCredentials, TokenProvider, acquire_token};
use crate::config::{SyncBehaviorConfig, SyncConfig};
use crate::error::Result;
use crate::fetch::{FetchOptions, PagedFetcher, RecordSet, api_client};
use crate::job::{Job, select_jobs};
use crate::metrics::{Metrics, MetricsSnapshot, Timer};
use crate::retry::with_retry;
use crate::staging::{PostgresConnector, StagingStore, StoreConnector};
use crate::transform::{TransformOutcome, TransformRunner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Job keys to run; empty runs every enabled job
    pub only: Vec<String>,
    /// Max pages per job
    pub max_pages: Option<u32>,
    /// Sleep between pages
    pub page_delay: Option<Duration>,
    /// Skip transform SQL
    pub skip_transforms: bool,
}

impl SyncOptions {
    /// Options taken from the `[sync]` section.
    pub fn from_config(config: &SyncBehaviorConfig) -> Self {
        Self {
            only: Vec::new(),
            max_pages: config.max_pages,
            page_delay: config.page_delay(),
            skip_transforms: config.skip_transforms,
        }
    }

    /// Restrict the run to these keys.
    pub fn only<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = keys.into_iter().map(Into::into).collect();
        self
    }

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            max_pages: self.max_pages,
            page_delay: self.page_delay,
        }
    }
}

/// Sync result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Run identifier
    pub run_id: Uuid,
    /// Per-table results, in run order
    pub tables: Vec<TableSyncResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when sync completed
    pub completed_at: String,
    /// Counters at the end of the run
    pub metrics: MetricsSnapshot,
}

impl SyncResult {
    /// Get total records staged.
    pub fn total_records(&self) -> usize {
        self.tables.iter().map(|t| t.records).sum()
    }

    /// Get total pages fetched.
    pub fn total_pages(&self) -> u32 {
        self.tables.iter().map(|t| t.pages).sum()
    }
}

/// Per-table sync result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSyncResult {
    /// Job key
    pub key: String,
    /// Entity set fetched
    pub entity_set: String,
    /// Staging location (schema.table)
    pub location: String,
    /// Records fetched and staged
    pub records: usize,
    /// Pages fetched
    pub pages: u32,
    /// Throttled responses retried
    pub throttle_retries: u32,
    /// Transform result
    pub transform: TransformOutcome,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Staged row count for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedCount {
    /// Job key
    pub key: String,
    /// Staging location (schema.table)
    pub location: String,
    /// Rows staged, `None` if the table could not be read
    pub rows: Option<i64>,
}

/// Sync progress callback.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Sync progress update.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Current job key
    pub table: String,
    /// Current phase
    pub phase: SyncPhase,
    /// Records processed so far
    pub records_processed: usize,
    /// Position of this job in the run (1-based)
    pub job_index: usize,
    /// Number of jobs in the run
    pub job_count: usize,
}

/// Sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Authenticating and connecting
    Connecting,
    /// Fetching pages from the Web API
    Fetching,
    /// Writing to the staging table
    Loading,
    /// Running transform SQL
    Transforming,
    /// Committing
    Committing,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Connecting => write!(f, "connecting"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Loading => write!(f, "loading"),
            SyncPhase::Transforming => write!(f, "transforming"),
            SyncPhase::Committing => write!(f, "committing"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Main sync client.
pub struct SyncClient<A, C> {
    config: SyncConfig,
    auth: A,
    connector: C,
    progress_callback: Option<Arc<ProgressCallback>>,
    metrics: Arc<Metrics>,
}

impl SyncClient<ClientCredentials, PostgresConnector> {
    /// Client using the client-credentials flow and PostgreSQL.
    pub fn postgres(config: SyncConfig) -> Result<Self> {
        let auth = ClientCredentials::from_config(&config.dataverse)?;
        let connector = PostgresConnector::new(config.postgres.clone());
        Ok(Self::new(config, auth, connector))
    }
}

impl<A, C> SyncClient<A, C>
where
    A: TokenProvider,
    C: StoreConnector,
{
    /// Create a new sync client.
    pub fn new(config: SyncConfig, auth: A, connector: C) -> Self {
        Self {
            config,
            auth,
            connector,
            progress_callback: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(SyncProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Counters shared by every run of this client.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Test token acquisition and the store connection.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");

        acquire_token(&self.auth, &self.config.dataverse, &self.config.retry).await?;
        info!("Dataverse token: OK");

        let mut store = self.connect_store().await?;
        let ping = store.ping().await;
        close_store(&mut store).await;
        ping?;
        info!("PostgreSQL: OK");

        Ok(())
    }

    /// Staged row counts for every enabled job.
    pub async fn staged_counts(&self) -> Result<Vec<StagedCount>> {
        let mut store = self.connect_store().await?;
        let mut counts = Vec::new();

        for job in self.config.tables.iter().filter(|j| j.enabled) {
            let location = job.staging();
            let rows = match store.count_rows(&location).await {
                Ok(n) => Some(n),
                Err(e) => {
                    debug!("Cannot count {}: {}", location, e);
                    None
                }
            };
            counts.push(StagedCount {
                key: job.key.clone(),
                location: location.to_string(),
                rows,
            });
        }

        close_store(&mut store).await;
        Ok(counts)
    }

    /// Run sync.
    ///
    /// Jobs run one at a time in registry order. Each job commits on its
    /// own; the first failure rolls back that job and ends the run.
    #[instrument(skip(self, options), fields(run_id = tracing::field::Empty))]
    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncResult> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let jobs = select_jobs(&self.config.tables, &options.only)?;
        if jobs.is_empty() {
            warn!("No tables selected");
            return Ok(self.finish(run_id, start, Vec::new()));
        }
        info!("Starting sync of {} tables", jobs.len());

        self.report_progress(SyncProgress {
            table: String::new(),
            phase: SyncPhase::Connecting,
            records_processed: 0,
            job_index: 0,
            job_count: jobs.len(),
        });

        let token = acquire_token(&self.auth, &self.config.dataverse, &self.config.retry).await?;
        let client = api_client(&token, self.config.dataverse.request_timeout())?;
        let fetcher = PagedFetcher::new(
            client,
            self.config.throttle.clone(),
            Arc::clone(&self.metrics),
        );

        let mut store = self.connect_store().await?;
        let outcome = self.run_jobs(&mut store, &fetcher, &jobs, options).await;
        close_store(&mut store).await;
        let tables = outcome?;

        let result = self.finish(run_id, start, tables);
        info!(
            "Sync completed in {}ms. Tables: {}, records: {}, pages: {}",
            result.duration_ms,
            result.tables.len(),
            result.total_records(),
            result.total_pages()
        );
        Ok(result)
    }

    async fn connect_store(&self) -> Result<C::Store> {
        with_retry(&self.config.retry, "Store connect", || self.connector.connect()).await
    }

    async fn run_jobs(
        &self,
        store: &mut C::Store,
        fetcher: &PagedFetcher,
        jobs: &[&Job],
        options: &SyncOptions,
    ) -> Result<Vec<TableSyncResult>> {
        let transforms = TransformRunner::new(!options.skip_transforms);
        let mut results = Vec::with_capacity(jobs.len());

        for (i, job) in jobs.iter().enumerate() {
            let position = (i + 1, jobs.len());
            match self
                .sync_table(store, fetcher, job, options, transforms, position)
                .await
            {
                Ok(result) => {
                    self.metrics.record_job(true);
                    results.push(result);
                }
                Err(e) => {
                    self.metrics.record_job(false);
                    error!(table = %job.key, code = e.code(), "Table sync failed: {}", e);
                    self.report_progress(SyncProgress {
                        table: job.key.clone(),
                        phase: SyncPhase::Failed,
                        records_processed: 0,
                        job_index: position.0,
                        job_count: position.1,
                    });
                    if i + 1 < jobs.len() {
                        warn!("Skipping {} remaining tables", jobs.len() - i - 1);
                    }
                    return Err(e);
                }
            }
        }

        Ok(results)
    }

    /// Sync a single table.
    #[instrument(skip_all, fields(table = %job.key))]
    async fn sync_table(
        &self,
        store: &mut C::Store,
        fetcher: &PagedFetcher,
        job: &Job,
        options: &SyncOptions,
        transforms: TransformRunner,
        position: (usize, usize),
    ) -> Result<TableSyncResult> {
        let timer = Timer::start(format!("[{}] table sync", job.key));
        let (job_index, job_count) = position;
        let progress = |phase: SyncPhase, records_processed: usize| SyncProgress {
            table: job.key.clone(),
            phase,
            records_processed,
            job_index,
            job_count,
        };

        info!("[{}] fetching {}", job.key, job.entity_set);
        self.report_progress(progress(SyncPhase::Fetching, 0));

        let url = job.resource_url(&self.config.dataverse.base_url)?;
        let set = fetcher.fetch(url, options.fetch_options()).await?;
        info!(
            "[{}] fetched {} records in {} pages",
            job.key,
            set.len(),
            set.pages
        );

        store.begin().await?;
        let staged = self.stage(store, job, &set, transforms, &progress).await;
        let transform = match staged {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback_err) = store.rollback().await {
                    warn!("[{}] rollback failed: {}", job.key, rollback_err);
                }
                return Err(e);
            }
        };

        self.report_progress(progress(SyncPhase::Committing, set.len()));
        store.commit().await?;

        self.report_progress(progress(SyncPhase::Completed, set.len()));
        let duration_ms = timer.stop();
        info!(
            "[{}] staged {} rows into {} ({}ms, transform {})",
            job.key,
            set.len(),
            job.staging(),
            duration_ms,
            transform
        );

        Ok(TableSyncResult {
            key: job.key.clone(),
            entity_set: job.entity_set.clone(),
            location: job.staging().to_string(),
            records: set.len(),
            pages: set.pages,
            throttle_retries: set.throttle_retries,
            transform,
            duration_ms,
        })
    }

    /// Writes inside the job's transaction.
    async fn stage<P>(
        &self,
        store: &mut C::Store,
        job: &Job,
        set: &RecordSet,
        transforms: TransformRunner,
        progress: &P,
    ) -> Result<TransformOutcome>
    where
        P: Fn(SyncPhase, usize) -> SyncProgress,
    {
        let location = job.staging();
        self.report_progress(progress(SyncPhase::Loading, 0));

        store.ensure_location(&location).await?;
        store.clear(&location).await?;
        let written = store
            .bulk_append(&location, &set.records, self.config.sync.batch_size)
            .await?;
        self.metrics.record_loaded(written);

        self.report_progress(progress(SyncPhase::Transforming, set.len()));
        let outcome = transforms.run(store, job).await?;
        if outcome == TransformOutcome::Applied {
            self.metrics.record_transform();
        }
        Ok(outcome)
    }

    fn finish(&self, run_id: Uuid, start: Instant, tables: Vec<TableSyncResult>) -> SyncResult {
        SyncResult {
            run_id,
            tables,
            duration_ms: start.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now().to_rfc3339(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Report progress via callback.
    fn report_progress(&self, progress: SyncProgress) {
        if let Some(ref callback) = self.progress_callback {
            callback(progress);
        }
    }
}

async fn close_store<S: StagingStore>(store: &mut S) {
    if let Err(e) = store.close().await {
        warn!("Failed to close staging store: {}", e);
    }
}
