//! Ingestion orchestration: budget gate, per-target page loops, sink hand-off
//! and checkpointing.

pub mod budget;
pub mod pager;
pub mod sinks;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use newspipe_adapters::{ArticleSource, SourceError, MAX_PAGE_SIZE};
use newspipe_core::{DateWindow, FetchMode, PipelineConfig};
use newspipe_storage::{BackoffPolicy, CheckpointError, CheckpointState, CheckpointStore, DedupStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub use budget::{enforce_cap, TokenEstimate};
pub use pager::{fetch_with_retries, FetchFailure, PagedFetcher, StopReason, WindowFetch};
pub use sinks::{ArticleSink, JsonLinesSink, OutputLayout, ParquetTableSink};

pub const CRATE_NAME: &str = "newspipe-sync";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("estimated tokens {estimated} exceed token cap {cap}; aborting to protect quota")]
    QuotaExceeded { estimated: u64, cap: u64 },
    #[error("fetch failed for '{target}' ({window}) page {page} after {attempts} attempt(s): {source}")]
    FetchFailed {
        target: String,
        window: String,
        page: u32,
        attempts: usize,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl IngestError {
    /// Process exit status for each failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            IngestError::Config(_) => 1,
            IngestError::QuotaExceeded { .. } => 2,
            IngestError::FetchFailed { .. } => 3,
            IngestError::Checkpoint(_) => 4,
            IngestError::Storage(_) => 5,
        }
    }
}

/// What to do when one target's page loop fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the run. Everything already written stays valid for the next resume.
    #[default]
    FailFast,
    /// Record the failure and move on to the next target.
    ContinueOnError,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub backoff: BackoffPolicy,
    pub page_size: u32,
    pub skip_duplicates: bool,
    /// `None` or `Some(0)` disables the quota gate.
    pub token_cap: Option<u64>,
    pub failure_policy: FailurePolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            page_size: MAX_PAGE_SIZE,
            skip_duplicates: true,
            token_cap: Some(400),
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl IngestSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(retries) = env_parse::<usize>("NEWSPIPE_MAX_RETRIES") {
            settings.backoff.max_retries = retries;
        }
        if let Some(base_ms) = env_parse::<u64>("NEWSPIPE_BACKOFF_BASE_MS") {
            settings.backoff.base_delay = Duration::from_millis(base_ms);
        }
        if let Some(page_size) = env_parse::<u32>("NEWSPIPE_PAGE_SIZE") {
            settings.page_size = page_size;
        }
        if let Some(cap) = env_parse::<u64>("NEWSPIPE_TOKEN_CAP") {
            settings.token_cap = Some(cap).filter(|c| *c > 0);
        }
        if std::env::var("NEWSPIPE_CONTINUE_ON_ERROR")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
        {
            settings.failure_policy = FailurePolicy::ContinueOnError;
        }
        settings
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Rejects contradictory or unusable run parameters before any state is opened.
pub fn validate_config(config: &PipelineConfig, settings: &IngestSettings) -> Result<(), IngestError> {
    if let Some(target) = config.targets.iter().find(|t| t.trim().is_empty()) {
        return Err(IngestError::Config(format!("blank query target {target:?}")));
    }
    if let Some(year) = config
        .years
        .iter()
        .find(|y| **y < 1900 || DateWindow::calendar_year(**y).is_none())
    {
        return Err(IngestError::Config(format!("year {year} is out of range")));
    }
    if settings.page_size == 0 || settings.page_size > MAX_PAGE_SIZE {
        return Err(IngestError::Config(format!(
            "page size must be within 1..={MAX_PAGE_SIZE}, got {}",
            settings.page_size
        )));
    }
    if config.outdir.as_os_str().is_empty() {
        return Err(IngestError::Config("output directory is empty".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct UniverseFile {
    #[serde(default)]
    symbols: Vec<String>,
}

/// Reads the `symbols:` list from a YAML universe file.
pub async fn load_universe_file(path: &Path) -> Result<Vec<String>, IngestError> {
    let raw = fs::read_to_string(path).await.map_err(|err| {
        IngestError::Config(format!("reading universe file {}: {err}", path.display()))
    })?;
    let universe: UniverseFile = serde_yaml::from_str(&raw).map_err(|err| {
        IngestError::Config(format!("parsing universe file {}: {err}", path.display()))
    })?;
    let symbols: Vec<String> = universe
        .symbols
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(IngestError::Config(format!(
            "universe file {} lists no symbols",
            path.display()
        )));
    }
    info!(count = symbols.len(), path = %path.display(), "loaded universe symbols");
    Ok(symbols)
}

/// Concatenates target lists, dropping blanks and repeats but keeping first-seen order.
pub fn merge_targets<I, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<S>>,
    S: AsRef<str>,
{
    let mut merged: Vec<String> = Vec::new();
    for target in lists.into_iter().flatten() {
        let target = target.as_ref().trim();
        if !target.is_empty() && !merged.iter().any(|t| t == target) {
            merged.push(target.to_string());
        }
    }
    merged
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFetch {
    pub target: String,
    pub window: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeReport {
    pub mode: FetchMode,
    pub planned_fetches: usize,
    pub pages_requested: u64,
    /// Articles handed to the sinks; this is what the checkpoint accumulates.
    pub novel_articles: u64,
    /// Rows summed over every sink.
    pub rows_written: u64,
    pub empty_fetches: usize,
    pub failed: Vec<FailedFetch>,
}

impl ModeReport {
    fn new(mode: FetchMode, planned_fetches: usize) -> Self {
        Self {
            mode,
            planned_fetches,
            pages_requested: 0,
            novel_articles: 0,
            rows_written: 0,
            empty_fetches: 0,
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub estimate: TokenEstimate,
    pub recent: Option<ModeReport>,
    pub archive: Option<ModeReport>,
}

impl RunReport {
    pub fn mode_label(&self) -> &'static str {
        match (&self.recent, &self.archive) {
            (Some(_), Some(_)) => "mixed",
            (Some(_), None) => "recent",
            (None, Some(_)) => "archive",
            (None, None) => "none",
        }
    }

    pub fn failed_fetches(&self) -> usize {
        self.recent.iter().chain(self.archive.iter()).map(|r| r.failed.len()).sum()
    }

    pub fn metrics(&self, config: &PipelineConfig, extra: impl Into<String>) -> RunMetrics {
        let novel = |r: &Option<ModeReport>| r.as_ref().map_or(0, |r| r.novel_articles);
        let rows = |r: &Option<ModeReport>| r.as_ref().map_or(0, |r| r.rows_written);
        RunMetrics {
            ts: self.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            run_id: self.run_id,
            mode: self.mode_label().to_string(),
            targets: config.query_targets(),
            years: config.years.clone(),
            recent_pages: config.recent_pages,
            archive_pages: config.archive_pages,
            items_recent: novel(&self.recent),
            items_archive: novel(&self.archive),
            rows_recent: rows(&self.recent),
            rows_archive: rows(&self.archive),
            tokens_recent_est: self.estimate.recent,
            tokens_archive_est: self.estimate.archive,
            failed_targets: self.failed_fetches(),
            extra: extra.into(),
        }
    }
}

/// One line of `run_metrics.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub ts: String,
    pub run_id: Uuid,
    pub mode: String,
    pub targets: Vec<String>,
    pub years: Vec<i32>,
    pub recent_pages: u32,
    pub archive_pages: u32,
    pub items_recent: u64,
    pub items_archive: u64,
    pub rows_recent: u64,
    pub rows_archive: u64,
    pub tokens_recent_est: u64,
    pub tokens_archive_est: u64,
    pub failed_targets: usize,
    pub extra: String,
}

pub async fn append_run_metrics(path: &Path, metrics: &RunMetrics) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(metrics).context("serializing run metrics")?;
    line.push(b'\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(&line)
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Owns the durable state of one output directory for the duration of a run.
pub struct IngestionOrchestrator {
    config: PipelineConfig,
    settings: IngestSettings,
    source: Arc<dyn ArticleSource>,
    dedup: DedupStore,
    checkpoints: CheckpointStore,
    state: CheckpointState,
    layout: OutputLayout,
    recent_sinks: Vec<Box<dyn ArticleSink>>,
    archive_sinks: Vec<Box<dyn ArticleSink>>,
}

impl IngestionOrchestrator {
    /// Validates the configuration and applies the token cap, then loads the
    /// checkpoint and the dedup log from the output directory. Nothing is
    /// read or created on disk when either check fails. A corrupt checkpoint
    /// is a hard error.
    pub async fn open(
        config: PipelineConfig,
        settings: IngestSettings,
        source: Arc<dyn ArticleSource>,
    ) -> Result<Self, IngestError> {
        validate_config(&config, &settings)?;
        if let Err(err) = enforce_cap(&TokenEstimate::for_config(&config), settings.token_cap) {
            tracing::error!(error = %err, "quota gate rejected the run");
            return Err(err);
        }
        fs::create_dir_all(&config.outdir)
            .await
            .with_context(|| format!("creating output directory {}", config.outdir.display()))?;

        let checkpoints = CheckpointStore::in_dir(&config.outdir);
        let state = checkpoints.load().await?;
        let dedup = DedupStore::open_in(&config.outdir).await?;
        if dedup.skipped_lines() > 0 {
            warn!(
                skipped = dedup.skipped_lines(),
                path = %dedup.path().display(),
                "ignored malformed dedup log lines"
            );
        }
        info!(
            source = source.source_id(),
            seen = dedup.len(),
            items_written_recent = state.items_written_recent,
            items_written_archive = state.items_written_archive,
            outdir = %config.outdir.display(),
            "opened ingestion state"
        );

        let layout = OutputLayout::new(&config.outdir);
        Ok(Self {
            recent_sinks: layout.default_sinks(FetchMode::Recent),
            archive_sinks: layout.default_sinks(FetchMode::Archive),
            config,
            settings,
            source,
            dedup,
            checkpoints,
            state,
            layout,
        })
    }

    /// Replaces the sinks for one mode.
    pub fn with_sinks(mut self, mode: FetchMode, sinks: Vec<Box<dyn ArticleSink>>) -> Self {
        match mode {
            FetchMode::Recent => self.recent_sinks = sinks,
            FetchMode::Archive => self.archive_sinks = sinks,
        }
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn checkpoint(&self) -> &CheckpointState {
        &self.state
    }

    pub fn checkpoint_path(&self) -> &Path {
        self.checkpoints.path()
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn estimate(&self) -> TokenEstimate {
        TokenEstimate::for_config(&self.config)
    }

    /// Runs every mode the configuration enables. The token cap was already
    /// applied by [`IngestionOrchestrator::open`].
    pub async fn run(&mut self) -> Result<RunReport, IngestError> {
        let estimate = self.estimate();

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, estimated_tokens = estimate.total(), "ingestion run started");

        let recent = if self.config.runs_recent() {
            Some(self.run_recent().await?)
        } else {
            None
        };
        let archive = if self.config.runs_archive() {
            Some(self.run_archive().await?)
        } else {
            None
        };

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            estimate,
            recent,
            archive,
        })
    }

    pub async fn run_recent(&mut self) -> Result<ModeReport, IngestError> {
        self.run_mode(FetchMode::Recent).await
    }

    pub async fn run_archive(&mut self) -> Result<ModeReport, IngestError> {
        self.run_mode(FetchMode::Archive).await
    }

    /// Appends the run's metrics line under the output directory.
    pub async fn record_metrics(&self, report: &RunReport, extra: &str) -> Result<(), IngestError> {
        let metrics = report.metrics(&self.config, extra);
        append_run_metrics(&self.layout.metrics_path(), &metrics).await?;
        Ok(())
    }

    async fn run_mode(&mut self, mode: FetchMode) -> Result<ModeReport, IngestError> {
        let plan = match mode {
            FetchMode::Recent => self.config.recent_plan(),
            FetchMode::Archive => self.config.archive_plan(),
        };
        let mut report = ModeReport::new(mode, plan.len());

        for fetch in &plan {
            let window = fetch.window_label();
            let fetched = PagedFetcher::new(self.source.as_ref(), &mut self.dedup)
                .backoff(self.settings.backoff)
                .pacing(self.config.pacing)
                .page_size(self.settings.page_size)
                .skip_duplicates(self.settings.skip_duplicates)
                .lang(self.config.lang.clone())
                .run(&fetch.target, fetch.window, fetch.pages)
                .await;

            report.pages_requested += u64::from(fetched.pages_requested);

            // Pages accepted before a failure are already marked seen, so they
            // go to the sinks before the failure is acted on.
            if !fetched.articles.is_empty() {
                let sinks = match mode {
                    FetchMode::Recent => &self.recent_sinks,
                    FetchMode::Archive => &self.archive_sinks,
                };
                for sink in sinks {
                    let rows = sink
                        .append(&fetched.articles)
                        .await
                        .with_context(|| format!("{} sink for {} ({window})", sink.name(), fetch.target))?;
                    report.rows_written += rows as u64;
                }
                report.novel_articles += fetched.articles.len() as u64;
                info!(
                    %mode,
                    target = %fetch.target,
                    %window,
                    novel = fetched.articles.len(),
                    pages = fetched.pages_requested,
                    "wrote articles"
                );
            } else if fetched.failure.is_none() {
                warn!(%mode, target = %fetch.target, %window, raw = fetched.raw_records, "no new articles");
                report.empty_fetches += 1;
            }

            match fetched.failure {
                None => {}
                Some(err @ IngestError::FetchFailed { .. })
                    if self.settings.failure_policy == FailurePolicy::ContinueOnError =>
                {
                    warn!(%mode, target = %fetch.target, %window, error = %err, "target failed; continuing");
                    report.failed.push(FailedFetch {
                        target: fetch.target.clone(),
                        window,
                        error: err.to_string(),
                    });
                }
                Some(err) => return Err(err),
            }
        }

        self.state.record(mode, report.novel_articles);
        self.checkpoints.save(&self.state).await?;
        info!(
            %mode,
            novel = report.novel_articles,
            rows = report.rows_written,
            failed = report.failed.len(),
            total = self.state.items_written(mode),
            "mode complete; checkpoint saved"
        );
        Ok(report)
    }
}
