//! Durable run state (seen-identifier log, checkpoint) + retry utilities for newspipe.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use newspipe_core::{Article, FetchMode};
use rand::{rng, Rng};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newspipe-storage";

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const SEEN_FILE: &str = "seen_uris.jsonl";

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// see either the old content or the new content and never a torn write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Cumulative, auditable counters for one output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_started_at: DateTime<Utc>,
    #[serde(default, alias = "last_written_recent")]
    pub items_written_recent: u64,
    #[serde(default, alias = "last_written_archive")]
    pub items_written_archive: u64,
}

impl CheckpointState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            run_started_at: now,
            items_written_recent: 0,
            items_written_archive: 0,
        }
    }

    pub fn record(&mut self, mode: FetchMode, items: u64) {
        let counter = match mode {
            FetchMode::Recent => &mut self.items_written_recent,
            FetchMode::Archive => &mut self.items_written_archive,
        };
        *counter = counter.saturating_add(items);
    }

    pub fn items_written(&self, mode: FetchMode) -> u64 {
        match mode {
            FetchMode::Recent => self.items_written_recent,
            FetchMode::Archive => self.items_written_archive,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("checkpoint file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CHECKPOINT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent file means a first run. An unreadable record is an error: the
    /// counters are never guessed.
    pub async fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet; starting fresh");
                return Ok(CheckpointState::fresh(Utc::now()));
            }
            Err(err) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source: err.into(),
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let io_err = |source: BoxError| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| io_err(e.into()))?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| io_err(e.into()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenEntry {
    #[serde(default)]
    uri: Option<String>,
}

/// Append-only set of every identifier ever handed downstream.
///
/// The whole log is held in memory; one process owns it for the run, so
/// check-and-set is a plain `HashSet` insert.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    seen: HashSet<String>,
    skipped_lines: usize,
    /// The log's last line has no terminating newline (torn write).
    unterminated_tail: bool,
}

impl DedupStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            seen: HashSet::new(),
            skipped_lines: 0,
            unterminated_tail: false,
        };

        let bytes = match fs::read(&store.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading dedup log {}", store.path.display()))
            }
        };

        store.unterminated_tail = bytes.last().is_some_and(|b| *b != b'\n');
        // Lossy decode keeps a torn trailing write from failing the whole load.
        let text = String::from_utf8_lossy(&bytes);
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SeenEntry>(line) {
                Ok(SeenEntry { uri: Some(uri) }) if !uri.trim().is_empty() => {
                    store.seen.insert(uri);
                }
                Ok(_) => store.skipped_lines += 1,
                Err(err) => {
                    warn!(
                        path = %store.path.display(),
                        line = line_no + 1,
                        error = %err,
                        "skipping malformed dedup log line"
                    );
                    store.skipped_lines += 1;
                }
            }
        }

        debug!(
            path = %store.path.display(),
            identifiers = store.seen.len(),
            skipped = store.skipped_lines,
            "loaded dedup log"
        );
        Ok(store)
    }

    pub async fn open_in(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open(dir.as_ref().join(SEEN_FILE)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.seen.contains(identifier)
    }

    /// True the first time an identifier is offered; marks it seen as a side effect.
    pub fn is_new(&mut self, identifier: &str) -> bool {
        if self.seen.contains(identifier) {
            return false;
        }
        self.seen.insert(identifier.to_string())
    }

    /// Keeps only articles never seen before, in page order. Articles without
    /// any identity are dropped; URL-only articles get their surrogate id
    /// written back before the check.
    pub fn filter_novel(&mut self, page: Vec<Article>) -> Vec<Article> {
        page.into_iter()
            .filter_map(|mut article| {
                let id = article.resolve_identity()?;
                self.is_new(&id).then_some(article)
            })
            .collect()
    }

    /// Appends identifiers to the durable log and flushes before returning.
    /// A torn last line is terminated first so the new entries start on
    /// their own line.
    pub async fn persist<S: AsRef<str>>(&mut self, identifiers: &[S]) -> anyhow::Result<()> {
        if identifiers.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        if self.unterminated_tail {
            buf.push(b'\n');
        }
        for id in identifiers {
            let line = serde_json::to_string(&SeenEntry {
                uri: Some(id.as_ref().to_string()),
            })
            .context("serializing dedup log entry")?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening dedup log {}", self.path.display()))?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("appending to dedup log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing dedup log {}", self.path.display()))?;
        file.sync_data()
            .await
            .with_context(|| format!("syncing dedup log {}", self.path.display()))?;
        self.unterminated_tail = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `base * multiplier^attempt`, capped, plus up to `max_jitter` of noise.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_jitter: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng().random_range(0..=jitter_ms))
        };
        self.delay_for_attempt(attempt_index) + jitter
    }
}
