//! Append-only output sinks for novel articles.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::Utc;
use newspipe_core::{Article, FetchMode};
use parquet::arrow::ArrowWriter;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Receives each target's novel articles. Returns the number of rows written.
#[async_trait]
pub trait ArticleSink: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, articles: &[Article]) -> Result<usize>;
}

/// Where a run's artifacts live under the output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jsonl_path(&self, mode: FetchMode) -> PathBuf {
        self.root.join(format!("articles_{}.jsonl", mode.as_str()))
    }

    pub fn table_dir(&self, mode: FetchMode) -> PathBuf {
        self.root.join(format!("articles_{}_table", mode.as_str()))
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("run_metrics.jsonl")
    }

    /// Default pair: full records as JSON lines plus a flattened table.
    pub fn default_sinks(&self, mode: FetchMode) -> Vec<Box<dyn ArticleSink>> {
        vec![
            Box::new(JsonLinesSink::new(self.jsonl_path(mode))),
            Box::new(ParquetTableSink::new(self.table_dir(mode))),
        ]
    }
}

/// One JSON object per line, appended.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArticleSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, articles: &[Article]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }
        let mut buf = Vec::new();
        for article in articles {
            serde_json::to_writer(&mut buf, article).context("serializing article")?;
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
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(articles.len())
    }
}

/// Flattened table of the commonly used fields. Each hand-off lands as its
/// own part file, so readers see a directory of parquet parts.
#[derive(Debug, Clone)]
pub struct ParquetTableSink {
    dir: PathBuf,
}

impl ParquetTableSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArticleSink for ParquetTableSink {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn append(&self, articles: &[Article]) -> Result<usize> {
        if articles.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating directory {}", self.dir.display()))?;

        let part = format!(
            "part-{}-{}.parquet",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            Uuid::new_v4().simple()
        );
        let final_path = self.dir.join(&part);
        let temp_path = self.dir.join(format!(".{part}.tmp"));

        let batch = article_batch(articles)?;
        if let Err(err) = write_parquet(&temp_path, batch) {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), final_path.display()))?;
        Ok(articles.len())
    }
}

pub fn article_table_schema() -> Schema {
    Schema::new(
        [
            "uri",
            "url",
            "title",
            "body",
            "lang",
            "source_title",
            "date_time",
            "date",
            "time",
        ]
        .into_iter()
        .map(|name| ArrowField::new(name, DataType::Utf8, true))
        .collect::<Vec<_>>(),
    )
}

fn article_batch(articles: &[Article]) -> Result<RecordBatch> {
    let column = |get: fn(&Article) -> Option<&str>| {
        Arc::new(StringArray::from(articles.iter().map(get).collect::<Vec<_>>()))
            as arrow_array::ArrayRef
    };
    RecordBatch::try_new(
        Arc::new(article_table_schema()),
        vec![
            column(|a| a.uri.as_deref()),
            column(|a| a.url.as_deref()),
            column(|a| a.title.as_deref()),
            column(|a| a.body.as_deref()),
            column(|a| a.lang.as_deref()),
            column(Article::source_title),
            column(|a| a.date_time.as_deref()),
            column(|a| a.date.as_deref()),
            column(|a| a.time.as_deref()),
        ],
    )
    .context("building article record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}
