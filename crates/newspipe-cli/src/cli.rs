//! Command-line surface for `newspipe`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use newspipe_core::{PipelineConfig, DEFAULT_OUTDIR};
use newspipe_sync::{FailurePolicy, IngestSettings};

#[derive(Parser, Debug)]
#[command(name = "newspipe", author, version)]
#[command(about = "Resumable, quota-aware news ingestion into JSONL and Parquet")]
pub struct Cli {
    /// Free-text query, e.g. "Tencent OR 0700.HK"
    #[arg(long)]
    pub keywords: Option<String>,

    /// Symbol or keyword targets, space or comma separated
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Calendar years to sweep in archive mode, e.g. 2024 2023
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub years: Vec<i32>,

    /// Pages per target for the recent window (up to 100 articles a page)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub recent_pages: i64,

    /// Pages per target per year for the archive sweep
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub archive_pages: i64,

    /// Language filter (eng, zho, jpn, ...). All languages when omitted
    #[arg(long)]
    pub lang: Option<String>,

    #[arg(long, default_value = DEFAULT_OUTDIR)]
    pub outdir: PathBuf,

    /// Verbose debug logs
    #[arg(long)]
    pub debug: bool,

    /// Print the token estimate and exit without calling the API
    #[arg(long)]
    pub estimate_only: bool,

    /// Also write logs to this file
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    #[arg(long)]
    pub max_retries: Option<usize>,

    /// Abort before any request when the estimate exceeds this; 0 disables
    #[arg(long)]
    pub token_cap: Option<u64>,

    /// YAML file with a `symbols:` list appended to --symbols
    #[arg(long)]
    pub universe_file: Option<PathBuf>,

    /// Delay after each accepted page
    #[arg(long, env = "NEWSPIPE_PACING_MS", default_value_t = 400)]
    pub pacing_ms: u64,

    /// Keep going with the next target when one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Serve pages from a fixture directory instead of the live API
    #[arg(long)]
    pub fixtures: Option<PathBuf>,

    #[arg(long, env = "ER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "ER_BASE_URL")]
    pub er_base_url: Option<String>,
}

fn clamp_pages(pages: i64) -> u32 {
    u32::try_from(pages.max(0)).unwrap_or(u32::MAX)
}

impl Cli {
    pub fn pipeline_config(&self, targets: Vec<String>) -> PipelineConfig {
        PipelineConfig {
            keywords: self.keywords.clone().filter(|k| !k.trim().is_empty()),
            targets,
            years: self.years.clone(),
            recent_pages: clamp_pages(self.recent_pages),
            archive_pages: clamp_pages(self.archive_pages),
            lang: self.lang.clone().filter(|l| !l.trim().is_empty()),
            outdir: self.outdir.clone(),
            pacing: Duration::from_millis(self.pacing_ms),
        }
    }

    /// Layers explicit flags over `base`.
    pub fn ingest_settings(&self, base: IngestSettings) -> IngestSettings {
        let mut settings = base;
        if let Some(retries) = self.max_retries {
            settings.backoff.max_retries = retries;
        }
        if let Some(cap) = self.token_cap {
            settings.token_cap = Some(cap).filter(|c| *c > 0);
        }
        if self.continue_on_error {
            settings.failure_policy = FailurePolicy::ContinueOnError;
        }
        settings
    }

    /// Free-form note stored with the run metrics.
    pub fn metrics_extra(&self) -> String {
        let universe = self
            .universe_file
            .as_ref()
            .map(|p| format!("universe={}", p.display()))
            .unwrap_or_else(|| "manual".to_string());
        format!("lang={}, {universe}", self.lang.as_deref().unwrap_or("all"))
    }
}
