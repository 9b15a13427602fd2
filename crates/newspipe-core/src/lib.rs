//! Core article model, fetch planning and run configuration for newspipe.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "newspipe-core";

/// Marks identifiers derived from an article URL rather than supplied upstream.
pub const SURROGATE_ID_PREFIX: &str = "urlsha256:";

pub const DEFAULT_OUTDIR: &str = "news_out";

/// Publisher block attached to an upstream article.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Upstream article record.
///
/// The fields the engine inspects are typed; everything else the upstream
/// sends is kept in `extra` and written back out untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Article {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,
    #[serde(rename = "dateTime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Article {
    /// Native identifier, if the upstream supplied a non-empty one.
    pub fn identifier(&self) -> Option<&str> {
        non_empty(self.uri.as_deref())
    }

    pub fn source_title(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.title.as_deref())
    }

    /// Settles the article's identity, writing a surrogate back into `uri`
    /// when only a URL is present. Returns `None` for records with neither,
    /// which have no stable identity and must be dropped.
    pub fn resolve_identity(&mut self) -> Option<String> {
        if let Some(uri) = self.identifier() {
            return Some(uri.to_string());
        }
        let url = non_empty(self.url.as_deref())?;
        let surrogate = surrogate_identifier(url);
        self.uri = Some(surrogate.clone());
        Some(surrogate)
    }
}

/// Stable identifier for a URL: same URL, same identifier, across runs.
pub fn surrogate_identifier(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{SURROGATE_ID_PREFIX}{}", hex::encode(hasher.finalize()))
}

pub fn is_surrogate_identifier(id: &str) -> bool {
    id.starts_with(SURROGATE_ID_PREFIX)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Rolling recent window; no explicit date range.
    Recent,
    /// One sweep per calendar year.
    Archive,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Recent => "recent",
            FetchMode::Archive => "archive",
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive date range passed to the upstream as `dateStart`/`dateEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `YYYY-01-01..YYYY-12-31`.
    pub fn calendar_year(year: i32) -> Option<Self> {
        Some(Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1)?,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start_str(), self.end_str())
    }
}

/// One bounded page-loop invocation derived from the run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFetch {
    pub mode: FetchMode,
    pub target: String,
    pub window: Option<DateWindow>,
    pub pages: u32,
}

impl PlannedFetch {
    pub fn window_label(&self) -> String {
        self.window
            .map(|w| w.to_string())
            .unwrap_or_else(|| "recent".to_string())
    }
}

/// Immutable run parameters. Page counts are unsigned, so the caller's
/// clamp to zero is enforced by the type.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub keywords: Option<String>,
    pub targets: Vec<String>,
    pub years: Vec<i32>,
    pub recent_pages: u32,
    pub archive_pages: u32,
    pub lang: Option<String>,
    pub outdir: PathBuf,
    pub pacing: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keywords: None,
            targets: Vec::new(),
            years: Vec::new(),
            recent_pages: 0,
            archive_pages: 0,
            lang: None,
            outdir: PathBuf::from(DEFAULT_OUTDIR),
            pacing: Duration::from_millis(400),
        }
    }
}

impl PipelineConfig {
    /// Free-text keywords first, then the symbol/keyword targets.
    pub fn query_targets(&self) -> Vec<String> {
        self.keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .chain(self.targets.iter())
            .cloned()
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.query_targets().len()
    }

    pub fn runs_recent(&self) -> bool {
        self.recent_pages > 0
    }

    pub fn runs_archive(&self) -> bool {
        self.archive_pages > 0 && !self.years.is_empty()
    }

    pub fn recent_plan(&self) -> Vec<PlannedFetch> {
        if !self.runs_recent() {
            return Vec::new();
        }
        self.query_targets()
            .into_iter()
            .map(|target| PlannedFetch {
                mode: FetchMode::Recent,
                target,
                window: None,
                pages: self.recent_pages,
            })
            .collect()
    }

    /// Year-major: every target is swept once per year before moving on.
    pub fn archive_plan(&self) -> Vec<PlannedFetch> {
        if !self.runs_archive() {
            return Vec::new();
        }
        let targets = self.query_targets();
        self.years
            .iter()
            .filter_map(|year| DateWindow::calendar_year(*year))
            .flat_map(|window| {
                targets.iter().map(move |target| PlannedFetch {
                    mode: FetchMode::Archive,
                    target: target.clone(),
                    window: Some(window),
                    pages: self.archive_pages,
                })
            })
            .collect()
    }

    pub fn fetch_plan(&self) -> Vec<PlannedFetch> {
        let mut plan = self.recent_plan();
        plan.extend(self.archive_plan());
        plan
    }
}
