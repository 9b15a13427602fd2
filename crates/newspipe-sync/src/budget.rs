//! Pre-flight token estimation. Pure arithmetic; nothing here touches the network.

use newspipe_core::{FetchMode, PipelineConfig};
use serde::Serialize;

use crate::IngestError;

/// One token per recent page.
pub const RECENT_TOKENS_PER_PAGE: u64 = 1;

/// Archive pages are billed per searched year.
pub const ARCHIVE_TOKENS_PER_YEAR_PAGE: u64 = 5;

pub fn estimate_recent(pages: u32) -> u64 {
    u64::from(pages) * RECENT_TOKENS_PER_PAGE
}

pub fn estimate_archive(pages: u32, years: usize) -> u64 {
    ARCHIVE_TOKENS_PER_YEAR_PAGE * u64::from(pages) * years as u64
}

/// Cost of one mode across all targets.
pub fn estimate_mode(mode: FetchMode, pages: u32, years: usize, targets: usize) -> u64 {
    let per_target = match mode {
        FetchMode::Recent => estimate_recent(pages),
        FetchMode::Archive => estimate_archive(pages, years),
    };
    per_target.saturating_mul(targets as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    pub recent: u64,
    pub archive: u64,
}

impl TokenEstimate {
    pub fn for_config(config: &PipelineConfig) -> Self {
        let targets = config.target_count();
        Self {
            recent: estimate_mode(FetchMode::Recent, config.recent_pages, 0, targets),
            archive: estimate_mode(
                FetchMode::Archive,
                config.archive_pages,
                config.years.len(),
                targets,
            ),
        }
    }

    pub fn total(&self) -> u64 {
        self.recent.saturating_add(self.archive)
    }
}

/// A cap of `None` or zero disables the check. Equality with the cap passes.
pub fn enforce_cap(estimate: &TokenEstimate, cap: Option<u64>) -> Result<(), IngestError> {
    match cap.filter(|c| *c > 0) {
        Some(cap) if estimate.total() > cap => Err(IngestError::QuotaExceeded {
            estimated: estimate.total(),
            cap,
        }),
        _ => Ok(()),
    }
}
