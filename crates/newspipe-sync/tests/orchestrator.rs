use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use newspipe_adapters::MemorySource;
use newspipe_core::{surrogate_identifier, Article, DateWindow, FetchMode, PipelineConfig};
use newspipe_storage::{CheckpointStore, DedupStore};
use newspipe_sync::{FailurePolicy, IngestError, IngestSettings, IngestionOrchestrator, OutputLayout};
use tempfile::tempdir;

fn config(outdir: &Path, targets: &[&str]) -> PipelineConfig {
    PipelineConfig {
        targets: targets.iter().map(|t| t.to_string()).collect(),
        outdir: outdir.to_path_buf(),
        pacing: Duration::ZERO,
        ..Default::default()
    }
}

fn settings() -> IngestSettings {
    IngestSettings {
        token_cap: None,
        ..IngestSettings::default()
    }
}

fn articles(prefix: &str, count: usize) -> Vec<Article> {
    (0..count)
        .map(|i| Article {
            uri: Some(format!("{prefix}-{i}")),
            url: Some(format!("https://news.example/{prefix}/{i}")),
            title: Some(format!("{prefix} story {i}")),
            ..Default::default()
        })
        .collect()
}

fn jsonl_uris(outdir: &Path, mode: FetchMode) -> Vec<String> {
    let path = OutputLayout::new(outdir).jsonl_path(mode);
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .map(|l| {
            serde_json::from_str::<Article>(l)
                .expect("jsonl row")
                .uri
                .expect("uri")
        })
        .collect()
}

async fn open(
    config: PipelineConfig,
    settings: IngestSettings,
    source: &Arc<MemorySource>,
) -> IngestionOrchestrator {
    IngestionOrchestrator::open(config, settings, source.clone())
        .await
        .expect("open orchestrator")
}

#[tokio::test]
async fn full_page_then_empty_page_checkpoints_one_hundred() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_page("AAPL", None, 1, articles("aapl", 100)));
    let mut config = config(dir.path(), &["AAPL"]);
    config.recent_pages = 2;

    let mut orchestrator = open(config, settings(), &source).await;
    let report = orchestrator.run().await.expect("run");

    let recent = report.recent.expect("recent ran");
    assert_eq!(recent.novel_articles, 100);
    assert_eq!(recent.rows_written, 200);
    assert_eq!(recent.pages_requested, 2);
    assert!(report.archive.is_none());
    assert_eq!(source.call_count(), 2);

    let state = CheckpointStore::in_dir(dir.path()).load().await.expect("checkpoint");
    assert_eq!(state.items_written_recent, 100);
    assert_eq!(state.items_written_archive, 0);
    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent).len(), 100);
}

#[tokio::test]
async fn second_run_over_same_state_emits_nothing_new() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_page("AAPL", None, 1, articles("aapl", 5))
            .with_page("AAPL", None, 2, articles("aapl-p2", 3)),
    );
    let mut config = config(dir.path(), &["AAPL"]);
    config.recent_pages = 3;

    let first = open(config.clone(), settings(), &source)
        .await
        .run()
        .await
        .expect("first run");
    assert_eq!(first.recent.expect("recent").novel_articles, 8);

    let second = open(config, settings(), &source)
        .await
        .run()
        .await
        .expect("second run");
    let recent = second.recent.expect("recent");
    assert_eq!(recent.novel_articles, 0);
    assert_eq!(recent.empty_fetches, 1);

    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent).len(), 8);
    let state = CheckpointStore::in_dir(dir.path()).load().await.expect("checkpoint");
    assert_eq!(state.items_written_recent, 8);
}

#[tokio::test]
async fn quota_violation_makes_no_calls() {
    let dir = tempdir().expect("tempdir");
    let outdir = dir.path().join("out");
    let source = Arc::new(MemorySource::new());
    let mut config = config(&outdir, &["0700.HK"]);
    config.years = vec![2024, 2023];
    config.archive_pages = 3;
    let settings = IngestSettings {
        token_cap: Some(10),
        ..IngestSettings::default()
    };

    let err = IngestionOrchestrator::open(config, settings, source.clone())
        .await
        .err()
        .expect("over cap");
    assert!(matches!(err, IngestError::QuotaExceeded { estimated: 30, cap: 10 }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(source.call_count(), 0);
    // rejected before the output directory or any state file is touched
    assert!(!outdir.exists());
}

#[tokio::test]
async fn resume_emits_only_unseen_identifiers() {
    let dir = tempdir().expect("tempdir");
    DedupStore::open_in(dir.path())
        .await
        .expect("dedup")
        .persist(&["a", "b"])
        .await
        .expect("seed");

    let page: Vec<Article> = ["a", "b", "c"]
        .iter()
        .map(|id| Article {
            uri: Some(id.to_string()),
            ..Default::default()
        })
        .collect();
    let source = Arc::new(MemorySource::new().with_page("AAPL", None, 1, page));
    let mut config = config(dir.path(), &["AAPL"]);
    config.recent_pages = 1;

    let mut orchestrator = open(config, settings(), &source).await;
    assert_eq!(orchestrator.dedup().len(), 2);
    orchestrator.run_recent().await.expect("recent");

    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent), vec!["c"]);
}

#[tokio::test]
async fn url_only_articles_collapse_across_targets() {
    let dir = tempdir().expect("tempdir");
    let shared = || Article {
        url: Some("http://x".into()),
        title: Some("Same wire story".into()),
        ..Default::default()
    };
    let orphan = Article {
        title: Some("no identity".into()),
        ..Default::default()
    };
    let source = Arc::new(
        MemorySource::new()
            .with_page("0700.HK", None, 1, vec![shared(), orphan])
            .with_page("9988.HK", None, 1, vec![shared()]),
    );
    let mut config = config(dir.path(), &["0700.HK", "9988.HK"]);
    config.recent_pages = 1;

    let report = open(config, settings(), &source)
        .await
        .run()
        .await
        .expect("run");
    assert_eq!(report.recent.expect("recent").novel_articles, 1);

    let expected = surrogate_identifier("http://x");
    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent), vec![expected.clone()]);
    let seen = DedupStore::open_in(dir.path()).await.expect("dedup");
    assert!(seen.contains(&expected));
    assert_eq!(seen.len(), 1);
}

#[tokio::test]
async fn archive_sweeps_every_target_once_per_year() {
    let dir = tempdir().expect("tempdir");
    let y2024 = DateWindow::calendar_year(2024);
    let y2023 = DateWindow::calendar_year(2023);
    let source = Arc::new(
        MemorySource::new()
            .with_page("AAPL", y2024, 1, articles("aapl-2024", 2))
            .with_page("MSFT", y2023, 1, articles("msft-2023", 1)),
    );
    let mut config = config(dir.path(), &["AAPL", "MSFT"]);
    config.keywords = Some("big tech".into());
    config.years = vec![2024, 2023];
    config.archive_pages = 1;

    let report = open(config, settings(), &source)
        .await
        .run()
        .await
        .expect("run");
    assert!(report.recent.is_none());
    assert_eq!(report.mode_label(), "archive");
    assert_eq!(report.archive.expect("archive").novel_articles, 3);

    let order: Vec<(String, Option<DateWindow>)> = source
        .calls()
        .into_iter()
        .map(|q| (q.query, q.window))
        .collect();
    assert_eq!(
        order,
        vec![
            ("big tech".to_string(), y2024),
            ("AAPL".to_string(), y2024),
            ("MSFT".to_string(), y2024),
            ("big tech".to_string(), y2023),
            ("AAPL".to_string(), y2023),
            ("MSFT".to_string(), y2023),
        ]
    );
    let state = CheckpointStore::in_dir(dir.path()).load().await.expect("checkpoint");
    assert_eq!(state.items_written_archive, 3);
}

#[tokio::test]
async fn fail_fast_halts_without_touching_the_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_page("AAPL", None, 1, articles("aapl", 2))
            .with_fatal("AAPL", None, 2)
            .with_page("MSFT", None, 1, articles("msft", 2)),
    );
    let mut config = config(dir.path(), &["AAPL", "MSFT"]);
    config.recent_pages = 2;

    let err = open(config, settings(), &source)
        .await
        .run()
        .await
        .expect_err("fatal page");
    assert!(matches!(err, IngestError::FetchFailed { ref target, page: 2, .. } if target == "AAPL"));
    assert_eq!(err.exit_code(), 3);
    assert!(source.calls().iter().all(|q| q.query == "AAPL"));
    assert!(!CheckpointStore::in_dir(dir.path()).path().exists());

    // page 1 is both marked seen and written, so nothing is lost on resume
    let seen = DedupStore::open_in(dir.path()).await.expect("dedup");
    assert!(seen.contains("aapl-0"));
    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent), vec!["aapl-0", "aapl-1"]);
}

#[tokio::test]
async fn continue_on_error_keeps_pages_before_the_failure() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_page("AAPL", None, 1, articles("aapl", 2))
            .with_fatal("AAPL", None, 2)
            .with_page("MSFT", None, 1, articles("msft", 3)),
    );
    let mut config = config(dir.path(), &["AAPL", "MSFT"]);
    config.recent_pages = 2;
    let settings = IngestSettings {
        failure_policy: FailurePolicy::ContinueOnError,
        ..settings()
    };

    let report = open(config.clone(), settings.clone(), &source)
        .await
        .run()
        .await
        .expect("run");
    let recent = report.recent.expect("recent");
    assert_eq!(recent.failed.len(), 1);
    assert_eq!(recent.failed[0].target, "AAPL");
    assert_eq!(recent.novel_articles, 5);
    assert_eq!(recent.empty_fetches, 0);
    assert_eq!(
        jsonl_uris(dir.path(), FetchMode::Recent),
        vec!["aapl-0", "aapl-1", "msft-0", "msft-1", "msft-2"]
    );

    // once the source recovers, a resume re-serves the same pages without re-emitting them
    let recovered = Arc::new(
        MemorySource::new()
            .with_page("AAPL", None, 1, articles("aapl", 2))
            .with_page("MSFT", None, 1, articles("msft", 3)),
    );
    let second = open(config, settings, &recovered)
        .await
        .run()
        .await
        .expect("resume");
    assert_eq!(second.recent.expect("recent").novel_articles, 0);
    assert_eq!(jsonl_uris(dir.path(), FetchMode::Recent).len(), 5);
    let state = CheckpointStore::in_dir(dir.path()).load().await.expect("checkpoint");
    assert_eq!(state.items_written_recent, 5);
}

#[tokio::test]
async fn continue_on_error_records_the_failure_and_moves_on() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_fatal("AAPL", None, 1)
            .with_page("MSFT", None, 1, articles("msft", 4)),
    );
    let mut config = config(dir.path(), &["AAPL", "MSFT"]);
    config.recent_pages = 1;
    let settings = IngestSettings {
        failure_policy: FailurePolicy::ContinueOnError,
        ..settings()
    };

    let mut orchestrator = open(config, settings, &source).await;
    let report = orchestrator.run().await.expect("run");
    let recent = report.recent.as_ref().expect("recent");
    assert_eq!(recent.failed.len(), 1);
    assert_eq!(recent.failed[0].target, "AAPL");
    assert_eq!(recent.novel_articles, 4);
    assert_eq!(report.failed_fetches(), 1);
    assert_eq!(orchestrator.checkpoint().items_written_recent, 4);

    orchestrator
        .record_metrics(&report, "lang=all, manual")
        .await
        .expect("metrics");
    let metrics = std::fs::read_to_string(orchestrator.layout().metrics_path()).expect("metrics file");
    let row: serde_json::Value = serde_json::from_str(metrics.trim()).expect("row");
    assert_eq!(row["failed_targets"], 1);
    assert_eq!(row["items_recent"], 4);
    assert_eq!(row["mode"], "recent");
}

#[tokio::test]
async fn empty_target_list_is_a_no_op_run() {
    let dir = tempdir().expect("tempdir");
    let source = Arc::new(MemorySource::new());
    let mut config = config(dir.path(), &[]);
    config.recent_pages = 3;

    let report = open(config, settings(), &source)
        .await
        .run()
        .await
        .expect("run");
    let recent = report.recent.expect("recent");
    assert_eq!(recent.planned_fetches, 0);
    assert_eq!(recent.novel_articles, 0);
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn corrupt_checkpoint_refuses_to_start() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("checkpoint.json"), b"{\"run_started_at\": 12").expect("write");
    let source = Arc::new(MemorySource::new());
    let mut config = config(dir.path(), &["AAPL"]);
    config.recent_pages = 1;

    let err = IngestionOrchestrator::open(config, settings(), source.clone())
        .await
        .err()
        .expect("corrupt checkpoint");
    assert!(matches!(err, IngestError::Checkpoint(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(source.call_count(), 0);
}
