mod cli;

use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use newspipe_adapters::{ArticleSource, EventRegistryClient, EventRegistryConfig, FixtureSource};
use newspipe_core::{FetchMode, PipelineConfig};
use newspipe_sync::{
    enforce_cap, load_universe_file, merge_targets, validate_config, IngestError, IngestSettings,
    IngestionOrchestrator, RunReport, TokenEstimate,
};
use tracing::{debug, error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.debug, cli.logfile.as_deref()) {
        eprintln!("failed to initialise logging: {err:#}");
        return ExitCode::from(1);
    }
    debug!(?cli.symbols, ?cli.years, ?cli.outdir, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = err.exit_code(), "{err}");
            let mut cause = std::error::Error::source(&err);
            while let Some(inner) = cause {
                error!("  caused by: {inner}");
                cause = inner.source();
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_tracing(debug: bool, logfile: Option<&Path>) -> anyhow::Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_layer = match logfile {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tfmt::layer()
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tfmt::layer()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339()),
        )
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

async fn run(cli: Cli) -> Result<(), IngestError> {
    let mut target_lists = vec![cli.symbols.clone()];
    if let Some(path) = &cli.universe_file {
        target_lists.push(load_universe_file(path).await?);
    }
    let config = cli.pipeline_config(merge_targets(target_lists));
    let settings = cli.ingest_settings(IngestSettings::from_env());
    validate_config(&config, &settings)?;

    let estimate = TokenEstimate::for_config(&config);
    report_plan(&config, &estimate);

    if cli.estimate_only {
        info!("estimate-only run finished; no API calls made");
        return Ok(());
    }
    enforce_cap(&estimate, settings.token_cap)?;

    let source = build_source(&cli)?;
    let mut orchestrator = IngestionOrchestrator::open(config, settings, source).await?;
    let report = orchestrator.run().await?;
    report_outputs(&orchestrator, &report);
    orchestrator
        .record_metrics(&report, &cli.metrics_extra())
        .await?;
    Ok(())
}

fn build_source(cli: &Cli) -> Result<Arc<dyn ArticleSource>, IngestError> {
    if let Some(dir) = &cli.fixtures {
        info!(dir = %dir.display(), "serving pages from fixtures");
        return Ok(Arc::new(FixtureSource::new(dir)));
    }
    let api_key = cli
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            IngestError::Config(
                "ER_API_KEY is not set; export it or pass --fixtures <dir>".to_string(),
            )
        })?;
    let mut er_config = EventRegistryConfig::new(api_key);
    if let Some(base_url) = &cli.er_base_url {
        er_config.base_url = base_url.clone();
    }
    let client = EventRegistryClient::new(er_config)
        .map_err(|err| IngestError::Config(format!("{err:#}")))?;
    Ok(Arc::new(client))
}

fn report_plan(config: &PipelineConfig, estimate: &TokenEstimate) {
    println!(
        "estimated tokens -> recent: {}, archive: {}, total: {}",
        estimate.recent,
        estimate.archive,
        estimate.total()
    );
    info!(
        recent_pages = config.recent_pages,
        archive_pages = config.archive_pages,
        years = ?config.years,
        targets = ?config.query_targets(),
        lang = config.lang.as_deref().unwrap_or("all"),
        "plan"
    );
}

fn report_outputs(orchestrator: &IngestionOrchestrator, report: &RunReport) {
    if let Some(recent) = &report.recent {
        println!(
            "recent: {} new articles ({} rows across sinks)",
            recent.novel_articles, recent.rows_written
        );
    }
    if let Some(archive) = &report.archive {
        println!(
            "archive: {} new articles ({} rows across sinks)",
            archive.novel_articles, archive.rows_written
        );
    }
    if report.failed_fetches() > 0 {
        println!("failed targets: {}", report.failed_fetches());
    }

    let layout = orchestrator.layout();
    println!("outputs at {}", layout.root().display());
    for mode in [FetchMode::Recent, FetchMode::Archive] {
        println!(" - {mode} jsonl : {}", layout.jsonl_path(mode).display());
        println!(" - {mode} table : {}", layout.table_dir(mode).display());
    }
    println!(" - checkpoint   : {}", orchestrator.checkpoint_path().display());
    println!(" - seen         : {}", orchestrator.dedup().path().display());
}
