use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use lotar_core::GameType;
use lotar_storage::CorpusStore;
use lotar_sync::{IngestMode, IngestPipeline, RunSummary, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotar")]
#[command(about = "Lottery draw corpus ingestion and statistics")]
struct Cli {
    /// Game type: lotto645 or pension720.
    #[arg(long, default_value = "lotto645")]
    game: GameType,

    /// Corpus data root (env LOTAR_DATA_DIR, default ./data).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Catch up to the newest published draw.
    Latest,
    /// Backfill every published draw from 1.
    All,
    /// Ingest an inclusive draw span, e.g. `range 1100-1163`.
    Range { span: String },
    /// Re-fetch store winners for numbers-only draws.
    UpdateStores,
    /// Recompute the statistics snapshot from the persisted corpus.
    Stats,
}

fn parse_span(span: &str) -> Result<(u32, u32)> {
    let Some((start, end)) = span.split_once('-') else {
        bail!("range must be <start>-<end>, got {span}");
    };
    let start: u32 = start.trim().parse()?;
    let end: u32 = end.trim().parse()?;
    if start > end {
        bail!("range start {start} is after end {end}");
    }
    Ok((start, end))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} ({} {}): fetched={} persisted={} skipped={} store_rows={} failures={}",
        summary.run_id,
        summary.game.as_str(),
        summary.mode,
        summary.draws_fetched,
        summary.draws_persisted,
        summary.draws_skipped,
        summary.store_rows_persisted,
        summary.failures.len(),
    );
    for failure in &summary.failures {
        println!("  draw {}: {}", failure.draw_no, failure.error);
    }
    if let Some(report) = &summary.latest_report {
        match report.reason {
            // Retry advice is data, not failure: still exit zero.
            Some(reason) => println!(
                "latest draw {}: {:?}, retry advised ({})",
                report.draw_no,
                report.state,
                reason.as_str()
            ),
            None => println!("latest draw {}: complete", report.draw_no),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let mode = match &cli.command {
        Commands::Latest => IngestMode::Latest,
        Commands::All => IngestMode::All,
        Commands::Range { span } => {
            let (start, end) = parse_span(span)?;
            IngestMode::Range { start, end }
        }
        Commands::UpdateStores => IngestMode::UpdateStoresOnly,
        Commands::Stats => {
            let store = CorpusStore::open(&config.data_dir, cli.game)?;
            lotar_stats::compute_and_write(&store)?;
            println!(
                "statistics written to {}",
                store.root().join("statistics.json").display()
            );
            return Ok(());
        }
    };

    let pipeline = IngestPipeline::new(&config, cli.game)?;
    let summary = pipeline.run(mode).await?;
    print_summary(&summary);
    Ok(())
}
