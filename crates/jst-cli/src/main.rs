use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use jst_core::TargetTable;
use jst_sync::{ConsolidationConfig, ConsolidationPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jst")]
#[command(about = "Consolidate legacy job-search tracker databases into one unified SQLite file")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read every source, merge, and write the unified database (default).
    Consolidate(ConsolidateArgs),
    /// Print how each legacy table would be classified and mapped.
    Analyze(AnalyzeArgs),
    /// Create the unified database and apply its schema.
    Init(TargetArgs),
    /// Check key constraints and duplicate keys in the unified database.
    Verify(TargetArgs),
    /// Summarize the most recent consolidation runs.
    Report(ReportArgs),
}

#[derive(Debug, Default, Args)]
struct ConsolidateArgs {
    #[arg(long)]
    target: Option<PathBuf>,
    /// Legacy database, repeatable; processed in the given order.
    #[arg(long = "source")]
    sources: Vec<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long = "source")]
    sources: Vec<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long)]
    target: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, default_value_t = 5)]
    runs: usize,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn format_counts(counts: &BTreeMap<TargetTable, i64>) -> String {
    counts
        .iter()
        .map(|(table, n)| format!("{table}={n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mut config = ConsolidationConfig::from_env();

    match cli
        .command
        .unwrap_or_else(|| Commands::Consolidate(ConsolidateArgs::default()))
    {
        Commands::Consolidate(args) => {
            if let Some(target) = args.target {
                config.target_db = target;
            }
            if !args.sources.is_empty() {
                config.sources = args.sources;
            }
            if args.rules.is_some() {
                config.rules_path = args.rules;
            }
            if let Some(dir) = args.reports_dir {
                config.reports_dir = dir;
            }
            config.dry_run = args.dry_run;

            let summary = ConsolidationPipeline::new(config)?.run_once().await?;
            println!(
                "consolidation complete: run_id={} sources={} skipped={} staged={}",
                summary.run_id, summary.sources_read, summary.sources_skipped, summary.staged_rows,
            );
            println!(
                "merged={} written={} conflicts={} review={} reports={}",
                summary.merged_rows,
                summary.rows_written,
                summary.conflicts,
                summary.review_items,
                summary.reports_dir
            );
            if let Some(counts) = &summary.counts_after {
                println!("rows: {}", format_counts(counts));
            }
        }
        Commands::Analyze(args) => {
            if !args.sources.is_empty() {
                config.sources = args.sources;
            }
            if args.rules.is_some() {
                config.rules_path = args.rules;
            }
            let rules = config.load_rules()?;
            let sources = jst_sync::analyze_sources(&rules, &config.sources).await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&sources)?);
            } else {
                println!("{}", jst_sync::render_analysis_markdown(&sources));
            }
        }
        Commands::Init(args) => {
            let target = args.target.unwrap_or(config.target_db);
            let counts = jst_sync::init_target(&target).await?;
            println!("initialized {}: {}", target.display(), format_counts(&counts));
        }
        Commands::Verify(args) => {
            let target = args.target.unwrap_or(config.target_db);
            let report = jst_sync::verify_target(&target).await?;
            match &report.key_index.index_name {
                Some(name) => println!(
                    "jobs unique key ({}) enforced by {name}",
                    report.key_index.expected_columns.join(", ")
                ),
                None => println!(
                    "jobs has no unique index on ({})",
                    report.key_index.expected_columns.join(", ")
                ),
            }
            for group in &report.duplicates {
                let key = group
                    .key
                    .iter()
                    .map(|part| part.as_deref().unwrap_or("<null>"))
                    .collect::<Vec<_>>()
                    .join(" / ");
                println!("duplicate {} key `{key}` x{}", group.table, group.count);
            }
            if !report.is_ok() {
                bail!("verification failed for {}", target.display());
            }
            info!(target = %target.display(), "verification passed");
        }
        Commands::Report(args) => {
            let root = args.reports_dir.unwrap_or(config.reports_dir);
            println!("{}", jst_sync::report_recent_markdown(args.runs, &root)?);
        }
    }

    Ok(())
}
