use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use clap::{Parser, Subcommand};
use cpaor_report::{render_markdown, ReportOptions, ReportSources, ReportTables};
use cpaor_storage::{MetadataStore, TableStore};
use cpaor_sync::pipelines::{acled, hdx, ocha_hpc};
use cpaor_sync::{
    load_country_registry, run_update_from_env, SyncConfig, SyncPipeline, UpdateOptions,
    UpdateReport,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cpaor-cli")]
#[command(about = "Child Protection AoR data pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh every dataset that is due.
    Update {
        /// Restricted pull that does not move `last_update_time`.
        #[arg(long)]
        sample: bool,
        /// Only this dataset.
        #[arg(long)]
        only: Option<String>,
    },
    /// Build the ACLED admin1 location mapping if it is not cached yet.
    MapLocations,
    /// Print a markdown summary of the persisted tables.
    Report {
        /// Defaults to the current year.
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Run `update` on the configured cron until interrupted.
    Watch,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// Non-zero when any dataset of the run failed.
fn update_status(report: &UpdateReport) -> u8 {
    u8::from(report.failed() > 0)
}

/// Mirrored HDX file of `dataset`, from its metadata entry or `default_file`.
fn hdx_file(metadata: Option<&cpaor_core::DatasetsMetadata>, dataset: &str, default_file: &str) -> String {
    let saved = metadata
        .and_then(|m| m.get(dataset))
        .and_then(|entry| entry.saved_file_name.as_deref())
        .unwrap_or(default_file);
    hdx::file_path(dataset, saved)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Update {
        sample: false,
        only: None,
    }) {
        Commands::Update { sample, only } => {
            let report = run_update_from_env(UpdateOptions { sample, only }).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing update report")?
            );
            if report.failed() > 0 {
                eprintln!("{} dataset(s) failed", report.failed());
            }
            return Ok(ExitCode::from(update_status(&report)));
        }
        Commands::MapLocations => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let mapping = pipeline.map_locations().await?;
            for (country, names) in &mapping {
                println!("{country}: {} names mapped", names.len());
            }
        }
        Commands::Report { year, country, top } => {
            let config = SyncConfig::from_env();
            let registry = load_country_registry(&config.countries_file)?;
            let metadata = MetadataStore::new(config.metadata_path()).load().await.ok();
            let plans_table = metadata
                .as_ref()
                .and_then(|m| m.get(ocha_hpc::DATASET).map(ocha_hpc::table_path))
                .unwrap_or_else(|| format!("{}/{}", ocha_hpc::DATASET, ocha_hpc::DEFAULT_SAVED_FILE));
            let ipc_table = hdx_file(metadata.as_ref(), hdx::IPC_DATASET, "ipc_global_national_long.csv");
            let inform_workbook = hdx_file(
                metadata.as_ref(),
                hdx::INFORM_SEVERITY_DATASET,
                "inform_severity.xlsx",
            );
            let tables = ReportTables::load(
                &TableStore::new(config.outputs_dir()),
                &ReportSources {
                    plans_table: &plans_table,
                    counts_table: acled::COUNTS_TABLE,
                    ipc_table: &ipc_table,
                    inform_workbook: &inform_workbook,
                    countries: registry.countries(),
                },
            )
            .await?;
            let year = year.unwrap_or_else(|| Local::now().year());
            print!("{}", render_markdown(&tables, &ReportOptions { year, country, top }));
        }
        Commands::Watch => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let cron = pipeline.config().update_cron.clone();
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "watching for scheduled updates");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
