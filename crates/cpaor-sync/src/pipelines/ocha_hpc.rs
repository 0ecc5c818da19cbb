use std::ops::RangeInclusive;

use anyhow::Result;
use async_trait::async_trait;
use cpaor_adapters::{parse_plan_summary, OchaHpcClient};
use cpaor_core::{DataSource, DatasetMetadata, PlanCaseloadRecord};
use tracing::{info, warn};

use super::{DatasetPipeline, PipelineContext, PipelineRun};
use crate::merge::merge_dedup;

pub const DATASET: &str = "ocha_hpc";
pub const DEFAULT_SAVED_FILE: &str = "ocha_hpc_data.csv";
pub const PLAN_YEARS: RangeInclusive<i32> = 2020..=2027;

pub fn table_path(metadata: &DatasetMetadata) -> String {
    let file = metadata
        .saved_file_name
        .as_deref()
        .unwrap_or(DEFAULT_SAVED_FILE);
    format!("{DATASET}/{file}")
}

/// Caseload figures per plan and year. Years whose request or payload fails
/// are skipped with a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct OchaHpcPipeline;

#[async_trait]
impl DatasetPipeline for OchaHpcPipeline {
    fn dataset(&self) -> &'static str {
        DATASET
    }

    async fn run(&self, ctx: &PipelineContext, metadata: DatasetMetadata) -> Result<PipelineRun> {
        let client = OchaHpcClient::new(ctx.http.clone(), metadata.website_url.clone());
        let aliases = ctx.registry.aliases(DataSource::OchaHpc);

        let mut fresh: Vec<PlanCaseloadRecord> = Vec::new();
        for year in PLAN_YEARS {
            let parsed = match client.fetch_year(&ctx.adapter, year).await {
                Ok(body) => parse_plan_summary(&body, year, aliases),
                Err(err) => Err(err),
            };
            match parsed {
                Ok(rows) => {
                    info!(year, plans = rows.len(), "plan summary pulled");
                    fresh.extend(rows);
                }
                Err(err) => warn!(year, error = %err, "skipping plan year"),
            }
        }
        fresh.retain(PlanCaseloadRecord::has_pin_figures);

        let path = table_path(&metadata);
        let existing = ctx.tables.read::<PlanCaseloadRecord>(&path).await?;
        let merged = merge_dedup(existing.rows, fresh);
        ctx.tables.write(&path, &merged).await?;

        Ok(PipelineRun {
            metadata,
            rows_written: merged.len(),
            dropped_rows: existing.dropped,
        })
    }
}
