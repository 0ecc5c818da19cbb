//! One pipeline per dataset entry of `datasets_metadata.json`.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use cpaor_adapters::AdapterContext;
use cpaor_core::{CountryRegistry, DatasetMetadata};
use cpaor_storage::{HttpFetcher, TableStore};

use crate::config::Credentials;

pub mod acaps;
pub mod acled;
pub mod hdx;
pub mod ocha_hpc;

pub use acaps::AcapsPipeline;
pub use acled::AcledPipeline;
pub use hdx::HdxPipeline;
pub use ocha_hpc::OchaHpcPipeline;

/// Everything a pipeline may touch during one update run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub registry: CountryRegistry,
    pub credentials: Credentials,
    pub http: HttpFetcher,
    pub adapter: AdapterContext,
    /// Rooted at `<data root>/datasources`.
    pub tables: TableStore,
    pub boundaries_dir: PathBuf,
    pub sample: bool,
    pub today: NaiveDate,
}

/// What a successful pipeline run hands back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub metadata: DatasetMetadata,
    pub rows_written: usize,
    pub dropped_rows: usize,
}

impl PipelineRun {
    pub fn unchanged(metadata: DatasetMetadata) -> Self {
        Self {
            metadata,
            rows_written: 0,
            dropped_rows: 0,
        }
    }
}

#[async_trait]
pub trait DatasetPipeline: Send + Sync {
    /// Key of this dataset in `datasets_metadata.json`.
    fn dataset(&self) -> &'static str;

    async fn run(&self, ctx: &PipelineContext, metadata: DatasetMetadata) -> Result<PipelineRun>;
}

/// The datasets updated by `update`, in run order.
pub fn default_pipelines() -> Vec<Box<dyn DatasetPipeline>> {
    vec![
        Box::new(HdxPipeline::new(hdx::IPC_DATASET)),
        Box::new(AcapsPipeline::default()),
        Box::new(HdxPipeline::new(hdx::INFORM_SEVERITY_DATASET)),
        Box::new(OchaHpcPipeline),
        Box::new(AcledPipeline::default()),
    ]
}
