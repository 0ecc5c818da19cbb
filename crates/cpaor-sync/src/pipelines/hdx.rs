use anyhow::{Context, Result};
use async_trait::async_trait;
use cpaor_adapters::hdx::FIRST_RESOURCE;
use cpaor_adapters::HdxClient;
use cpaor_core::DatasetMetadata;
use cpaor_storage::write_atomic;
use tracing::info;

use super::{DatasetPipeline, PipelineContext, PipelineRun};

pub const IPC_DATASET: &str = "ipc";
pub const INFORM_SEVERITY_DATASET: &str = "acaps_inform_severity";

/// Where the mirrored file of `dataset` is stored, relative to the outputs root.
pub fn file_path(dataset: &str, saved_file_name: &str) -> String {
    format!("{dataset}/{saved_file_name}")
}

/// Mirrors one file published on an HDX dataset page. The file is downloaded
/// only when the page's modification date differs from the recorded one.
#[derive(Debug, Clone, Copy)]
pub struct HdxPipeline {
    dataset: &'static str,
}

impl HdxPipeline {
    pub fn new(dataset: &'static str) -> Self {
        Self { dataset }
    }
}

#[async_trait]
impl DatasetPipeline for HdxPipeline {
    fn dataset(&self) -> &'static str {
        self.dataset
    }

    async fn run(&self, ctx: &PipelineContext, mut metadata: DatasetMetadata) -> Result<PipelineRun> {
        let saved_file_name = metadata
            .saved_file_name
            .clone()
            .with_context(|| format!("{} has no saved_file_name", self.dataset))?;
        let hdx_file_name = metadata.hdx_file_name.as_deref().unwrap_or(FIRST_RESOURCE);

        let client = HdxClient::new(ctx.http.clone());
        let info = client
            .latest_file_info(&ctx.adapter, self.dataset, &metadata.website_url, hdx_file_name)
            .await?;

        if metadata.latest_file_time() == Some(info.file_time.as_str()) {
            info!(dataset = self.dataset, file_time = %info.file_time, "HDX file unchanged");
            return Ok(PipelineRun::unchanged(metadata));
        }

        let body = client.download(&info.download_url).await?;
        let target = ctx.tables.path(file_path(self.dataset, &saved_file_name));
        write_atomic(&target, &body).await?;
        info!(
            dataset = self.dataset,
            file_time = %info.file_time,
            bytes = body.len(),
            "HDX file refreshed"
        );
        metadata.latest_file_info = Some(info);

        Ok(PipelineRun {
            metadata,
            rows_written: 1,
            dropped_rows: 0,
        })
    }
}
