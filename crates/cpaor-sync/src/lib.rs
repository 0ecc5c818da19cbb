//! Update orchestration: per-dataset pipelines, location mapping and the
//! metadata-driven scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use cpaor_adapters::AdapterContext;
use cpaor_core::{CountryRegistry, EventRecord};
use cpaor_storage::{HttpClientConfig, HttpFetcher, MetadataStore, RawArchive, TableStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod breakdowns;
pub mod config;
pub mod fetch;
pub mod locations;
pub mod matcher;
pub mod merge;
pub mod pipelines;
pub mod scheduler;

pub use config::{load_country_registry, Credentials, SyncConfig};
pub use locations::{LocationMapping, LocationMappingBuilder};
pub use pipelines::{default_pipelines, DatasetPipeline, PipelineContext};
pub use scheduler::{DatasetOutcome, DatasetReport, UpdateScheduler};

pub const CRATE_NAME: &str = "cpaor-sync";

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Restricted pull that leaves `last_update_time` untouched.
    pub sample: bool,
    pub only: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sample: bool,
    pub datasets: Vec<DatasetReport>,
}

impl UpdateReport {
    pub fn failed(&self) -> usize {
        self.datasets
            .iter()
            .filter(|d| matches!(d.outcome, DatasetOutcome::Failed { .. }))
            .count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: CountryRegistry,
    http: HttpFetcher,
    pipelines: Vec<Box<dyn DatasetPipeline>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let registry = load_country_registry(&config.countries_file)?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: SyncConfig, registry: CountryRegistry) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            config,
            registry,
            http,
            pipelines: default_pipelines(),
        })
    }

    pub fn with_pipelines(mut self, pipelines: Vec<Box<dyn DatasetPipeline>>) -> Self {
        self.pipelines = pipelines;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn context(&self, sample: bool) -> PipelineContext {
        let archive = self
            .config
            .archive_raw
            .then(|| RawArchive::new(self.config.raw_dir()));
        PipelineContext {
            registry: self.registry.clone(),
            credentials: self.config.credentials.clone(),
            http: self.http.clone(),
            adapter: AdapterContext::new(archive),
            tables: TableStore::new(self.config.outputs_dir()),
            boundaries_dir: self.config.boundaries_dir(),
            sample,
            today: Local::now().date_naive(),
        }
    }

    pub async fn run_once(&self, options: &UpdateOptions) -> Result<UpdateReport> {
        if let Some(only) = options.only.as_deref() {
            if !self.pipelines.iter().any(|p| p.dataset() == only) {
                bail!("unknown dataset `{only}`");
            }
        }
        let ctx = self.context(options.sample);
        info!(run_id = %ctx.adapter.run_id, sample = options.sample, "update run started");

        let scheduler = UpdateScheduler::new(MetadataStore::new(self.config.metadata_path()));
        let datasets = scheduler
            .run(&self.pipelines, &ctx, options.only.as_deref())
            .await?;

        let report = UpdateReport {
            run_id: ctx.adapter.run_id,
            started_at: ctx.adapter.started_at,
            finished_at: Utc::now(),
            sample: options.sample,
            datasets,
        };
        info!(run_id = %report.run_id, failed = report.failed(), "update run finished");
        Ok(report)
    }

    /// Builds (or loads) the ACLED admin1 mapping from the names present in
    /// the persisted events table.
    pub async fn map_locations(&self) -> Result<LocationMapping> {
        let tables = TableStore::new(self.config.outputs_dir());
        let events = tables
            .read::<EventRecord>(pipelines::acled::EVENTS_TABLE)
            .await
            .context("reading persisted ACLED events")?;

        let names = pipelines::acled::admin1_names_by_country(
            events
                .rows
                .iter()
                .map(|e| (e.country.as_str(), e.admin1.as_str())),
        );
        LocationMappingBuilder::new(
            tables.path(pipelines::acled::MAPPING_CACHE),
            self.config.boundaries_dir(),
        )
        .build(self.registry.countries(), &names)
        .await
    }

    /// A cron scheduler running `run_once` on `update_cron`, or `None` when
    /// scheduling is disabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.update_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(&UpdateOptions::default()).await {
                    Ok(report) => info!(run_id = %report.run_id, failed = report.failed(), "scheduled update finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled update failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_update_from_env(options: UpdateOptions) -> Result<UpdateReport> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(&options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::test_support::registry;
    use crate::pipelines::PipelineRun;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use cpaor_core::{DatasetMetadata, DatasetsMetadata};
    use tempfile::tempdir;

    struct TouchPipeline;

    #[async_trait]
    impl DatasetPipeline for TouchPipeline {
        fn dataset(&self) -> &'static str {
            "touch"
        }

        async fn run(&self, ctx: &PipelineContext, metadata: DatasetMetadata) -> Result<PipelineRun> {
            ctx.tables
                .write("touch/rows.csv", &[EventRecord {
                    country: "Sudan".into(),
                    admin1: "Khartoum".into(),
                    event_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                    latitude: 15.5,
                    longitude: 32.5,
                    event_type: "Violence against civilians".into(),
                    fatalities: 1,
                }])
                .await?;
            Ok(PipelineRun {
                metadata,
                rows_written: 1,
                dropped_rows: 0,
            })
        }
    }

    async fn seed_metadata(config: &SyncConfig) {
        let metadata: DatasetsMetadata =
            [("touch".to_string(), DatasetMetadata::new(1, "https://example.org"))].into();
        MetadataStore::new(config.metadata_path())
            .save(&metadata)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_once_updates_due_datasets_under_the_data_root() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::for_data_root(dir.path());
        seed_metadata(&config).await;

        let pipeline = SyncPipeline::with_registry(config.clone(), registry(&["Sudan"]))
            .unwrap()
            .with_pipelines(vec![Box::new(TouchPipeline)]);
        let report = pipeline.run_once(&UpdateOptions::default()).await.unwrap();

        assert_eq!(report.datasets.len(), 1);
        assert_eq!(report.failed(), 0);
        assert!(config.outputs_dir().join("touch/rows.csv").exists());
        let saved = MetadataStore::new(config.metadata_path()).load().await.unwrap();
        assert_eq!(
            saved["touch"].last_update_time,
            cpaor_core::format_metadata_date(Local::now().date_naive())
        );
    }

    #[tokio::test]
    async fn unknown_only_dataset_is_rejected() {
        let dir = tempdir().unwrap();
        let pipeline =
            SyncPipeline::with_registry(SyncConfig::for_data_root(dir.path()), registry(&["Sudan"]))
                .unwrap();
        let err = pipeline
            .run_once(&UpdateOptions {
                sample: false,
                only: Some("idmc".into()),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("idmc"));
    }

    #[tokio::test]
    async fn map_locations_uses_persisted_admin1_names() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::for_data_root(dir.path());
        std::fs::create_dir_all(config.boundaries_dir()).unwrap();
        std::fs::write(
            config.boundaries_dir().join("Sudan.geojson"),
            r#"{"geojson":{"features":[{"properties":{"name":"North Darfur"}},{"properties":{"name":"Khartoum"}}]}}"#,
        )
        .unwrap();
        let tables = TableStore::new(config.outputs_dir());
        let event = |admin1: &str| EventRecord {
            country: "Sudan".into(),
            admin1: admin1.into(),
            event_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            latitude: 13.6,
            longitude: 25.3,
            event_type: "Violence against civilians".into(),
            fatalities: 0,
        };
        tables
            .write(
                pipelines::acled::EVENTS_TABLE,
                &[event("N. Darfur"), event("Khartoum")],
            )
            .await
            .unwrap();

        let pipeline = SyncPipeline::with_registry(config, registry(&["Sudan"])).unwrap();
        let mapping = pipeline.map_locations().await.unwrap();
        assert_eq!(mapping["Sudan"]["N. Darfur"], "North Darfur");
        assert_eq!(mapping["Sudan"]["Khartoum"], "Khartoum");
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(
            SyncPipeline::with_registry(SyncConfig::for_data_root(dir.path()), registry(&["Sudan"]))
                .unwrap(),
        );
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }
}
