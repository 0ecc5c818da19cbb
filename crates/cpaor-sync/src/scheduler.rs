use anyhow::Result;
use cpaor_core::DatasetsMetadata;
use cpaor_storage::MetadataStore;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::pipelines::{DatasetPipeline, PipelineContext};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetOutcome {
    Skipped {
        days_since_update: i64,
        update_frequency: i64,
    },
    Updated {
        rows_written: usize,
        dropped_rows: usize,
    },
    Failed {
        error: String,
    },
    /// The dataset has no entry in the metadata file.
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetReport {
    pub dataset: String,
    pub outcome: DatasetOutcome,
}

/// Runs each due pipeline in turn and persists metadata after every dataset.
/// A failing pipeline is logged and leaves its metadata entry untouched.
#[derive(Debug, Clone)]
pub struct UpdateScheduler {
    store: MetadataStore,
}

impl UpdateScheduler {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub async fn run(
        &self,
        pipelines: &[Box<dyn DatasetPipeline>],
        ctx: &PipelineContext,
        only: Option<&str>,
    ) -> Result<Vec<DatasetReport>> {
        let mut metadata: DatasetsMetadata = self.store.load().await?;
        let mut reports = Vec::new();

        for pipeline in pipelines {
            let dataset = pipeline.dataset();
            if only.is_some_and(|name| name != dataset) {
                continue;
            }
            let span = info_span!("dataset_update", run_id = %ctx.adapter.run_id, dataset);
            let outcome = self
                .run_dataset(pipeline.as_ref(), ctx, &mut metadata)
                .instrument(span)
                .await?;
            reports.push(DatasetReport {
                dataset: dataset.to_string(),
                outcome,
            });
        }
        Ok(reports)
    }

    async fn run_dataset(
        &self,
        pipeline: &dyn DatasetPipeline,
        ctx: &PipelineContext,
        metadata: &mut DatasetsMetadata,
    ) -> Result<DatasetOutcome> {
        let dataset = pipeline.dataset();
        let Some(entry) = metadata.get(dataset).cloned() else {
            warn!("dataset missing from metadata file");
            return Ok(DatasetOutcome::NotConfigured);
        };

        let days_since_update = match entry.days_since_last_update(ctx.today) {
            Ok(days) => days,
            Err(err) => {
                error!(error = %err, "unreadable last_update_time");
                return Ok(DatasetOutcome::Failed {
                    error: err.to_string(),
                });
            }
        };
        if days_since_update < entry.update_frequency {
            info!(
                days_since_update,
                update_frequency = entry.update_frequency,
                "not due"
            );
            return Ok(DatasetOutcome::Skipped {
                days_since_update,
                update_frequency: entry.update_frequency,
            });
        }

        info!(days_since_update, sample = ctx.sample, "updating");
        match pipeline.run(ctx, entry).await {
            Ok(run) => {
                let mut updated = run.metadata;
                if !ctx.sample {
                    updated.mark_updated(ctx.today);
                }
                metadata.insert(dataset.to_string(), updated);
                self.store.save(metadata).await?;
                info!(
                    rows_written = run.rows_written,
                    dropped_rows = run.dropped_rows,
                    "dataset updated"
                );
                Ok(DatasetOutcome::Updated {
                    rows_written: run.rows_written,
                    dropped_rows: run.dropped_rows,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "dataset update failed");
                Ok(DatasetOutcome::Failed { error: message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::test_support::context;
    use crate::pipelines::PipelineRun;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{Days, NaiveDate};
    use cpaor_core::{format_metadata_date, DatasetMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CountingPipeline {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl DatasetPipeline for CountingPipeline {
        fn dataset(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &PipelineContext, mut metadata: DatasetMetadata) -> Result<PipelineRun> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("upstream timed out");
            }
            metadata.saved_file_name = Some("out.csv".into());
            Ok(PipelineRun {
                metadata,
                rows_written: 4,
                dropped_rows: 1,
            })
        }
    }

    fn pipeline(name: &'static str, fail: bool) -> (Box<dyn DatasetPipeline>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingPipeline {
                name,
                runs: runs.clone(),
                fail,
            }),
            runs,
        )
    }

    fn entry(last_update: NaiveDate, update_frequency: i64) -> DatasetMetadata {
        let mut meta = DatasetMetadata::new(update_frequency, "https://example.org");
        meta.last_update_time = format_metadata_date(last_update);
        meta
    }

    async fn seed(store: &MetadataStore, entries: &[(&str, DatasetMetadata)]) {
        let metadata: DatasetsMetadata = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        store.save(&metadata).await.unwrap();
    }

    fn three_days_before(today: NaiveDate) -> NaiveDate {
        today.checked_sub_days(Days::new(3)).unwrap()
    }

    #[tokio::test]
    async fn dataset_updated_three_days_ago_waits_for_weekly_frequency() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Sudan"]);
        let store = MetadataStore::new(dir.path().join("datasets_metadata.json"));
        seed(&store, &[("acled", entry(three_days_before(ctx.today), 7))]).await;

        let (p, runs) = pipeline("acled", false);
        let reports = UpdateScheduler::new(store).run(&[p], &ctx, None).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            reports[0].outcome,
            DatasetOutcome::Skipped {
                days_since_update: 3,
                update_frequency: 7
            }
        );
    }

    #[tokio::test]
    async fn dataset_updated_three_days_ago_runs_with_two_day_frequency() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Sudan"]);
        let store = MetadataStore::new(dir.path().join("datasets_metadata.json"));
        seed(&store, &[("acled", entry(three_days_before(ctx.today), 2))]).await;

        let (p, runs) = pipeline("acled", false);
        let reports = UpdateScheduler::new(store.clone())
            .run(&[p], &ctx, None)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            reports[0].outcome,
            DatasetOutcome::Updated {
                rows_written: 4,
                dropped_rows: 1
            }
        );

        let saved = store.load().await.unwrap();
        assert_eq!(saved["acled"].last_update_time, "10-06-2024");
        assert_eq!(saved["acled"].saved_file_name.as_deref(), Some("out.csv"));
    }

    #[tokio::test]
    async fn failure_leaves_metadata_untouched_and_later_datasets_still_run() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Sudan"]);
        let store = MetadataStore::new(dir.path().join("datasets_metadata.json"));
        let stale = entry(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 7);
        seed(&store, &[("acaps", stale.clone()), ("acled", stale.clone())]).await;

        let (failing, _) = pipeline("acaps", true);
        let (ok, ok_runs) = pipeline("acled", false);
        let reports = UpdateScheduler::new(store.clone())
            .run(&[failing, ok], &ctx, None)
            .await
            .unwrap();

        assert!(matches!(
            &reports[0].outcome,
            DatasetOutcome::Failed { error } if error.contains("upstream timed out")
        ));
        assert_eq!(ok_runs.load(Ordering::SeqCst), 1);
        let saved = store.load().await.unwrap();
        assert_eq!(saved["acaps"], stale);
        assert_eq!(saved["acled"].last_update_time, "10-06-2024");
    }

    #[tokio::test]
    async fn sample_runs_keep_the_update_date() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path(), &["Sudan"]);
        ctx.sample = true;
        let store = MetadataStore::new(dir.path().join("datasets_metadata.json"));
        seed(&store, &[("acled", entry(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 7))]).await;

        let (p, runs) = pipeline("acled", false);
        UpdateScheduler::new(store.clone())
            .run(&[p], &ctx, None)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().await.unwrap()["acled"].last_update_time, "01-01-2024");
    }

    #[tokio::test]
    async fn only_filter_and_unconfigured_datasets() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Sudan"]);
        let store = MetadataStore::new(dir.path().join("datasets_metadata.json"));
        seed(&store, &[("acled", entry(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 7))]).await;

        let (acled, acled_runs) = pipeline("acled", false);
        let (ipc, _) = pipeline("ipc", false);
        let scheduler = UpdateScheduler::new(store);

        let reports = scheduler.run(&[ipc, acled], &ctx, Some("ipc")).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, DatasetOutcome::NotConfigured);
        assert_eq!(acled_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_metadata_file_is_an_error() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Sudan"]);
        let store = MetadataStore::new(dir.path().join("absent.json"));
        let (p, _) = pipeline("acled", false);
        assert!(UpdateScheduler::new(store).run(&[p], &ctx, None).await.is_err());
    }
}
