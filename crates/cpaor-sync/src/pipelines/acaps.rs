use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use cpaor_adapters::acaps::DEFAULT_AUTH_URL;
use cpaor_adapters::{parse_protection_indicators, AcapsClient, AcapsEndpoints, PageQuery};
use cpaor_core::{
    format_metadata_date, parse_metadata_date, CountryStartDate, DataSource, DatasetMetadata,
    ProtectionIndicatorRecord,
};
use cpaor_storage::write_json_pretty;
use serde_json::Value as JsonValue;
use tracing::info;

use super::{DatasetPipeline, PipelineContext, PipelineRun};
use crate::breakdowns::prepare_breakdowns;
use crate::fetch::fetch_all_pages;
use crate::merge::merge_dedup;

pub const DATASET: &str = "acaps_protection_indicators";
pub const INDICATORS_TABLE: &str = "acaps_protection_indicators/raw_datasets/protection_indicators.csv";
pub const START_DATES_TABLE: &str =
    "acaps_protection_indicators/raw_datasets/country_to_last_infer_date.csv";
pub const SAMPLE_INDICATORS_TABLE: &str =
    "acaps_protection_indicators/raw_datasets/sample_protection_indicators.csv";
pub const SAMPLE_START_DATES_TABLE: &str =
    "acaps_protection_indicators/raw_datasets/sample_country_to_last_infer_date.csv";
pub const BREAKDOWNS_FILE: &str = "acaps_protection_indicators/breakdowns.json";
pub const SAMPLE_BREAKDOWNS_FILE: &str = "acaps_protection_indicators/sample_breakdowns.json";

const SAMPLE_COUNTRY: &str = "Ukraine";

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, 1).unwrap_or_default()
}

fn sample_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 9, 2).unwrap_or_default()
}

/// Output paths of one run. Sample runs never touch the production files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTables {
    pub indicators: &'static str,
    pub start_dates: &'static str,
    pub breakdowns: &'static str,
}

pub fn run_tables(sample: bool) -> RunTables {
    if sample {
        RunTables {
            indicators: SAMPLE_INDICATORS_TABLE,
            start_dates: SAMPLE_START_DATES_TABLE,
            breakdowns: SAMPLE_BREAKDOWNS_FILE,
        }
    } else {
        RunTables {
            indicators: INDICATORS_TABLE,
            start_dates: START_DATES_TABLE,
            breakdowns: BREAKDOWNS_FILE,
        }
    }
}

/// Latest `source_date` already persisted, per country.
pub fn latest_source_dates(rows: &[ProtectionIndicatorRecord]) -> BTreeMap<String, NaiveDate> {
    let mut latest: BTreeMap<String, NaiveDate> = BTreeMap::new();
    for row in rows {
        latest
            .entry(row.country.clone())
            .and_modify(|d| *d = (*d).max(row.source_date))
            .or_insert(row.source_date);
    }
    latest
}

/// Start date for countries with no persisted rows: the last file date
/// recorded in metadata, or 2021-01-01.
fn reference_start_date(metadata: &DatasetMetadata) -> Result<NaiveDate> {
    match metadata.latest_file_time() {
        Some(file_time) => Ok(parse_metadata_date(file_time)
            .context("reading latest_file_info.file_time")?),
        None => Ok(default_start_date()),
    }
}

#[derive(Debug, Clone)]
pub struct AcapsPipeline {
    auth_url: String,
}

impl Default for AcapsPipeline {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
        }
    }
}

impl AcapsPipeline {
    pub fn with_auth_url(auth_url: impl Into<String>) -> Self {
        Self {
            auth_url: auth_url.into(),
        }
    }
}

#[async_trait]
impl DatasetPipeline for AcapsPipeline {
    fn dataset(&self) -> &'static str {
        DATASET
    }

    async fn run(&self, ctx: &PipelineContext, mut metadata: DatasetMetadata) -> Result<PipelineRun> {
        let username = ctx.credentials.email()?;
        let password = ctx.credentials.acaps_password()?;
        let client = AcapsClient::authenticate(
            ctx.http.clone(),
            &AcapsEndpoints {
                auth_url: self.auth_url.clone(),
                data_url: metadata.website_url.clone(),
            },
            username,
            password,
        )
        .await?
        .with_end_date(ctx.sample.then(sample_end_date));

        let outputs = run_tables(ctx.sample);
        let existing = ctx
            .tables
            .read::<ProtectionIndicatorRecord>(outputs.indicators)
            .await?;
        let latest = latest_source_dates(&existing.rows);
        let reference = reference_start_date(&metadata)?;
        let aliases = ctx.registry.aliases(DataSource::Acaps);

        let countries: Vec<String> = if ctx.sample {
            vec![SAMPLE_COUNTRY.to_string()]
        } else {
            ctx.registry.countries().to_vec()
        };

        let mut raw: Vec<JsonValue> = Vec::new();
        let mut start_dates = Vec::with_capacity(countries.len());
        for country in &countries {
            let start_date = latest.get(country).copied().unwrap_or(reference);
            start_dates.push(CountryStartDate {
                country: country.clone(),
                last_infer_date: start_date,
            });

            info!(country = %country, start_date = %start_date, "pulling protection indicators");
            let query = PageQuery {
                country: aliases.to_source(country),
                start_date,
            };
            let pages = fetch_all_pages(&client, &ctx.adapter, &query).await?;
            info!(country = %country, rows = pages.rows.len(), requests = pages.requests, "country pulled");
            raw.extend(pages.rows);
        }
        ctx.tables.write(outputs.start_dates, &start_dates).await?;

        let parsed = parse_protection_indicators(&raw, aliases);
        let merged = merge_dedup(existing.rows, parsed.rows);
        ctx.tables.write(outputs.indicators, &merged).await?;

        let breakdowns = prepare_breakdowns(&merged);
        write_json_pretty(&ctx.tables.path(outputs.breakdowns), &breakdowns)
            .await
            .context("writing protection indicator breakdowns")?;
        info!(breakdowns = breakdowns.len(), "breakdowns prepared");

        if !ctx.sample {
            metadata
                .latest_file_info
                .get_or_insert_with(Default::default)
                .file_time = format_metadata_date(ctx.today);
        }

        Ok(PipelineRun {
            metadata,
            rows_written: merged.len(),
            dropped_rows: existing.dropped + parsed.dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::test_support::context;
    use cpaor_core::LatestFileInfo;
    use cpaor_storage::TableRead;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(country: &str, date: NaiveDate, indicator: &str) -> ProtectionIndicatorRecord {
        ProtectionIndicatorRecord {
            country: country.into(),
            iso3: String::new(),
            source_date: date,
            adm1_eng_name: vec!["North Kivu".to_string()].into(),
            indicator: vec![indicator.to_string()].into(),
            targeting_specific_population_groups: Default::default(),
            justification: "persisted".into(),
            source_name: String::new(),
            source_link: String::new(),
            countrywide: false,
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn latest_dates_are_per_country_maxima() {
        let latest = latest_source_dates(&[
            record("Mali", ymd(2023, 1, 5), "a"),
            record("Mali", ymd(2023, 3, 1), "b"),
            record("Chad", ymd(2022, 12, 1), "a"),
        ]);
        assert_eq!(latest["Mali"], ymd(2023, 3, 1));
        assert_eq!(latest["Chad"], ymd(2022, 12, 1));
    }

    #[test]
    fn reference_date_comes_from_file_time_or_default() {
        let mut meta = DatasetMetadata::new(7, "u");
        assert_eq!(reference_start_date(&meta).unwrap(), ymd(2021, 1, 1));
        meta.latest_file_info = Some(LatestFileInfo {
            file_time: "15-02-2024".into(),
            download_url: String::new(),
        });
        assert_eq!(reference_start_date(&meta).unwrap(), ymd(2024, 2, 15));
    }

    #[tokio::test]
    async fn pulls_each_country_from_its_own_start_date_and_merges() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token-auth/");
                then.status(200).json_body(json!({"token": "t"}));
            })
            .await;
        let drc_page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/protection")
                    .query_param("country", "DRC")
                    .query_param("_internal_filter_date_gte", "2023-05-14")
                    .query_param("page", "1");
                then.status(200).json_body(json!({"results": [{
                    "country": ["DRC"],
                    "iso3": ["COD"],
                    "source_date": "2023-05-14T00:00:00",
                    "adm1_eng_name": ["North Kivu"],
                    "indicator": ["recruitment"],
                    "targeting_specific_population_groups": [],
                    "justification": "fresh"
                }, {
                    "country": [],
                    "source_date": "2023-05-20",
                    "justification": "no country"
                }]}));
            })
            .await;
        let drc_page2 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/protection")
                    .query_param("country", "DRC")
                    .query_param("page", "2");
                then.status(200).json_body(json!({"results": []}));
            })
            .await;
        let sudan_page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/protection")
                    .query_param("country", "Sudan")
                    .query_param("_internal_filter_date_gte", "2024-02-15")
                    .query_param("page", "1");
                then.status(200).json_body(json!({"results": []}));
            })
            .await;

        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), &["Congo DRC", "Sudan"]);
        ctx.tables
            .write(
                INDICATORS_TABLE,
                &[
                    record("Congo DRC", ymd(2023, 5, 14), "recruitment"),
                    record("Congo DRC", ymd(2023, 1, 2), "other"),
                ],
            )
            .await
            .unwrap();

        let mut meta = DatasetMetadata::new(7, server.url("/protection"));
        meta.latest_file_info = Some(LatestFileInfo {
            file_time: "15-02-2024".into(),
            download_url: String::new(),
        });
        let run = AcapsPipeline::with_auth_url(server.url("/token-auth/"))
            .run(&ctx, meta)
            .await
            .unwrap();

        drc_page1.assert_async().await;
        drc_page2.assert_async().await;
        sudan_page1.assert_async().await;

        assert_eq!(run.rows_written, 2);
        assert_eq!(run.dropped_rows, 1);
        assert_eq!(
            run.metadata.latest_file_info.unwrap().file_time,
            "10-06-2024"
        );

        let table: TableRead<ProtectionIndicatorRecord> =
            ctx.tables.read(INDICATORS_TABLE).await.unwrap();
        let fresh = table
            .rows
            .iter()
            .find(|r| r.indicator.first() == Some("recruitment"))
            .unwrap();
        assert_eq!(fresh.justification, "fresh");

        let starts: TableRead<CountryStartDate> = ctx.tables.read(START_DATES_TABLE).await.unwrap();
        assert_eq!(
            starts.rows,
            vec![
                CountryStartDate {
                    country: "Congo DRC".into(),
                    last_infer_date: ymd(2023, 5, 14)
                },
                CountryStartDate {
                    country: "Sudan".into(),
                    last_infer_date: ymd(2024, 2, 15)
                },
            ]
        );

        let breakdowns: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ctx.tables.path(BREAKDOWNS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(breakdowns, json!([]));
    }

    #[tokio::test]
    async fn sample_run_pulls_ukraine_into_sample_tables_only() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token-auth/");
                then.status(200).json_body(json!({"token": "t"}));
            })
            .await;
        let ukraine_page1 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/protection")
                    .query_param("country", "Ukraine")
                    .query_param("_internal_filter_date_gte", "2024-02-15")
                    .query_param("_internal_filter_date_lte", "2023-09-02")
                    .query_param("page", "1");
                then.status(200).json_body(json!({"results": [{
                    "country": ["Ukraine"],
                    "iso3": ["UKR"],
                    "source_date": "2023-06-02",
                    "adm1_eng_name": ["Kharkiv"],
                    "indicator": ["attacks"],
                    "targeting_specific_population_groups": [],
                    "justification": "sampled"
                }]}));
            })
            .await;
        let ukraine_page2 = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/protection")
                    .query_param("country", "Ukraine")
                    .query_param("page", "2");
                then.status(200).json_body(json!({"results": []}));
            })
            .await;
        let other_countries = server
            .mock_async(|when, then| {
                when.method(GET).path("/protection").query_param("country", "Sudan");
                then.status(200).json_body(json!({"results": []}));
            })
            .await;

        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path(), &["Sudan", "Ukraine"]);
        ctx.sample = true;
        let production = vec![record("Sudan", ymd(2023, 1, 2), "persisted")];
        ctx.tables.write(INDICATORS_TABLE, &production).await.unwrap();

        let mut meta = DatasetMetadata::new(7, server.url("/protection"));
        meta.latest_file_info = Some(LatestFileInfo {
            file_time: "15-02-2024".into(),
            download_url: String::new(),
        });
        let run = AcapsPipeline::with_auth_url(server.url("/token-auth/"))
            .run(&ctx, meta)
            .await
            .unwrap();

        ukraine_page1.assert_async().await;
        ukraine_page2.assert_async().await;
        assert_eq!(other_countries.hits_async().await, 0);

        assert_eq!(run.rows_written, 1);
        assert_eq!(
            run.metadata.latest_file_info.unwrap().file_time,
            "15-02-2024"
        );

        let kept: TableRead<ProtectionIndicatorRecord> =
            ctx.tables.read(INDICATORS_TABLE).await.unwrap();
        assert_eq!(kept.rows, production);
        assert!(!ctx.tables.path(START_DATES_TABLE).exists());

        let sampled: TableRead<ProtectionIndicatorRecord> =
            ctx.tables.read(SAMPLE_INDICATORS_TABLE).await.unwrap();
        assert_eq!(sampled.rows.len(), 1);
        assert_eq!(sampled.rows[0].justification, "sampled");
        let starts: TableRead<CountryStartDate> =
            ctx.tables.read(SAMPLE_START_DATES_TABLE).await.unwrap();
        assert_eq!(starts.rows.len(), 1);
        assert_eq!(starts.rows[0].country, "Ukraine");
        assert!(ctx.tables.path(SAMPLE_BREAKDOWNS_FILE).exists());
        assert!(!ctx.tables.path(BREAKDOWNS_FILE).exists());
    }

    #[tokio::test]
    async fn missing_password_fails_before_any_request() {
        let dir = tempdir().unwrap();
        let mut ctx = context(dir.path(), &["Sudan"]);
        ctx.credentials.acaps_password = None;
        let err = AcapsPipeline::default()
            .run(&ctx, DatasetMetadata::new(7, "http://127.0.0.1:9/unused"))
            .await
            .expect_err("no password");
        assert!(format!("{err:#}").contains("ACAPS_PASSWORD"));
    }
}
