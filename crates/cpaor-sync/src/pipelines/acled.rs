use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use cpaor_adapters::{parse_acled_events, AcledClient};
use cpaor_core::{DataSource, DatasetMetadata, EventCount, EventRecord, RawEvent};
use tracing::{info, warn};

use super::{DatasetPipeline, PipelineContext, PipelineRun};
use crate::locations::{apply_mapping, LocationMapping, LocationMappingBuilder};
use crate::merge::{accumulate_counts, merge_dedup, sum_fatalities};

pub const DATASET: &str = "acled";
pub const COUNTS_TABLE: &str = "acled/number_events_evolution.csv";
pub const EVENTS_TABLE: &str = "acled/individual_events_targetting_civilians_new.csv";
pub const MAPPING_CACHE: &str = "acled/mapping_acled_to_fieldmaps.json";

/// Individual events are kept from this year onwards.
pub const MIN_EVENT_YEAR: i32 = 2023;

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 1, 1).unwrap_or_default()
}

/// Distinct admin1 names per country, in first-seen order.
pub fn admin1_names_by_country<'a>(
    events: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, Vec<String>> {
    let mut seen: BTreeSet<(&str, &str)> = BTreeSet::new();
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (country, admin1) in events {
        if seen.insert((country, admin1)) {
            out.entry(country.to_string()).or_default().push(admin1.to_string());
        }
    }
    out
}

/// Events of tracked countries from [`MIN_EVENT_YEAR`] on, with admin1
/// rewritten through the location mapping and fatalities summed per key.
pub fn civilian_events(
    events: &[RawEvent],
    countries: &[String],
    mapping: &LocationMapping,
) -> Vec<EventRecord> {
    let tracked: BTreeSet<&str> = countries.iter().map(String::as_str).collect();
    let rows = events
        .iter()
        .filter(|e| e.year >= MIN_EVENT_YEAR && tracked.contains(e.country.as_str()))
        .map(|e| {
            let admin1 = apply_mapping(mapping.get(&e.country), &e.admin1).to_string();
            EventRecord {
                admin1,
                ..e.clone().into_event_record()
            }
        })
        .collect();
    sum_fatalities(rows)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcledPipeline;

#[async_trait]
impl DatasetPipeline for AcledPipeline {
    fn dataset(&self) -> &'static str {
        DATASET
    }

    async fn run(&self, ctx: &PipelineContext, metadata: DatasetMetadata) -> Result<PipelineRun> {
        let client = AcledClient::new(
            ctx.http.clone(),
            metadata.website_url.clone(),
            ctx.credentials.acled_api_key()?,
            ctx.credentials.email()?,
        );
        let start_date = if metadata.last_update_time.trim().is_empty() {
            default_start_date()
        } else {
            metadata.last_update_date()?
        };
        let aliases = ctx.registry.aliases(DataSource::Acled);
        let countries = ctx.registry.countries();

        let mut raw = Vec::new();
        for country in countries {
            match client
                .fetch_country(&ctx.adapter, &aliases.to_source(country), start_date)
                .await
            {
                Ok(rows) => {
                    info!(country = %country, events = rows.len(), "events pulled");
                    raw.extend(rows);
                }
                Err(err) => warn!(country = %country, error = %err, "skipping country"),
            }
        }
        let parsed = parse_acled_events(&raw, aliases);

        let existing_counts = ctx.tables.read::<EventCount>(COUNTS_TABLE).await?;
        let counts = accumulate_counts(
            existing_counts.rows,
            parsed.rows.iter().map(|e| (e.country.clone(), e.year)),
        );
        ctx.tables.write(COUNTS_TABLE, &counts).await?;

        let names = admin1_names_by_country(
            parsed
                .rows
                .iter()
                .map(|e| (e.country.as_str(), e.admin1.as_str())),
        );
        let mapping = LocationMappingBuilder::new(ctx.tables.path(MAPPING_CACHE), &ctx.boundaries_dir)
            .build(countries, &names)
            .await?;

        let fresh = civilian_events(&parsed.rows, countries, &mapping);
        let existing_events = ctx.tables.read::<EventRecord>(EVENTS_TABLE).await?;
        let merged = merge_dedup(existing_events.rows, fresh);
        ctx.tables.write(EVENTS_TABLE, &merged).await?;

        Ok(PipelineRun {
            metadata,
            rows_written: counts.len() + merged.len(),
            dropped_rows: parsed.dropped + existing_counts.dropped + existing_events.dropped,
        })
    }
}
