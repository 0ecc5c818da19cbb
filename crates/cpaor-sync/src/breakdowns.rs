//! Per-country breakdowns of ACAPS protection indicators: for every value of
//! the location, indicator and population-group columns, the most recent
//! supporting observations.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use cpaor_core::ProtectionIndicatorRecord;
use serde::Serialize;

pub const COUNTRY_WIDE: &str = "Country Wide";
pub const MIN_ENTRIES: usize = 3;
pub const MAX_ENTRIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum BreakdownColumn {
    #[serde(rename = "Geolocation")]
    Geolocation,
    #[serde(rename = "Indicator")]
    Indicator,
    #[serde(rename = "Targeting Specific Population Groups")]
    TargetedGroups,
}

impl BreakdownColumn {
    pub const ALL: [BreakdownColumn; 3] = [
        BreakdownColumn::Geolocation,
        BreakdownColumn::Indicator,
        BreakdownColumn::TargetedGroups,
    ];

    fn values<'a>(&self, record: &'a ProtectionIndicatorRecord) -> &'a [String] {
        match self {
            BreakdownColumn::Geolocation => &record.adm1_eng_name.0,
            BreakdownColumn::Indicator => &record.indicator.0,
            BreakdownColumn::TargetedGroups => &record.targeting_specific_population_groups.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownEntry {
    pub source_name: String,
    pub source_date: NaiveDate,
    pub source_link: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub country: String,
    pub column: BreakdownColumn,
    pub value: String,
    pub entries: Vec<BreakdownEntry>,
    pub n_entries: usize,
    pub last_date: NaiveDate,
}

/// Countrywide rows are located at `Country Wide` instead of their admin1 list.
fn localized(record: &ProtectionIndicatorRecord) -> ProtectionIndicatorRecord {
    let mut record = record.clone();
    if record.countrywide {
        record.adm1_eng_name = vec![COUNTRY_WIDE.to_string()].into();
    }
    record
}

/// Breakdowns of one country, ordered by column then value.
pub fn country_breakdowns(records: &[ProtectionIndicatorRecord], country: &str) -> Vec<Breakdown> {
    let rows: Vec<ProtectionIndicatorRecord> = records
        .iter()
        .filter(|r| r.country == country)
        .map(localized)
        .collect();

    let mut out = Vec::new();
    for column in BreakdownColumn::ALL {
        let values: BTreeSet<&str> = rows
            .iter()
            .flat_map(|r| column.values(r))
            .map(String::as_str)
            .collect();

        for value in values {
            let mut matching: Vec<&ProtectionIndicatorRecord> = rows
                .iter()
                .filter(|r| column.values(r).iter().any(|v| v == value))
                .collect();
            if matching.len() < MIN_ENTRIES && value != COUNTRY_WIDE {
                continue;
            }
            matching.sort_by(|a, b| b.source_date.cmp(&a.source_date));
            matching.truncate(MAX_ENTRIES);

            let entries: Vec<BreakdownEntry> = matching
                .iter()
                .map(|r| BreakdownEntry {
                    source_name: r.source_name.clone(),
                    source_date: r.source_date,
                    source_link: r.source_link.clone(),
                    text: r.justification.replace('\n', " "),
                })
                .collect();
            let Some(last_date) = entries.first().map(|e| e.source_date) else {
                continue;
            };
            out.push(Breakdown {
                country: country.to_string(),
                column,
                value: value.to_string(),
                n_entries: entries.len(),
                entries,
                last_date,
            });
        }
    }
    out
}

/// Breakdowns for every country present in `records`, ordered by country.
pub fn prepare_breakdowns(records: &[ProtectionIndicatorRecord]) -> Vec<Breakdown> {
    let countries: BTreeSet<&str> = records.iter().map(|r| r.country.as_str()).collect();
    countries
        .into_iter()
        .flat_map(|country| country_breakdowns(records, country))
        .collect()
}
