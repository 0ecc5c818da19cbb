//! Core domain model for the CPAoR data pipelines.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "cpaor-core";

/// Date format used by `datasets_metadata.json` (`last_update_time`, `file_time`).
pub const METADATA_DATE_FORMAT: &str = "%d-%m-%Y";

/// Stand-in for a dataset that has never been updated.
pub const NEVER_UPDATED: &str = "01-01-2000";

/// Upstream systems that spell country names their own way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Acaps,
    Acled,
    OchaHpc,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataSource::Acaps => "acaps",
            DataSource::Acled => "acled",
            DataSource::OchaHpc => "ocha_hpc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CountryRegistryError {
    #[error("{source_system}: alias `{alias}` is shared by `{first}` and `{second}`")]
    DuplicateAlias {
        source_system: String,
        alias: String,
        first: String,
        second: String,
    },
}

/// Bidirectional canonical <-> source-system country names. Unmapped names pass through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryAliases {
    to_source: BTreeMap<String, String>,
    to_canonical: BTreeMap<String, String>,
}

impl CountryAliases {
    /// Builds the mapping from `canonical -> alias` pairs, rejecting aliases
    /// claimed by more than one canonical name.
    pub fn new(
        source_system: impl fmt::Display,
        canonical_to_alias: BTreeMap<String, String>,
    ) -> Result<Self, CountryRegistryError> {
        let mut to_canonical: BTreeMap<String, String> = BTreeMap::new();
        for (canonical, alias) in &canonical_to_alias {
            if let Some(first) = to_canonical.insert(alias.clone(), canonical.clone()) {
                return Err(CountryRegistryError::DuplicateAlias {
                    source_system: source_system.to_string(),
                    alias: alias.clone(),
                    first,
                    second: canonical.clone(),
                });
            }
        }
        Ok(Self {
            to_source: canonical_to_alias,
            to_canonical,
        })
    }

    pub fn to_source(&self, canonical: &str) -> String {
        self.to_source
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    pub fn to_canonical(&self, alias: &str) -> String {
        self.to_canonical
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }

    pub fn len(&self) -> usize {
        self.to_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_source.is_empty()
    }
}

/// Tracked countries plus the alias tables of every upstream source.
#[derive(Debug, Clone, Default)]
pub struct CountryRegistry {
    countries: Vec<String>,
    aliases: BTreeMap<DataSource, CountryAliases>,
    passthrough: CountryAliases,
}

impl CountryRegistry {
    pub fn new(
        countries: Vec<String>,
        aliases: BTreeMap<DataSource, BTreeMap<String, String>>,
    ) -> Result<Self, CountryRegistryError> {
        let aliases = aliases
            .into_iter()
            .map(|(source, pairs)| CountryAliases::new(source, pairs).map(|a| (source, a)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Self {
            countries,
            aliases,
            passthrough: CountryAliases::default(),
        })
    }

    pub fn countries(&self) -> &[String] {
        &self.countries
    }

    pub fn aliases(&self, source: DataSource) -> &CountryAliases {
        self.aliases.get(&source).unwrap_or(&self.passthrough)
    }
}

/// Rows that carry a natural business key used for merge/dedup.
pub trait NaturalKey {
    type Key: Ord + Clone;

    fn natural_key(&self) -> Self::Key;
}

/// One ACLED event as returned by the API (before location mapping).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub year: i32,
    pub country: String,
    pub admin1: String,
    pub event_type: String,
    pub event_date: NaiveDate,
    pub latitude: f64,
    pub longitude: f64,
    pub fatalities: i64,
}

impl RawEvent {
    pub fn into_event_record(self) -> EventRecord {
        EventRecord {
            country: self.country,
            admin1: self.admin1,
            event_date: self.event_date,
            latitude: self.latitude,
            longitude: self.longitude,
            event_type: self.event_type,
            fatalities: self.fatalities,
        }
    }
}

/// Persisted row of `individual_events_targetting_civilians_new.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub country: String,
    pub admin1: String,
    pub event_date: NaiveDate,
    pub latitude: f64,
    pub longitude: f64,
    pub event_type: String,
    pub fatalities: i64,
}

impl NaturalKey for EventRecord {
    type Key = (String, String, NaiveDate, String, String, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.country.clone(),
            self.admin1.clone(),
            self.event_date,
            self.latitude.to_string(),
            self.longitude.to_string(),
            self.event_type.clone(),
        )
    }
}

/// Persisted row of `number_events_evolution.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCount {
    pub country: String,
    pub year: i32,
    #[serde(rename = "Number of Events")]
    pub number_of_events: u64,
}

impl NaturalKey for EventCount {
    type Key = (String, i32);

    fn natural_key(&self) -> Self::Key {
        (self.country.clone(), self.year)
    }
}

/// One humanitarian plan's caseload figures for a country and year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCaseloadRecord {
    pub country: String,
    pub year: i32,
    pub plan_type: String,
    pub children_in_need: Option<f64>,
    pub targeted_children: Option<f64>,
    pub tot_pop_in_need: Option<f64>,
    pub cp_targeted: Option<f64>,
    pub cp_beneficiaries: Option<f64>,
}

impl PlanCaseloadRecord {
    pub fn has_pin_figures(&self) -> bool {
        self.children_in_need.is_some()
            || self.targeted_children.is_some()
            || self.tot_pop_in_need.is_some()
    }
}

impl NaturalKey for PlanCaseloadRecord {
    type Key = (String, i32, String);

    fn natural_key(&self) -> Self::Key {
        (self.country.clone(), self.year, self.plan_type.clone())
    }
}

/// One ACAPS protection indicator observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionIndicatorRecord {
    pub country: String,
    pub iso3: String,
    pub source_date: NaiveDate,
    pub adm1_eng_name: ListCell,
    pub indicator: ListCell,
    pub targeting_specific_population_groups: ListCell,
    pub justification: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub source_link: String,
    /// The observation covers the whole country rather than `adm1_eng_name`.
    #[serde(default)]
    pub countrywide: bool,
}

impl NaturalKey for ProtectionIndicatorRecord {
    type Key = (String, NaiveDate, String, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.country.clone(),
            self.source_date,
            self.adm1_eng_name.joined(),
            self.indicator.joined(),
        )
    }
}

/// Per-country start date used by the last ACAPS pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryStartDate {
    pub country: String,
    pub last_infer_date: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListLiteralError {
    #[error("list literal is missing its closing bracket")]
    UnclosedBracket,
    #[error("list item is not quoted")]
    UnquotedItem,
    #[error("list item has no closing quote")]
    UnterminatedString,
    #[error("unexpected character `{0}` between list items")]
    UnexpectedChar(char),
}

/// Parses a stringified list cell.
///
/// Accepts JSON arrays (`["a", "b"]`) and single-quoted literals (`['a', 'b']`).
/// A bare scalar is a one-element list; an empty cell or `nan` is an empty list.
pub fn parse_list_literal(raw: &str) -> Result<Vec<String>, ListLiteralError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Ok(Vec::new());
    }
    let Some(rest) = trimmed.strip_prefix('[') else {
        return Ok(vec![unquote_scalar(trimmed).to_string()]);
    };
    let Some(inner) = rest.strip_suffix(']') else {
        return Err(ListLiteralError::UnclosedBracket);
    };
    if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
        return Ok(items);
    }
    parse_quoted_items(inner)
}

fn unquote_scalar(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_quoted_items(inner: &str) -> Result<Vec<String>, ListLiteralError> {
    let mut out = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(quote) = chars.next() else {
            break;
        };
        if quote != '\'' && quote != '"' {
            return Err(ListLiteralError::UnquotedItem);
        }
        let mut item = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        item.push(escaped);
                    }
                }
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => item.push(c),
            }
        }
        if !closed {
            return Err(ListLiteralError::UnterminatedString);
        }
        out.push(item);
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(other) => return Err(ListLiteralError::UnexpectedChar(other)),
        }
    }
    Ok(out)
}

/// A list-valued CSV cell, written as a JSON array and read with [`parse_list_literal`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListCell(pub Vec<String>);

impl ListCell {
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn joined(&self) -> String {
        self.0.join("|")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for ListCell {
    fn from(items: Vec<String>) -> Self {
        Self(items)
    }
}

impl Serialize for ListCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(&self.0).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for ListCell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_list_literal(&raw).map(ListCell).map_err(D::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid date `{value}` (expected dd-mm-yyyy)")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

pub fn parse_metadata_date(value: &str) -> Result<NaiveDate, MetadataError> {
    NaiveDate::parse_from_str(value.trim(), METADATA_DATE_FORMAT).map_err(|source| {
        MetadataError::InvalidDate {
            value: value.to_string(),
            source,
        }
    })
}

pub fn format_metadata_date(date: NaiveDate) -> String {
    date.format(METADATA_DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestFileInfo {
    #[serde(default)]
    pub file_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_url: String,
}

/// One entry of `datasets_metadata.json`. Unknown keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub last_update_time: String,
    pub update_frequency: i64,
    #[serde(default)]
    pub website_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdx_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_file_info: Option<LatestFileInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

pub type DatasetsMetadata = BTreeMap<String, DatasetMetadata>;

impl DatasetMetadata {
    pub fn new(update_frequency: i64, website_url: impl Into<String>) -> Self {
        Self {
            last_update_time: String::new(),
            update_frequency,
            website_url: website_url.into(),
            saved_file_name: None,
            hdx_file_name: None,
            latest_file_info: None,
            extra: BTreeMap::new(),
        }
    }

    /// Last update date; an empty field means the dataset was never updated.
    pub fn last_update_date(&self) -> Result<NaiveDate, MetadataError> {
        if self.last_update_time.trim().is_empty() {
            parse_metadata_date(NEVER_UPDATED)
        } else {
            parse_metadata_date(&self.last_update_time)
        }
    }

    pub fn days_since_last_update(&self, today: NaiveDate) -> Result<i64, MetadataError> {
        Ok((today - self.last_update_date()?).num_days())
    }

    pub fn is_due(&self, today: NaiveDate) -> Result<bool, MetadataError> {
        Ok(self.days_since_last_update(today)? >= self.update_frequency)
    }

    pub fn mark_updated(&mut self, today: NaiveDate) {
        self.last_update_time = format_metadata_date(today);
    }

    pub fn latest_file_time(&self) -> Option<&str> {
        self.latest_file_info
            .as_ref()
            .map(|info| info.file_time.as_str())
            .filter(|t| !t.trim().is_empty())
    }
}
