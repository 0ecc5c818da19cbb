//! Source clients for the humanitarian APIs + parsing of their raw payloads into typed rows.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use cpaor_core::ListLiteralError;
use cpaor_storage::{FetchError, RawArchive};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod acaps;
pub mod acled;
pub mod hdx;
pub mod ocha_hpc;

pub use acaps::{parse_protection_indicators, AcapsClient, AcapsEndpoints};
pub use acled::{parse_acled_events, AcledClient};
pub use hdx::{parse_resource_listing, HdxClient};
pub use ocha_hpc::{parse_plan_summary, OchaHpcClient};

pub const CRATE_NAME: &str = "cpaor-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing credential `{0}`")]
    MissingCredential(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why a single upstream row could not be turned into a typed record.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("field `{field}`: {source}")]
    List {
        field: &'static str,
        #[source]
        source: ListLiteralError,
    },
    #[error("field `{field}` has invalid date `{value}`")]
    InvalidDate { field: &'static str, value: String },
    #[error("field `{field}` has invalid number `{value}`")]
    InvalidNumber { field: &'static str, value: String },
}

/// Typed rows parsed from a batch, plus the count of rows that were rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRows<T> {
    pub rows: Vec<T>,
    pub dropped: usize,
}

impl<T> Default for ParsedRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            dropped: 0,
        }
    }
}

impl<T> ParsedRows<T> {
    pub(crate) fn collect<'a, I, F>(source_id: &str, raw: I, mut parse: F) -> Self
    where
        I: IntoIterator<Item = &'a JsonValue>,
        F: FnMut(&JsonValue) -> Result<T, RowError>,
    {
        let mut out = Self::default();
        for (idx, value) in raw.into_iter().enumerate() {
            match parse(value) {
                Ok(row) => out.rows.push(row),
                Err(err) => {
                    debug!(source = source_id, row = idx, error = %err, "dropping row");
                    out.dropped += 1;
                }
            }
        }
        out
    }
}

/// Per-run context handed to every client call.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub archive: Option<RawArchive>,
}

impl AdapterContext {
    pub fn new(archive: Option<RawArchive>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            archive,
        }
    }

    /// Store a raw body in the archive when one is configured. Archive
    /// failures never fail the fetch.
    pub async fn archive_body(&self, dataset: &str, extension: &str, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive(self.started_at, dataset, extension, body).await {
            Ok(stored) => debug!(
                dataset,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "raw body archived"
            ),
            Err(err) => warn!(dataset, error = %err, "raw body archive failed"),
        }
    }
}

/// Query for one country's incremental pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Country name as spelled by the upstream source.
    pub country: String,
    pub start_date: NaiveDate,
}

/// A remote collection read page by page (1, 2, 3, ...) until a page comes back empty.
#[async_trait]
pub trait PagedSource: Send + Sync {
    type Row: Send;

    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        query: &PageQuery,
        page: u32,
    ) -> Result<Vec<Self::Row>, AdapterError>;
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Deserialize)]
struct BoundaryFile {
    geojson: BoundaryCollection,
}

#[derive(Debug, Deserialize)]
struct BoundaryCollection {
    #[serde(default)]
    features: Vec<BoundaryFeature>,
}

#[derive(Debug, Deserialize)]
struct BoundaryFeature {
    properties: BoundaryProperties,
}

#[derive(Debug, Deserialize)]
struct BoundaryProperties {
    name: String,
}

pub fn boundary_path(boundaries_dir: &Path, country: &str) -> PathBuf {
    boundaries_dir.join(format!("{country}.geojson"))
}

/// Admin1 names of `country` from its boundary file. A missing file is an error.
pub fn load_adm1_names(boundaries_dir: &Path, country: &str) -> Result<Vec<String>> {
    let path = boundary_path(boundaries_dir, country);
    let file: BoundaryFile = read_json_file(&path)
        .with_context(|| format!("loading admin1 boundaries for {country}"))?;
    Ok(file
        .geojson
        .features
        .into_iter()
        .map(|f| f.properties.name)
        .collect())
}

pub(crate) fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn field_text(row: &JsonValue, field: &'static str) -> Result<String, RowError> {
    row.get(field)
        .and_then(json_text)
        .ok_or(RowError::MissingField(field))
}

pub(crate) fn field_f64(row: &JsonValue, field: &'static str) -> Result<f64, RowError> {
    match row.get(field) {
        Some(JsonValue::Number(n)) => n.as_f64().ok_or(RowError::InvalidNumber {
            field,
            value: n.to_string(),
        }),
        Some(JsonValue::String(s)) => s.trim().parse().map_err(|_| RowError::InvalidNumber {
            field,
            value: s.clone(),
        }),
        _ => Err(RowError::MissingField(field)),
    }
}

pub(crate) fn field_i64(row: &JsonValue, field: &'static str) -> Result<i64, RowError> {
    match row.get(field) {
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or(RowError::InvalidNumber {
                field,
                value: n.to_string(),
            }),
        Some(JsonValue::String(s)) => s.trim().parse().map_err(|_| RowError::InvalidNumber {
            field,
            value: s.clone(),
        }),
        _ => Err(RowError::MissingField(field)),
    }
}

/// A boolean flag sent as a JSON bool, `"True"`/`"false"` or 0/1. Absent is false.
pub(crate) fn field_flag(row: &JsonValue, field: &'static str) -> bool {
    match row.get(field) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        _ => false,
    }
}

/// Parses `YYYY-MM-DD`, ignoring any time suffix (`2024-03-01T00:00:00`).
pub(crate) fn field_date(row: &JsonValue, field: &'static str) -> Result<NaiveDate, RowError> {
    let text = field_text(row, field)?;
    let day = text.get(..10).unwrap_or(text.as_str());
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| RowError::InvalidDate { field, value: text })
}

/// A list-valued field: a JSON array, a stringified list literal, or absent.
pub(crate) fn field_list(row: &JsonValue, field: &'static str) -> Result<Vec<String>, RowError> {
    match row.get(field) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items.iter().filter_map(json_text).collect()),
        Some(JsonValue::String(s)) => {
            cpaor_core::parse_list_literal(s).map_err(|source| RowError::List { field, source })
        }
        Some(other) => Ok(json_text(other).into_iter().collect()),
    }
}
