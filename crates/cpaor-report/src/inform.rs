//! ACAPS INFORM Severity workbook: country overview and per-country crisis
//! indicators.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::info;

pub const COUNTRY_SHEET: SheetLayout = SheetLayout::new("INFORM Severity - country", 1, 2);
pub const ALL_CRISES_SHEET: SheetLayout = SheetLayout::new("INFORM Severity - all crises", 1, 2);
pub const IMPACT_SHEET: SheetLayout = SheetLayout::new("Impact of the crisis", 1, 3);
pub const COMPLEXITY_SHEET: SheetLayout = SheetLayout::new("Complexity of the crisis", 1, 3);

/// Names of the leading columns that crisis sheets leave without a header.
const CRISIS_ID_COLUMNS: [&str; 5] = ["CRISIS", "DRIVERS", "CRISIS ID", "COUNTRY", "Iso3"];

const SEVERITY_CATEGORY: &str = "INFORM Severity category.1";
const DRIVERS: &str = "DRIVERS";
const TREND: &str = "Trend (last 3 months)";
const LAST_UPDATED: &str = "Last updated";

const MAIN_INDICATORS: [&str; 3] = [
    "Impact of the crisis",
    "Conditions of people affected",
    "Complexity of the crisis",
];
const COMPLEXITY_INDICATORS: [&str; 2] = ["Safety and security", "Humanitarian access"];
const IMPACT_SHARES: [&str; 4] = [
    "% of total area affected",
    "% of total population living in the affected area",
    "% of total population displaced on the total population affected",
    "% of fatalities on the total population affected",
];
const ACCESS_BARRIERS: [&str; 5] = [
    "Ongoing insecurity/hostilities affecting humanitarian assistance",
    "Physical constraints in the environment (obstacles related to terrain, climate, lack of infrastructure, etc.)",
    "Violence against personnel, facilities and assets",
    "Denial of existence of humanitarian needs or entitlements to assistance",
    "Presence of mines and improvised explosive devices",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl Cell {
    pub fn text(value: &str) -> Self {
        Cell::Text(value.to_string())
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Cell::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Cell::Number(n) => Some(n.to_string()),
            Cell::Date(d) => Some(d.format("%d-%m-%Y").to_string()),
            Cell::Empty => None,
        }
    }

    /// `x` marks a non-applicable score and counts as 0.
    fn as_score(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) if s.trim().eq_ignore_ascii_case("x") => Some(0.0),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            Cell::Text(s) => {
                let s = s.trim();
                let day = s.get(..10).unwrap_or(s);
                ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
            }
            _ => None,
        }
    }
}

/// Excel serial day number (1900 date system).
fn excel_serial_date(serial: f64) -> Option<NaiveDate> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(serial.floor() as i64))
}

fn cell_from(data: &Data) -> Cell {
    match data {
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::String(s) | Data::DateTimeIso(s) => Cell::Text(s.clone()),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64()).map_or(Cell::Empty, Cell::Date),
        _ => Cell::Empty,
    }
}

pub type SheetRows = Vec<Vec<Cell>>;

/// Where a sheet's header sits and how many rows after it are not data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetLayout {
    pub name: &'static str,
    pub header_row: usize,
    pub skip_rows: usize,
}

impl SheetLayout {
    pub const fn new(name: &'static str, header_row: usize, skip_rows: usize) -> Self {
        Self {
            name,
            header_row,
            skip_rows,
        }
    }
}

fn canonical_country(raw: &str) -> String {
    match raw.trim() {
        "DRC" => "Congo DRC".to_string(),
        "CAR" => "Central African Republic".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
struct SheetTable {
    columns: BTreeMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl SheetTable {
    fn from_rows(rows: &[Vec<Cell>], layout: SheetLayout) -> Option<Self> {
        let header = rows.get(layout.header_row)?;
        let mut columns = BTreeMap::new();
        for (i, cell) in header.iter().enumerate() {
            let name = match cell.as_text() {
                Some(name) => name,
                None => match CRISIS_ID_COLUMNS.get(i) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
            };
            let mut unique = name.clone();
            let mut n = 1;
            while columns.contains_key(&unique) {
                unique = format!("{name}.{n}");
                n += 1;
            }
            columns.insert(unique, i);
        }
        let data = rows
            .iter()
            .skip(layout.header_row + 1 + layout.skip_rows)
            .cloned()
            .collect();
        Some(Self {
            columns,
            rows: data,
        })
    }

    fn get<'a>(&self, row: &'a [Cell], column: &str) -> Option<&'a Cell> {
        row.get(*self.columns.get(column)?)
    }

    fn country_rows(&self, country: &str) -> Vec<&Vec<Cell>> {
        self.rows
            .iter()
            .filter(|row| {
                self.get(row, "COUNTRY")
                    .and_then(Cell::as_text)
                    .is_some_and(|c| canonical_country(&c) == country)
            })
            .collect()
    }

    /// Per column, the highest score over `rows`. Columns without any score are left out.
    fn max_scores(&self, rows: &[&Vec<Cell>], columns: &[&str]) -> Vec<IndicatorValue> {
        columns
            .iter()
            .filter_map(|column| {
                let value = rows
                    .iter()
                    .filter_map(|row| self.get(row, column).and_then(Cell::as_score))
                    .reduce(f64::max)?;
                Some(IndicatorValue {
                    indicator: column.to_string(),
                    value,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorValue {
    pub indicator: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountrySeverity {
    pub country: String,
    pub category: Option<String>,
    pub drivers: Option<String>,
    pub trend: Option<String>,
    pub last_updated: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeverityOverview {
    /// Latest update over the tracked countries, `mm-yyyy`.
    pub last_updated: Option<String>,
    pub countries: Vec<CountrySeverity>,
}

#[derive(Debug, Clone, Default)]
pub struct InformWorkbook {
    sheets: BTreeMap<String, SheetRows>,
}

impl InformWorkbook {
    pub fn from_sheets(sheets: impl IntoIterator<Item = (String, SheetRows)>) -> Self {
        Self {
            sheets: sheets.into_iter().collect(),
        }
    }

    /// Reads every sheet of the workbook at `path`. A missing file is `None`.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut workbook = open_workbook_auto(path)
            .with_context(|| format!("opening workbook {}", path.display()))?;
        let mut sheets = BTreeMap::new();
        for name in workbook.sheet_names() {
            let range = workbook
                .worksheet_range(&name)
                .with_context(|| format!("reading sheet `{name}` of {}", path.display()))?;
            // Ranges start at the first used cell; pad back to absolute positions.
            let (row0, col0) = range.start().unwrap_or((0, 0));
            let mut rows: SheetRows = (0..row0).map(|_| Vec::new()).collect();
            for row in range.rows() {
                let mut cells: Vec<Cell> = (0..col0).map(|_| Cell::Empty).collect();
                cells.extend(row.iter().map(cell_from));
                rows.push(cells);
            }
            sheets.insert(name, rows);
        }
        info!(path = %path.display(), sheets = sheets.len(), "INFORM workbook loaded");
        Ok(Some(Self { sheets }))
    }

    fn table(&self, layout: SheetLayout) -> Option<SheetTable> {
        SheetTable::from_rows(self.sheets.get(layout.name)?, layout)
    }

    /// Severity category, drivers and trend of the tracked countries, in
    /// sheet order. `None` when the country sheet is missing.
    pub fn severity_overview(&self, countries: &[String]) -> Option<SeverityOverview> {
        let table = self.table(COUNTRY_SHEET)?;
        let tracked: BTreeSet<&str> = countries.iter().map(String::as_str).collect();
        let rows: Vec<CountrySeverity> = table
            .rows
            .iter()
            .filter_map(|row| {
                let country = canonical_country(&table.get(row, "COUNTRY")?.as_text()?);
                tracked.contains(country.as_str()).then(|| CountrySeverity {
                    category: table.get(row, SEVERITY_CATEGORY).and_then(Cell::as_text),
                    drivers: table.get(row, DRIVERS).and_then(Cell::as_text),
                    trend: table.get(row, TREND).and_then(Cell::as_text),
                    last_updated: table.get(row, LAST_UPDATED).and_then(Cell::as_date),
                    country,
                })
            })
            .collect();
        let last_updated = rows
            .iter()
            .filter_map(|r| r.last_updated)
            .max()
            .map(|d| d.format("%m-%Y").to_string());
        Some(SeverityOverview {
            last_updated,
            countries: rows,
        })
    }

    /// Crisis scores of the physical environment, highest over the
    /// country's crises. Empty when the country has no crisis.
    pub fn physical_environment(&self, country: &str) -> Vec<IndicatorValue> {
        let Some(main) = self.table(ALL_CRISES_SHEET) else {
            return Vec::new();
        };
        let rows = main.country_rows(country);
        if rows.is_empty() {
            return Vec::new();
        }
        let mut values = main.max_scores(&rows, &MAIN_INDICATORS);
        if let Some(complexity) = self.table(COMPLEXITY_SHEET) {
            let rows = complexity.country_rows(country);
            values.extend(complexity.max_scores(&rows, &COMPLEXITY_INDICATORS));
        }
        values
    }

    /// Impact shares as percentages rounded to 2 decimals, capped at 100.
    pub fn impact_of_the_crisis(&self, country: &str) -> Vec<IndicatorValue> {
        let Some(table) = self.table(IMPACT_SHEET) else {
            return Vec::new();
        };
        let rows = table.country_rows(country);
        table
            .max_scores(&rows, &IMPACT_SHARES)
            .into_iter()
            .map(|mut v| {
                v.value = ((v.value * 10_000.0).round() / 100.0).min(100.0);
                v
            })
            .collect()
    }

    pub fn access_barriers(&self, country: &str) -> Vec<IndicatorValue> {
        let Some(table) = self.table(COMPLEXITY_SHEET) else {
            return Vec::new();
        };
        let rows = table.country_rows(country);
        table.max_scores(&rows, &ACCESS_BARRIERS)
    }

    /// Distinct crises of `country`, in sheet order.
    pub fn crises(&self, country: &str) -> Vec<String> {
        let Some(table) = self.table(IMPACT_SHEET) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        table
            .country_rows(country)
            .into_iter()
            .filter_map(|row| table.get(row, "CRISIS").and_then(Cell::as_text))
            .filter(|crisis| seen.insert(crisis.clone()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    fn t(value: &str) -> Cell {
        if value.is_empty() {
            Cell::Empty
        } else {
            Cell::text(value)
        }
    }

    fn n(value: f64) -> Cell {
        Cell::Number(value)
    }

    /// Title row, header row, then `skip` filler rows before the data.
    fn sheet(header: Vec<Cell>, skip: usize, data: Vec<Vec<Cell>>) -> SheetRows {
        let mut rows = vec![vec![t("title")], header];
        rows.extend((0..skip).map(|_| vec![t("")]));
        rows.extend(data);
        rows
    }

    fn crisis_header(columns: &[&str]) -> Vec<Cell> {
        let mut header: Vec<Cell> = (0..5).map(|_| Cell::Empty).collect();
        header.extend(columns.iter().map(|c| t(c)));
        header
    }

    fn crisis_row(crisis: &str, country: &str, values: Vec<Cell>) -> Vec<Cell> {
        let mut row = vec![t(crisis), t("Conflict"), t("ID"), t(country), t("")];
        row.extend(values);
        row
    }

    pub fn workbook() -> InformWorkbook {
        let country = sheet(
            vec![
                t("COUNTRY"),
                t("INFORM Severity Index"),
                t("INFORM Severity category"),
                t("INFORM Severity category"),
                t("DRIVERS"),
                t("Trend (last 3 months) "),
                t(" Last updated"),
            ],
            2,
            vec![
                vec![
                    t("Sudan"),
                    n(4.8),
                    n(5.0),
                    t("Very High"),
                    t("Conflict, Displacement"),
                    t("Increasing"),
                    Cell::Date(NaiveDate::from_ymd_opt(2024, 5, 28).unwrap()),
                ],
                vec![
                    t("DRC"),
                    n(4.2),
                    n(5.0),
                    t("Very High"),
                    t("Conflict"),
                    t("Stable"),
                    t("2024-04-30"),
                ],
                vec![t("Peru"), n(2.0), n(2.0), t("Low"), t(""), t(""), t("2024-06-01")],
            ],
        );
        let all_crises = sheet(
            crisis_header(&MAIN_INDICATORS),
            2,
            vec![
                crisis_row("Sudan conflict", "Sudan", vec![n(4.5), n(4.0), n(3.9)]),
                crisis_row("Sudan floods", "Sudan", vec![n(3.0), t("x"), n(4.4)]),
            ],
        );
        let impact = sheet(
            crisis_header(&IMPACT_SHARES),
            3,
            vec![
                crisis_row("Sudan conflict", "Sudan", vec![n(0.4512), n(0.2), n(1.3), t("x")]),
                crisis_row("Sudan floods", "Sudan", vec![n(0.1), n(0.3), n(0.05), t("x")]),
                crisis_row("Sudan conflict", "Sudan", vec![t(""), t(""), t(""), t("")]),
            ],
        );
        let mut complexity_columns: Vec<&str> = COMPLEXITY_INDICATORS.to_vec();
        complexity_columns.extend(ACCESS_BARRIERS);
        let complexity = sheet(
            crisis_header(&complexity_columns),
            3,
            vec![crisis_row(
                "Sudan conflict",
                "Sudan",
                vec![n(5.0), n(4.0), n(3.0), n(2.0), n(5.0), n(1.0), t("x")],
            )],
        );
        InformWorkbook::from_sheets([
            (COUNTRY_SHEET.name.to_string(), country),
            (ALL_CRISES_SHEET.name.to_string(), all_crises),
            (IMPACT_SHEET.name.to_string(), impact),
            (COMPLEXITY_SHEET.name.to_string(), complexity),
        ])
    }
}
