//! Aggregates over the persisted tables and a markdown summary of them.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use cpaor_core::{EventCount, PlanCaseloadRecord};
use cpaor_storage::TableStore;
use serde::Serialize;
use tracing::info;

pub mod format;
pub mod inform;
pub mod ipc;

use format::{abbreviate, add_commas, percentage};
use inform::{IndicatorValue, InformWorkbook};
use ipc::{food_insecure_population, latest_food_insecurity, FoodInsecurityRow, IpcRow};

pub const CRATE_NAME: &str = "cpaor-report";
pub const NO_DATA: &str = "No data available.";

/// Paths of the report inputs, relative to the outputs root, and the
/// tracked countries.
#[derive(Debug, Clone)]
pub struct ReportSources<'a> {
    pub plans_table: &'a str,
    pub counts_table: &'a str,
    pub ipc_table: &'a str,
    pub inform_workbook: &'a str,
    pub countries: &'a [String],
}

/// The tables a report reads. Missing files load as empty tables.
#[derive(Debug, Clone, Default)]
pub struct ReportTables {
    pub plans: Vec<PlanCaseloadRecord>,
    pub event_counts: Vec<EventCount>,
    pub food_insecurity: Vec<FoodInsecurityRow>,
    pub inform: Option<InformWorkbook>,
    pub countries: Vec<String>,
    pub dropped_rows: usize,
}

impl ReportTables {
    pub async fn load(tables: &TableStore, sources: &ReportSources<'_>) -> Result<Self> {
        let plans = tables.read::<PlanCaseloadRecord>(sources.plans_table).await?;
        let counts = tables.read::<EventCount>(sources.counts_table).await?;
        let ipc = tables.read::<IpcRow>(sources.ipc_table).await?;
        let inform = InformWorkbook::open(&tables.path(sources.inform_workbook))?;
        let food_insecurity = food_insecure_population(&ipc.rows, sources.countries);
        info!(
            plans = plans.rows.len(),
            event_counts = counts.rows.len(),
            food_insecurity = food_insecurity.len(),
            inform = inform.is_some(),
            "report tables loaded"
        );
        Ok(Self {
            plans: plans.rows,
            event_counts: counts.rows,
            food_insecurity,
            inform,
            countries: sources.countries.to_vec(),
            dropped_rows: plans.dropped + counts.dropped + ipc.dropped,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CaseloadTotal {
    pub children_in_need: u64,
    pub reporting_countries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ratio {
    pub value: f64,
    pub countries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryProportion {
    pub country: String,
    pub children_in_need: u64,
    pub proportion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearTotal {
    pub year: i32,
    pub children_in_need: f64,
    pub countries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpCoverage {
    pub year: i32,
    pub cp_beneficiaries: f64,
    pub cp_targeted: f64,
}

/// Rows of `year` carrying at least one PIN figure, ordered by country.
pub fn pin_rows_for_year(plans: &[PlanCaseloadRecord], year: i32) -> Vec<&PlanCaseloadRecord> {
    let mut rows: Vec<_> = plans
        .iter()
        .filter(|p| p.year == year && p.has_pin_figures())
        .collect();
    rows.sort_by(|a, b| a.country.cmp(&b.country));
    rows
}

pub fn total_children_in_need(rows: &[&PlanCaseloadRecord]) -> CaseloadTotal {
    let reported: Vec<f64> = rows.iter().filter_map(|r| r.children_in_need).collect();
    CaseloadTotal {
        children_in_need: reported.iter().sum::<f64>() as u64,
        reporting_countries: reported.len(),
    }
}

fn ratio_over_pairs(pairs: impl Iterator<Item = (f64, f64)>) -> Ratio {
    let (mut numerator, mut denominator, mut countries) = (0.0, 0.0, 0);
    for (num, den) in pairs {
        numerator += num;
        denominator += den;
        countries += 1;
    }
    let value = if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    };
    Ratio { value, countries }
}

/// Children in need over total population in need, for rows with both.
pub fn children_to_population_ratio(rows: &[&PlanCaseloadRecord]) -> Ratio {
    ratio_over_pairs(
        rows.iter()
            .filter_map(|r| Some((r.children_in_need?, r.tot_pop_in_need?))),
    )
}

/// Targeted children over children in need, for rows with both.
pub fn targeted_to_in_need_ratio(rows: &[&PlanCaseloadRecord]) -> Ratio {
    ratio_over_pairs(
        rows.iter()
            .filter_map(|r| Some((r.targeted_children?, r.children_in_need?))),
    )
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Countries of `year` ranked by children in need as a share of the total
/// population in need. The first row per country counts; rows without a
/// positive population figure are ignored.
pub fn top_countries_by_proportion(
    plans: &[PlanCaseloadRecord],
    year: i32,
    top: usize,
) -> Vec<CountryProportion> {
    let mut seen = BTreeSet::new();
    let mut ranked: Vec<CountryProportion> = plans
        .iter()
        .filter(|p| p.year == year)
        .filter_map(|p| {
            let children = p.children_in_need?;
            let population = p.tot_pop_in_need.filter(|v| *v > 0.0)?;
            seen.insert(p.country.as_str()).then(|| CountryProportion {
                country: p.country.clone(),
                children_in_need: children as u64,
                proportion: round2(children / population),
            })
        })
        .collect();
    ranked.sort_by(|a, b| b.proportion.total_cmp(&a.proportion));
    ranked.truncate(top);
    ranked
}

/// Children in need summed per year up to `up_to_year`, with the number of
/// contributing rows.
pub fn yearly_evolution(plans: &[PlanCaseloadRecord], up_to_year: i32) -> Vec<YearTotal> {
    let mut by_year: BTreeMap<i32, (f64, usize)> = BTreeMap::new();
    for plan in plans.iter().filter(|p| p.year <= up_to_year) {
        if let Some(children) = plan.children_in_need {
            let entry = by_year.entry(plan.year).or_default();
            entry.0 += children;
            entry.1 += 1;
        }
    }
    by_year
        .into_iter()
        .map(|(year, (children_in_need, countries))| YearTotal {
            year,
            children_in_need,
            countries,
        })
        .collect()
}

/// CP beneficiaries and targeted figures for one country, summed per year.
pub fn cp_coverage(plans: &[PlanCaseloadRecord], country: &str, up_to_year: i32) -> Vec<CpCoverage> {
    let mut by_year: BTreeMap<i32, (f64, f64)> = BTreeMap::new();
    for plan in plans
        .iter()
        .filter(|p| p.country == country && p.year <= up_to_year)
    {
        let entry = by_year.entry(plan.year).or_default();
        entry.0 += plan.cp_beneficiaries.unwrap_or(0.0);
        entry.1 += plan.cp_targeted.unwrap_or(0.0);
    }
    by_year
        .into_iter()
        .map(|(year, (cp_beneficiaries, cp_targeted))| CpCoverage {
            year,
            cp_beneficiaries,
            cp_targeted,
        })
        .collect()
}

pub fn events_per_year(counts: &[EventCount], country: &str) -> Vec<(i32, u64)> {
    let mut rows: Vec<(i32, u64)> = counts
        .iter()
        .filter(|c| c.country == country)
        .map(|c| (c.year, c.number_of_events))
        .collect();
    rows.sort_unstable();
    rows
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub year: i32,
    pub country: Option<String>,
    pub top: usize,
}

fn millions(value: f64) -> String {
    format!("{:.2} million", value / 1_000_000.0)
}

/// `4.0` -> `4`, `45.12` -> `45.12`.
fn score(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn push_indicators(lines: &mut Vec<String>, values: &[IndicatorValue], suffix: &str) {
    if values.is_empty() {
        lines.push(NO_DATA.to_string());
    }
    for v in values {
        lines.push(format!("- {}: {}{suffix}", v.indicator, score(v.value)));
    }
}

pub fn render_markdown(tables: &ReportTables, options: &ReportOptions) -> String {
    let year = options.year;
    let mut lines = vec![format!("# Child Protection Overview {year}"), String::new()];

    lines.push("## Caseload".to_string());
    let rows = pin_rows_for_year(&tables.plans, year);
    if rows.is_empty() {
        lines.push(NO_DATA.to_string());
    } else {
        let total = total_children_in_need(&rows);
        let share = children_to_population_ratio(&rows);
        let targeted = targeted_to_in_need_ratio(&rows);
        lines.push(format!(
            "- children in need: {} ({} countries)",
            add_commas(total.children_in_need),
            total.reporting_countries
        ));
        lines.push(format!(
            "- children among people in need: {} ({} countries)",
            percentage(share.value),
            share.countries
        ));
        lines.push(format!(
            "- children targeted among children in need: {} ({} countries)",
            percentage(targeted.value),
            targeted.countries
        ));
    }
    lines.push(String::new());

    lines.push("## Highest proportion of children in need".to_string());
    let top = top_countries_by_proportion(&tables.plans, year, options.top);
    if top.is_empty() {
        lines.push(NO_DATA.to_string());
    } else {
        for row in &top {
            lines.push(format!(
                "- {}: {} ({})",
                row.country,
                percentage(row.proportion),
                abbreviate(row.children_in_need as f64)
            ));
        }
    }
    lines.push(String::new());

    lines.push("## Evolution of children in need".to_string());
    let evolution = yearly_evolution(&tables.plans, year);
    if evolution.is_empty() {
        lines.push(NO_DATA.to_string());
    } else {
        for row in &evolution {
            lines.push(format!(
                "- {}: {} ({} countries)",
                row.year,
                abbreviate(row.children_in_need),
                row.countries
            ));
        }
    }
    lines.push(String::new());

    lines.push("## INFORM severity".to_string());
    let overview = tables
        .inform
        .as_ref()
        .and_then(|w| w.severity_overview(&tables.countries))
        .filter(|o| !o.countries.is_empty());
    match overview {
        None => lines.push(NO_DATA.to_string()),
        Some(overview) => {
            if let Some(updated) = &overview.last_updated {
                lines.push(format!("Last updated: {updated}"));
            }
            for row in &overview.countries {
                let mut line = format!(
                    "- {}: {}",
                    row.country,
                    row.category.as_deref().unwrap_or("unknown")
                );
                if let Some(trend) = &row.trend {
                    line.push_str(&format!(", trend {trend}"));
                }
                if let Some(drivers) = &row.drivers {
                    line.push_str(&format!(", drivers: {drivers}"));
                }
                lines.push(line);
            }
        }
    }

    if let Some(country) = options.country.as_deref() {
        lines.push(String::new());
        lines.push(format!("## {country}"));
        lines.push(String::new());
        lines.push("### CP beneficiaries vs CP targeted".to_string());
        let coverage = cp_coverage(&tables.plans, country, year);
        if coverage.is_empty() {
            lines.push(NO_DATA.to_string());
        } else {
            for row in &coverage {
                lines.push(format!(
                    "- {}: {} beneficiaries / {} targeted",
                    row.year,
                    millions(row.cp_beneficiaries),
                    millions(row.cp_targeted)
                ));
            }
        }
        lines.push(String::new());
        lines.push("### Events targeting civilians".to_string());
        let events = events_per_year(&tables.event_counts, country);
        if events.is_empty() {
            lines.push(NO_DATA.to_string());
        } else {
            for (year, count) in events {
                lines.push(format!("- {year}: {}", add_commas(count)));
            }
        }
        lines.push(String::new());
        lines.push("### Food insecurity (IPC Phase 3+)".to_string());
        match latest_food_insecurity(&tables.food_insecurity, country) {
            None => lines.push(NO_DATA.to_string()),
            Some(latest) => {
                lines.push(format!("Analysis: {}", latest.analysis_date));
                for region in &latest.regions {
                    lines.push(format!(
                        "- {}: {}",
                        region.region,
                        abbreviate(region.people as f64)
                    ));
                }
            }
        }

        let workbook = tables.inform.clone().unwrap_or_default();
        lines.push(String::new());
        lines.push("### Crisis drivers".to_string());
        let crises = workbook.crises(country);
        if crises.is_empty() {
            lines.push(NO_DATA.to_string());
        }
        for crisis in &crises {
            lines.push(format!("- {crisis}"));
        }
        lines.push(String::new());
        lines.push("### Physical environment".to_string());
        push_indicators(&mut lines, &workbook.physical_environment(country), "");
        lines.push(String::new());
        lines.push("### Impact of the crisis".to_string());
        push_indicators(&mut lines, &workbook.impact_of_the_crisis(country), "%");
        lines.push(String::new());
        lines.push("### Barriers to accessing goods and services".to_string());
        push_indicators(&mut lines, &workbook.access_barriers(country), "");
    }

    lines.push(String::new());
    lines.join("\n")
}
