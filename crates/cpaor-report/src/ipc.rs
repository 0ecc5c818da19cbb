//! IPC acute food insecurity: people in Phase 3 or above, per region, from the
//! latest current analysis of each country.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// IPC country codes, which are not ISO3 for several countries.
pub const COUNTRY_CODES: &[(&str, &str)] = &[
    ("AFG", "Afghanistan"),
    ("BAN", "Bangladesh"),
    ("BFA", "Burkina Faso"),
    ("BDI", "Burundi"),
    ("CMR", "Cameroon"),
    ("CAR", "Central African Republic"),
    ("CHA", "Chad"),
    ("COL", "Colombia"),
    ("COD", "Congo DRC"),
    ("ECU", "Ecuador"),
    ("SLV", "El Salvador"),
    ("ETH", "Ethiopia"),
    ("GTM", "Guatemala"),
    ("HTI", "Haiti"),
    ("HON", "Honduras"),
    ("IRN", "Iran"),
    ("IRQ", "Iraq"),
    ("JOR", "Jordan"),
    ("KEN", "Kenya"),
    ("LBN", "Lebanon"),
    ("LBY", "Libya"),
    ("MAD", "Madagascar"),
    ("MWI", "Malawi"),
    ("MLI", "Mali"),
    ("MEX", "Mexico"),
    ("MOZ", "Mozambique"),
    ("MMR", "Myanmar"),
    ("NEP", "Nepal"),
    ("NIC", "Nicaragua"),
    ("NIG", "Niger"),
    ("NGA", "Nigeria"),
    ("PAK", "Pakistan"),
    ("PAL", "Palestine"),
    ("PER", "Peru"),
    ("PHI", "Philippines"),
    ("SOM", "Somalia"),
    ("SSD", "South Sudan"),
    ("SUD", "Sudan"),
    ("SYR", "Syria"),
    ("TUR", "Türkiye"),
    ("UKR", "Ukraine"),
    ("VEN", "Venezuela"),
    ("YEM", "Yemen"),
    ("ZIM", "Zimbabwe"),
];

pub const CURRENT_VALIDITY: &str = "current";
pub const PHASE_3_PLUS: &str = "3+";

/// Unknown codes pass through unchanged.
pub fn country_for_code(code: &str) -> &str {
    COUNTRY_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or(code)
}

/// One row of the IPC long-format national file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IpcRow {
    #[serde(rename = "Date of analysis")]
    pub date_of_analysis: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Level 1", default)]
    pub region: String,
    #[serde(rename = "Validity period")]
    pub validity_period: String,
    #[serde(rename = "Phase")]
    pub phase: String,
    #[serde(rename = "Number")]
    pub number: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoodInsecurityRow {
    pub country: String,
    pub region: String,
    pub analysis_date: NaiveDate,
    pub people: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionFigure {
    pub region: String,
    pub people: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryFoodInsecurity {
    pub country: String,
    /// `Mar 2024`.
    pub analysis_date: String,
    pub regions: Vec<RegionFigure>,
}

/// `Mar 2024` -> 2024-03-01.
pub fn parse_analysis_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("1 {}", raw.trim()), "%d %b %Y").ok()
}

/// Current Phase 3+ rows of the tracked countries, with canonical names.
/// Rows with an unreadable analysis date are left out.
pub fn food_insecure_population(rows: &[IpcRow], countries: &[String]) -> Vec<FoodInsecurityRow> {
    let tracked: BTreeSet<&str> = countries.iter().map(String::as_str).collect();
    rows.iter()
        .filter(|r| r.validity_period == CURRENT_VALIDITY && r.phase == PHASE_3_PLUS)
        .filter_map(|r| {
            let country = country_for_code(r.country.trim());
            if !tracked.contains(country) {
                return None;
            }
            Some(FoodInsecurityRow {
                country: country.to_string(),
                region: r.region.clone(),
                analysis_date: parse_analysis_date(&r.date_of_analysis)?,
                people: r.number.max(0.0) as u64,
            })
        })
        .collect()
}

/// Regions of the latest analysis for `country`, largest figure first.
pub fn latest_food_insecurity(
    rows: &[FoodInsecurityRow],
    country: &str,
) -> Option<CountryFoodInsecurity> {
    let latest = rows
        .iter()
        .filter(|r| r.country == country)
        .map(|r| r.analysis_date)
        .max()?;
    let mut regions: Vec<RegionFigure> = rows
        .iter()
        .filter(|r| r.country == country && r.analysis_date == latest)
        .map(|r| RegionFigure {
            region: r.region.clone(),
            people: r.people,
        })
        .collect();
    regions.sort_by(|a, b| b.people.cmp(&a.people).then_with(|| a.region.cmp(&b.region)));
    Some(CountryFoodInsecurity {
        country: country.to_string(),
        analysis_date: latest.format("%b %Y").to_string(),
        regions,
    })
}
