//! OCHA HPC plan summaries, one request per plan year.

use std::time::Duration;

use cpaor_core::{CountryAliases, PlanCaseloadRecord};
use cpaor_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{json_text, AdapterContext, AdapterError};

pub const SOURCE_ID: &str = "ocha_hpc";
pub const DEFAULT_BASE_URL: &str = "https://api.hpc.tools/v2/public/planSummary";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRACKED_PLAN_TYPES: [&str; 2] = ["Humanitarian response plan", "Flash appeal"];

const CHILD_PROTECTION_REF: &str = "PRO-CPN";
const GENERAL_PROTECTION_REF: &str = "BP1";

#[derive(Debug, Deserialize)]
struct PlanSummaryResponse {
    data: PlanSummaryData,
}

#[derive(Debug, Deserialize)]
struct PlanSummaryData {
    #[serde(rename = "planData", default)]
    plan_data: Vec<PlanEntry>,
}

#[derive(Debug, Deserialize)]
struct PlanEntry {
    #[serde(rename = "planType", default)]
    plan_type: Option<String>,
    #[serde(rename = "planYear", default)]
    plan_year: Option<JsonValue>,
    #[serde(rename = "planCountries", default)]
    plan_countries: Vec<PlanCountry>,
    #[serde(default)]
    caseloads: Vec<Caseload>,
}

#[derive(Debug, Deserialize)]
struct PlanCountry {
    country: String,
}

#[derive(Debug, Deserialize)]
struct Caseload {
    #[serde(rename = "caseloadCustomRef", default)]
    custom_ref: Option<String>,
    #[serde(rename = "inNeed", default)]
    in_need: Option<JsonValue>,
    #[serde(default)]
    target: Option<JsonValue>,
    #[serde(default)]
    reached: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct OchaHpcClient {
    http: HttpFetcher,
    base_url: String,
}

impl OchaHpcClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url
        };
        Self { http, base_url }
    }

    pub async fn fetch_year(&self, ctx: &AdapterContext, year: i32) -> Result<JsonValue, AdapterError> {
        let request = HttpRequest::get(self.base_url.as_str())
            .query("year", year)
            .query("includeIndicators", "true")
            .query("includeCaseloads", "true")
            .query("includeFinancials", "true")
            .timeout(REQUEST_TIMEOUT);
        let response = self.http.fetch(&request).await?;
        ctx.archive_body(SOURCE_ID, "json", &response.body).await;
        Ok(response.json()?)
    }
}

fn number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Caseload rows of tracked plans in one plan-summary payload. `fallback_year`
/// is used when a plan carries no parseable `planYear`.
pub fn parse_plan_summary(
    body: &JsonValue,
    fallback_year: i32,
    aliases: &CountryAliases,
) -> Result<Vec<PlanCaseloadRecord>, AdapterError> {
    let response = PlanSummaryResponse::deserialize(body)
        .map_err(|err| AdapterError::Message(format!("malformed plan summary: {err}")))?;

    let mut rows = Vec::new();
    for plan in response.data.plan_data {
        let Some(plan_type) = plan.plan_type.filter(|t| TRACKED_PLAN_TYPES.contains(&t.as_str())) else {
            continue;
        };
        let Some(country) = plan.plan_countries.first() else {
            debug!(plan_type = %plan_type, "plan without countries skipped");
            continue;
        };
        if plan.caseloads.is_empty() {
            continue;
        }

        let child_protection: Vec<&Caseload> = plan
            .caseloads
            .iter()
            .filter(|c| {
                c.custom_ref
                    .as_deref()
                    .is_some_and(|r| r.contains(CHILD_PROTECTION_REF))
            })
            .collect();
        let general_protection = plan
            .caseloads
            .iter()
            .find(|c| c.custom_ref.as_deref() == Some(GENERAL_PROTECTION_REF));

        let year = plan
            .plan_year
            .as_ref()
            .and_then(json_text)
            .and_then(|y| y.parse::<i32>().ok())
            .unwrap_or(fallback_year);

        rows.push(PlanCaseloadRecord {
            country: aliases.to_canonical(&country.country),
            year,
            plan_type,
            children_in_need: child_protection.first().and_then(|c| number(c.in_need.as_ref())),
            targeted_children: child_protection.first().and_then(|c| number(c.target.as_ref())),
            tot_pop_in_need: general_protection.and_then(|c| number(c.in_need.as_ref())),
            cp_targeted: sum_present(child_protection.iter().map(|c| number(c.target.as_ref()))),
            cp_beneficiaries: sum_present(
                child_protection.iter().map(|c| number(c.reached.as_ref())),
            ),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_json;
    use cpaor_core::DataSource;
    use cpaor_storage::HttpClientConfig;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ocha_aliases() -> CountryAliases {
        CountryAliases::new(
            DataSource::OchaHpc,
            BTreeMap::from([
                ("Congo DRC".to_string(), "Congo, The Democratic Republic of the".to_string()),
                ("Syria".to_string(), "Syrian Arab Republic".to_string()),
            ]),
        )
        .unwrap()
    }

    #[test]
    fn fixture_plans_reduce_to_caseload_rows() {
        let body = fixture_json(&["ocha_hpc", "plan_summary_2024.json"]);
        let rows = parse_plan_summary(&body, 2024, &ocha_aliases()).expect("parse");

        // regional plan filtered, plan without caseloads skipped
        assert_eq!(rows.len(), 3);

        let drc = &rows[0];
        assert_eq!(drc.country, "Congo DRC");
        assert_eq!(drc.year, 2024);
        assert_eq!(drc.plan_type, "Humanitarian response plan");
        assert_eq!(drc.children_in_need, Some(3_100_000.0));
        assert_eq!(drc.targeted_children, Some(1_200_000.0));
        assert_eq!(drc.tot_pop_in_need, Some(8_000_000.0));
        assert_eq!(drc.cp_targeted, Some(1_500_000.0));
        assert_eq!(drc.cp_beneficiaries, Some(400_000.0));

        let syria = &rows[1];
        assert_eq!(syria.country, "Syria");
        assert_eq!(syria.year, 2024);
        assert_eq!(syria.children_in_need, None);
        assert_eq!(syria.tot_pop_in_need, Some(15_300_000.0));
        assert_eq!(syria.cp_beneficiaries, None);

        let flash = &rows[2];
        assert_eq!(flash.plan_type, "Flash appeal");
        assert!(!flash.has_pin_figures());
    }

    #[test]
    fn payload_without_data_is_rejected() {
        let err = parse_plan_summary(&json!({"status": 500}), 2024, &ocha_aliases())
            .expect_err("malformed");
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[tokio::test]
    async fn year_request_includes_caseloads() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/public/planSummary")
                    .query_param("year", "2023")
                    .query_param("includeCaseloads", "true")
                    .query_param("includeIndicators", "true")
                    .query_param("includeFinancials", "true");
                then.status(200).json_body(json!({"data": {"planData": []}}));
            })
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let client = OchaHpcClient::new(http, server.url("/v2/public/planSummary"));
        let body = client
            .fetch_year(&AdapterContext::new(None), 2023)
            .await
            .expect("fetch");
        assert!(parse_plan_summary(&body, 2023, &ocha_aliases()).unwrap().is_empty());
        mock.assert_async().await;
    }
}
