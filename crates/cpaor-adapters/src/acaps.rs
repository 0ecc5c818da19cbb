//! ACAPS protection indicators: token auth + `page`-paginated results.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use cpaor_core::{CountryAliases, ProtectionIndicatorRecord};
use cpaor_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    field_date, field_flag, field_list, field_text, json_text, AdapterContext, AdapterError, PageQuery,
    PagedSource, ParsedRows, RowError,
};

pub const SOURCE_ID: &str = "acaps_protection_indicators";
pub const DEFAULT_AUTH_URL: &str = "https://api.acaps.org/api/v1/token-auth/";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct AcapsEndpoints {
    pub auth_url: String,
    pub data_url: String,
}

impl AcapsEndpoints {
    pub fn new(data_url: impl Into<String>) -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            data_url: data_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultsPage {
    #[serde(default)]
    results: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct AcapsClient {
    http: HttpFetcher,
    data_url: String,
    token: String,
    end_date: Option<NaiveDate>,
}

impl AcapsClient {
    /// Exchanges credentials for an API token once per run.
    pub async fn authenticate(
        http: HttpFetcher,
        endpoints: &AcapsEndpoints,
        username: &str,
        password: &str,
    ) -> Result<Self, AdapterError> {
        let response: TokenResponse = http
            .post_form_json(
                &endpoints.auth_url,
                &[("username", username), ("password", password)],
                REQUEST_TIMEOUT,
            )
            .await?;
        let token = response
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AdapterError::Message("ACAPS token-auth answered without a token".into()))?;
        Ok(Self::with_token(http, endpoints.data_url.clone(), token))
    }

    pub fn with_token(http: HttpFetcher, data_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            data_url: data_url.into(),
            token: token.into(),
            end_date: None,
        }
    }

    /// Upper bound on `source_date`, used by sample runs.
    pub fn with_end_date(mut self, end_date: Option<NaiveDate>) -> Self {
        self.end_date = end_date;
        self
    }
}

#[async_trait]
impl PagedSource for AcapsClient {
    type Row = JsonValue;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        query: &PageQuery,
        page: u32,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let mut request = HttpRequest::get(self.data_url.as_str())
            .query("_internal_filter_date_gte", query.start_date.format("%Y-%m-%d"))
            .query("page", page)
            .query("country", &query.country)
            .authorization(format!("Token {}", self.token))
            .timeout(REQUEST_TIMEOUT);
        if let Some(end) = self.end_date {
            request = request.query("_internal_filter_date_lte", end.format("%Y-%m-%d"));
        }

        let response = self.http.fetch(&request).await?;
        ctx.archive_body(SOURCE_ID, "json", &response.body).await;
        let page: ResultsPage = response.json()?;
        Ok(page.results)
    }
}

/// Rows without a country or a justification are rejected and counted.
pub fn parse_protection_indicators(
    raw: &[JsonValue],
    aliases: &CountryAliases,
) -> ParsedRows<ProtectionIndicatorRecord> {
    ParsedRows::collect(SOURCE_ID, raw, |row| parse_indicator_row(row, aliases))
}

fn parse_indicator_row(
    row: &JsonValue,
    aliases: &CountryAliases,
) -> Result<ProtectionIndicatorRecord, RowError> {
    let country = field_list(row, "country")?
        .into_iter()
        .next()
        .ok_or(RowError::MissingField("country"))?;
    let justification = field_text(row, "justification")?;

    Ok(ProtectionIndicatorRecord {
        country: aliases.to_canonical(&country),
        iso3: field_list(row, "iso3")?.into_iter().next().unwrap_or_default(),
        source_date: field_date(row, "source_date")?,
        adm1_eng_name: field_list(row, "adm1_eng_name")?.into(),
        indicator: field_list(row, "indicator")?.into(),
        targeting_specific_population_groups: field_list(
            row,
            "targeting_specific_population_groups",
        )?
        .into(),
        justification,
        source_name: row.get("source_name").and_then(json_text).unwrap_or_default(),
        source_link: row.get("source_link").and_then(json_text).unwrap_or_default(),
        countrywide: field_flag(row, "countrywide"),
    })
}
