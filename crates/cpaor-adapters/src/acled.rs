//! ACLED events: a single unpaged (`limit=0`) request per country.

use std::time::Duration;

use chrono::NaiveDate;
use cpaor_core::{CountryAliases, RawEvent};
use cpaor_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    field_date, field_f64, field_i64, field_text, AdapterContext, AdapterError, ParsedRows,
    RowError,
};

pub const SOURCE_ID: &str = "acled";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const EVENT_FIELDS: &str =
    "year|country|admin1|event_type|event_date|latitude|longitude|fatalities";

const END_DATE: &str = "2030-01-01";

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
}

#[derive(Debug, Clone)]
pub struct AcledClient {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
    email: String,
}

impl AcledClient {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            email: email.into(),
        }
    }

    /// All events for `source_country` from `start_date` onwards. A missing or
    /// null `data` field is an empty result.
    pub async fn fetch_country(
        &self,
        ctx: &AdapterContext,
        source_country: &str,
        start_date: NaiveDate,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let request = HttpRequest::get(self.base_url.as_str())
            .query("key", &self.api_key)
            .query("email", &self.email)
            .query("country", source_country)
            .query("event_date_where", "BETWEEN")
            .query(
                "event_date",
                format!("{}|{END_DATE}", start_date.format("%Y-%m-%d")),
            )
            .query("limit", 0)
            .query("fields", EVENT_FIELDS)
            .timeout(REQUEST_TIMEOUT);

        let response = self.http.fetch(&request).await?;
        ctx.archive_body(SOURCE_ID, "json", &response.body).await;
        let body: EventsResponse = response.json()?;
        Ok(body.data.unwrap_or_default())
    }
}

pub fn parse_acled_events(raw: &[JsonValue], aliases: &CountryAliases) -> ParsedRows<RawEvent> {
    ParsedRows::collect(SOURCE_ID, raw, |row| parse_event_row(row, aliases))
}

fn parse_event_row(row: &JsonValue, aliases: &CountryAliases) -> Result<RawEvent, RowError> {
    let year = field_i64(row, "year")?;
    let year = i32::try_from(year).map_err(|_| RowError::InvalidNumber {
        field: "year",
        value: year.to_string(),
    })?;
    Ok(RawEvent {
        year,
        country: aliases.to_canonical(&field_text(row, "country")?),
        admin1: field_text(row, "admin1")?,
        event_type: field_text(row, "event_type")?,
        event_date: field_date(row, "event_date")?,
        latitude: field_f64(row, "latitude")?,
        longitude: field_f64(row, "longitude")?,
        fatalities: field_i64(row, "fatalities")?,
    })
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

    fn acled_aliases() -> CountryAliases {
        CountryAliases::new(
            DataSource::Acled,
            BTreeMap::from([
                ("Congo DRC".to_string(), "Democratic Republic of Congo".to_string()),
                ("Türkiye".to_string(), "Turkey".to_string()),
            ]),
        )
        .unwrap()
    }

    #[test]
    fn fixture_events_parse_leniently() {
        let body = fixture_json(&["acled", "events.json"]);
        let data = body["data"].as_array().expect("data array");
        let parsed = parse_acled_events(data, &acled_aliases());

        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.dropped, 1);

        let first = &parsed.rows[0];
        assert_eq!(first.country, "Congo DRC");
        assert_eq!(first.year, 2024);
        assert_eq!(first.admin1, "Nord-Kivu");
        assert_eq!(first.latitude, -1.6792);
        assert_eq!(first.fatalities, 2);

        assert_eq!(parsed.rows[2].country, "Türkiye");
        assert_eq!(parsed.rows[2].fatalities, 0);
    }

    #[tokio::test]
    async fn country_request_carries_acled_parameters() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/acled/read")
                    .query_param("key", "k")
                    .query_param("email", "me@example.org")
                    .query_param("country", "Democratic Republic of Congo")
                    .query_param("event_date_where", "BETWEEN")
                    .query_param("event_date", "2024-03-01|2030-01-01")
                    .query_param("limit", "0")
                    .query_param("fields", EVENT_FIELDS);
                then.status(200).json_body(json!({"success": true, "data": []}));
            })
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let client = AcledClient::new(http, server.url("/acled/read"), "k", "me@example.org");
        let rows = client
            .fetch_country(
                &AdapterContext::new(None),
                "Democratic Republic of Congo",
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            )
            .await
            .expect("fetch");
        assert!(rows.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn null_data_is_empty() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/acled/read");
                then.status(200).json_body(json!({"success": false, "data": null}));
            })
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let client = AcledClient::new(http, server.url("/acled/read"), "k", "e");
        let rows = client
            .fetch_country(
                &AdapterContext::new(None),
                "Mali",
                NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            )
            .await
            .expect("fetch");
        assert!(rows.is_empty());
    }
}
