//! HDX dataset pages: pick a resource from the page listing and download it.

use chrono::NaiveDate;
use cpaor_core::{format_metadata_date, LatestFileInfo};
use cpaor_storage::{HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html, Selector};

use crate::{AdapterContext, AdapterError};

pub const HDX_BASE_URL: &str = "https://data.humdata.org";

/// Resource name meaning "whatever the first listed resource is".
pub const FIRST_RESOURCE: &str = "-";

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_attr<'a>(element: ElementRef<'a>, sel: &Selector, attr: &str) -> Option<&'a str> {
    element.select(sel).next().and_then(|n| n.value().attr(attr))
}

/// `Modified: 12 March 2024` -> `12-03-2024`.
fn modified_date(text: &str) -> Result<String, AdapterError> {
    let raw = text.trim().trim_start_matches("Modified:").trim();
    let date = NaiveDate::parse_from_str(raw, "%d %B %Y")
        .map_err(|e| AdapterError::Message(format!("unparseable HDX date `{raw}`: {e}")))?;
    Ok(format_metadata_date(date))
}

fn absolute_url(href: &str) -> String {
    if href.starts_with('/') {
        format!("{HDX_BASE_URL}{href}")
    } else {
        href.to_string()
    }
}

/// Locates `file_name` (or the first resource for `"-"`) in an HDX dataset page.
pub fn parse_resource_listing(html: &str, file_name: &str) -> Result<LatestFileInfo, AdapterError> {
    let document = Html::parse_document(html);
    let item_sel = selector("li.resource-item")?;
    let title_sel = selector("a.heading")?;
    let date_sel = selector("div.update-date")?;
    let link_sel = selector("a.resource-url-analytics")?;

    let mut items = document.select(&item_sel);
    let item = if file_name == FIRST_RESOURCE {
        items.next()
    } else {
        items.find(|item| first_attr(*item, &title_sel, "title") == Some(file_name))
    }
    .ok_or_else(|| AdapterError::Message(format!("HDX resource `{file_name}` not found on page")))?;

    let date_text = first_text(item, &date_sel)
        .ok_or_else(|| AdapterError::Message(format!("HDX resource `{file_name}` has no update date")))?;
    let href = first_attr(item, &link_sel, "href")
        .ok_or_else(|| AdapterError::Message(format!("HDX resource `{file_name}` has no download link")))?;

    Ok(LatestFileInfo {
        file_time: modified_date(&date_text)?,
        download_url: absolute_url(href),
    })
}

#[derive(Debug, Clone)]
pub struct HdxClient {
    http: HttpFetcher,
}

impl HdxClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }

    /// Fetches the dataset page and resolves the tracked resource.
    pub async fn latest_file_info(
        &self,
        ctx: &AdapterContext,
        dataset: &str,
        page_url: &str,
        file_name: &str,
    ) -> Result<LatestFileInfo, AdapterError> {
        let response = self.http.fetch(&HttpRequest::get(page_url)).await?;
        ctx.archive_body(dataset, "html", &response.body).await;
        let html = String::from_utf8_lossy(&response.body);
        parse_resource_listing(&html, file_name)
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        Ok(self.http.fetch(&HttpRequest::get(url)).await?.body)
    }
}
