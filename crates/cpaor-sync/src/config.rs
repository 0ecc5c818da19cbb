use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cpaor_adapters::AdapterError;
use cpaor_core::{CountryRegistry, DataSource};
use serde::Deserialize;

pub const DEFAULT_UPDATE_CRON: &str = "0 0 5 * * *";

/// API credentials. Each is only required by the pipeline that uses it.
#[derive(Clone, Default)]
pub struct Credentials {
    pub email: Option<String>,
    pub acaps_password: Option<String>,
    pub acled_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("acaps_password", &self.acaps_password.as_ref().map(|_| "***"))
            .field("acled_api_key", &self.acled_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, AdapterError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or(AdapterError::MissingCredential(name))
}

impl Credentials {
    pub fn email(&self) -> Result<&str, AdapterError> {
        required(&self.email, "CPAOR_EMAIL")
    }

    pub fn acaps_password(&self) -> Result<&str, AdapterError> {
        required(&self.acaps_password, "ACAPS_PASSWORD")
    }

    pub fn acled_api_key(&self) -> Result<&str, AdapterError> {
        required(&self.acled_api_key, "ACLED_API_KEY")
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_root: PathBuf,
    pub countries_file: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub archive_raw: bool,
    pub scheduler_enabled: bool,
    pub update_cron: String,
    pub credentials: Credentials,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_root: lookup("CPAOR_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            countries_file: lookup("CPAOR_COUNTRIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./countries.yaml")),
            http_timeout_secs: lookup("CPAOR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            user_agent: lookup("CPAOR_USER_AGENT").unwrap_or_else(|| "cpaor-bot/0.1".to_string()),
            archive_raw: lookup("CPAOR_ARCHIVE_RAW").is_some_and(|v| truthy(&v)),
            scheduler_enabled: lookup("CPAOR_SCHEDULER_ENABLED").is_some_and(|v| truthy(&v)),
            update_cron: lookup("CPAOR_UPDATE_CRON").unwrap_or_else(|| DEFAULT_UPDATE_CRON.to_string()),
            credentials: Credentials {
                email: lookup("CPAOR_EMAIL"),
                acaps_password: lookup("ACAPS_PASSWORD"),
                acled_api_key: lookup("ACLED_API_KEY"),
            },
        }
    }

    /// Defaults rooted at `data_root`, with no credentials.
    pub fn for_data_root(data_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::from_lookup(|_| None);
        config.data_root = data_root.into();
        config
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_root.join("datasets_metadata.json")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.data_root.join("datasources")
    }

    pub fn boundaries_dir(&self) -> PathBuf {
        self.data_root.join("polygons").join("adm1")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_root.join("raw")
    }
}

#[derive(Debug, Deserialize)]
struct CountriesFile {
    countries: Vec<String>,
    #[serde(default)]
    aliases: BTreeMap<DataSource, BTreeMap<String, String>>,
}

pub fn parse_country_registry(text: &str) -> Result<CountryRegistry> {
    let file: CountriesFile = serde_yaml::from_str(text).context("parsing countries file")?;
    Ok(CountryRegistry::new(file.countries, file.aliases)?)
}

pub fn load_country_registry(path: &Path) -> Result<CountryRegistry> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_country_registry(&text).with_context(|| format!("loading {}", path.display()))
}
