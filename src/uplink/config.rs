//! Typed TOML configuration.
//!
//! The config is built exactly once at startup: read the file, expand
//! `${VAR}` environment references, apply any `--set key=value` overrides to
//! the parsed tree, then deserialize into the typed structs below (serde
//! defaults supply everything the user leaves out). After that the config is
//! shared immutably behind an `Arc` and never touched again.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("invalid override `{0}` (expected key=value)")]
    BadOverride(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Namespace segment used in data URLs and schema definition names.
    pub namespace: String,
    /// Optional school-year URL suffix for year-scoped deployments.
    pub year: Option<u32>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost/api".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            namespace: "ed-fi".to_string(),
            year: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on in-flight requests per resource.
    pub pool_size: usize,
    pub timeout_secs: u64,
    /// Attempts for the transparent backoff wrapper (transient faults only).
    pub num_retries: usize,
    pub backoff_factor: f64,
    /// Statuses the backoff wrapper retries. 401 is handled separately by
    /// the token-refresh loop and must not appear here.
    pub retry_statuses: Vec<u16>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            timeout_secs: 60,
            num_retries: 10,
            backoff_factor: 1.5,
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Cumulative terminal-failure count that aborts the run. 0 = unlimited.
    pub max_failures: usize,
    /// Skips the interactive confirmation for delete/truncate.
    pub force_delete: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_failures: 0,
            force_delete: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub page_size: usize,
    pub follow_references: bool,
    pub max_reference_depth: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            follow_references: false,
            max_reference_depth: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ValidateConfig {
    /// Checks to run, in order. Recognized: json, schema, descriptors,
    /// uniqueness, references.
    pub checks: Vec<String>,
    pub max_failures: usize,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            checks: vec![
                "json".to_string(),
                "schema".to_string(),
                "descriptors".to_string(),
                "uniqueness".to_string(),
                "references".to_string(),
            ],
            max_failures: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CountConfig {
    pub separator: String,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            separator: "\t".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Empty string means terminal-only logging.
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub api: ApiConfig,
    pub connection: ConnectionConfig,
    pub run: RunConfig,
    pub fetch: FetchConfig,
    pub validate: ValidateConfig,
    pub count: CountConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./"),
            state_dir: default_state_dir(),
            api: ApiConfig::default(),
            connection: ConnectionConfig::default(),
            run: RunConfig::default(),
            fetch: FetchConfig::default(),
            validate: ValidateConfig::default(),
            count: CountConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".uplink"),
        None => PathBuf::from(".uplink"),
    }
}

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Replaces `${VAR}` references with environment values. Unset variables are
/// left as-is so the later parse error points at the real problem.
fn expand_env_refs(raw: &str) -> String {
    ENV_REF
        .replace_all(raw, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Applies one `key=value` override to the parsed TOML tree, creating
/// intermediate tables as needed. The value is parsed as TOML when possible
/// (numbers, booleans, arrays) and falls back to a plain string.
fn apply_override(root: &mut toml::Value, spec: &str) -> ConfigResult<()> {
    let (key, value) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::BadOverride(spec.to_string()))?;
    let parsed: toml::Value = match value.parse::<toml::Value>() {
        Ok(v) => v,
        Err(_) => toml::Value::String(value.to_string()),
    };

    let mut current = root;
    let segments: Vec<&str> = key.split('.').collect();
    for segment in &segments[..segments.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::BadOverride(spec.to_string()))?;
        current = table
            .entry((*segment).to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::BadOverride(spec.to_string()))?;
    table.insert(segments[segments.len() - 1].to_string(), parsed);
    Ok(())
}

impl AppConfig {
    /// Loads the config file, expands environment references, applies CLI
    /// overrides, and deserializes with defaults filled in.
    pub fn load(path: &Path, overrides: &[String]) -> ConfigResult<Self> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw, overrides)
    }

    pub fn parse(raw: &str, overrides: &[String]) -> ConfigResult<Self> {
        let expanded = expand_env_refs(raw);
        let mut tree: toml::Value = expanded.parse()?;
        for spec in overrides {
            apply_override(&mut tree, spec)?;
        }
        let config: AppConfig = tree.try_into()?;
        Ok(config)
    }
}
