//! APM configuration
//!
//! Settings can come from TOML or YAML files, from `APM_*` environment
//! variables, or from the builder. Every field has a default, so a partial
//! document is valid input.
//!
//! Connection and export settings (`server_url`, `secret_token`, `api_key`,
//! `service_version`, `flush_interval`, `capture_body`,
//! `capture_sql_statements`) are validated and carried for a network
//! exporter. The in-memory sink does not read them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::DEFAULT_TRANSACTION_TYPE;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),
}

/// Agent log verbosity. Parsed case-insensitively from files and the
/// environment alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    #[default]
    Warning,
    Error,
    Critical,
    None,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Information => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::None => "off",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "information" | "info" => Ok(LogLevel::Information),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(ConfigError::Parse(format!("unknown log level '{other}'"))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, <LogLevel as TryFrom<String>>::Error> {
        value.parse()
    }
}

fn default_sanitize_fields() -> Vec<String> {
    [
        "password",
        "passwd",
        "pwd",
        "secret",
        "key",
        "token",
        "authorization",
        "cookie",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// APM agent and facade configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApmConfig {
    /// Service name reported with every transaction
    pub service_name: String,

    pub service_version: String,

    pub environment: String,

    /// APM server endpoint
    pub server_url: String,

    pub secret_token: String,

    pub api_key: String,

    /// Fraction of root transactions marked sampled (0.0 to 1.0)
    pub transaction_sample_rate: f64,

    /// Maximum spans recorded per transaction
    pub transaction_max_spans: usize,

    /// Transactions the in-memory sink keeps before evicting ended ones
    pub max_retained_transactions: usize,

    pub capture_headers: bool,

    pub capture_body: bool,

    /// Flush interval in seconds
    pub flush_interval: u64,

    pub log_level: LogLevel,

    pub enable_logging: bool,

    /// Labels applied to every transaction
    pub global_labels: HashMap<String, String>,

    /// Request paths that are never instrumented. A trailing `*` matches by prefix.
    pub ignore_urls: Vec<String>,

    pub capture_sql_statements: bool,

    /// Redact header values whose names contain a `sanitize_fields` entry
    pub sanitize_field_names: bool,

    pub sanitize_fields: Vec<String>,

    /// Type used when a facade operation receives a blank type
    pub default_transaction_type: String,

    /// Clear the facade's current transaction when it is ended
    pub clear_on_end: bool,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_version: "1.0.0".to_string(),
            environment: "development".to_string(),
            server_url: String::new(),
            secret_token: String::new(),
            api_key: String::new(),
            transaction_sample_rate: 1.0,
            transaction_max_spans: 500,
            max_retained_transactions: 1000,
            capture_headers: true,
            capture_body: false,
            flush_interval: 10,
            log_level: LogLevel::Warning,
            enable_logging: true,
            global_labels: HashMap::new(),
            ignore_urls: Vec::new(),
            capture_sql_statements: true,
            sanitize_field_names: true,
            sanitize_fields: default_sanitize_fields(),
            default_transaction_type: DEFAULT_TRANSACTION_TYPE.to_string(),
            clear_on_end: false,
        }
    }
}

impl ApmConfig {
    /// Create a new config builder
    pub fn builder() -> ApmConfigBuilder {
        ApmConfigBuilder::new()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a `.toml`, `.yaml`, or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let content = std::fs::read_to_string(path)?;
        match extension.as_str() {
            "toml" => Self::from_toml_str(&content),
            "yaml" | "yml" => Self::from_yaml_str(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("APM_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: std::env::var("APM_SERVICE_VERSION")
                .unwrap_or(defaults.service_version),
            environment: std::env::var("APM_ENVIRONMENT").unwrap_or(defaults.environment),
            server_url: std::env::var("APM_SERVER_URL").unwrap_or(defaults.server_url),
            secret_token: std::env::var("APM_SECRET_TOKEN").unwrap_or(defaults.secret_token),
            api_key: std::env::var("APM_API_KEY").unwrap_or(defaults.api_key),
            transaction_sample_rate: std::env::var("APM_TRANSACTION_SAMPLE_RATE")
                .map(|v| v.parse().unwrap_or(1.0))
                .unwrap_or(1.0),
            transaction_max_spans: std::env::var("APM_TRANSACTION_MAX_SPANS")
                .map(|v| v.parse().unwrap_or(500))
                .unwrap_or(500),
            max_retained_transactions: std::env::var("APM_MAX_RETAINED_TRANSACTIONS")
                .map(|v| v.parse().unwrap_or(1000))
                .unwrap_or(1000),
            capture_headers: std::env::var("APM_CAPTURE_HEADERS")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            capture_body: std::env::var("APM_CAPTURE_BODY")
                .map(|v| v.parse().unwrap_or(false))
                .unwrap_or(false),
            flush_interval: std::env::var("APM_FLUSH_INTERVAL")
                .map(|v| v.parse().unwrap_or(10))
                .unwrap_or(10),
            log_level: std::env::var("APM_LOG_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            enable_logging: std::env::var("APM_ENABLE_LOGGING")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            global_labels: std::env::var("APM_GLOBAL_LABELS")
                .map(|v| parse_pairs(&v))
                .unwrap_or_default(),
            ignore_urls: std::env::var("APM_IGNORE_URLS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            capture_sql_statements: std::env::var("APM_CAPTURE_SQL_STATEMENTS")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            sanitize_field_names: std::env::var("APM_SANITIZE_FIELD_NAMES")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            sanitize_fields: std::env::var("APM_SANITIZE_FIELDS")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.sanitize_fields),
            default_transaction_type: std::env::var("APM_DEFAULT_TRANSACTION_TYPE")
                .unwrap_or(defaults.default_transaction_type),
            clear_on_end: std::env::var("APM_CLEAR_ON_END")
                .map(|v| v.parse().unwrap_or(false))
                .unwrap_or(false),
        }
    }

    /// Check every field and report all violations at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.service_name.trim().is_empty() {
            issues.push("service_name is required".to_string());
        }
        if !(0.0..=1.0).contains(&self.transaction_sample_rate) {
            issues.push(format!(
                "transaction_sample_rate must be between 0.0 and 1.0, got {}",
                self.transaction_sample_rate
            ));
        }
        if self.transaction_max_spans < 1 {
            issues.push("transaction_max_spans must be at least 1".to_string());
        }
        if self.max_retained_transactions < 1 {
            issues.push("max_retained_transactions must be at least 1".to_string());
        }
        if !(1..=300).contains(&self.flush_interval) {
            issues.push(format!(
                "flush_interval must be between 1 and 300 seconds, got {}",
                self.flush_interval
            ));
        }
        if !self.server_url.is_empty()
            && !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://"))
        {
            issues.push(format!("server_url must be an http(s) URL, got '{}'", self.server_url));
        }
        if self.global_labels.keys().any(|k| k.trim().is_empty()) {
            issues.push("global_labels must not contain blank keys".to_string());
        }

        if self.server_url.is_empty() && self.secret_token.is_empty() && self.api_key.is_empty() {
            tracing::warn!(
                service = %self.service_name,
                "No APM server URL, secret token, or API key configured; telemetry stays local"
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Whether `path` matches one of the `ignore_urls` patterns
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore_urls.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == pattern,
        })
    }

    /// Whether a header or field name should have its value redacted
    pub fn is_sensitive(&self, name: &str) -> bool {
        if !self.sanitize_field_names {
            return false;
        }
        let name = name.to_ascii_lowercase();
        self.sanitize_fields
            .iter()
            .any(|field| name.contains(&field.to_ascii_lowercase()))
    }
}

/// `a,b , c` -> `["a", "b", "c"]`
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `team=core,region=eu` -> `{team: core, region: eu}`
fn parse_pairs(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Builder for ApmConfig
#[derive(Debug, Default)]
pub struct ApmConfigBuilder {
    config: ApmConfig,
}

impl ApmConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.config.service_version = version.into();
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = environment.into();
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn secret_token(mut self, token: impl Into<String>) -> Self {
        self.config.secret_token = token.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn transaction_sample_rate(mut self, rate: f64) -> Self {
        self.config.transaction_sample_rate = rate;
        self
    }

    pub fn transaction_max_spans(mut self, max: usize) -> Self {
        self.config.transaction_max_spans = max;
        self
    }

    pub fn max_retained_transactions(mut self, max: usize) -> Self {
        self.config.max_retained_transactions = max;
        self
    }

    pub fn capture_headers(mut self, enabled: bool) -> Self {
        self.config.capture_headers = enabled;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn global_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.global_labels.insert(key.into(), value.into());
        self
    }

    pub fn ignore_url(mut self, pattern: impl Into<String>) -> Self {
        self.config.ignore_urls.push(pattern.into());
        self
    }

    pub fn default_transaction_type(mut self, transaction_type: impl Into<String>) -> Self {
        self.config.default_transaction_type = transaction_type.into();
        self
    }

    pub fn clear_on_end(mut self, enabled: bool) -> Self {
        self.config.clear_on_end = enabled;
        self
    }

    pub fn build(self) -> ApmConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ApmConfig::default();
        assert_eq!(config.service_version, "1.0.0");
        assert_eq!(config.environment, "development");
        assert_eq!(config.transaction_max_spans, 500);
        assert_eq!(config.max_retained_transactions, 1000);
        assert_eq!(config.flush_interval, 10);
        assert_eq!(config.log_level, LogLevel::Warning);
        assert_eq!(config.default_transaction_type, "messaging");
        assert!(!config.clear_on_end);
        assert!(config.sanitize_fields.contains(&"authorization".to_string()));
    }

    #[test]
    fn test_partial_toml() {
        let config = ApmConfig::from_toml_str(
            r#"
            service_name = "checkout"
            transaction_sample_rate = 0.25
            log_level = "Debug"
            ignore_urls = ["/health", "/static/*"]

            [global_labels]
            team = "payments"
            "#,
        )
        .unwrap();

        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.transaction_sample_rate, 0.25);
        assert_eq!(config.log_level.as_filter(), "debug");
        assert_eq!(config.global_labels["team"], "payments");
        assert_eq!(config.transaction_max_spans, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_is_case_insensitive_in_files() {
        let config = ApmConfig::from_toml_str(r#"log_level = "warning""#).unwrap();
        assert_eq!(config.log_level, LogLevel::Warning);

        let config = ApmConfig::from_toml_str(r#"log_level = "INFO""#).unwrap();
        assert_eq!(config.log_level, LogLevel::Information);

        let config = ApmConfig::from_yaml_str("log_level: debug").unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);

        let err = ApmConfig::from_toml_str(r#"log_level = "loud""#).unwrap_err();
        assert!(err.to_string().contains("unknown log level 'loud'"));
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "service_name: orders\nclear_on_end: true").unwrap();

        let config = ApmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service_name, "orders");
        assert!(config.clear_on_end);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            ApmConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn test_validate_collects_all_issues() {
        let config = ApmConfig::builder()
            .transaction_sample_rate(1.5)
            .transaction_max_spans(0)
            .max_retained_transactions(0)
            .server_url("apm.internal:8200")
            .build();

        match config.validate() {
            Err(ConfigError::Invalid(issues)) => assert_eq!(issues.len(), 5),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_ignore_patterns() {
        let config = ApmConfig::builder()
            .ignore_url("/health")
            .ignore_url("/static/*")
            .build();

        assert!(config.is_ignored("/health"));
        assert!(!config.is_ignored("/healthz"));
        assert!(config.is_ignored("/static/app.js"));
        assert!(!config.is_ignored("/api/orders"));
    }

    #[test]
    fn test_sensitive_names() {
        let mut config = ApmConfig::default();
        assert!(config.is_sensitive("Authorization"));
        assert!(config.is_sensitive("x-api-key"));
        assert!(!config.is_sensitive("accept"));

        config.sanitize_field_names = false;
        assert!(!config.is_sensitive("Authorization"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Information);
        assert_eq!("None".parse::<LogLevel>().unwrap().as_filter(), "off");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_env_list_parsing() {
        assert_eq!(parse_list(" /a, ,/b "), vec!["/a", "/b"]);
        let pairs = parse_pairs("team=core, region = eu,broken");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["region"], "eu");
    }
}
