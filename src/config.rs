use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;

use crate::model::{Endpoint, HelpOverrides};

static DEFAULT_SCRAPE_SCHEME: &str = "http";
static DEFAULT_SCRAPE_HOST: &str = "localhost";
static DEFAULT_METRICS_PORT: u16 = 9100;
static DEFAULT_METRICS_PATH: &str = "/metrics";
static DEFAULT_SCRAPE_INTERVAL: u64 = 30;
static DEFAULT_REQUEST_TIMEOUT: u64 = 5;

/// Upper bound, in seconds, for intervals and timeouts (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("gateway must not be empty")]
    MissingGateway,
    #[error("endpoint name must not be empty")]
    MissingName,
    #[error("duplicate endpoint name {0:?}")]
    DuplicateEndpoint(String),
    #[error("endpoint {0:?} has a zero scrape interval")]
    ZeroInterval(String),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("{field} exceeds the maximum of {max} seconds")]
    TooLarge { field: String, max: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub scrape_timeout: Option<u64>,
    #[serde(default)]
    pub help_overrides: HelpOverrides,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            path: default_path(),
            interval: default_interval(),
            hostname: None,
            labels: BTreeMap::new(),
        }
    }
}

fn default_scheme() -> String {
    DEFAULT_SCRAPE_SCHEME.to_string()
}

fn default_host() -> String {
    DEFAULT_SCRAPE_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}

fn default_interval() -> u64 {
    DEFAULT_SCRAPE_INTERVAL
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.gateway = config.gateway.trim().trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.is_empty() {
            return Err(ConfigError::MissingGateway);
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::ZeroTimeout("request_timeout"));
        }
        if self.scrape_timeout == Some(0) {
            return Err(ConfigError::ZeroTimeout("scrape_timeout"));
        }
        check_max("request_timeout", self.request_timeout)?;
        if let Some(scrape_timeout) = self.scrape_timeout {
            check_max("scrape_timeout", scrape_timeout)?;
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ConfigError::MissingName);
            }
            if !seen.insert(endpoint.name.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.name.clone()));
            }
            if endpoint.interval == 0 {
                return Err(ConfigError::ZeroInterval(endpoint.name.clone()));
            }
            check_max(&format!("interval of endpoint {:?}", endpoint.name), endpoint.interval)?;
        }
        Ok(())
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout.unwrap_or(self.request_timeout))
    }

    /// Resolves the configured endpoints in file order, filling a missing
    /// `hostname` with this machine's name.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let fqdn = local_fqdn();
        self.endpoints
            .iter()
            .cloned()
            .map(|endpoint| Endpoint::new(endpoint, &fqdn))
            .collect()
    }
}

fn check_max(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::TooLarge {
            field: field.to_string(),
            max: MAX_DURATION_SECS,
        });
    }
    Ok(())
}

/// This host's fully-qualified name: the resolver's canonical name for the
/// kernel host name, or the host name itself when that lookup fails.
pub fn local_fqdn() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    fqdn_or_hostname(hostname, canonical_name)
}

fn fqdn_or_hostname(hostname: String, resolve: impl FnOnce(&str) -> Option<String>) -> String {
    if hostname.is_empty() {
        return DEFAULT_SCRAPE_HOST.to_string();
    }
    match resolve(&hostname) {
        Some(fqdn) if !fqdn.is_empty() => fqdn,
        _ => hostname,
    }
}

#[cfg(unix)]
fn canonical_name(hostname: &str) -> Option<String> {
    let hints = dns_lookup::AddrInfoHints {
        socktype: 0,
        protocol: 0,
        address: 0,
        flags: libc::AI_CANONNAME,
    };
    dns_lookup::getaddrinfo(Some(hostname), None, Some(hints))
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|info| info.canonname)
        .find(|name| name.contains('.'))
}

#[cfg(not(unix))]
fn canonical_name(_hostname: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_yaml_str(
            r#"
gateway: http://collector:9091/
endpoints:
  - name: node1
"#,
        )
        .unwrap();

        assert_eq!(config.gateway, "http://collector:9091");
        assert_eq!(config.request_timeout, 5);
        assert_eq!(config.scrape_timeout(), Duration::from_secs(5));
        assert!(config.help_overrides.is_empty());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Full);
        assert!(config.log_file.is_none());
        assert_eq!(
            config.endpoints,
            vec![EndpointConfig {
                name: "node1".into(),
                ..EndpointConfig::default()
            }]
        );
    }

    #[test]
    fn full_config_is_read() {
        let config = Config::from_yaml_str(
            r#"
gateway: http://collector:9091
request_timeout: 3
scrape_timeout: 2
log_level: debug
log_format: json
log_file: /var/log/menoetius.log
help_overrides:
  node_load1: One minute load average.
endpoints:
  - name: node1
    scheme: https
    host: 10.0.0.5
    port: 9200
    path: /probe
    interval: 10
    hostname: node1.dc1
    labels:
      dc: east
      rack: "12"
  - name: node2
"#,
        )
        .unwrap();

        assert_eq!(config.push_timeout(), Duration::from_secs(3));
        assert_eq!(config.scrape_timeout(), Duration::from_secs(2));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/menoetius.log")));
        assert_eq!(
            config.help_overrides.get("node_load1").map(String::as_str),
            Some("One minute load average.")
        );

        let endpoints = config.endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].name, "node1");
        assert_eq!(endpoints[0].url(), "https://10.0.0.5:9200/probe");
        assert_eq!(endpoints[0].interval, Duration::from_secs(10));
        assert_eq!(endpoints[0].instance, "node1.dc1");
        assert_eq!(endpoints[0].labels.get("rack").map(String::as_str), Some("12"));
        assert_eq!(endpoints[1].name, "node2");
        assert_eq!(endpoints[1].instance, local_fqdn());
    }

    #[test]
    fn missing_gateway_is_rejected() {
        let err = Config::from_yaml_str("endpoints: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = Config::from_yaml_str("gateway: ''\nendpoints: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingGateway));
    }

    #[test]
    fn missing_endpoint_name_is_rejected() {
        let err = Config::from_yaml_str("gateway: http://gw\nendpoints:\n  - host: a\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Config::from_yaml_str(
            "gateway: http://gw\nendpoints:\n  - name: a\n  - name: b\n  - name: a\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEndpoint(name) if name == "a"));
    }

    #[test]
    fn zero_interval_and_timeouts_are_rejected() {
        let err = Config::from_yaml_str("gateway: http://gw\nendpoints:\n  - name: a\n    interval: 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval(_)));

        let err = Config::from_yaml_str("gateway: http://gw\nrequest_timeout: 0\nendpoints: []\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout("request_timeout")));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = Config::from_yaml_str(
            "gateway: http://gw\nendpoints:\n  - name: a\n    interval: 18446744073709551615\n",
        )
        .unwrap_err();
        assert!(matches!(&err, ConfigError::TooLarge { field, .. } if field.contains("\"a\"")));

        let err = Config::from_yaml_str(
            "gateway: http://gw\nrequest_timeout: 18446744073709551615\nendpoints: []\n",
        )
        .unwrap_err();
        assert!(matches!(&err, ConfigError::TooLarge { field, .. } if field == "request_timeout"));

        let err = Config::from_yaml_str("gateway: http://gw\nscrape_timeout: 31536001\nendpoints: []\n")
            .unwrap_err();
        assert!(matches!(&err, ConfigError::TooLarge { field, .. } if field == "scrape_timeout"));

        let config = Config::from_yaml_str(
            "gateway: http://gw\nendpoints:\n  - name: a\n    interval: 31536000\n",
        )
        .unwrap();
        assert_eq!(config.endpoints[0].interval, MAX_DURATION_SECS);
    }

    #[test]
    fn canonical_name_wins_when_resolved() {
        let fqdn = fqdn_or_hostname("node1".into(), |host| Some(format!("{}.dc1.example.org", host)));
        assert_eq!(fqdn, "node1.dc1.example.org");
    }

    #[test]
    fn host_name_is_kept_when_resolution_fails() {
        assert_eq!(fqdn_or_hostname("node1".into(), |_| None), "node1");
        assert_eq!(fqdn_or_hostname("node1".into(), |_| Some(String::new())), "node1");
        assert_eq!(fqdn_or_hostname(String::new(), |_| None), "localhost");
    }

    #[test]
    fn local_fqdn_is_never_empty() {
        assert!(!local_fqdn().is_empty());
    }

    #[test]
    fn unreadable_file_is_reported_with_path() {
        let err = Config::load("/nonexistent/menoetius.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/menoetius.yaml"));
    }
}
