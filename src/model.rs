use std::collections::{BTreeMap, HashMap};

use tokio::time::{Duration, Instant};

use crate::config::{EndpointConfig, MAX_DURATION_SECS};

/// Metric name -> replacement HELP text.
pub type HelpOverrides = HashMap<String, String>;

/// A scrape target plus the time it becomes eligible for its next scrape.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub interval: Duration,
    pub instance: String,
    pub labels: BTreeMap<String, String>,
    next_scrape_at: Instant,
}

impl Endpoint {
    /// Builds an endpoint that is due immediately. `default_instance` is used
    /// when the configuration carries no `hostname`.
    pub fn new(config: EndpointConfig, default_instance: &str) -> Self {
        Self {
            instance: config
                .hostname
                .unwrap_or_else(|| default_instance.to_string()),
            name: config.name,
            scheme: config.scheme,
            host: config.host,
            port: config.port,
            path: config.path,
            interval: Duration::from_secs(config.interval.min(MAX_DURATION_SECS)),
            labels: config.labels,
            next_scrape_at: Instant::now(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    pub fn next_scrape_at(&self) -> Instant {
        self.next_scrape_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_scrape_at
    }

    /// Pushes the next eligible time out to `now + interval`. Called once per
    /// dispatch, never on completion.
    pub fn advance(&mut self, now: Instant) {
        let next = now.checked_add(self.interval).unwrap_or_else(|| {
            tracing::warn!(endpoint = %self.name, interval = ?self.interval, "interval overflows the clock");
            now.checked_add(Duration::from_secs(MAX_DURATION_SECS)).unwrap_or(now)
        });
        debug_assert!(next >= self.next_scrape_at);
        self.next_scrape_at = next;
    }

    pub fn job(&self) -> ScrapeJob {
        ScrapeJob {
            job: self.name.clone(),
            scrape_url: self.url(),
            instance: self.instance.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Everything a single fetch-and-forward invocation needs, detached from the
/// scheduler's mutable endpoint state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeJob {
    pub job: String,
    pub scrape_url: String,
    pub instance: String,
    pub labels: BTreeMap<String, String>,
}
