//! Scrape Prometheus-style endpoints on their own intervals and push the
//! results to a gateway, for hosts the collector cannot reach.

pub mod config;
pub mod format;
pub mod model;
pub mod scheduler;
pub mod scraper;

pub use config::{Config, ConfigError, EndpointConfig, LogFormat};
pub use model::{Endpoint, HelpOverrides, ScrapeJob};
pub use scheduler::{InFlightRegistry, Scheduler, ShutdownHandle};
pub use scraper::{ForwardError, Forwarder, HttpForwarder};
