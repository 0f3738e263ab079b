use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::time::Duration;

use crate::config::Config;
use crate::format::{push_path, rewrite_help};
use crate::model::{HelpOverrides, ScrapeJob};

static TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("unable to query metrics from {url}: {source}")]
    Scrape {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unable to push metrics to {url}: {source}")]
    Push {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// One fetch-and-forward invocation. Implementations absorb every failure:
/// nothing is returned to the scheduler.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, job: ScrapeJob);
}

/// Scrapes over HTTP and pushes the (HELP-rewritten) body to a gateway.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    gateway: String,
    scrape_timeout: Duration,
    push_timeout: Duration,
    help_overrides: Arc<HelpOverrides>,
}

impl HttpForwarder {
    pub fn new(
        gateway: impl Into<String>,
        scrape_timeout: Duration,
        push_timeout: Duration,
        help_overrides: Arc<HelpOverrides>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(scrape_timeout.max(push_timeout))
            .build()?;

        Ok(Self {
            client,
            gateway: gateway.into(),
            scrape_timeout,
            push_timeout,
            help_overrides,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(
            config.gateway.clone(),
            config.scrape_timeout(),
            config.push_timeout(),
            Arc::new(config.help_overrides.clone()),
        )
    }

    /// Runs the invocation and reports where the metrics were pushed.
    pub async fn try_forward(&self, job: &ScrapeJob) -> Result<String, ForwardError> {
        let body = self.scrape(&job.scrape_url).await?;
        let body = rewrite_help(&body, &self.help_overrides);
        let destination = push_path(&self.gateway, &job.job, &job.instance, &job.labels);
        self.push(&destination, body).await?;
        Ok(destination)
    }

    async fn scrape(&self, url: &str) -> Result<String, ForwardError> {
        let scrape_err = |source: reqwest::Error| ForwardError::Scrape {
            url: url.to_string(),
            source,
        };

        tracing::debug!(%url, "scraping");
        self.client
            .get(url)
            .timeout(self.scrape_timeout)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(scrape_err)?
            .text()
            .await
            .map_err(scrape_err)
    }

    async fn push(&self, destination: &str, body: String) -> Result<(), ForwardError> {
        self.client
            .post(destination)
            .timeout(self.push_timeout)
            .header(CONTENT_TYPE, TEXT_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| ForwardError::Push {
                url: destination.to_string(),
                source,
            })?;
        Ok(())
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, job: ScrapeJob) {
        match self.try_forward(&job).await {
            Ok(destination) => tracing::info!(
                endpoint = %job.job,
                url = %job.scrape_url,
                %destination,
                "metrics pushed"
            ),
            Err(e @ ForwardError::Scrape { .. }) => {
                tracing::error!(endpoint = %job.job, url = %job.scrape_url, error = %e, "scrape failed")
            }
            Err(e @ ForwardError::Push { .. }) => {
                tracing::error!(endpoint = %job.job, error = %e, "push failed")
            }
        }
    }
}
