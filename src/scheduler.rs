//! Tick loop that decides which endpoints are due and hands them to a
//! [`Forwarder`] without waiting for the result.
//!
//! Each endpoint has at most one worker in flight. A due endpoint whose
//! previous worker is still running is skipped and picked up on the first
//! tick after that worker finishes; dispatches are never queued.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::FutureExt;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::model::Endpoint;
use crate::scraper::Forwarder;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Names of endpoints with a live worker, keyed to their dispatch time.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<InFlightInner>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    entries: Mutex<HashMap<String, Instant>>,
    idle: Notify,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // entries stay consistent even if a holder panicked
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot for `name`, or returns `None` while another worker
    /// holds it. The slot is released when the guard drops.
    pub fn try_acquire(&self, name: &str) -> Option<InFlightGuard> {
        let mut entries = self.entries();
        if entries.contains_key(name) {
            return None;
        }
        entries.insert(name.to_string(), Instant::now());
        Some(InFlightGuard {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    pub fn in_flight_since(&self, name: &str) -> Option<Instant> {
        self.entries().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Resolves once no worker is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries();
        entries.remove(name);
        if entries.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Liveness handle for one dispatched worker.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    name: String,
}

impl InFlightGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

/// The one control input into a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Stops further dispatches. Workers already in flight are left to finish.
    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Scheduler<F: Forwarder> {
    endpoints: Vec<Endpoint>,
    forwarder: Arc<F>,
    in_flight: InFlightRegistry,
    tick: Duration,
    shutdown: CancellationToken,
}

impl<F: Forwarder> Scheduler<F> {
    pub fn new(endpoints: Vec<Endpoint>, forwarder: F) -> Self {
        for endpoint in &endpoints {
            tracing::debug!(
                endpoint = %endpoint.name,
                url = %endpoint.url(),
                interval = ?endpoint.interval,
                instance = %endpoint.instance,
                "created endpoint"
            );
        }

        Self {
            endpoints,
            forwarder: Arc::new(forwarder),
            in_flight: InFlightRegistry::new(),
            tick: DEFAULT_TICK,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn in_flight(&self) -> InFlightRegistry {
        self.in_flight.clone()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Evaluates every endpoint, in configuration order, against `now` and
    /// dispatches the ones that are due and idle. Returns the dispatch count.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut dispatched = 0;

        for endpoint in self.endpoints.iter_mut() {
            if !endpoint.is_due(now) {
                continue;
            }

            let guard = match self.in_flight.try_acquire(&endpoint.name) {
                Some(guard) => guard,
                None => {
                    tracing::debug!(endpoint = %endpoint.name, "previous scrape still in flight, skipping");
                    continue;
                }
            };

            endpoint.advance(now);
            let job = endpoint.job();
            tracing::debug!(endpoint = %endpoint.name, url = %job.scrape_url, "dispatching scrape");

            let forwarder = Arc::clone(&self.forwarder);
            tokio::spawn(async move {
                let guard = guard;
                if AssertUnwindSafe(forwarder.forward(job))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!(endpoint = %guard.name(), "scrape worker panicked");
                }
            });
            dispatched += 1;
        }

        dispatched
    }

    /// Ticks until shutdown is requested, then returns the in-flight registry
    /// without waiting on it.
    pub async fn run(mut self) -> InFlightRegistry {
        tracing::info!(endpoints = self.endpoints.len(), tick = ?self.tick, "scheduler started");

        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let dispatched = self.tick(Instant::now());
                    if dispatched > 0 {
                        tracing::debug!(dispatched, "tick");
                    }
                }
            }
        }

        tracing::info!(in_flight = self.in_flight.len(), "scheduler stopped");
        self.in_flight
    }
}
