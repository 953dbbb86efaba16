//! # Network Telemetry Module
//!
//! Polls the sensor node's JSON readings endpoint once per second and
//! publishes validated samples as `TelemetryUpdate`s.
//!
//! ## Lifecycle
//! - `connect()`: one immediate fetch; on success the repeating poll starts
//! - `disconnect()`: stops the poll and publishes `NetworkDisconnected`
//!
//! A failed poll cycle is logged and skipped; only `disconnect` (or dropping
//! the poller) stops the loop.
//!
//! ## Calorie Accrual
//! `CalorieAccrual` tracks the last logged minute so the owner appends at most
//! one ledger entry per 60-second window.

use crate::error::PollError;
use crate::sample::{self, SampleSource};
use crate::telemetry::TelemetryUpdate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_ENDPOINT: &str = "http://192.168.4.1/readings";
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const ACCRUAL_WINDOW: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ReadingsSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Value, PollError>;
}

/// Fetches readings over HTTP
pub struct HttpReadingsSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReadingsSource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReadingsSource for HttpReadingsSource {
    async fn fetch(&self) -> Result<Value, PollError> {
        let response = self.client.get(&self.endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| PollError::Parse(e.to_string()))
    }
}

pub struct TelemetryPoller<S: ReadingsSource> {
    source: Arc<S>,
    updates: crossbeam_channel::Sender<TelemetryUpdate>,
    task: Option<JoinHandle<()>>,
}

impl<S: ReadingsSource> TelemetryPoller<S> {
    pub fn new(source: S, updates: crossbeam_channel::Sender<TelemetryUpdate>) -> Self {
        Self {
            source: Arc::new(source),
            updates,
            task: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.task.is_some()
    }

    /// Fetch once and, on success, start polling every second
    pub async fn connect(&mut self) -> Result<(), PollError> {
        if self.is_connected() {
            return Ok(());
        }

        let readings = fetch_with_timeout(self.source.as_ref()).await.map_err(|e| {
            log::error!("Sensor node unreachable: {}", e);
            e
        })?;

        log::info!("Connected to sensor node");
        let _ = self.updates.send(TelemetryUpdate::NetworkConnected);
        publish(&self.updates, &readings, Utc::now());

        let source = self.source.clone();
        let updates = self.updates.clone();
        self.task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + POLL_INTERVAL;
            let mut interval = tokio::time::interval_at(start, POLL_INTERVAL);
            loop {
                interval.tick().await;
                match fetch_with_timeout(source.as_ref()).await {
                    Ok(readings) => publish(&updates, &readings, Utc::now()),
                    Err(e) => log::warn!("Poll cycle failed: {}", e),
                }
            }
        }));
        Ok(())
    }

    /// Stop polling. Publishes `NetworkDisconnected` even when not connected.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::info!("Disconnected from sensor node");
        }
        let _ = self.updates.send(TelemetryUpdate::NetworkDisconnected);
    }
}

impl<S: ReadingsSource> Drop for TelemetryPoller<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn fetch_with_timeout<S: ReadingsSource + ?Sized>(source: &S) -> Result<Value, PollError> {
    tokio::time::timeout(REQUEST_TIMEOUT, source.fetch())
        .await
        .unwrap_or(Err(PollError::Timeout))
}

fn publish(
    updates: &crossbeam_channel::Sender<TelemetryUpdate>,
    readings: &Value,
    now: DateTime<Utc>,
) {
    for sample in sample::validate_readings(readings, now) {
        let _ = updates.send(TelemetryUpdate::Sample {
            source: SampleSource::Network,
            sample,
        });
    }
}

/// One ledger entry per accrual window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalorieAccrual {
    last_logged: Option<DateTime<Utc>>,
}

impl CalorieAccrual {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that moved backwards never makes a window due
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        match self.last_logged {
            None => true,
            Some(last) => (at - last)
                .to_std()
                .map(|elapsed| elapsed >= ACCRUAL_WINDOW)
                .unwrap_or(false),
        }
    }

    pub fn mark(&mut self, at: DateTime<Utc>) {
        self.last_logged = Some(at);
    }

    pub fn reset(&mut self) {
        self.last_logged = None;
    }
}
