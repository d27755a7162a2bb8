//! Fan-out of alert transitions to notification sinks
//!
//! `notify` never blocks: events go through a bounded queue and a background
//! worker fans them out to one lane per sink. Each lane delivers in order and
//! retries with exponential backoff, so a failing sink only delays itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::model::{AlertEvent, TransitionKind};

/// External notification channel
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Transient; delivery is retried
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// The sink refused the event; retrying will not help
    #[error("Sink rejected event: {0}")]
    Rejected(String),
}

// ============================================================================
// Built-in sinks
// ============================================================================

/// Writes transitions to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        match event.kind {
            TransitionKind::Fired => tracing::warn!(
                rule_id = %event.alert.rule_id,
                alert_id = %event.alert.id,
                severity = %event.alert.severity,
                "Alert '{}' fired: {}",
                event.rule_name,
                event.condition
            ),
            TransitionKind::Cleared => tracing::info!(
                rule_id = %event.alert.rule_id,
                alert_id = %event.alert.id,
                "Alert '{}' cleared",
                event.rule_name
            ),
        }
        Ok(())
    }
}

/// POSTs each transition as JSON
pub struct WebhookSink {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: format!("webhook:{}", url),
            url,
            headers: HashMap::new(),
            client,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn payload(event: &AlertEvent) -> serde_json::Value {
        serde_json::json!({
            "alert_id": event.alert.id,
            "rule_id": event.alert.rule_id,
            "rule_name": event.rule_name,
            "transition": event.kind,
            "severity": event.alert.severity,
            "condition": event.condition,
            "value": event.alert.last_value,
            "first_fired_at": event.alert.first_fired_at.to_rfc3339(),
            "cleared_at": event.alert.cleared_at.map(|t| t.to_rfc3339()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.url).json(&Self::payload(event));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(format!("Failed to send webhook: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(alert_id = %event.alert.id, url = %self.url, "Webhook notification sent");
            Ok(())
        } else if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(SinkError::Rejected(format!("Webhook returned status {}", status)))
        } else {
            Err(SinkError::Unavailable(format!("Webhook returned status {}", status)))
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), with up to 20% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let delay = base.saturating_mul(2u64.pow(attempt.saturating_sub(1).min(16)));
        let delay = delay.min(self.max_backoff.as_millis() as u64);

        let jitter = if delay >= 5 {
            rand::thread_rng().gen_range(0..=delay / 5)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Default)]
pub struct DispatchStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct Dispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    policy: RetryPolicy,
    capacity: usize,
    tx: mpsc::Sender<AlertEvent>,
    rx: Mutex<Option<mpsc::Receiver<AlertEvent>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, policy: RetryPolicy, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sinks,
            policy,
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx: Mutex::new(None),
            stats: DispatchStats::default(),
        }
    }

    /// Queue an event for delivery. Never waits; a full queue drops the event.
    pub fn notify(&self, event: AlertEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    alert_id = %event.alert.id,
                    kind = %event.kind,
                    "Notification queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    alert_id = %event.alert.id,
                    kind = %event.kind,
                    "Dispatcher stopped, dropping event"
                );
            }
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Start the delivery workers. Each sink sees events in queue order.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        let rx = self.rx.lock().take();

        tokio::spawn(async move {
            let mut rx = match rx {
                Some(rx) => rx,
                None => {
                    tracing::warn!("Dispatcher already started");
                    return;
                }
            };

            let (stop_tx, stop_rx) = watch::channel(false);
            let mut lanes = Vec::with_capacity(self.sinks.len());
            let mut workers = Vec::with_capacity(self.sinks.len());
            for sink in &self.sinks {
                let (lane_tx, lane_rx) = mpsc::channel(self.capacity);
                lanes.push((Arc::clone(sink), lane_tx));
                workers.push(tokio::spawn(Arc::clone(&self).run_lane(
                    Arc::clone(sink),
                    lane_rx,
                    stop_rx.clone(),
                )));
            }
            tracing::info!(sinks = self.sinks.len(), "Dispatcher started");

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => match maybe_event {
                        Some(event) => self.fan_out(&lanes, event),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }

            let _ = stop_tx.send(true);
            drop(lanes);
            for result in futures::future::join_all(workers).await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Notification lane terminated abnormally");
                }
            }
            tracing::info!("Dispatcher stopped");
        })
    }

    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Hand an event to every sink lane. A full lane drops the event for that sink only.
    fn fan_out(
        &self,
        lanes: &[(Arc<dyn NotificationSink>, mpsc::Sender<AlertEvent>)],
        event: AlertEvent,
    ) {
        for (sink, lane) in lanes {
            if lane.try_send(event.clone()).is_err() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    sink = %sink.name(),
                    alert_id = %event.alert.id,
                    kind = %event.kind,
                    "Sink backlog full, dropping event"
                );
            }
        }
    }

    async fn run_lane(
        self: Arc<Self>,
        sink: Arc<dyn NotificationSink>,
        mut events: mpsc::Receiver<AlertEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => event,
                    None => break,
                },
                _ = stop.changed() => break,
            };
            tokio::select! {
                _ = self.deliver_with_retry(sink.as_ref(), &event) => {}
                _ = stop.changed() => break,
            }
        }
    }

    async fn deliver_with_retry(&self, sink: &dyn NotificationSink, event: &AlertEvent) {
        let mut attempt = 1;
        loop {
            match sink.deliver(event).await {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(SinkError::Rejected(reason)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        sink = %sink.name(),
                        alert_id = %event.alert.id,
                        error = %reason,
                        "Notification rejected, dropping"
                    );
                    return;
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        sink = %sink.name(),
                        alert_id = %event.alert.id,
                        attempts = attempt,
                        error = %e,
                        "Notification failed, dropping"
                    );
                    return;
                }
                Err(e) => {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        sink = %sink.name(),
                        alert_id = %event.alert.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
