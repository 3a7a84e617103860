//! Runtime state and the health endpoint
//!
//! Every long-running process owns one [`HealthState`]. The stage loops
//! update it; the axum router in [`router`] reads a snapshot per request:
//!
//! - `GET /health`: liveness. 200 while connecting, polling or delivering.
//! - `GET /ready`: readiness. 200 only once the source is connected and polling.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Lifecycle of a stage process
///
/// `Idle -> Connecting -> Polling <-> Delivering -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Idle,
    Connecting,
    Polling,
    Delivering,
    Draining,
    Stopped,
}

impl RuntimeState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            RuntimeState::Connecting | RuntimeState::Polling | RuntimeState::Delivering
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RuntimeState::Polling | RuntimeState::Delivering)
    }
}

#[derive(Debug)]
struct Snapshot {
    state: RuntimeState,
    channel_connected: bool,
    last_poll_at: Option<DateTime<Utc>>,
    last_processed_id: Option<String>,
    details: Map<String, Value>,
}

#[derive(Debug)]
struct Inner {
    service: String,
    started: Instant,
    snapshot: RwLock<Snapshot>,
    processed: AtomicU64,
    skipped: AtomicU64,
    dead_lettered: AtomicU64,
    secondary_failures: AtomicU64,
}

/// Shared, cheaply cloneable health record of one process
#[derive(Debug, Clone)]
pub struct HealthState {
    inner: Arc<Inner>,
}

/// Body of `/health` and `/ready`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub state: RuntimeState,
    pub uptime_seconds: u64,
    pub channel_connected: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_processed_id: Option<String>,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub dead_lettered_count: u64,
    pub secondary_failures: u64,
    pub details: Map<String, Value>,
}

impl HealthState {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                started: Instant::now(),
                snapshot: RwLock::new(Snapshot {
                    state: RuntimeState::Idle,
                    channel_connected: false,
                    last_poll_at: None,
                    last_processed_id: None,
                    details: Map::new(),
                }),
                processed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
                secondary_failures: AtomicU64::new(0),
            }),
        }
    }

    // A panicking writer only ever leaves plain values behind, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn state(&self) -> RuntimeState {
        self.read().state
    }

    pub fn set_state(&self, state: RuntimeState) {
        let mut snapshot = self.write();
        if snapshot.state != state {
            info!(service = %self.inner.service, from = ?snapshot.state, to = ?state, "state change");
            snapshot.state = state;
        }
    }

    /// Move to `to` only if currently in `from`; returns whether it moved
    pub fn transition(&self, from: RuntimeState, to: RuntimeState) -> bool {
        let mut snapshot = self.write();
        if snapshot.state == from {
            snapshot.state = to;
            true
        } else {
            false
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.write().channel_connected = connected;
    }

    pub fn record_poll(&self) {
        self.write().last_poll_at = Some(Utc::now());
    }

    pub fn record_processed(&self, id: &str) {
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
        self.write().last_processed_id = Some(id.to_string());
    }

    pub fn record_skipped(&self) {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_secondary_failure(&self) {
        self.inner.secondary_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Attach a connector-specific detail (mailbox, host, cursor) to the report
    pub fn set_detail(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().details.insert(key.into(), value.into());
    }

    pub fn report(&self) -> HealthReport {
        let snapshot = self.read();
        HealthReport {
            service: self.inner.service.clone(),
            state: snapshot.state,
            uptime_seconds: self.inner.started.elapsed().as_secs(),
            channel_connected: snapshot.channel_connected,
            last_poll_at: snapshot.last_poll_at,
            last_processed_id: snapshot.last_processed_id.clone(),
            processed_count: self.inner.processed.load(Ordering::Relaxed),
            skipped_count: self.inner.skipped.load(Ordering::Relaxed),
            dead_lettered_count: self.inner.dead_lettered.load(Ordering::Relaxed),
            secondary_failures: self.inner.secondary_failures.load(Ordering::Relaxed),
            details: snapshot.details.clone(),
        }
    }
}

/// Health routes with request tracing
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.report();
    let code = if report.state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.report();
    let code = if report.state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Serve the health routes on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(service = %state.service(), %addr, "health endpoint listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
