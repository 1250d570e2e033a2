//! Connection stability tracking.
//!
//! Event-driven: session managers and executors record lifecycle events and
//! request outcomes; exporters read aggregate snapshots. Every slice a
//! snapshot exposes is a defensive copy — mutating a returned value never
//! touches the tracker.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventType {
    Created,
    Active,
    Dropped,
    Terminated,
    Reconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: ConnectionEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session and aggregate state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub request_count: u64,
    pub success_count: u64,
    pub avg_latency_ms: f64,
    pub reconnects: u64,
    pub dropped: bool,
    pub terminated: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    sessions: HashMap<String, SessionStats>,
    events: VecDeque<ConnectionEvent>,
    time_series: Vec<TimeSeriesPoint>,
    created: u64,
    dropped: u64,
    terminated: u64,
    reconnects: u64,
    requests: u64,
    successes: u64,
    protocol_errors: u64,
    avg_latency_ms: f64,
}

/// One minute-resolution bucket of lifecycle activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub minute: DateTime<Utc>,
    pub created: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

/// Aggregate snapshot consumed by external exporters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityMetrics {
    pub stability_score: f64,
    pub created: u64,
    pub dropped: u64,
    pub terminated: u64,
    pub reconnects: u64,
    pub requests: u64,
    pub successes: u64,
    pub protocol_errors: u64,
    pub avg_latency_ms: f64,
    pub drop_rate: f64,
    pub reconnect_rate: f64,
    pub protocol_error_rate: f64,
    pub churn_per_minute: f64,
    pub sessions: HashMap<String, SessionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_events: Option<Vec<ConnectionEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_series: Option<Vec<TimeSeriesPoint>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConnectionTracker {
    state: RwLock<TrackerState>,
    event_capacity: usize,
    started_at: DateTime<Utc>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ConnectionTracker {
    /// Zero capacity selects the default ring size.
    pub fn new(event_capacity: usize) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            event_capacity: if event_capacity == 0 {
                DEFAULT_EVENT_CAPACITY
            } else {
                event_capacity
            },
            started_at: Utc::now(),
        }
    }

    /// Record one lifecycle event. `Active` counts a request against the
    /// session and the aggregate; `RecordSuccess` is the matching success
    /// half, called only when the request succeeded.
    pub fn record_event(
        &self,
        session_id: &str,
        event_type: ConnectionEventType,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        let mut state = self.state.write();

        let stats = state.sessions.entry(session_id.to_owned()).or_default();
        match event_type {
            ConnectionEventType::Created => {}
            ConnectionEventType::Active => {
                stats.request_count += 1;
            }
            ConnectionEventType::Dropped => {
                stats.dropped = true;
            }
            ConnectionEventType::Terminated => {
                stats.terminated = true;
            }
            ConnectionEventType::Reconnect => {
                stats.reconnects += 1;
            }
        }

        match event_type {
            ConnectionEventType::Created => state.created += 1,
            ConnectionEventType::Active => state.requests += 1,
            ConnectionEventType::Dropped => state.dropped += 1,
            ConnectionEventType::Terminated => state.terminated += 1,
            ConnectionEventType::Reconnect => state.reconnects += 1,
        }

        bump_time_series(&mut state.time_series, now, event_type);

        state.events.push_back(ConnectionEvent {
            session_id: session_id.to_owned(),
            event_type,
            timestamp: now,
            reason,
        });
        while state.events.len() > self.event_capacity {
            state.events.pop_front();
        }
    }

    /// Record a successful request and fold its latency into the running
    /// means: `avg = (avg * (n - 1) + latency) / n`.
    pub fn record_success(&self, session_id: &str, latency_ms: u64) {
        let mut state = self.state.write();
        state.successes += 1;
        let n = state.successes as f64;
        state.avg_latency_ms = (state.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;

        let stats = state.sessions.entry(session_id.to_owned()).or_default();
        stats.success_count += 1;
        let n = stats.success_count as f64;
        stats.avg_latency_ms = (stats.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;
    }

    pub fn record_protocol_error(&self, session_id: &str) {
        let mut state = self.state.write();
        state.protocol_errors += 1;
        state.sessions.entry(session_id.to_owned()).or_default();
    }

    /// Aggregate snapshot. Every collection inside is a fresh copy.
    pub fn stability_metrics(
        &self,
        include_events: bool,
        include_time_series: bool,
    ) -> StabilityMetrics {
        let state = self.state.read();

        let drop_rate = ratio(state.dropped, state.created);
        let reconnect_rate = ratio(state.reconnects, state.created);
        let protocol_error_rate = ratio(state.protocol_errors, state.requests);
        let stability_score = (100.0
            - (drop_rate * 50.0 + reconnect_rate * 30.0 + protocol_error_rate * 20.0))
            .clamp(0.0, 100.0);

        let elapsed_minutes = (Utc::now() - self.started_at).num_minutes().max(1) as f64;
        let churn_per_minute = state.created as f64 / elapsed_minutes;

        StabilityMetrics {
            stability_score,
            created: state.created,
            dropped: state.dropped,
            terminated: state.terminated,
            reconnects: state.reconnects,
            requests: state.requests,
            successes: state.successes,
            protocol_errors: state.protocol_errors,
            avg_latency_ms: state.avg_latency_ms,
            drop_rate,
            reconnect_rate,
            protocol_error_rate,
            churn_per_minute,
            sessions: state.sessions.clone(),
            recent_events: include_events.then(|| state.events.iter().cloned().collect()),
            time_series: include_time_series.then(|| state.time_series.clone()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn bump_time_series(
    series: &mut Vec<TimeSeriesPoint>,
    now: DateTime<Utc>,
    event_type: ConnectionEventType,
) {
    use chrono::{DurationRound, Duration};
    let minute = now
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(now);

    if series.last().map(|p| p.minute) != Some(minute) {
        series.push(TimeSeriesPoint {
            minute,
            created: 0,
            dropped: 0,
            reconnects: 0,
        });
    }
    let point = series.last_mut().expect("pushed above");
    match event_type {
        ConnectionEventType::Created => point.created += 1,
        ConnectionEventType::Dropped => point.dropped += 1,
        ConnectionEventType::Reconnect => point.reconnects += 1,
        ConnectionEventType::Active | ConnectionEventType::Terminated => {}
    }
}
