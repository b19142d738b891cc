//! Collector-side client.
//!
//! [`Backoff`] is the connection state machine:
//!
//! ```text
//! Disconnected ──failure──▶ Retrying { attempt, next_delay } ──accepted──▶ Connected
//!                               ▲            │
//!                               └──failure───┘
//! ```
//!
//! Delays escalate through [`BACKOFF_TIERS`], repeating the last tier. The
//! machine keeps no timers of its own: [`Backoff::tick`] advances it by an
//! elapsed duration, so tests can step it deterministically.
//!
//! [`CollectorClient::push_events`] drives the machine over HTTP. After a
//! transport failure it waits out the delay, asks the server for the
//! session's last accepted sequence, and resumes from there. Only an
//! accepted submission counts as success: a server that answers the
//! resumption query but keeps failing submissions still uses up the attempt
//! budget. A `409 sequence_gap` triggers the same re-sync without waiting.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::protocol::{
    RegisterRequest, RegisterResponse, SessionStatus, SubmitRequest, SubmitResponse,
};
use crate::models::Event;

/// Delay before each retry attempt; the last tier repeats.
pub const BACKOFF_TIERS: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Consecutive gap re-syncs tolerated before giving up.
const MAX_RESYNCS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Retrying { attempt: u32, next_delay: Duration },
    Connected,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    state: ConnectionState,
    tiers: Vec<Duration>,
    waited: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::with_tiers(BACKOFF_TIERS.to_vec())
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A machine with custom delay tiers. An empty list means no delay.
    pub fn with_tiers(tiers: Vec<Duration>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            tiers,
            waited: Duration::ZERO,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.tiers
            .get(idx)
            .or_else(|| self.tiers.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Record a failed attempt. Returns the delay before the next one.
    pub fn on_failure(&mut self) -> Duration {
        let attempt = match self.state {
            ConnectionState::Retrying { attempt, .. } => attempt + 1,
            ConnectionState::Disconnected | ConnectionState::Connected => 1,
        };
        let next_delay = self.delay_for(attempt);
        self.state = ConnectionState::Retrying {
            attempt,
            next_delay,
        };
        self.waited = Duration::ZERO;
        next_delay
    }

    pub fn on_success(&mut self) {
        self.state = ConnectionState::Connected;
        self.waited = Duration::ZERO;
    }

    /// Advance simulated time. Returns `true` once an attempt may be made.
    pub fn tick(&mut self, elapsed: Duration) -> bool {
        match self.state {
            ConnectionState::Retrying { next_delay, .. } => {
                self.waited += elapsed;
                self.waited >= next_delay
            }
            ConnectionState::Disconnected | ConnectionState::Connected => true,
        }
    }

    /// Time left before the next attempt.
    pub fn remaining(&self) -> Duration {
        match self.state {
            ConnectionState::Retrying { next_delay, .. } => next_delay.saturating_sub(self.waited),
            _ => Duration::ZERO,
        }
    }
}

/// Why a request did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Server unreachable or failing; worth retrying.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("sequence gap: server expects {expected}, got {received}")]
    SequenceGap { expected: i64, received: i64 },

    /// Definitive rejection; retrying will not help.
    #[error("rejected ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    expected: Option<i64>,
    #[serde(default)]
    received: Option<i64>,
}

/// Totals over one [`CollectorClient::push_events`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub batches: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub retransmitted: usize,
    pub resyncs: u32,
    pub last_sequence: i64,
    pub conversation_id: Option<String>,
}

/// Index of the first event after `last_sequence`.
fn resume_position(events: &[Event], last_sequence: i64) -> usize {
    events
        .iter()
        .position(|e| e.sequence > last_sequence)
        .unwrap_or(events.len())
}

async fn classify(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        return ClientError::Transport(format!("server returned {}", status));
    }
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) if env.error.code == "sequence_gap" => ClientError::SequenceGap {
            expected: env.error.expected.unwrap_or(0),
            received: env.error.received.unwrap_or(0),
        },
        Ok(env) => ClientError::Rejected {
            status: status.as_u16(),
            code: env.error.code,
            message: env.error.message,
        },
        Err(_) => ClientError::Rejected {
            status: status.as_u16(),
            code: "unknown".to_string(),
            message: body,
        },
    }
}

pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    workspace_id: Option<String>,
    batch_size: usize,
    max_attempts: u32,
    backoff: Backoff,
}

impl CollectorClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            workspace_id: None,
            batch_size: 100,
            max_attempts: 8,
            backoff: Backoff::new(),
        })
    }

    pub fn with_workspace(mut self, workspace_id: Option<String>) -> Self {
        self.workspace_id = workspace_id;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Retry budget and delay tiers for transport failures.
    pub fn with_backoff(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.backoff.state()
    }

    /// One-shot registration against `base_url`.
    pub async fn register(base_url: &str, req: &RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/collectors", base_url.trim_end_matches('/'));
        let response = reqwest::Client::new()
            .post(&url)
            .json(req)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        if !response.status().is_success() {
            return Err(classify(response).await.into());
        }
        Ok(response.json().await?)
    }

    /// Last sequence the server accepted for `session_id`.
    pub async fn last_sequence(&self, session_id: &str) -> Result<i64, ClientError> {
        let url = format!("{}/collectors/sessions/{}", self.base_url, session_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        let status: SessionStatus = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(status.last_sequence)
    }

    async fn submit(&self, session_id: &str, events: &[Event]) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}/collectors/events", self.base_url);
        let body = SubmitRequest {
            session_id: session_id.to_string(),
            workspace_id: self.workspace_id.clone(),
            events: events.to_vec(),
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Push `events` (ordered by sequence) for one session, from the first.
    /// Events the server already holds come back as retransmissions.
    pub async fn push_events(&mut self, session_id: &str, events: &[Event]) -> Result<PushSummary> {
        self.push_events_after(session_id, events, 0).await
    }

    /// Ask the server where the session stands, then push only what follows.
    pub async fn resume(&mut self, session_id: &str, events: &[Event]) -> Result<PushSummary> {
        let last = match self.last_sequence(session_id).await {
            Ok(last) => last,
            Err(ClientError::Transport(err)) => {
                tracing::warn!(session_id, error = %err, "resumption query failed; pushing everything");
                self.backoff.on_failure();
                0
            }
            Err(err) => return Err(err.into()),
        };
        self.push_events_after(session_id, events, last).await
    }

    /// Push the events after `last_sent`, the sequence this side believes
    /// the server already holds. A wrong belief is corrected through the
    /// server's gap response.
    pub async fn push_events_after(
        &mut self,
        session_id: &str,
        events: &[Event],
        last_sent: i64,
    ) -> Result<PushSummary> {
        let mut summary = PushSummary {
            last_sequence: last_sent,
            ..PushSummary::default()
        };
        let mut pos = resume_position(events, last_sent);
        // Set once the server answered the resumption query after a failure.
        let mut resumed = false;

        while pos < events.len() {
            let retrying = match self.backoff.state() {
                ConnectionState::Retrying {
                    attempt,
                    next_delay,
                } if !resumed => Some((attempt, next_delay)),
                _ => None,
            };
            if let Some((attempt, next_delay)) = retrying {
                if attempt > self.max_attempts {
                    bail!(
                        "giving up on session {} after {} failed attempts",
                        session_id,
                        attempt
                    );
                }
                tokio::time::sleep(next_delay).await;
                self.backoff.tick(next_delay);

                match self.last_sequence(session_id).await {
                    Ok(last) => {
                        resumed = true;
                        pos = resume_position(events, last);
                        summary.last_sequence = last;
                        tracing::info!(session_id, last_sequence = last, "reconnected; resuming");
                        continue;
                    }
                    Err(ClientError::Transport(err)) => {
                        let delay = self.backoff.on_failure();
                        tracing::warn!(session_id, error = %err, retry_in_ms = delay.as_millis() as u64, "collector server unreachable");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            let end = (pos + self.batch_size).min(events.len());
            match self.submit(session_id, &events[pos..end]).await {
                Ok(resp) => {
                    self.backoff.on_success();
                    resumed = false;
                    summary.batches += 1;
                    summary.accepted += resp.accepted;
                    summary.duplicates += resp.duplicates;
                    summary.retransmitted += resp.retransmitted;
                    summary.last_sequence = resp.last_sequence;
                    summary.conversation_id = resp.conversation_id;
                    pos = end;
                }
                Err(ClientError::SequenceGap { expected, received }) => {
                    summary.resyncs += 1;
                    if summary.resyncs > MAX_RESYNCS {
                        bail!("session {} keeps reporting sequence gaps", session_id);
                    }
                    tracing::warn!(session_id, expected, received, "sequence gap; re-syncing");
                    let last = self.last_sequence(session_id).await?;
                    let next = resume_position(events, last);
                    match events.get(next) {
                        Some(e) if e.sequence == last + 1 => pos = next,
                        Some(e) => bail!(
                            "server is at sequence {} but the earliest unsent local event is {}",
                            last,
                            e.sequence
                        ),
                        None => pos = next,
                    }
                }
                Err(ClientError::Transport(err)) => {
                    resumed = false;
                    let delay = self.backoff.on_failure();
                    tracing::warn!(session_id, error = %err, retry_in_ms = delay.as_millis() as u64, "push failed");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if resumed {
            // The server already held everything that was left.
            self.backoff.on_success();
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    #[test]
    fn test_backoff_escalates_and_repeats_last_tier() {
        let mut b = Backoff::new();
        assert_eq!(b.state(), ConnectionState::Disconnected);
        let delays: Vec<u64> = (0..8).map(|_| b.on_failure().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 5, 10, 30, 60, 60, 60]);
        assert_eq!(
            b.state(),
            ConnectionState::Retrying {
                attempt: 8,
                next_delay: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_tick_reports_readiness() {
        let mut b = Backoff::new();
        assert!(b.tick(Duration::ZERO));
        b.on_failure();
        b.on_failure();
        assert!(!b.tick(Duration::from_millis(1500)));
        assert_eq!(b.remaining(), Duration::from_millis(500));
        assert!(b.tick(Duration::from_millis(500)));

        b.on_success();
        assert_eq!(b.state(), ConnectionState::Connected);
        // A failure after a success starts again at the first tier.
        assert_eq!(b.on_failure(), Duration::from_secs(1));
    }

    #[test]
    fn test_resume_position() {
        let events: Vec<Event> = (1..=5)
            .map(|seq| Event {
                event_type: EventType::Message,
                sequence: seq,
                content_hash: None,
                payload: serde_json::json!({}),
                timestamp: None,
            })
            .collect();
        assert_eq!(resume_position(&events, 0), 0);
        assert_eq!(resume_position(&events, 3), 3);
        assert_eq!(resume_position(&events, 9), 5);
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up() {
        // Nothing listens on port 9 of localhost.
        let mut client = CollectorClient::new("http://127.0.0.1:9", "cik_x.y")
            .unwrap()
            .with_backoff(Backoff::with_tiers(vec![Duration::from_millis(1)]), 2);
        let events = vec![Event {
            event_type: EventType::SessionStart,
            sequence: 1,
            content_hash: None,
            payload: serde_json::json!({}),
            timestamp: None,
        }];
        let err = client.push_events("s", &events).await.unwrap_err();
        assert!(err.to_string().contains("giving up"));
        assert!(matches!(client.state(), ConnectionState::Retrying { .. }));
    }
}
