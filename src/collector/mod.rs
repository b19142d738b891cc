//! Collector event protocol.
//!
//! Remote collectors register once, then push ordered event batches per
//! session. [`CollectorService`] holds the server-side logic; the HTTP
//! surface in [`server`](crate::server) is a thin mapping onto it.
//!
//! # API keys
//!
//! Keys have the form `cik_<collector-id>.<secret>`. Only an HMAC-SHA256 of
//! the secret, keyed by a random per-collector salt, is stored; verification
//! uses the MAC's constant-time comparison.
//!
//! # Submission
//!
//! A batch is authenticated, scope-checked and size-checked, then planned
//! under the session lock by [`protocol::plan_batch`]. A rejected batch has
//! no effects and creates no job. An accepted plan is applied through
//! [`IngestionPipeline::ingest_events`], still under the same lock.

pub mod client;
pub mod protocol;

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::CollectorSettings;
use crate::locks::session_key;
use crate::models::{Collector, CollectorSession, JobStatus};
use crate::pipeline::{EventBatch, IngestionPipeline};
use protocol::{
    content_hash, plan_batch, CollectorStatus, RegisterRequest, RegisterResponse, SessionStatus,
    SubmitRequest, SubmitResponse,
};

type HmacSha256 = Hmac<Sha256>;

const KEY_PREFIX: &str = "cik_";

/// Protocol-level rejections. None of these leave partial effects.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid or unknown API key")]
    Unauthorized,

    #[error("collector is not scoped to workspace {0}")]
    WorkspaceMismatch(String),

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: i64, received: i64 },

    #[error("sequence {sequence} was already applied with different content")]
    SequenceConflict { sequence: i64 },

    #[error("session {session_id} is complete")]
    SessionClosed { session_id: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ProtocolError {
    /// Stable machine-readable code used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Unauthorized => "unauthorized",
            ProtocolError::WorkspaceMismatch(_) => "workspace_mismatch",
            ProtocolError::SequenceGap { .. } => "sequence_gap",
            ProtocolError::SequenceConflict { .. } => "sequence_conflict",
            ProtocolError::SessionClosed { .. } => "session_closed",
            ProtocolError::BadRequest(_) => "bad_request",
            ProtocolError::NotFound(_) => "not_found",
            ProtocolError::Internal(_) => "internal",
        }
    }
}

fn mac_for(salt: &str, secret: &str) -> Result<HmacSha256, ProtocolError> {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes())
        .map_err(|e| ProtocolError::Internal(anyhow::anyhow!("hmac key: {}", e)))?;
    mac.update(secret.as_bytes());
    Ok(mac)
}

/// Split `cik_<id>.<secret>` into its parts.
fn split_api_key(api_key: &str) -> Option<(&str, &str)> {
    let rest = api_key.strip_prefix(KEY_PREFIX)?;
    let (id, secret) = rest.split_once('.')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id, secret))
}

fn status_of(collector: &Collector) -> CollectorStatus {
    CollectorStatus {
        id: collector.id.clone(),
        workspace_id: collector.workspace_id.clone(),
        collector_type: collector.collector_type.clone(),
        version: collector.version.clone(),
        hostname: collector.hostname.clone(),
        created_at: collector.created_at,
        last_seen_at: collector.last_seen_at,
        last_event_at: collector.last_event_at,
    }
}

#[derive(Clone)]
pub struct CollectorService {
    pipeline: IngestionPipeline,
    settings: CollectorSettings,
}

impl CollectorService {
    pub fn new(pipeline: IngestionPipeline, settings: CollectorSettings) -> Self {
        Self { pipeline, settings }
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    /// Register a collector. The returned API key is not stored and cannot
    /// be retrieved again.
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ProtocolError> {
        if req.workspace_id.trim().is_empty() {
            return Err(ProtocolError::BadRequest("workspace_id is required".to_string()));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let secret = hex::encode(rand::random::<[u8; 24]>());
        let salt = hex::encode(rand::random::<[u8; 16]>());
        let key_hash = hex::encode(mac_for(&salt, &secret)?.finalize().into_bytes());

        let collector = Collector {
            id: id.clone(),
            workspace_id: req.workspace_id.clone(),
            collector_type: req.collector_type,
            version: req.version,
            hostname: req.hostname,
            key_salt: salt,
            key_hash,
            created_at: Utc::now(),
            last_seen_at: None,
            last_event_at: None,
        };
        self.pipeline.store().insert_collector(&collector).await?;
        tracing::info!(
            collector_id = %id,
            workspace_id = %collector.workspace_id,
            hostname = %collector.hostname,
            "collector registered"
        );

        Ok(RegisterResponse {
            api_key: format!("{}{}.{}", KEY_PREFIX, id, secret),
            collector_id: id,
            workspace_id: req.workspace_id,
        })
    }

    /// Resolve an API key to its collector.
    pub async fn authenticate(&self, api_key: &str) -> Result<Collector, ProtocolError> {
        let (id, secret) = split_api_key(api_key).ok_or(ProtocolError::Unauthorized)?;
        let collector = self
            .pipeline
            .store()
            .get_collector(id)
            .await?
            .ok_or(ProtocolError::Unauthorized)?;
        let expected = hex::decode(&collector.key_hash).map_err(|_| ProtocolError::Unauthorized)?;
        mac_for(&collector.key_salt, secret)?
            .verify_slice(&expected)
            .map_err(|_| ProtocolError::Unauthorized)?;
        Ok(collector)
    }

    /// Validate and apply one event batch.
    pub async fn submit(
        &self,
        collector: &Collector,
        req: SubmitRequest,
    ) -> Result<SubmitResponse, ProtocolError> {
        let received_at = Instant::now();
        let result = self.submit_inner(collector, req, received_at).await;
        if let Err(err) = &result {
            match err {
                ProtocolError::Internal(_) => tracing::error!(
                    collector_id = %collector.id,
                    error = %err,
                    "event batch failed"
                ),
                _ => tracing::warn!(
                    collector_id = %collector.id,
                    code = err.code(),
                    error = %err,
                    "event batch rejected"
                ),
            }
        }
        result
    }

    async fn submit_inner(
        &self,
        collector: &Collector,
        req: SubmitRequest,
        received_at: Instant,
    ) -> Result<SubmitResponse, ProtocolError> {
        if req.session_id.trim().is_empty() {
            return Err(ProtocolError::BadRequest("session_id is required".to_string()));
        }
        if let Some(ws) = &req.workspace_id {
            if ws != &collector.workspace_id {
                return Err(ProtocolError::WorkspaceMismatch(ws.clone()));
            }
        }
        if req.events.is_empty() {
            return Err(ProtocolError::BadRequest("batch has no events".to_string()));
        }
        if req.events.len() > self.settings.max_batch_events {
            return Err(ProtocolError::BadRequest(format!(
                "batch of {} events exceeds the limit of {}",
                req.events.len(),
                self.settings.max_batch_events
            )));
        }

        let store = self.pipeline.store();
        let guard = self
            .pipeline
            .locks()
            .acquire(&session_key(&collector.id, &req.session_id))
            .await;

        let dedup_started = Instant::now();
        let stored = store.get_session(&collector.id, &req.session_id).await?;
        let state = stored
            .clone()
            .unwrap_or_else(|| CollectorSession::fresh(&collector.id, &req.session_id));

        let behind: Vec<i64> = req
            .events
            .iter()
            .map(|e| e.sequence)
            .filter(|s| *s < state.expected_sequence)
            .collect();
        let recorded: HashMap<_, _> = store
            .recorded_events(&collector.id, &req.session_id, &behind)
            .await?
            .into_iter()
            .map(|r| (r.sequence, r))
            .collect();
        let mut hashes: Vec<String> = req.events.iter().map(content_hash).collect();
        hashes.sort();
        hashes.dedup();
        let known = store
            .known_event_hashes(&collector.id, &req.session_id, &hashes)
            .await?;

        let plan = plan_batch(&state, &req.events, &recorded, &known)?;
        let dedup_ms = dedup_started.elapsed().as_millis() as i64;

        let (accepted, duplicates, retransmitted) =
            (plan.accepted.len(), plan.duplicates, plan.retransmitted);
        let consumed = plan.consumed();
        let session = plan.session.clone();

        let job = self
            .pipeline
            .ingest_events(
                &guard,
                EventBatch {
                    collector_id: collector.id.clone(),
                    session_id: req.session_id.clone(),
                    stored: stored.clone(),
                    plan,
                    received_at,
                    dedup_ms,
                },
            )
            .await?;
        drop(guard);

        if job.status == JobStatus::Failed {
            return Err(ProtocolError::Internal(anyhow::anyhow!(
                "{}",
                job.error.unwrap_or_else(|| "ingestion failed".to_string())
            )));
        }

        let now = Utc::now();
        store
            .touch_collector(&collector.id, now, (consumed > 0).then_some(now))
            .await?;

        // Pure retransmissions leave the stored session as it was.
        let effective = if consumed > 0 { Some(session) } else { stored };
        Ok(SubmitResponse {
            session_id: req.session_id,
            accepted,
            duplicates,
            retransmitted,
            last_sequence: effective.as_ref().map(|s| s.last_sequence()).unwrap_or(0),
            complete: effective.as_ref().map(|s| s.complete).unwrap_or(false),
            conversation_id: effective.map(|s| s.conversation_id),
            job_id: Some(job.id),
        })
    }

    /// Resumption query: last accepted sequence of a session.
    pub async fn session_status(
        &self,
        collector: &Collector,
        session_id: &str,
    ) -> Result<SessionStatus, ProtocolError> {
        let session = self
            .pipeline
            .store()
            .get_session(&collector.id, session_id)
            .await?;
        Ok(SessionStatus {
            session_id: session_id.to_string(),
            last_sequence: session.as_ref().map(|s| s.last_sequence()).unwrap_or(0),
            complete: session.as_ref().map(|s| s.complete).unwrap_or(false),
            conversation_id: session.map(|s| s.conversation_id),
        })
    }

    /// Status of the authenticated collector itself.
    pub async fn status(
        &self,
        collector: &Collector,
        id: &str,
    ) -> Result<CollectorStatus, ProtocolError> {
        if collector.id != id {
            return Err(ProtocolError::NotFound(format!("collector {} not found", id)));
        }
        let current = self
            .pipeline
            .store()
            .get_collector(id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("collector {} not found", id)))?;
        Ok(status_of(&current))
    }

    /// Record that the collector is alive.
    pub async fn heartbeat(
        &self,
        collector: &Collector,
        id: &str,
    ) -> Result<CollectorStatus, ProtocolError> {
        if collector.id != id {
            return Err(ProtocolError::NotFound(format!("collector {} not found", id)));
        }
        self.pipeline
            .store()
            .touch_collector(id, Utc::now(), None)
            .await?;
        tracing::debug!(collector_id = %id, "heartbeat");
        self.status(collector, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestSettings;
    use crate::models::{Event, EventType};
    use crate::parsers::ParserRegistry;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> CollectorService {
        let store = Arc::new(InMemoryStore::new());
        let pipeline =
            IngestionPipeline::new(store, ParserRegistry::with_builtins(), IngestSettings::default());
        CollectorService::new(pipeline, CollectorSettings::default())
    }

    fn register_req() -> RegisterRequest {
        RegisterRequest {
            workspace_id: "W".to_string(),
            collector_type: "claude-code".to_string(),
            version: "1.0.0".to_string(),
            hostname: "devbox".to_string(),
        }
    }

    fn event(seq: i64, event_type: EventType, payload: serde_json::Value, hash: Option<&str>) -> Event {
        Event {
            event_type,
            sequence: seq,
            content_hash: hash.map(String::from),
            payload,
            timestamp: None,
        }
    }

    fn submit(session: &str, events: Vec<Event>) -> SubmitRequest {
        SubmitRequest {
            session_id: session.to_string(),
            workspace_id: None,
            events,
        }
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let svc = service();
        let reg = svc.register(register_req()).await.unwrap();
        assert!(reg.api_key.starts_with("cik_"));

        let collector = svc.authenticate(&reg.api_key).await.unwrap();
        assert_eq!(collector.id, reg.collector_id);
        assert_ne!(collector.key_hash, reg.api_key);

        let tampered = format!("{}x", reg.api_key);
        assert!(matches!(
            svc.authenticate(&tampered).await,
            Err(ProtocolError::Unauthorized)
        ));
        assert!(matches!(
            svc.authenticate("not-a-key").await,
            Err(ProtocolError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_submit_and_retransmit() {
        let svc = service();
        let reg = svc.register(register_req()).await.unwrap();
        let collector = svc.authenticate(&reg.api_key).await.unwrap();

        let first = svc
            .submit(
                &collector,
                submit(
                    "S",
                    vec![
                        event(1, EventType::SessionStart, json!({"title": "demo"}), None),
                        event(2, EventType::Message, json!({"role": "user", "content": "hi"}), Some("h1")),
                    ],
                ),
            )
            .await
            .unwrap();
        assert_eq!(first.last_sequence, 2);
        assert_eq!(first.accepted, 2);

        let status = svc.session_status(&collector, "S").await.unwrap();
        assert_eq!(status.last_sequence, 2);

        let again = svc
            .submit(
                &collector,
                submit(
                    "S",
                    vec![event(2, EventType::Message, json!({"role": "user", "content": "hi"}), Some("h1"))],
                ),
            )
            .await
            .unwrap();
        assert_eq!(again.accepted, 0);
        assert_eq!(again.retransmitted, 1);
        assert_eq!(again.last_sequence, 2);

        let conv_id = first.conversation_id.unwrap();
        let msgs = svc.pipeline().store().list_messages(&conv_id).await.unwrap();
        assert_eq!(msgs.len(), 1);

        let job = svc
            .pipeline()
            .store()
            .get_job(again.job_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Duplicate);
    }

    #[tokio::test]
    async fn test_rejections() {
        let svc = service();
        let reg = svc.register(register_req()).await.unwrap();
        let collector = svc.authenticate(&reg.api_key).await.unwrap();

        let mut wrong_ws = submit("S", vec![event(1, EventType::SessionStart, json!({}), None)]);
        wrong_ws.workspace_id = Some("other".to_string());
        assert!(matches!(
            svc.submit(&collector, wrong_ws).await,
            Err(ProtocolError::WorkspaceMismatch(_))
        ));

        let gap = submit(
            "S",
            vec![
                event(1, EventType::SessionStart, json!({}), None),
                event(3, EventType::Message, json!({"content": "x"}), None),
            ],
        );
        assert!(matches!(
            svc.submit(&collector, gap).await,
            Err(ProtocolError::SequenceGap { expected: 2, received: 3 })
        ));
        // Nothing from the rejected batch was applied.
        assert_eq!(svc.session_status(&collector, "S").await.unwrap().last_sequence, 0);

        let oversized = submit(
            "S",
            (1..=501)
                .map(|i| event(i, EventType::Message, json!({"content": i}), None))
                .collect(),
        );
        assert!(matches!(
            svc.submit(&collector, oversized).await,
            Err(ProtocolError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_seen() {
        let svc = service();
        let reg = svc.register(register_req()).await.unwrap();
        let collector = svc.authenticate(&reg.api_key).await.unwrap();
        assert!(collector.last_seen_at.is_none());
        let status = svc.heartbeat(&collector, &reg.collector_id).await.unwrap();
        assert!(status.last_seen_at.is_some());
        assert!(matches!(
            svc.heartbeat(&collector, "someone-else").await,
            Err(ProtocolError::NotFound(_))
        ));
    }
}
