//! In-memory [`Store`] implementation for tests.
//!
//! All tables live in one `State` behind a `std::sync::RwLock`. `persist`
//! validates the whole batch before touching anything and holds the write
//! lock throughout, which gives it the same all-or-nothing behaviour as the
//! SQLite transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobFilter, PersistAction, PersistBatch, Store};
use crate::models::{
    Collector, CollectorSession, ConversationRecord, FileChange, IngestionJob, JobStatus,
    MessageRecord, ParseCheckpoint, RecordedEvent, WatchConfiguration,
};

type SessionKey = (String, String);

#[derive(Default)]
struct State {
    conversations: HashMap<String, ConversationRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
    file_changes: HashMap<String, Vec<FileChange>>,
    checkpoints: HashMap<PathBuf, ParseCheckpoint>,
    jobs: Vec<IngestionJob>,
    watch_configs: HashMap<String, WatchConfiguration>,
    collectors: HashMap<String, Collector>,
    sessions: HashMap<SessionKey, CollectorSession>,
    events: HashMap<SessionKey, BTreeMap<i64, RecordedEvent>>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    failing_persists: AtomicUsize,
    failing_checkpoint_loads: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `persist` fail without touching state.
    pub fn fail_next_persists(&self, n: usize) {
        self.failing_persists.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `load_checkpoint` fail.
    pub fn fail_next_checkpoint_loads(&self, n: usize) {
        self.failing_checkpoint_loads.store(n, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn session_key(collector_id: &str, session_id: &str) -> SessionKey {
    (collector_id.to_string(), session_id.to_string())
}

impl State {
    fn check(&self, batch: &PersistBatch) -> Result<()> {
        match &batch.action {
            PersistAction::Create(header) => {
                if self.conversations.contains_key(&header.id) {
                    bail!("conversation {} already exists", header.id);
                }
                if self
                    .conversations
                    .values()
                    .any(|c| c.source == header.source && c.external_id == header.external_id)
                {
                    bail!(
                        "conversation {}/{} already exists",
                        header.source,
                        header.external_id
                    );
                }
            }
            PersistAction::Replace(header) => {
                if !self.conversations.contains_key(&header.id) {
                    bail!("conversation {} not found", header.id);
                }
            }
            PersistAction::Append { conversation_id } => {
                if !self.conversations.contains_key(conversation_id) {
                    bail!("conversation {} not found", conversation_id);
                }
                let existing: HashSet<i64> = self
                    .messages
                    .get(conversation_id)
                    .map(|m| m.iter().map(|m| m.index).collect())
                    .unwrap_or_default();
                if let Some(m) = batch.messages.iter().find(|m| existing.contains(&m.index)) {
                    bail!(
                        "message {} already stored for conversation {}",
                        m.index,
                        conversation_id
                    );
                }
            }
        }
        if let Some(update) = &batch.session {
            let key = session_key(&update.session.collector_id, &update.session.session_id);
            if let Some(events) = self.events.get(&key) {
                if let Some(e) = update.events.iter().find(|e| events.contains_key(&e.sequence)) {
                    bail!("event {} already recorded", e.sequence);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_conversation(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let state = self.read()?;
        Ok(state
            .conversations
            .values()
            .find(|c| c.source == source && c.external_id == external_id)
            .cloned())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.read()?.conversations.get(id).cloned())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let state = self.read()?;
        let mut msgs = state.messages.get(conversation_id).cloned().unwrap_or_default();
        msgs.sort_by_key(|m| m.index);
        Ok(msgs)
    }

    async fn list_file_changes(&self, conversation_id: &str) -> Result<Vec<FileChange>> {
        let state = self.read()?;
        Ok(state
            .file_changes
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist(&self, batch: PersistBatch) -> Result<String> {
        if take_failure(&self.failing_persists) {
            bail!("simulated persist failure");
        }
        let mut state = self.write()?;
        state.check(&batch)?;

        let now = Utc::now();
        let conv_id = batch.action.conversation_id().to_string();
        let new_messages = batch.messages.iter().map(|m| MessageRecord {
            conversation_id: conv_id.clone(),
            index: m.index,
            role: m.role.clone(),
            content: m.content.clone(),
            timestamp: m.timestamp,
        });

        match &batch.action {
            PersistAction::Create(header) | PersistAction::Replace(header) => {
                let created_at = state
                    .conversations
                    .get(&header.id)
                    .map(|c| c.created_at)
                    .unwrap_or(now);
                state.conversations.insert(
                    header.id.clone(),
                    ConversationRecord {
                        id: header.id.clone(),
                        source: header.source.clone(),
                        external_id: header.external_id.clone(),
                        title: header.title.clone(),
                        project_path: header.project_path.clone(),
                        message_count: batch.messages.len() as i64,
                        fingerprint: batch.fingerprint.clone(),
                        needs_tagging: header.needs_tagging,
                        created_at,
                        updated_at: now,
                    },
                );
                state.messages.insert(conv_id.clone(), new_messages.collect());
                state
                    .file_changes
                    .insert(conv_id.clone(), batch.file_changes.clone());
            }
            PersistAction::Append { .. } => {
                state
                    .messages
                    .entry(conv_id.clone())
                    .or_default()
                    .extend(new_messages);
                state
                    .file_changes
                    .entry(conv_id.clone())
                    .or_default()
                    .extend(batch.file_changes.iter().cloned());
                if let Some(conv) = state.conversations.get_mut(&conv_id) {
                    conv.message_count += batch.messages.len() as i64;
                    conv.fingerprint = batch.fingerprint.clone();
                    conv.updated_at = now;
                }
            }
        }

        if let Some(cp) = &batch.checkpoint {
            state.checkpoints.insert(cp.path.clone(), cp.clone());
        }
        if let Some(update) = batch.session {
            let key = session_key(&update.session.collector_id, &update.session.session_id);
            let recorded = state.events.entry(key.clone()).or_default();
            for e in update.events {
                recorded.insert(e.sequence, e);
            }
            state.sessions.insert(key, update.session);
        }
        Ok(conv_id)
    }

    async fn load_checkpoint(&self, path: &Path) -> Result<Option<ParseCheckpoint>> {
        if take_failure(&self.failing_checkpoint_loads) {
            bail!("simulated checkpoint read failure");
        }
        Ok(self.read()?.checkpoints.get(path).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &ParseCheckpoint) -> Result<()> {
        self.write()?
            .checkpoints
            .insert(checkpoint.path.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<ParseCheckpoint>> {
        Ok(self.read()?.checkpoints.values().cloned().collect())
    }

    async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
        let mut state = self.write()?;
        if state.jobs.iter().any(|j| j.id == job.id) {
            bail!("job {} already exists", job.id);
        }
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &IngestionJob) -> Result<()> {
        let mut state = self.write()?;
        let stored = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| anyhow!("job {} not found", job.id))?;
        if stored.status.is_terminal() {
            bail!("job {} is already {}", job.id, stored.status);
        }
        *stored = job.clone();
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<IngestionJob>> {
        Ok(self.read()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        let state = self.read()?;
        let mut jobs: Vec<IngestionJob> = state
            .jobs
            .iter()
            .rev()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| {
                filter
                    .watch_config_id
                    .as_deref()
                    .map_or(true, |id| j.watch_config_id.as_deref() == Some(id))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn insert_watch_config(&self, config: &WatchConfiguration) -> Result<()> {
        let mut state = self.write()?;
        if state.watch_configs.values().any(|c| c.path == config.path) {
            bail!("path {} is already watched", config.path.display());
        }
        state
            .watch_configs
            .insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_watch_config(&self, id: &str) -> Result<Option<WatchConfiguration>> {
        Ok(self.read()?.watch_configs.get(id).cloned())
    }

    async fn list_watch_configs(&self) -> Result<Vec<WatchConfiguration>> {
        let mut configs: Vec<_> = self.read()?.watch_configs.values().cloned().collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(configs)
    }

    async fn set_watch_active(&self, id: &str, active: bool, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        let cfg = state
            .watch_configs
            .get_mut(id)
            .ok_or_else(|| anyhow!("watch configuration {} not found", id))?;
        cfg.active = active;
        if active {
            cfg.last_started_at = Some(at);
        } else {
            cfg.last_stopped_at = Some(at);
        }
        Ok(())
    }

    async fn record_watch_error(&self, id: &str, message: &str) -> Result<()> {
        let mut state = self.write()?;
        if let Some(cfg) = state.watch_configs.get_mut(id) {
            cfg.error_count += 1;
            cfg.last_error = Some(message.to_string());
        }
        Ok(())
    }

    async fn record_watch_job(
        &self,
        id: &str,
        status: JobStatus,
        messages_added: i64,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(cfg) = state.watch_configs.get_mut(id) {
            match status {
                JobStatus::Success => {
                    cfg.files_ingested += 1;
                    cfg.messages_ingested += messages_added;
                }
                JobStatus::Failed => cfg.error_count += 1,
                _ => {}
            }
        }
        Ok(())
    }

    async fn delete_watch_config(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        match state.watch_configs.get(id) {
            Some(cfg) if !cfg.active => {
                state.watch_configs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_collector(&self, collector: &Collector) -> Result<()> {
        let mut state = self.write()?;
        if state.collectors.contains_key(&collector.id) {
            bail!("collector {} already exists", collector.id);
        }
        state
            .collectors
            .insert(collector.id.clone(), collector.clone());
        Ok(())
    }

    async fn get_collector(&self, id: &str) -> Result<Option<Collector>> {
        Ok(self.read()?.collectors.get(id).cloned())
    }

    async fn touch_collector(
        &self,
        id: &str,
        seen_at: DateTime<Utc>,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(c) = state.collectors.get_mut(id) {
            c.last_seen_at = Some(seen_at);
            if event_at.is_some() {
                c.last_event_at = event_at;
            }
        }
        Ok(())
    }

    async fn get_session(
        &self,
        collector_id: &str,
        session_id: &str,
    ) -> Result<Option<CollectorSession>> {
        Ok(self
            .read()?
            .sessions
            .get(&session_key(collector_id, session_id))
            .cloned())
    }

    async fn recorded_events(
        &self,
        collector_id: &str,
        session_id: &str,
        sequences: &[i64],
    ) -> Result<Vec<RecordedEvent>> {
        let state = self.read()?;
        let Some(events) = state.events.get(&session_key(collector_id, session_id)) else {
            return Ok(Vec::new());
        };
        Ok(sequences
            .iter()
            .filter_map(|s| events.get(s).cloned())
            .collect())
    }

    async fn known_event_hashes(
        &self,
        collector_id: &str,
        session_id: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>> {
        let state = self.read()?;
        let Some(events) = state.events.get(&session_key(collector_id, session_id)) else {
            return Ok(HashSet::new());
        };
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        Ok(events
            .values()
            .filter(|e| wanted.contains(e.content_hash.as_str()))
            .map(|e| e.content_hash.clone())
            .collect())
    }
}
