//! Short-term conversation buffer — the last M messages per conversation
//! plus an optional rolling summary.
//!
//! Two interchangeable implementations: an in-process map for single-replica
//! deployments and a KV-backed variant (atomic append-and-trim, TTL on every
//! write) for multi-replica deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::kv::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferedMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ConversationBuffer: Send + Sync {
    async fn append(&self, conversation_id: Uuid, message: BufferedMessage) -> Result<()>;

    /// Messages in append order, oldest first.
    async fn get(&self, conversation_id: Uuid) -> Result<Vec<BufferedMessage>>;

    async fn set_summary(&self, conversation_id: Uuid, summary: String) -> Result<()>;

    async fn get_summary(&self, conversation_id: Uuid) -> Result<Option<String>>;

    /// Drop buffered messages, keep the rolling summary.
    async fn reset(&self, conversation_id: Uuid) -> Result<()>;

    /// Evict conversations idle longer than `idle_for`. Returns evictions.
    async fn cleanup(&self, idle_for: Duration) -> Result<usize>;
}

// ── In-process implementation ──────────────────────────

struct BufferEntry {
    messages: VecDeque<BufferedMessage>,
    summary: Option<String>,
    last_activity: Instant,
}

pub struct InProcessBuffer {
    capacity: usize,
    entries: RwLock<HashMap<Uuid, Arc<tokio::sync::Mutex<BufferEntry>>>>,
}

impl InProcessBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<BufferEntry>> {
        if let Some(entry) = self.entries.read().await.get(&conversation_id) {
            return entry.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(conversation_id)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(BufferEntry {
                    messages: VecDeque::new(),
                    summary: None,
                    last_activity: Instant::now(),
                }))
            })
            .clone()
    }
}

#[async_trait]
impl ConversationBuffer for InProcessBuffer {
    async fn append(&self, conversation_id: Uuid, message: BufferedMessage) -> Result<()> {
        let entry = self.entry(conversation_id).await;
        let mut guard = entry.lock().await;
        guard.messages.push_back(message);
        while guard.messages.len() > self.capacity {
            guard.messages.pop_front();
        }
        guard.last_activity = Instant::now();
        Ok(())
    }

    async fn get(&self, conversation_id: Uuid) -> Result<Vec<BufferedMessage>> {
        if let Some(entry) = self.entries.read().await.get(&conversation_id) {
            let guard = entry.lock().await;
            return Ok(guard.messages.iter().cloned().collect());
        }
        Ok(Vec::new())
    }

    async fn set_summary(&self, conversation_id: Uuid, summary: String) -> Result<()> {
        let entry = self.entry(conversation_id).await;
        let mut guard = entry.lock().await;
        guard.summary = Some(summary);
        guard.last_activity = Instant::now();
        Ok(())
    }

    async fn get_summary(&self, conversation_id: Uuid) -> Result<Option<String>> {
        if let Some(entry) = self.entries.read().await.get(&conversation_id) {
            return Ok(entry.lock().await.summary.clone());
        }
        Ok(None)
    }

    async fn reset(&self, conversation_id: Uuid) -> Result<()> {
        if let Some(entry) = self.entries.read().await.get(&conversation_id) {
            let mut guard = entry.lock().await;
            guard.messages.clear();
            guard.last_activity = Instant::now();
        }
        Ok(())
    }

    async fn cleanup(&self, idle_for: Duration) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let mut keep = HashMap::new();
        for (id, entry) in entries.drain() {
            let idle = entry.lock().await.last_activity.elapsed();
            if idle < idle_for {
                keep.insert(id, entry);
            }
        }
        let evicted = before - keep.len();
        *entries = keep;
        Ok(evicted)
    }
}

// ── KV-backed implementation ───────────────────────────

pub struct KvBuffer {
    kv: Arc<dyn KvStore>,
    capacity: usize,
    ttl: Duration,
}

impl KvBuffer {
    pub fn new(kv: Arc<dyn KvStore>, capacity: usize, ttl: Duration) -> Self {
        Self { kv, capacity, ttl }
    }

    fn messages_key(conversation_id: Uuid) -> String {
        format!("buf:{conversation_id}:messages")
    }

    fn summary_key(conversation_id: Uuid) -> String {
        format!("buf:{conversation_id}:summary")
    }
}

#[async_trait]
impl ConversationBuffer for KvBuffer {
    async fn append(&self, conversation_id: Uuid, message: BufferedMessage) -> Result<()> {
        let encoded = serde_json::to_string(&message)?;
        self.kv
            .list_push_trim(
                &Self::messages_key(conversation_id),
                encoded,
                self.capacity,
                self.ttl,
            )
            .await
    }

    async fn get(&self, conversation_id: Uuid) -> Result<Vec<BufferedMessage>> {
        let raw = self.kv.list_get(&Self::messages_key(conversation_id)).await?;
        let mut messages = Vec::with_capacity(raw.len());
        for line in raw {
            messages.push(serde_json::from_str(&line)?);
        }
        Ok(messages)
    }

    async fn set_summary(&self, conversation_id: Uuid, summary: String) -> Result<()> {
        self.kv
            .set(&Self::summary_key(conversation_id), summary, Some(self.ttl))
            .await
    }

    async fn get_summary(&self, conversation_id: Uuid) -> Result<Option<String>> {
        self.kv.get(&Self::summary_key(conversation_id)).await
    }

    async fn reset(&self, conversation_id: Uuid) -> Result<()> {
        self.kv.delete(&Self::messages_key(conversation_id)).await
    }

    async fn cleanup(&self, _idle_for: Duration) -> Result<usize> {
        // Per-key TTL handles eviction server-side
        Ok(0)
    }
}
