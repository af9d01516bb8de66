//! Persisted message store: the record of truth for every message.
//!
//! Writes are partial patches guarded by the terminal status rule: once a
//! message is terminal, content patches are dropped with
//! [`PatchOutcome::IgnoredTerminal`] instead of failing. A patch carrying
//! `expected_stream_id` only lands while the record still names that stream.
//! Readers can subscribe to a live view of one message.

use crate::db::DbPool;
use crate::types::{
    ChatwireError, Message, MessageId, MessagePatch, MessageStatus, PatchOutcome, Result, Role,
    StreamId, ThreadId,
};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates the message, or replaces it wholesale when the id already
    /// exists (regeneration reuses the response id).
    async fn upsert(&self, message: Message) -> Result<()>;

    async fn get(&self, id: &MessageId) -> Result<Option<Message>>;

    async fn patch(&self, id: &MessageId, patch: MessagePatch) -> Result<PatchOutcome>;

    /// Live view of one message. The receiver holds the latest known record.
    async fn subscribe(&self, id: &MessageId) -> Result<watch::Receiver<Option<Message>>>;

    async fn ping(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Applies `patch` in place, honoring the terminal guard.
pub fn apply_patch(message: &mut Message, patch: MessagePatch, now: i64) -> PatchOutcome {
    if message.status.is_terminal() {
        if patch.is_metadata_only() {
            message.provider_metadata = patch.provider_metadata;
            message.updated_at = now;
            return PatchOutcome::Applied;
        }
        return PatchOutcome::IgnoredTerminal;
    }
    if let Some(expected) = &patch.expected_stream_id {
        if message.resumable_stream_id.as_ref() != Some(expected) {
            return PatchOutcome::IgnoredSuperseded;
        }
    }
    if let Some(parts) = patch.parts {
        message.parts = parts;
    }
    if let Some(status) = patch.status {
        message.status = status;
    }
    if let Some(err) = patch.server_error {
        message.server_error = Some(err);
    }
    if let Some(meta) = patch.provider_metadata {
        message.provider_metadata = Some(meta);
    }
    if let Some(stream_id) = patch.resumable_stream_id {
        message.resumable_stream_id = stream_id;
    }
    message.updated_at = now;
    PatchOutcome::Applied
}

#[derive(Default)]
struct Watchers {
    senders: Mutex<HashMap<MessageId, watch::Sender<Option<Message>>>>,
}

impl Watchers {
    fn subscribe(&self, id: &MessageId) -> watch::Receiver<Option<Message>> {
        let mut senders = lock(&self.senders);
        match senders.get(id) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(None);
                senders.insert(id.clone(), tx);
                rx
            }
        }
    }

    fn is_watched(&self, id: &MessageId) -> bool {
        lock(&self.senders)
            .get(id)
            .map(|tx| tx.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Publishes `message` unless the channel already holds a newer copy.
    fn publish(&self, message: &Message) {
        let mut senders = lock(&self.senders);
        senders.retain(|_, tx| tx.receiver_count() > 0);
        if let Some(tx) = senders.get(&message.message_id) {
            tx.send_if_modified(|current| {
                let stale = match current {
                    Some(existing) => existing.updated_at <= message.updated_at,
                    None => true,
                };
                if stale {
                    *current = Some(message.clone());
                }
                stale
            });
        }
    }
}

pub struct SqliteMessageStore {
    pool: DbPool,
    watchers: Watchers,
}

const TERMINAL_STATUSES_SQL: &str = "('done', 'error', 'cancelled', 'rejected', 'deleted')";

impl SqliteMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            watchers: Watchers::default(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn fetch(&self, id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT message_id, thread_id, role, status, parts_json, model, server_error_json, \
             provider_metadata_json, resumable_stream_id, created_at, updated_at \
             FROM messages WHERE message_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_message(&r)?)),
            None => Ok(None),
        }
    }

    async fn notify(&self, id: &MessageId) -> Result<()> {
        if !self.watchers.is_watched(id) {
            return Ok(());
        }
        if let Some(message) = self.fetch(id).await? {
            self.watchers.publish(&message);
        }
        Ok(())
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let parts_json: String = row.try_get("parts_json")?;
    let server_error_json: Option<String> = row.try_get("server_error_json")?;
    let metadata_json: Option<String> = row.try_get("provider_metadata_json")?;
    let stream_id: Option<String> = row.try_get("resumable_stream_id")?;

    Ok(Message {
        message_id: MessageId(row.try_get("message_id")?),
        thread_id: ThreadId(row.try_get("thread_id")?),
        role: role.parse::<Role>()?,
        status: status.parse::<MessageStatus>()?,
        parts: serde_json::from_str(&parts_json)?,
        model: row.try_get("model")?,
        server_error: match server_error_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
        provider_metadata: match metadata_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
        resumable_stream_id: stream_id.map(StreamId),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn upsert(&self, message: Message) -> Result<()> {
        let parts_json = serde_json::to_string(&message.parts)?;
        let server_error_json = match &message.server_error {
            Some(e) => Some(serde_json::to_string(e)?),
            None => None,
        };
        let metadata_json = match &message.provider_metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO messages (message_id, thread_id, role, status, parts_json, model, \
             server_error_json, provider_metadata_json, resumable_stream_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(message_id) DO UPDATE SET \
             thread_id = excluded.thread_id, role = excluded.role, status = excluded.status, \
             parts_json = excluded.parts_json, model = excluded.model, \
             server_error_json = excluded.server_error_json, \
             provider_metadata_json = excluded.provider_metadata_json, \
             resumable_stream_id = excluded.resumable_stream_id, \
             updated_at = excluded.updated_at",
        )
        .bind(message.message_id.as_str())
        .bind(message.thread_id.as_str())
        .bind(message.role.as_str())
        .bind(message.status.as_str())
        .bind(parts_json)
        .bind(&message.model)
        .bind(server_error_json)
        .bind(metadata_json)
        .bind(message.resumable_stream_id.as_ref().map(|s| s.0.clone()))
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        self.notify(&message.message_id).await
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        self.fetch(id).await
    }

    async fn patch(&self, id: &MessageId, patch: MessagePatch) -> Result<PatchOutcome> {
        let now = chrono::Utc::now().timestamp_millis();

        if patch.is_metadata_only() {
            let metadata_json = match &patch.provider_metadata {
                Some(m) => Some(serde_json::to_string(m)?),
                None => None,
            };
            let updated = sqlx::query(
                "UPDATE messages SET provider_metadata_json = ?, updated_at = ? WHERE message_id = ?",
            )
            .bind(metadata_json)
            .bind(now)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(ChatwireError::NotFound(format!("message {}", id)).into());
            }
            self.notify(id).await?;
            return Ok(PatchOutcome::Applied);
        }

        let parts_json = match &patch.parts {
            Some(parts) => Some(serde_json::to_string(parts)?),
            None => None,
        };
        let server_error_json = match &patch.server_error {
            Some(e) => Some(serde_json::to_string(e)?),
            None => None,
        };
        let metadata_json = match &patch.provider_metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        let (set_stream_id, stream_id) = match &patch.resumable_stream_id {
            Some(value) => (true, value.as_ref().map(|s| s.0.clone())),
            None => (false, None),
        };

        // The status and ownership guards live in the WHERE clause so the check
        // and the write are one statement.
        let sql = format!(
            "UPDATE messages SET \
             parts_json = COALESCE(?, parts_json), \
             status = COALESCE(?, status), \
             server_error_json = COALESCE(?, server_error_json), \
             provider_metadata_json = COALESCE(?, provider_metadata_json), \
             resumable_stream_id = CASE WHEN ? THEN ? ELSE resumable_stream_id END, \
             updated_at = ? \
             WHERE message_id = ? AND status NOT IN {} \
             AND (? IS NULL OR resumable_stream_id = ?)",
            TERMINAL_STATUSES_SQL
        );
        let expected = patch.expected_stream_id.as_ref().map(|s| s.as_str());
        let updated = sqlx::query(&sql)
            .bind(parts_json)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(server_error_json)
            .bind(metadata_json)
            .bind(set_stream_id)
            .bind(stream_id)
            .bind(now)
            .bind(id.as_str())
            .bind(expected)
            .bind(expected)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT status FROM messages WHERE message_id = ?")
                    .bind(id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some((status,)) => {
                    tracing::debug!(
                        "[⚙️  -> 💾] Dropped late write to {} message {}",
                        status,
                        id.short()
                    );
                    let terminal = status
                        .parse::<MessageStatus>()
                        .map(|s| s.is_terminal())
                        .unwrap_or(false);
                    if terminal {
                        Ok(PatchOutcome::IgnoredTerminal)
                    } else {
                        Ok(PatchOutcome::IgnoredSuperseded)
                    }
                }
                None => Err(ChatwireError::NotFound(format!("message {}", id)).into()),
            };
        }

        self.notify(id).await?;
        Ok(PatchOutcome::Applied)
    }

    async fn subscribe(&self, id: &MessageId) -> Result<watch::Receiver<Option<Message>>> {
        // Register before reading so a write landing in between is not missed.
        let rx = self.watchers.subscribe(id);
        if let Some(current) = self.fetch(id).await? {
            self.watchers.publish(&current);
        }
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process store, used by tests and single-process demos.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<MessageId, Message>>,
    watchers: Watchers,
    write_delay: Duration,
    patch_calls: AtomicUsize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every patch sleeps this long before applying, simulating a slow backend.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: delay,
            ..Self::default()
        }
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn upsert(&self, message: Message) -> Result<()> {
        lock(&self.messages).insert(message.message_id.clone(), message.clone());
        self.watchers.publish(&message);
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(lock(&self.messages).get(id).cloned())
    }

    async fn patch(&self, id: &MessageId, patch: MessagePatch) -> Result<PatchOutcome> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let (outcome, snapshot) = {
            let mut messages = lock(&self.messages);
            let message = match messages.get_mut(id) {
                Some(m) => m,
                None => return Err(ChatwireError::NotFound(format!("message {}", id)).into()),
            };
            let outcome = apply_patch(message, patch, now);
            (outcome, message.clone())
        };
        if outcome == PatchOutcome::Applied {
            self.watchers.publish(&snapshot);
        }
        Ok(outcome)
    }

    async fn subscribe(&self, id: &MessageId) -> Result<watch::Receiver<Option<Message>>> {
        let rx = self.watchers.subscribe(id);
        let current = lock(&self.messages).get(id).cloned();
        if let Some(current) = current {
            self.watchers.publish(&current);
        }
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessagePart, ServerError, ServerErrorKind};

    fn assistant(id: &str) -> Message {
        Message::new(
            MessageId::from(id),
            ThreadId::from("thread"),
            Role::Assistant,
            MessageStatus::Pending,
            Vec::new(),
            "test-model",
        )
    }

    fn text_patch(text: &str, status: MessageStatus) -> MessagePatch {
        MessagePatch {
            parts: Some(vec![MessagePart::Text { text: text.into() }]),
            status: Some(status),
            ..MessagePatch::default()
        }
    }

    #[tokio::test]
    async fn terminal_guard_drops_late_content() {
        let store = MemoryMessageStore::new();
        let id = MessageId::from("m1");
        if let Err(e) = store.upsert(assistant("m1")).await {
            panic!("upsert failed: {}", e);
        }

        let errored = MessagePatch {
            status: Some(MessageStatus::Error),
            server_error: Some(ServerError {
                kind: ServerErrorKind::Provider,
                message: "boom".into(),
            }),
            ..MessagePatch::default()
        };
        assert!(matches!(
            store.patch(&id, errored).await,
            Ok(PatchOutcome::Applied)
        ));
        assert!(matches!(
            store.patch(&id, text_patch("late", MessageStatus::Done)).await,
            Ok(PatchOutcome::IgnoredTerminal)
        ));

        let message = match store.get(&id).await {
            Ok(Some(m)) => m,
            other => panic!("missing message: {:?}", other.map(|_| ())),
        };
        assert_eq!(message.status, MessageStatus::Error);
        assert!(message.parts.is_empty());
    }

    #[tokio::test]
    async fn metadata_passes_the_guard() {
        let store = MemoryMessageStore::new();
        let id = MessageId::from("m1");
        let _ = store.upsert(assistant("m1")).await;
        let _ = store.patch(&id, text_patch("hi", MessageStatus::Done)).await;
        let outcome = store
            .patch(&id, MessagePatch::metadata(serde_json::json!({"tokens": 3})))
            .await;
        assert!(matches!(outcome, Ok(PatchOutcome::Applied)));
        let message = store.get(&id).await.ok().flatten();
        assert_eq!(
            message.and_then(|m| m.provider_metadata),
            Some(serde_json::json!({"tokens": 3}))
        );
    }

    #[tokio::test]
    async fn writes_from_a_replaced_stream_are_dropped() {
        let store = MemoryMessageStore::new();
        let id = MessageId::from("m1");
        let mut regenerated = assistant("m1");
        regenerated.resumable_stream_id = Some(StreamId::from("new"));
        let _ = store.upsert(regenerated).await;

        let mut stale = text_patch("old answer", MessageStatus::Streaming);
        stale.resumable_stream_id = Some(None);
        stale.expected_stream_id = Some(StreamId::from("old"));
        assert!(matches!(
            store.patch(&id, stale).await,
            Ok(PatchOutcome::IgnoredSuperseded)
        ));

        let mut owned = text_patch("new answer", MessageStatus::Streaming);
        owned.expected_stream_id = Some(StreamId::from("new"));
        assert!(matches!(store.patch(&id, owned).await, Ok(PatchOutcome::Applied)));

        let message = store.get(&id).await.ok().flatten();
        assert_eq!(
            message.map(|m| (m.text(), m.resumable_stream_id)),
            Some(("new answer".to_string(), Some(StreamId::from("new"))))
        );
    }

    #[tokio::test]
    async fn subscribers_see_current_and_later_records() {
        let store = MemoryMessageStore::new();
        let id = MessageId::from("m1");
        let _ = store.upsert(assistant("m1")).await;
        let mut rx = match store.subscribe(&id).await {
            Ok(rx) => rx,
            Err(e) => panic!("subscribe failed: {}", e),
        };
        assert_eq!(
            rx.borrow_and_update().as_ref().map(|m| m.status),
            Some(MessageStatus::Pending)
        );
        let _ = store.patch(&id, text_patch("hello", MessageStatus::Streaming)).await;
        assert!(rx.changed().await.is_ok());
        assert_eq!(rx.borrow().as_ref().map(|m| m.text()), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn patching_unknown_message_is_not_found() {
        let store = MemoryMessageStore::new();
        let result = store
            .patch(&MessageId::from("ghost"), text_patch("x", MessageStatus::Streaming))
            .await;
        match result {
            Err(e) => assert!(matches!(e.inner, ChatwireError::NotFound(_))),
            Ok(o) => panic!("expected NotFound, got {:?}", o),
        }
    }
}
