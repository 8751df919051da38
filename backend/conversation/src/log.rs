//! Append-only conversation log persisted to disk.
//!
//! One self-describing JSON record per line. Appends serialize through a
//! single writer path; each entry is written as one complete flushed line,
//! and replay truncates at the last well-formed record, so a partially
//! written entry is never visible after a crash.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use valet_core::{ConversationEntry, MessageContext, Role, ValetError};

struct LogInner {
    writer: Option<File>,
    next_sequence: u64,
}

pub struct ConversationLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl ConversationLog {
    /// Open (or create) the log at `path`, recovering the next sequence id
    /// from existing entries.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ValetError> {
        let path = path.into();
        ensure_parent_dir(&path).await?;

        let existing = read_entries(&path).await?;
        let next_sequence = existing.last().map(|e| e.sequence + 1).unwrap_or(1);

        let writer = open_append(&path).await?;
        debug!(path = %path.display(), next_sequence, "Conversation log opened");

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                writer: Some(writer),
                next_sequence,
            }),
        })
    }

    /// Append one entry. This is the single serialization point for turn
    /// ordering: entries land in the order appends are accepted.
    pub async fn append(
        &self,
        role: Role,
        content: impl Into<String>,
        context: Option<MessageContext>,
    ) -> Result<ConversationEntry, ValetError> {
        let content = content.into();
        let mut inner = self.inner.lock().await;

        let entry = ConversationEntry {
            sequence: inner.next_sequence,
            role,
            content,
            timestamp: Utc::now(),
            context,
        };

        let mut line = serde_json::to_string(&entry)
            .map_err(|e| ValetError::persistence("append", format!("serialize entry: {e}")))?;
        line.push('\n');

        let writer = match inner.writer.as_mut() {
            Some(writer) => writer,
            None => {
                // Re-open after a clear raced with us.
                let file = open_append(&self.path).await?;
                inner.writer = Some(file);
                inner.writer.as_mut().expect("writer just set")
            }
        };

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ValetError::persistence("append", e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ValetError::persistence("append", e.to_string()))?;

        inner.next_sequence += 1;
        Ok(entry)
    }

    pub async fn record_user(
        &self,
        content: impl Into<String>,
        context: MessageContext,
    ) -> Result<ConversationEntry, ValetError> {
        self.append(Role::User, content, Some(context)).await
    }

    pub async fn record_reply(
        &self,
        content: impl Into<String>,
        context: Option<MessageContext>,
    ) -> Result<ConversationEntry, ValetError> {
        self.append(Role::Agent, content, context).await
    }

    /// Record a status/result message originating from an execution agent.
    pub async fn record_agent_report(
        &self,
        content: impl Into<String>,
    ) -> Result<ConversationEntry, ValetError> {
        self.append(Role::Agent, content, None).await
    }

    /// Record a trigger-originated result.
    pub async fn record_trigger_report(
        &self,
        content: impl Into<String>,
    ) -> Result<ConversationEntry, ValetError> {
        self.append(Role::Trigger, content, None).await
    }

    /// Record an orchestration marker that must not reach user-facing
    /// history (duplicate suppression, scheduling anomalies).
    pub async fn record_noop(
        &self,
        reason: impl Into<String>,
    ) -> Result<ConversationEntry, ValetError> {
        self.append(Role::System, reason, None).await
    }

    /// Replay all entries in append order.
    pub async fn replay(&self) -> Result<Vec<ConversationEntry>, ValetError> {
        self.replay_from(0).await
    }

    /// Replay entries with sequence id strictly greater than `after`,
    /// allowing a reader to restart from where it left off.
    pub async fn replay_from(&self, after: u64) -> Result<Vec<ConversationEntry>, ValetError> {
        let _guard = self.inner.lock().await;
        let entries = read_entries(&self.path).await?;
        Ok(entries.into_iter().filter(|e| e.sequence > after).collect())
    }

    /// The most recent `limit` entries, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ConversationEntry>, ValetError> {
        let mut entries = self.replay().await?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// User-facing history: orchestration markers hidden.
    pub async fn to_chat_history(&self) -> Result<Vec<ConversationEntry>, ValetError> {
        let entries = self.replay().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.role != Role::System)
            .collect())
    }

    /// Remove all entries. The live file is renamed aside before unlinking
    /// so an append path held open by another process keeps writing to the
    /// old inode instead of corrupting the fresh file.
    pub async fn clear(&self) -> Result<(), ValetError> {
        let mut inner = self.inner.lock().await;
        inner.writer = None;

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let aside = self
                .path
                .with_extension(format!("cleared.{}", Utc::now().timestamp_millis()));
            tokio::fs::rename(&self.path, &aside)
                .await
                .map_err(|e| ValetError::persistence("clear", e.to_string()))?;
            if let Err(e) = tokio::fs::remove_file(&aside).await {
                warn!(error = %e, path = %aside.display(), "Failed to remove cleared log file");
            }
        }

        let writer = open_append(&self.path).await?;
        inner.writer = Some(writer);
        inner.next_sequence = 1;
        info!(path = %self.path.display(), "Conversation log cleared");
        Ok(())
    }
}

async fn ensure_parent_dir(path: &Path) -> Result<(), ValetError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ValetError::persistence("open", e.to_string()))?;
    }
    Ok(())
}

async fn open_append(path: &Path) -> Result<File, ValetError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| ValetError::persistence("open", e.to_string()))
}

/// Parse the log file, stopping at the first malformed record. A torn
/// trailing line from an unclean shutdown truncates the replay instead of
/// failing it.
async fn read_entries(path: &Path) -> Result<Vec<ConversationEntry>, ValetError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ValetError::persistence("read", e.to_string())),
    };

    let mut entries = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ConversationEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Truncating replay at malformed log record"
                );
                break;
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_log() -> (tempfile::TempDir, ConversationLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::open(dir.path().join("conversation.log"))
            .await
            .unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn replay_preserves_append_order_with_gap_free_ids() {
        let (_dir, log) = temp_log().await;
        for i in 0..5 {
            log.append(Role::User, format!("message {i}"), None)
                .await
                .unwrap();
        }
        let entries = log.replay().await.unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
            assert_eq!(entry.content, format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.log");
        {
            let log = ConversationLog::open(&path).await.unwrap();
            log.append(Role::User, "first", None).await.unwrap();
            log.append(Role::Agent, "second", None).await.unwrap();
        }
        let log = ConversationLog::open(&path).await.unwrap();
        let entry = log.append(Role::User, "third", None).await.unwrap();
        assert_eq!(entry.sequence, 3);
    }

    #[tokio::test]
    async fn torn_trailing_line_truncates_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.log");
        {
            let log = ConversationLog::open(&path).await.unwrap();
            log.append(Role::User, "kept", None).await.unwrap();
        }
        // Simulate a crash mid-append: partial JSON with no newline.
        let mut raw = tokio::fs::read_to_string(&path).await.unwrap();
        raw.push_str("{\"sequence\":2,\"role\":\"agent\",\"cont");
        tokio::fs::write(&path, raw).await.unwrap();

        let log = ConversationLog::open(&path).await.unwrap();
        let entries = log.replay().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "kept");

        // The recovered writer continues the gap-free sequence.
        let entry = log.append(Role::Agent, "after crash", None).await.unwrap();
        assert_eq!(entry.sequence, 2);
    }

    #[tokio::test]
    async fn replay_from_is_restartable() {
        let (_dir, log) = temp_log().await;
        for i in 0..4 {
            log.append(Role::User, format!("m{i}"), None).await.unwrap();
        }
        let tail = log.replay_from(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 3);
    }

    #[tokio::test]
    async fn chat_history_hides_orchestration_markers() {
        let (_dir, log) = temp_log().await;
        log.record_user("hello", MessageContext::new("console"))
            .await
            .unwrap();
        log.record_noop("suppressed duplicate agent reply")
            .await
            .unwrap();
        log.record_reply("hi there", None).await.unwrap();

        let history = log.to_chat_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.role != Role::System));

        // The marker is still durable in the raw replay.
        assert_eq!(log.replay().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn clear_resets_and_does_not_break_concurrent_appends() {
        let (_dir, log) = temp_log().await;
        let log = std::sync::Arc::new(log);
        for i in 0..3 {
            log.append(Role::User, format!("m{i}"), None).await.unwrap();
        }

        let appender = {
            let log = log.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    log.append(Role::Agent, format!("concurrent {i}"), None)
                        .await
                        .unwrap();
                }
            })
        };
        log.clear().await.unwrap();
        appender.await.unwrap();

        // Whatever landed after the clear still forms a gap-free sequence.
        let entries = log.replay().await.unwrap();
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
    }
}
