//! Durable SQLite-backed trigger store.
//!
//! Default implementation of the `TriggerStore` interface the scheduler
//! consumes. One row per trigger; the schedule itself is stored as an
//! opaque JSON value so new recurrence kinds need no migration.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use valet_core::{
    NewTrigger, Trigger, TriggerId, TriggerSchedule, TriggerStatus, TriggerStore, ValetError,
};

pub struct SqliteTriggerStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteTriggerStore {
    pub fn open(db_path: &Path) -> Result<Self, ValetError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ValetError::persistence("open trigger store", e.to_string()))?;
        }
        let conn = rusqlite::Connection::open(db_path)
            .map_err(|e| ValetError::persistence("open trigger store", e.to_string()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS triggers (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id       TEXT NOT NULL,
                schedule       TEXT NOT NULL,
                payload        TEXT NOT NULL,
                status         TEXT NOT NULL,
                next_fire_at   TEXT,
                last_fired_at  TEXT,
                failure_count  INTEGER NOT NULL DEFAULT 0,
                last_error     TEXT,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS triggers_status ON triggers(status);
            "#,
        )
        .map_err(|e| ValetError::persistence("init trigger store", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, ValetError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| ValetError::persistence("open trigger store", e.to_string()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS triggers (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id       TEXT NOT NULL,
                schedule       TEXT NOT NULL,
                payload        TEXT NOT NULL,
                status         TEXT NOT NULL,
                next_fire_at   TEXT,
                last_fired_at  TEXT,
                failure_count  INTEGER NOT NULL DEFAULT 0,
                last_error     TEXT,
                created_at     TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| ValetError::persistence("init trigger store", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
    let schedule_json: String = row.get(2)?;
    let schedule: TriggerSchedule = serde_json::from_str(&schedule_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_raw: String = row.get(4)?;
    let status: TriggerStatus = status_raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown status '{status_raw}'").into(),
        )
    })?;

    Ok(Trigger {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        schedule,
        payload: row.get(3)?,
        status,
        next_fire_at: parse_instant(row.get::<_, Option<String>>(5)?),
        last_fired_at: parse_instant(row.get::<_, Option<String>>(6)?),
        failure_count: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        created_at: parse_instant(Some(row.get::<_, String>(9)?)).unwrap_or_else(Utc::now),
    })
}

fn parse_instant(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_instant(instant: &Option<DateTime<Utc>>) -> Option<String> {
    instant.map(|dt| dt.to_rfc3339())
}

const TRIGGER_COLUMNS: &str = "id, agent_id, schedule, payload, status, next_fire_at, \
     last_fired_at, failure_count, last_error, created_at";

#[async_trait]
impl TriggerStore for SqliteTriggerStore {
    async fn create(&self, spec: NewTrigger) -> Result<Trigger, ValetError> {
        let now = Utc::now();
        let next_fire_at = spec.schedule.initial_fire_at(now)?.ok_or_else(|| {
            ValetError::validation("trigger schedule has no future occurrence")
        })?;

        let schedule_json = serde_json::to_string(&spec.schedule)
            .map_err(|e| ValetError::persistence("create trigger", e.to_string()))?;

        let conn = self.conn.lock().expect("trigger store lock poisoned");
        conn.execute(
            "INSERT INTO triggers
               (agent_id, schedule, payload, status, next_fire_at, failure_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                spec.agent_id,
                schedule_json,
                spec.payload,
                TriggerStatus::Scheduled.to_string(),
                next_fire_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| ValetError::persistence("create trigger", e.to_string()))?;

        let id = conn.last_insert_rowid();
        debug!(trigger_id = id, agent = %spec.agent_id, "Trigger created");

        Ok(Trigger {
            id,
            agent_id: spec.agent_id,
            schedule: spec.schedule,
            payload: spec.payload,
            status: TriggerStatus::Scheduled,
            next_fire_at: Some(next_fire_at),
            last_fired_at: None,
            failure_count: 0,
            last_error: None,
            created_at: now,
        })
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, ValetError> {
        let conn = self.conn.lock().expect("trigger store lock poisoned");
        let mut stmt = conn
            .prepare(&format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = ?1"))
            .map_err(|e| ValetError::persistence("get trigger", e.to_string()))?;
        let mut rows = stmt
            .query_map(params![id], row_to_trigger)
            .map_err(|e| ValetError::persistence("get trigger", e.to_string()))?;
        match rows.next() {
            Some(Ok(trigger)) => Ok(Some(trigger)),
            Some(Err(e)) => Err(ValetError::persistence("get trigger", e.to_string())),
            None => Ok(None),
        }
    }

    async fn update(&self, trigger: &Trigger) -> Result<(), ValetError> {
        let schedule_json = serde_json::to_string(&trigger.schedule)
            .map_err(|e| ValetError::persistence("update trigger", e.to_string()))?;
        let conn = self.conn.lock().expect("trigger store lock poisoned");
        let changed = conn
            .execute(
                "UPDATE triggers SET
                   agent_id = ?2, schedule = ?3, payload = ?4, status = ?5,
                   next_fire_at = ?6, last_fired_at = ?7, failure_count = ?8,
                   last_error = ?9
                 WHERE id = ?1",
                params![
                    trigger.id,
                    trigger.agent_id,
                    schedule_json,
                    trigger.payload,
                    trigger.status.to_string(),
                    format_instant(&trigger.next_fire_at),
                    format_instant(&trigger.last_fired_at),
                    trigger.failure_count as i64,
                    trigger.last_error,
                ],
            )
            .map_err(|e| ValetError::persistence("update trigger", e.to_string()))?;
        if changed == 0 {
            return Err(ValetError::Persistence {
                operation: "update trigger".into(),
                detail: "no such trigger".into(),
                trigger_id: Some(trigger.id),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: TriggerId) -> Result<bool, ValetError> {
        let conn = self.conn.lock().expect("trigger store lock poisoned");
        let changed = conn
            .execute("DELETE FROM triggers WHERE id = ?1", params![id])
            .map_err(|e| ValetError::persistence("delete trigger", e.to_string()))?;
        Ok(changed > 0)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Trigger>, ValetError> {
        let conn = self.conn.lock().expect("trigger store lock poisoned");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE status IN ('scheduled', 'running')
                 ORDER BY next_fire_at ASC"
            ))
            .map_err(|e| ValetError::persistence("list triggers", e.to_string()))?;
        let triggers = stmt
            .query_map([], row_to_trigger)
            .map_err(|e| ValetError::persistence("list triggers", e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ValetError::persistence("list triggers", e.to_string()))?;
        Ok(triggers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use valet_core::RecurrenceRule;

    #[tokio::test]
    async fn create_assigns_id_and_initial_fire_time() {
        let store = SqliteTriggerStore::open_in_memory().unwrap();
        let at = Utc::now() + ChronoDuration::minutes(5);
        let trigger = store
            .create(NewTrigger::once("reminders", at, "call dentist"))
            .await
            .unwrap();
        assert!(trigger.id > 0);
        assert_eq!(trigger.status, TriggerStatus::Scheduled);
        assert_eq!(
            trigger.next_fire_at.unwrap().timestamp(),
            at.timestamp()
        );
    }

    #[tokio::test]
    async fn roundtrip_through_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTriggerStore::open(&dir.path().join("triggers.db")).unwrap();
        let created = store
            .create(NewTrigger::recurring(
                "digest",
                RecurrenceRule::Interval { seconds: 3600 },
                "morning digest",
            ))
            .await
            .unwrap();

        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn update_persists_status_and_failure_state() {
        let store = SqliteTriggerStore::open_in_memory().unwrap();
        let mut trigger = store
            .create(NewTrigger::once("reminders", Utc::now(), "x"))
            .await
            .unwrap();

        trigger.status = TriggerStatus::Failed;
        trigger.failure_count = 3;
        trigger.last_error = Some("provider unreachable".into());
        trigger.next_fire_at = None;
        store.update(&trigger).await.unwrap();

        let fetched = store.get(trigger.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TriggerStatus::Failed);
        assert_eq!(fetched.failure_count, 3);
        assert!(fetched.next_fire_at.is_none());
    }

    #[tokio::test]
    async fn list_non_terminal_excludes_terminal_states() {
        let store = SqliteTriggerStore::open_in_memory().unwrap();
        let scheduled = store
            .create(NewTrigger::once("a", Utc::now(), "1"))
            .await
            .unwrap();
        let mut done = store
            .create(NewTrigger::once("b", Utc::now(), "2"))
            .await
            .unwrap();
        done.status = TriggerStatus::Completed;
        store.update(&done).await.unwrap();

        let live = store.list_non_terminal().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, scheduled.id);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_existed() {
        let store = SqliteTriggerStore::open_in_memory().unwrap();
        let trigger = store
            .create(NewTrigger::once("a", Utc::now(), "1"))
            .await
            .unwrap();
        assert!(store.delete(trigger.id).await.unwrap());
        assert!(!store.delete(trigger.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_of_missing_trigger_is_a_persistence_error() {
        let store = SqliteTriggerStore::open_in_memory().unwrap();
        let ghost = Trigger {
            id: 999,
            agent_id: "a".into(),
            schedule: TriggerSchedule::Once { at: Utc::now() },
            payload: "x".into(),
            status: TriggerStatus::Scheduled,
            next_fire_at: None,
            last_fired_at: None,
            failure_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        match store.update(&ghost).await {
            Err(ValetError::Persistence { trigger_id, .. }) => {
                assert_eq!(trigger_id, Some(999));
            }
            other => panic!("expected persistence error, got {other:?}"),
        }
    }
}
