//! 会话事件日志：追加写、按会话顺序读取
//!
//! - [`SqliteJournal`]：持久化到 SQLite（rusqlite，同步调用，单连接加锁）
//! - [`MemoryJournal`]：进程内实现，用于测试与 `--ephemeral`
//!
//! 每条事件带有从 1 开始连续的序号；读取时发现断号或无法反序列化即视为日志损坏。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::core::state::SessionEvent;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("journal record {seq} of session {session} is unreadable: {reason}")]
    Corrupted {
        session: String,
        seq: u64,
        reason: String,
    },

    #[error("journal of session {session} has a gap: expected seq {expected}, found {found}")]
    Gap {
        session: String,
        expected: u64,
        found: u64,
    },

    #[error("journal lock poisoned")]
    Poisoned,

    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 会话事件日志
pub trait EventJournal: Send + Sync {
    /// 追加一条事件，返回其序号
    fn append(&self, session_id: &str, event: &SessionEvent) -> Result<u64, JournalError>;

    /// 按序号顺序读取会话的全部事件；会话不存在时返回空
    fn load(&self, session_id: &str) -> Result<Vec<SessionEvent>, JournalError>;

    /// 已知的会话 ID（按最近活动排序）
    fn sessions(&self) -> Result<Vec<String>, JournalError>;
}

/// 进程内事件日志
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<HashMap<String, Vec<SessionEvent>>>,
    order: Mutex<Vec<String>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.events
            .lock()
            .map(|m| m.get(session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl EventJournal for MemoryJournal {
    fn append(&self, session_id: &str, event: &SessionEvent) -> Result<u64, JournalError> {
        let mut events = self.events.lock().map_err(|_| JournalError::Poisoned)?;
        let log = events.entry(session_id.to_string()).or_default();
        log.push(event.clone());
        let seq = log.len() as u64;
        drop(events);

        let mut order = self.order.lock().map_err(|_| JournalError::Poisoned)?;
        order.retain(|s| s != session_id);
        order.insert(0, session_id.to_string());
        Ok(seq)
    }

    fn load(&self, session_id: &str) -> Result<Vec<SessionEvent>, JournalError> {
        let events = self.events.lock().map_err(|_| JournalError::Poisoned)?;
        Ok(events.get(session_id).cloned().unwrap_or_default())
    }

    fn sessions(&self) -> Result<Vec<String>, JournalError> {
        Ok(self.order.lock().map_err(|_| JournalError::Poisoned)?.clone())
    }
}

/// SQLite 事件日志
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, JournalError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, JournalError> {
        // journal_mode 会返回一行结果，单独执行
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            CREATE TABLE IF NOT EXISTS session_events (
                session_id  TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl EventJournal for SqliteJournal {
    fn append(&self, session_id: &str, event: &SessionEvent) -> Result<u64, JournalError> {
        let payload = serde_json::to_string(event).map_err(|e| JournalError::Corrupted {
            session: session_id.to_string(),
            seq: 0,
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO session_events (session_id, seq, kind, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                next,
                event.kind(),
                payload,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(next as u64)
    }

    fn load(&self, session_id: &str) -> Result<Vec<SessionEvent>, JournalError> {
        let conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM session_events WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for (idx, row) in rows.enumerate() {
            let (seq, payload) = row?;
            let expected = idx as u64 + 1;
            if seq as u64 != expected {
                return Err(JournalError::Gap {
                    session: session_id.to_string(),
                    expected,
                    found: seq as u64,
                });
            }
            let event = serde_json::from_str(&payload).map_err(|e| JournalError::Corrupted {
                session: session_id.to_string(),
                seq: seq as u64,
                reason: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn sessions(&self) -> Result<Vec<String>, JournalError> {
        let conn = self.conn.lock().map_err(|_| JournalError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT session_id FROM session_events GROUP BY session_id ORDER BY MAX(recorded_at) DESC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<SessionEvent> {
        vec![
            SessionEvent::Started {
                started_at: "t0".into(),
            },
            SessionEvent::PromptRendered {
                prompt: "menu".into(),
            },
            SessionEvent::InputSignalled { raw: "/stats".into() },
        ]
    }

    #[test]
    fn test_sqlite_append_and_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SqliteJournal::open(dir.path().join("nested/journal.db")).unwrap();
        for (i, e) in sample().iter().enumerate() {
            assert_eq!(journal.append("s1", e).unwrap(), i as u64 + 1);
        }
        journal.append("s2", &sample()[0]).unwrap();

        assert_eq!(journal.load("s1").unwrap(), sample());
        assert_eq!(journal.load("s2").unwrap().len(), 1);
        assert!(journal.load("missing").unwrap().is_empty());
        assert_eq!(journal.sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        {
            let journal = SqliteJournal::open(&path).unwrap();
            for e in sample() {
                journal.append("s1", &e).unwrap();
            }
        }
        let reopened = SqliteJournal::open(&path).unwrap();
        assert_eq!(reopened.load("s1").unwrap(), sample());
    }

    #[test]
    fn test_sqlite_detects_corruption() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        journal.append("s1", &sample()[0]).unwrap();
        {
            let conn = journal.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO session_events VALUES ('s1', 2, 'prompt_rendered', '{not json', 't')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            journal.load("s1"),
            Err(JournalError::Corrupted { seq: 2, .. })
        ));
    }

    #[test]
    fn test_sqlite_detects_gap() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        journal.append("s1", &sample()[0]).unwrap();
        {
            let conn = journal.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO session_events VALUES ('s1', 5, 'input_dequeued', '{\"event\":\"input_dequeued\"}', 't')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            journal.load("s1"),
            Err(JournalError::Gap { expected: 2, found: 5, .. })
        ));
    }

    #[test]
    fn test_memory_journal_orders_sessions_by_activity() {
        let journal = MemoryJournal::new();
        journal.append("a", &sample()[0]).unwrap();
        journal.append("b", &sample()[0]).unwrap();
        journal.append("a", &sample()[1]).unwrap();
        assert_eq!(journal.sessions().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(journal.len("a"), 2);
    }
}
