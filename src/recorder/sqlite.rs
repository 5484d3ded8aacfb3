//! SQLite 记录存储
//!
//! 表 execution_records(session_id, seq, timestamp, kind, payload)，主键 (session_id, seq)；
//! 主键冲突即拒绝重复序号。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::core::RecorderError;
use crate::plan::SessionId;
use crate::recorder::{RecordEntry, RecordEvent, RecordStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS execution_records (
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);
";

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// 打开（或创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, RecorderError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RecorderError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RecorderError> {
        self.conn.lock().map_err(|_| RecorderError::Poisoned)
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, entry: &RecordEntry) -> Result<(), RecorderError> {
        let (kind, payload) = entry.event.clone().into_parts()?;
        let conn = self.lock()?;
        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM execution_records WHERE session_id = ?1",
            params![entry.session_id],
            |row| row.get(0),
        )?;
        if entry.seq as i64 != last + 1 {
            return Err(RecorderError::Corrupt {
                seq: entry.seq,
                reason: format!("expected seq {}", last + 1),
            });
        }
        conn.execute(
            "INSERT INTO execution_records (session_id, seq, timestamp, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.session_id,
                entry.seq as i64,
                entry.timestamp,
                kind,
                serde_json::to_string(&payload)?
            ],
        )?;
        Ok(())
    }

    fn last_seq(&self, session_id: &str) -> Result<u64, RecorderError> {
        let conn = self.lock()?;
        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM execution_records WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(last as u64)
    }

    fn page(
        &self,
        session_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<RecordEntry>, RecorderError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, kind, payload FROM execution_records
             WHERE session_id = ?1 AND seq >= ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![session_id, from_seq as i64, limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, timestamp, kind, payload) = row?;
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            entries.push(RecordEntry {
                session_id: session_id.to_string(),
                seq: seq as u64,
                timestamp,
                event: RecordEvent::from_parts(&kind, payload)?,
            });
        }
        Ok(entries)
    }

    fn sessions(&self) -> Result<Vec<SessionId>, RecorderError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT session_id FROM execution_records ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SessionStatus, TerminalReason};

    fn terminal(seq: u64) -> RecordEntry {
        RecordEntry {
            session_id: "sess_1".into(),
            seq,
            timestamp: 42,
            event: RecordEvent::SessionTerminal {
                status: SessionStatus::Aborted,
                reason: Some(TerminalReason::Cancelled),
                message: None,
            },
        }
    }

    #[test]
    fn test_sqlite_insert_and_page() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.insert(&terminal(1)).unwrap();
        assert_eq!(store.last_seq("sess_1").unwrap(), 1);
        assert_eq!(store.last_seq("sess_2").unwrap(), 0);

        let page = store.page("sess_1", 1, 10).unwrap();
        assert_eq!(page, vec![terminal(1)]);
        assert_eq!(store.sessions().unwrap(), vec!["sess_1".to_string()]);
    }

    #[test]
    fn test_sqlite_rejects_reused_seq() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.insert(&terminal(1)).unwrap();
        assert!(store.insert(&terminal(1)).is_err());
        assert!(store.insert(&terminal(3)).is_err());
    }

    #[test]
    fn test_sqlite_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.insert(&terminal(1)).unwrap();
        }
        let reopened = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(reopened.page("sess_1", 1, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_open_creates_parent_dirs_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("records.db");
        assert!(SqliteRecordStore::open(&nested).is_ok());

        // 父路径是普通文件，无法创建目录
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let err = SqliteRecordStore::open(blocker.join("records.db")).err().unwrap();
        assert!(matches!(err, RecorderError::Io(_)));
    }
}
