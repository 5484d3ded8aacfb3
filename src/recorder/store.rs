//! 记录存储抽象与内存实现

use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::RecorderError;
use crate::plan::SessionId;
use crate::recorder::RecordEntry;

/// 追加式记录存储；不提供修改或删除
pub trait RecordStore: Send + Sync {
    /// 写入一条记录；seq 必须恰好是该会话的下一个序号
    fn insert(&self, entry: &RecordEntry) -> Result<(), RecorderError>;

    /// 会话的最后序号（无记录为 0）
    fn last_seq(&self, session_id: &str) -> Result<u64, RecorderError>;

    /// 按序号读取一页：seq >= from_seq，最多 limit 条
    fn page(
        &self,
        session_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<RecordEntry>, RecorderError>;

    /// 有记录的会话
    fn sessions(&self) -> Result<Vec<SessionId>, RecorderError>;
}

/// 内存存储（默认）
#[derive(Default)]
pub struct MemoryRecordStore {
    entries: RwLock<HashMap<SessionId, Vec<RecordEntry>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, entry: &RecordEntry) -> Result<(), RecorderError> {
        let mut entries = self.entries.write().map_err(|_| RecorderError::Poisoned)?;
        let log = entries.entry(entry.session_id.clone()).or_default();
        let expected = log.len() as u64 + 1;
        if entry.seq != expected {
            return Err(RecorderError::Corrupt {
                seq: entry.seq,
                reason: format!("expected seq {expected}"),
            });
        }
        log.push(entry.clone());
        Ok(())
    }

    fn last_seq(&self, session_id: &str) -> Result<u64, RecorderError> {
        let entries = self.entries.read().map_err(|_| RecorderError::Poisoned)?;
        Ok(entries.get(session_id).map(|l| l.len() as u64).unwrap_or(0))
    }

    fn page(
        &self,
        session_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<RecordEntry>, RecorderError> {
        let entries = self.entries.read().map_err(|_| RecorderError::Poisoned)?;
        let Some(log) = entries.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = from_seq.max(1) as usize - 1;
        Ok(log.iter().skip(start).take(limit).cloned().collect())
    }

    fn sessions(&self) -> Result<Vec<SessionId>, RecorderError> {
        let entries = self.entries.read().map_err(|_| RecorderError::Poisoned)?;
        let mut ids: Vec<SessionId> = entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
