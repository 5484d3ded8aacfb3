//! 执行记录器
//!
//! 追加式日志：append 是唯一写操作，序号按会话单调分配；read 返回惰性、有限、可重启的游标；
//! replay 通过折叠记录重建 SessionState。

pub mod entry;
pub mod sqlite;
pub mod store;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::{RecorderBackend, RecorderSection};
use crate::core::{RecorderError, SessionState};
use crate::plan::SessionId;

pub use entry::{RecordEntry, RecordEvent};
pub use sqlite::SqliteRecordStore;
pub use store::{MemoryRecordStore, RecordStore};

const DEFAULT_PAGE_SIZE: usize = 64;

/// 执行记录器：多个会话共享，按会话串行分配序号
pub struct ExecutionRecorder {
    store: Arc<dyn RecordStore>,
    /// 会话 -> 已分配的最后序号
    seqs: Mutex<HashMap<SessionId, u64>>,
    page_size: usize,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            seqs: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordStore::new()))
    }

    /// 按配置选择存储后端
    pub fn from_config(section: &RecorderSection) -> Result<Self, RecorderError> {
        let store: Arc<dyn RecordStore> = match section.backend {
            RecorderBackend::Memory => Arc::new(MemoryRecordStore::new()),
            RecorderBackend::Sqlite => Arc::new(SqliteRecordStore::open(section.sqlite_path())?),
        };
        Ok(Self::new(store))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// 追加一条记录，返回带序号与时间戳的条目
    pub fn append(&self, session_id: &str, event: RecordEvent) -> Result<RecordEntry, RecorderError> {
        let mut seqs = self.seqs.lock().map_err(|_| RecorderError::Poisoned)?;
        let last = match seqs.get(session_id) {
            Some(seq) => *seq,
            None => self.store.last_seq(session_id)?,
        };
        let entry = RecordEntry {
            session_id: session_id.to_string(),
            seq: last + 1,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        };
        self.store.insert(&entry)?;
        // 终态之后会话不再追加，释放其序号缓存
        if matches!(entry.event, RecordEvent::SessionTerminal { .. }) {
            seqs.remove(session_id);
        } else {
            seqs.insert(session_id.to_string(), entry.seq);
        }
        tracing::debug!(session = %session_id, seq = entry.seq, kind = entry.event.kind(), "record appended");
        Ok(entry)
    }

    /// 从 from_seq 开始的游标；上界为创建时刻的最后序号
    pub fn read(&self, session_id: &str, from_seq: u64) -> Result<RecordCursor, RecorderError> {
        let upper = self.store.last_seq(session_id)?;
        Ok(RecordCursor {
            store: self.store.clone(),
            session_id: session_id.to_string(),
            from_seq: from_seq.max(1),
            next_seq: from_seq.max(1),
            upper,
            page_size: self.page_size,
            buffer: VecDeque::new(),
        })
    }

    /// 完整日志
    pub fn entries(&self, session_id: &str) -> Result<Vec<RecordEntry>, RecorderError> {
        self.read(session_id, 1)?.collect()
    }

    /// 最后 n 条
    pub fn tail(&self, session_id: &str, n: usize) -> Result<Vec<RecordEntry>, RecorderError> {
        let last = self.store.last_seq(session_id)?;
        let from = last.saturating_sub(n as u64) + 1;
        self.store.page(session_id, from, n)
    }

    pub fn last_seq(&self, session_id: &str) -> Result<u64, RecorderError> {
        self.store.last_seq(session_id)
    }

    pub fn sessions(&self) -> Result<Vec<SessionId>, RecorderError> {
        self.store.sessions()
    }

    /// 折叠全部记录重建会话状态
    pub fn replay(&self, session_id: &str) -> Result<SessionState, RecorderError> {
        self.replay_until(session_id, u64::MAX)
    }

    /// 折叠 seq <= until 的记录
    pub fn replay_until(&self, session_id: &str, until: u64) -> Result<SessionState, RecorderError> {
        let mut state = SessionState::new(session_id);
        for entry in self.read(session_id, 1)? {
            let entry = entry?;
            if entry.seq > until {
                break;
            }
            state.apply(&entry)?;
        }
        if state.last_seq == 0 {
            return Err(RecorderError::NoRecords(session_id.to_string()));
        }
        Ok(state)
    }
}

/// 分页读取的记录游标
#[derive(Clone)]
pub struct RecordCursor {
    store: Arc<dyn RecordStore>,
    session_id: SessionId,
    from_seq: u64,
    next_seq: u64,
    upper: u64,
    page_size: usize,
    buffer: VecDeque<RecordEntry>,
}

impl RecordCursor {
    /// 回到起点重新读取
    pub fn restart(&mut self) {
        self.next_seq = self.from_seq;
        self.buffer.clear();
    }
}

impl Iterator for RecordCursor {
    type Item = Result<RecordEntry, RecorderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.next_seq > self.upper {
                return None;
            }
            let remaining = (self.upper - self.next_seq + 1) as usize;
            match self
                .store
                .page(&self.session_id, self.next_seq, self.page_size.min(remaining))
            {
                Ok(page) if page.is_empty() => {
                    self.next_seq = self.upper + 1;
                    return None;
                }
                Ok(page) => self.buffer.extend(page),
                Err(e) => {
                    self.next_seq = self.upper + 1;
                    return Some(Err(e));
                }
            }
        }
        let entry = self.buffer.pop_front()?;
        self.next_seq = entry.seq + 1;
        Some(Ok(entry))
    }
}
