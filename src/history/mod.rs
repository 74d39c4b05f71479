//! Check history: the immutable per-tick record and its persistence
//!
//! Every tick of every check produces exactly one history record: a common
//! header stamped by the engine plus a check-specific payload. Records are
//! persisted as flat dotted-key documents in Elasticsearch.

mod record;
mod repository;

pub use record::{
    AlarmResult, CheckDomain, ConsulCheckHistory, CpuCheckHistory, DiskCheckHistory,
    EsCheckHistory, HistoryHeader, MemoryCheckHistory, ProcessLevel, ProcessLevels,
    SwarmpitCheckHistory,
};
pub use repository::{EsHistoryStore, HistoryStore};
