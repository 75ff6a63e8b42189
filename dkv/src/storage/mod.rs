pub mod cask;
pub mod engine;
pub mod journal;
pub mod log;
pub mod memory;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

/// KeyDir是一个内存当中的map，这里使用的是BTreeMap的实现方式，便于进行顺序遍历进行compaction。
/// key为存储的key，而value记录长度、位置与过期时间，用于进行偏移读取.
/// map当中始终保存当前key的最新版本的位置。
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32, u64)>;

/// A stored entry: the value bytes plus the expiry as epoch seconds, 0 for
/// no expiry. Expired entries read as absent and are dropped by compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,

    pub expire_at: u64,
}

impl Entry {
    pub fn new(value: Vec<u8>) -> Self {
        Entry { value, expire_at: 0 }
    }

    pub fn with_expiry(value: Vec<u8>, expire_at: u64) -> Self {
        Entry { value, expire_at }
    }

    /// Whether the entry is expired at the given epoch second.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expire_at != 0 && self.expire_at <= now
    }
}

/// 用于表示当前存储引擎的状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// The current wall clock as epoch seconds, the reference point for expiry.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Entry)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Entry)>>> ScanIteratorT for I {}
