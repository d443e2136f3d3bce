use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// 时间戳切分索引覆盖的时间跨度（按天切分）
pub const TIMESTAMP_INDEX_SPAN: Duration = Duration::from_secs(24 * 3600);

/// 一个物理索引（segment）。
///
/// 每次 reload 都从存储端状态重新派生，没有独立的销毁路径。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index: String,
    #[serde(default)]
    pub keys: Vec<String>,
    /// 代际号，没有 `{number}` 变量时为 -1
    pub num: i64,
    /// 无变量段：永不按代际/时间轮转或淘汰
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub docs_count: u64,
    #[serde(default)]
    pub docs_deleted: u64,
    #[serde(default)]
    pub store_size: u64,
    /// None 表示时间范围未解析（等价于零时间）
    #[serde(default, with = "unix_nanos")]
    pub min_t: Option<SystemTime>,
    #[serde(default, with = "unix_nanos")]
    pub max_t: Option<SystemTime>,
    /// 当前分区的可写索引
    #[serde(default)]
    pub active: bool,
}

impl IndexEntry {
    /// 与 `[start, end]` 有交集；未解析的边界视为无界
    pub fn overlaps(&self, start: SystemTime, end: SystemTime) -> bool {
        self.min_t.map_or(true, |t| t <= end) && self.max_t.map_or(true, |t| t >= start)
    }

    /// `max_t` 截断到小时（秒级 bucket），用于磁盘淘汰排序
    pub fn max_t_hour(&self) -> Option<u64> {
        self.max_t.map(|t| {
            let secs = t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
            secs - secs % 3600
        })
    }

    /// 新鲜度降序：(num, min_t, max_t, store_size) 大者在前
    pub fn freshness_desc(a: &IndexEntry, b: &IndexEntry) -> Ordering {
        (b.num, b.min_t, b.max_t, b.store_size).cmp(&(a.num, a.min_t, a.max_t, a.store_size))
    }

    /// 淘汰顺序：最老的小时在前，同一小时内小的在前
    pub fn eviction_asc(a: &IndexEntry, b: &IndexEntry) -> Ordering {
        (a.max_t_hour(), a.store_size).cmp(&(b.max_t_hour(), b.store_size))
    }
}

/// `Option<SystemTime>` <-> unix 纳秒（共享缓存 blob 的时间格式）
pub mod unix_nanos {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    /// 只接受 1970 ~ 2262 之间的时间（i64 纳秒的表示范围）
    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => {
                let since = t
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| S::Error::custom("time before unix epoch"))?;
                let nanos = i64::try_from(since.as_nanos())
                    .map_err(|_| S::Error::custom("time out of i64 nanosecond range"))?;
                s.serialize_some(&nanos)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
        match Option::<i64>::deserialize(d)? {
            None => Ok(None),
            Some(n) => u64::try_from(n)
                .map(|n| Some(UNIX_EPOCH + Duration::from_nanos(n)))
                .map_err(|_| D::Error::custom(format!("negative unix nanos {n}"))),
        }
    }
}
