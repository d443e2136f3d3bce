pub mod entry;
pub mod group;

use std::sync::Arc;
use std::time::SystemTime;

pub use entry::{IndexEntry, TIMESTAMP_INDEX_SPAN};
pub use group::{IndexGroup, KeyPath};

/// 清理 / 滚动时用来挑选索引的过滤器
pub type IndexFilter = Arc<dyn Fn(&IndexEntry) -> bool + Send + Sync>;

/// 物理索引名反查结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    /// 命中的配置前缀
    pub prefix: String,
    /// 命中的模板原文
    pub pattern: String,
    pub keys: Vec<String>,
    /// 代际号，没有 `{number}` 变量时为 -1
    pub num: i64,
    /// `{timestamp}` 变量给出的窗口起点
    pub timestamp: Option<SystemTime>,
    /// 模板不含变量
    pub fixed: bool,
}

impl MatchResult {
    /// 以存储端统计信息构造 entry（list 中的 active 与时间范围由 loader 后续填充）
    pub fn into_entry(
        self,
        index: &str,
        docs_count: u64,
        docs_deleted: u64,
        store_size: u64,
    ) -> IndexEntry {
        let (min_t, max_t) = match self.timestamp {
            Some(t) => (
                Some(t),
                Some(t + TIMESTAMP_INDEX_SPAN - std::time::Duration::from_nanos(1)),
            ),
            None => (None, None),
        };
        IndexEntry {
            index: index.to_string(),
            keys: self.keys,
            num: self.num,
            fixed: self.fixed,
            docs_count,
            docs_deleted,
            store_size,
            min_t,
            max_t,
            // fixed 索引总是可写
            active: self.fixed,
        }
    }
}
