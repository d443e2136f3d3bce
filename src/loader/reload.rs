use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use crate::error::Result;
use crate::index::IndexGroup;
use crate::loader::Loader;

type TimeRange = Option<(SystemTime, SystemTime)>;

/// 时间范围缓存条目：文档数不变时复用上次的聚合结果
#[derive(Clone, Debug)]
pub(crate) struct CachedRange {
    docs_count: u64,
    docs_deleted: u64,
    range: TimeRange,
}

struct Pending {
    index: String,
    docs_count: u64,
    docs_deleted: u64,
}

impl Loader {
    /// 直接从存储端构建一棵新的索引树
    pub(crate) async fn load_from_store(&self) -> Result<IndexGroup> {
        let timeout = self.cfg.request_timeout();
        let mut root = IndexGroup::default();
        let mut seen: HashSet<String> = HashSet::new();

        for p in &self.prefixes {
            let list =
                tokio::time::timeout(timeout, self.store.list_indices(&p.prefix)).await??;
            for cat in list {
                // 前缀可能互相覆盖
                if !seen.insert(cat.index.clone()) {
                    continue;
                }
                let Some(m) = p
                    .patterns
                    .iter()
                    .find_map(|cp| self.match_pattern(&p.prefix, cp, &cat.index))
                else {
                    tracing::debug!("Skip unrecognized index {}", cat.index);
                    continue;
                };
                let entry = m.into_entry(&cat.index, cat.docs_count, cat.docs_deleted, cat.store_size);
                if !root.insert(entry) {
                    tracing::warn!("Duplicate fixed index {} ignored", cat.index);
                }
            }
        }

        root.walk_mut(&mut |g| g.select_active());
        if self.cfg.query_index_time_range {
            self.resolve_time_ranges(&mut root).await;
        }
        root.walk_mut(&mut |g| g.sort_list());

        self.time_ranges.retain(|name, _| seen.contains(name));
        Ok(root)
    }

    /// 为非 active、非 fixed 且名字里没有时间窗口的索引查询 min/max 时间。
    ///
    /// 单个索引查询失败只记日志，该索引保持未解析，下一轮重试。
    async fn resolve_time_ranges(&self, root: &mut IndexGroup) {
        let mut pending = Vec::new();
        root.walk(&mut |g| {
            pending.extend(
                g.list
                    .iter()
                    .filter(|e| !e.active && !e.fixed && e.min_t.is_none())
                    .map(|e| Pending {
                        index: e.index.clone(),
                        docs_count: e.docs_count,
                        docs_deleted: e.docs_deleted,
                    }),
            );
        });
        if pending.is_empty() {
            return;
        }

        let timeout = self.cfg.request_timeout();
        let mut resolved: HashMap<String, TimeRange> = HashMap::with_capacity(pending.len());
        let mut queried = 0usize;
        for p in pending {
            let cached = self.time_ranges.get(&p.index).and_then(|c| {
                (c.docs_count == p.docs_count && c.docs_deleted == p.docs_deleted)
                    .then_some(c.range)
            });
            if let Some(range) = cached {
                resolved.insert(p.index, range);
                continue;
            }

            queried += 1;
            let res = tokio::time::timeout(
                timeout,
                self.store.time_range(&p.index, &self.cfg.timestamp_field),
            )
            .await;
            match res {
                Ok(Ok(range)) => {
                    tracing::debug!("Index {} time range {:?}", p.index, range);
                    self.time_ranges.insert(
                        p.index.clone(),
                        CachedRange {
                            docs_count: p.docs_count,
                            docs_deleted: p.docs_deleted,
                            range,
                        },
                    );
                    resolved.insert(p.index, range);
                }
                Ok(Err(e)) => tracing::warn!("Query time range of {} failed: {}", p.index, e),
                Err(_) => tracing::warn!("Query time range of {} timed out", p.index),
            }
        }
        if queried > 0 {
            tracing::debug!("Queried time range of {} indices", queried);
        }

        root.walk_mut(&mut |g| {
            for e in g.list.iter_mut() {
                if let Some(Some((min, max))) = resolved.get(&e.index) {
                    e.min_t = Some(*min);
                    e.max_t = Some(*max);
                }
            }
        });
    }
}
