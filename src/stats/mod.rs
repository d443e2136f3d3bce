use std::fmt;
use std::time::{Duration, SystemTime};

use crate::index::IndexGroup;

/// 当前快照的统计（由 `simulate` 周期打印）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LifecycleReport {
    /// 含索引的分区数
    pub partitions: usize,
    pub entries: usize,
    pub active: usize,
    pub fixed: usize,
    /// 时间范围尚未解析的非 active 索引
    pub unresolved: usize,
    pub store_bytes: u64,
    pub docs_count: u64,
    pub docs_deleted: u64,
    /// 最老数据距今
    pub oldest_age: Option<Duration>,
}

impl LifecycleReport {
    pub fn from_snapshot(root: &IndexGroup) -> Self {
        let mut r = LifecycleReport::default();
        let mut oldest: Option<SystemTime> = None;
        root.walk(&mut |g| {
            if !g.list.is_empty() || g.fixed.is_some() {
                r.partitions += 1;
            }
            for e in g.list.iter().chain(g.fixed.iter()) {
                r.entries += 1;
                r.store_bytes += e.store_size;
                r.docs_count += e.docs_count;
                r.docs_deleted += e.docs_deleted;
                if e.fixed {
                    r.fixed += 1;
                } else if e.active {
                    r.active += 1;
                } else if e.max_t.is_none() {
                    r.unresolved += 1;
                }
                if let Some(t) = e.min_t {
                    oldest = Some(oldest.map_or(t, |o| o.min(t)));
                }
            }
        });
        r.oldest_age = oldest.and_then(|t| SystemTime::now().duration_since(t).ok());
        r
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;
    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn human_age(age: Option<Duration>) -> String {
    match age {
        None => "-".to_string(),
        Some(d) => {
            let h = d.as_secs() / 3600;
            format!("{}d {}h", h / 24, h % 24)
        }
    }
}

impl fmt::Display for LifecycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           index-lifecycle Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║   partitions:   {:>10}                       ║", self.partitions)?;
        writeln!(f, "║   indices:      {:>10}                       ║", self.entries)?;
        writeln!(f, "║   active:       {:>10}                       ║", self.active)?;
        writeln!(f, "║   fixed:        {:>10}                       ║", self.fixed)?;
        writeln!(f, "║   unresolved:   {:>10}                       ║", self.unresolved)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   store:        {:>10}                       ║",
            human_bytes(self.store_bytes)
        )?;
        writeln!(f, "║   docs:         {:>10}                       ║", self.docs_count)?;
        writeln!(f, "║   deleted docs: {:>10}                       ║", self.docs_deleted)?;
        writeln!(
            f,
            "║   oldest data:  {:>10}                       ║",
            human_age(self.oldest_age)
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
