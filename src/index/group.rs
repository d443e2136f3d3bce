use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::index::entry::IndexEntry;

/// 查询路径：从根开始逐级的 key；`recursive` 时连同所有子分区一起返回
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPath {
    pub keys: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
}

impl KeyPath {
    pub fn new<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            recursive: false,
        }
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// 按分区 key 逐级展开的索引树。
///
/// 每次 reload 整体重建，发布后不可变（替换而不是修改）。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGroup {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, IndexGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<IndexEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<IndexEntry>,
}

impl IndexGroup {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.list.is_empty() && self.fixed.is_none()
    }

    /// 沿 keys 找到对应分区
    pub fn get<S: AsRef<str>>(&self, keys: &[S]) -> Option<&IndexGroup> {
        keys.iter()
            .try_fold(self, |g, k| g.groups.get(k.as_ref()))
    }

    /// 按 entry.keys 插入（不存在的中间分区自动创建）；返回 false 表示 fixed 位置已被占用
    pub fn insert(&mut self, entry: IndexEntry) -> bool {
        let mut g = self;
        for k in &entry.keys {
            g = g.groups.entry(k.clone()).or_default();
        }
        if entry.fixed {
            if g.fixed.is_some() {
                return false;
            }
            g.fixed = Some(entry);
        } else {
            g.list.push(entry);
        }
        true
    }

    /// 深度优先遍历所有分区（含自身）
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a IndexGroup)) {
        f(self);
        for child in self.groups.values() {
            child.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut IndexGroup)) {
        f(self);
        for child in self.groups.values_mut() {
            child.walk_mut(f);
        }
    }

    /// 所有 entry（list + fixed），深度优先
    pub fn entries(&self) -> Vec<&IndexEntry> {
        let mut out = Vec::new();
        self.walk(&mut |g| {
            out.extend(g.list.iter());
            out.extend(g.fixed.iter());
        });
        out
    }

    /// 选出 list 中唯一的 active：有 num>0 时取最大 num，否则取 min_t 最新者
    pub fn select_active(&mut self) {
        for e in self.list.iter_mut() {
            e.active = false;
        }
        let by_num = self
            .list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.num > 0)
            .max_by_key(|(_, e)| e.num)
            .map(|(i, _)| i);
        let idx = by_num.or_else(|| {
            self.list
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| e.min_t)
                .map(|(i, _)| i)
        });
        if let Some(i) = idx {
            self.list[i].active = true;
        }
    }

    /// active 永远排在首位，其余按新鲜度降序
    pub fn sort_list(&mut self) {
        self.list.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then_with(|| IndexEntry::freshness_desc(a, b))
        });
    }

    /// 收集与时间窗口有交集的索引名
    pub fn collect_names(
        &self,
        start: SystemTime,
        end: SystemTime,
        recursive: bool,
        out: &mut Vec<String>,
    ) {
        out.extend(
            self.list
                .iter()
                .filter(|e| e.overlaps(start, end))
                .map(|e| e.index.clone()),
        );
        if let Some(fixed) = &self.fixed {
            out.push(fixed.index.clone());
        }
        if recursive {
            for child in self.groups.values() {
                child.collect_names(start, end, true, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn entry(name: &str, keys: &[&str], num: i64, min_secs: Option<u64>) -> IndexEntry {
        IndexEntry {
            index: name.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            num,
            min_t: min_secs.map(|s| UNIX_EPOCH + Duration::from_secs(s)),
            max_t: min_secs.map(|s| UNIX_EPOCH + Duration::from_secs(s + 86399)),
            ..Default::default()
        }
    }

    #[test]
    fn insert_splits_fixed_and_list() {
        let mut root = IndexGroup::default();
        assert!(root.insert(entry("a-r-1", &["cpu", "ns1"], 1, None)));
        let mut fixed = entry("a", &["cpu", "ns1"], -1, None);
        fixed.fixed = true;
        assert!(root.insert(fixed.clone()));
        assert!(!root.insert(fixed));

        let g = root.get(&["cpu", "ns1"]).unwrap();
        assert_eq!(g.list.len(), 1);
        assert_eq!(g.fixed.as_ref().unwrap().index, "a");
        assert!(root.get(&["cpu", "missing"]).is_none());
    }

    #[test]
    fn exactly_one_active_highest_number_wins() {
        let mut g = IndexGroup::default();
        g.list = vec![
            entry("r-2", &[], 2, Some(500)),
            entry("r-7", &[], 7, Some(10)),
            entry("day", &[], -1, Some(90_000)),
            entry("r-3", &[], 3, None),
        ];
        g.select_active();
        let active: Vec<_> = g.list.iter().filter(|e| e.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].index, "r-7");
    }

    #[test]
    fn exactly_one_active_latest_min_t_without_numbers() {
        let mut g = IndexGroup::default();
        g.list = vec![
            entry("d1", &[], -1, Some(0)),
            entry("d3", &[], -1, Some(2 * 86400)),
            entry("d2", &[], -1, Some(86400)),
        ];
        g.list[0].active = true;
        g.select_active();
        let active: Vec<_> = g.list.iter().filter(|e| e.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].index, "d3");

        g.sort_list();
        let names: Vec<_> = g.list.iter().map(|e| e.index.as_str()).collect();
        assert_eq!(names, vec!["d3", "d2", "d1"]);
    }

    #[test]
    fn collect_names_respects_window_and_recursion() {
        let mut root = IndexGroup::default();
        root.insert(entry("old", &["cpu"], -1, Some(0)));
        root.insert(entry("new", &["cpu"], -1, Some(10 * 86400)));
        root.insert(entry("child", &["cpu", "ns"], -1, Some(10 * 86400)));

        let start = UNIX_EPOCH + Duration::from_secs(9 * 86400);
        let end = UNIX_EPOCH + Duration::from_secs(11 * 86400);
        let cpu = root.get(&["cpu"]).unwrap();

        let mut out = Vec::new();
        cpu.collect_names(start, end, false, &mut out);
        assert_eq!(out, vec!["new".to_string()]);

        out.clear();
        cpu.collect_names(start, end, true, &mut out);
        assert_eq!(out, vec!["new".to_string(), "child".to_string()]);
    }

    #[test]
    fn snapshot_json_round_trips() {
        let mut root = IndexGroup::default();
        root.insert(entry("spot-cpu-ns-r-000001", &["cpu", "ns"], 1, Some(3600)));
        root.walk_mut(&mut |g| g.select_active());
        let blob = serde_json::to_string(&root).unwrap();
        let back: IndexGroup = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn active_stays_first_when_times_resolve_later() {
        // 没有代际号也没有时间窗口：选 active 时 min_t 全未解析
        let mut g = IndexGroup::default();
        g.list = vec![
            entry("x-b", &[], -1, None),
            entry("x-a", &[], -1, None),
        ];
        g.select_active();
        let active = g.list.iter().find(|e| e.active).unwrap().index.clone();
        for e in g.list.iter_mut().filter(|e| !e.active) {
            e.min_t = Some(UNIX_EPOCH + Duration::from_secs(100));
            e.max_t = Some(UNIX_EPOCH + Duration::from_secs(200));
        }
        g.sort_list();
        assert!(g.list[0].active);
        assert_eq!(g.list[0].index, active);
    }
}
