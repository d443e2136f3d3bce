use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cleaner::Cleaner;
use crate::config::DiskCleanConfig;
use crate::error::{Error, Result};
use crate::index::{IndexEntry, IndexGroup};
use crate::rollover::Rollover;
use crate::store::{NodeFsStats, ShardRouting};

/// 索引名 → (节点 id → 该索引在节点上的字节数)
pub type Holders = HashMap<String, BTreeMap<String, u64>>;

/// 一轮磁盘检查中单个节点的用量
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeDiskUsage {
    pub id: String,
    pub name: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// 节点上非 active、非 fixed 索引的字节数
    pub store_bytes: u64,
    pub used_percent: f64,
    pub store_percent: f64,
    /// 降到低水位需要释放的字节（不低于保留下限）
    pub expect_delete: u64,
    /// 本轮已标记删除的字节
    pub deleted: u64,
    pub pressured: bool,
}

impl NodeDiskUsage {
    /// 回到低水位还差的字节数（不考虑保留下限）
    fn shortfall(&self, low_percent: f64) -> u64 {
        let target = (self.total_bytes as f64 * low_percent / 100.0) as u64;
        self.used_bytes.saturating_sub(target)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RoundOutcome {
    Balanced,
    Deleted(usize),
    RolledOver(usize),
    Stuck,
}

/// 按索引聚合分片路由
pub fn holders_of(routing: &[ShardRouting]) -> Holders {
    let mut holders = Holders::new();
    for r in routing {
        *holders
            .entry(r.index.clone())
            .or_default()
            .entry(r.node_id.clone())
            .or_default() += r.store_bytes;
    }
    holders
}

/// 计算每个节点的用量；`threshold` 为判定受压的使用率
pub fn node_usage(
    stats: &[NodeFsStats],
    holders: &Holders,
    evictable: &HashSet<&str>,
    cfg: &DiskCleanConfig,
    threshold: f64,
) -> HashMap<String, NodeDiskUsage> {
    let mut store: HashMap<&str, u64> = HashMap::new();
    for (index, nodes) in holders {
        if !evictable.contains(index.as_str()) {
            continue;
        }
        for (node, bytes) in nodes {
            *store.entry(node.as_str()).or_default() += bytes;
        }
    }

    stats
        .iter()
        .filter(|s| s.total_bytes > 0)
        .map(|s| {
            let total = s.total_bytes;
            let used = total.saturating_sub(s.available_bytes);
            let store_bytes = store.get(s.id.as_str()).copied().unwrap_or(0);
            let mut u = NodeDiskUsage {
                id: s.id.clone(),
                name: s.name.clone(),
                total_bytes: total,
                used_bytes: used,
                store_bytes,
                used_percent: used as f64 * 100.0 / total as f64,
                store_percent: store_bytes as f64 * 100.0 / total as f64,
                ..Default::default()
            };
            u.expect_delete = u
                .shortfall(cfg.low_disk_usage_percent)
                .min(store_bytes.saturating_sub(cfg.min_indices_store));
            u.pressured = u.used_percent >= threshold
                && u.store_percent >= cfg.min_indices_store_percent
                && u.expect_delete > 0;
            (s.id.clone(), u)
        })
        .collect()
}

/// 淘汰候选：非 active、非 fixed，最老的小时在前，同一小时内小的在前
pub fn sorted_candidates(root: &IndexGroup) -> Vec<&IndexEntry> {
    let mut candidates: Vec<&IndexEntry> = root
        .entries()
        .into_iter()
        .filter(|e| !e.active && !e.fixed)
        .collect();
    candidates.sort_by(|a, b| IndexEntry::eviction_asc(a, b));
    candidates
}

/// 按顺序标记要删除的索引。
///
/// 只要某个受压节点还没删够就标记，但任何受压节点都不能因此低于保留下限。
pub fn select_for_deletion(
    candidates: &[&IndexEntry],
    holders: &Holders,
    nodes: &mut HashMap<String, NodeDiskUsage>,
    floor: u64,
) -> Vec<String> {
    let mut marked = Vec::new();
    for e in candidates {
        let Some(held) = holders.get(&e.index) else {
            continue;
        };
        let pressured: Vec<(&String, u64)> = held
            .iter()
            .filter(|(n, _)| nodes.get(n.as_str()).is_some_and(|u| u.pressured))
            .map(|(n, b)| (n, *b))
            .collect();
        if pressured.is_empty() {
            continue;
        }
        let needed = pressured
            .iter()
            .any(|(n, _)| nodes.get(n.as_str()).is_some_and(|u| u.deleted < u.expect_delete));
        let fits = pressured.iter().all(|(n, b)| {
            nodes
                .get(n.as_str())
                .is_some_and(|u| u.deleted + b <= u.store_bytes.saturating_sub(floor))
        });
        if !(needed && fits) {
            continue;
        }
        for (n, b) in &pressured {
            if let Some(u) = nodes.get_mut(n.as_str()) {
                u.deleted += b;
            }
        }
        marked.push(e.index.clone());
    }
    marked
}

impl Cleaner {
    pub(super) async fn disk_loop(self: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_secs(self.cfg.disk.check_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.check_disk(&token).await {
                if e != Error::Cancelled {
                    tracing::error!("Disk check failed: {}", e);
                }
            }
        }
    }

    /// 一次完整的磁盘检查：首轮以高水位判定受压，之后以低水位继续，直到平衡或无事可做
    pub async fn check_disk(&self, token: &CancellationToken) -> Result<()> {
        let cfg = &self.cfg.disk;
        let rounds = cfg.max_rounds.max(1);
        for round in 1..=rounds {
            let threshold = if round == 1 {
                cfg.high_disk_usage_percent
            } else {
                cfg.low_disk_usage_percent
            };
            match self.disk_round(token, threshold).await? {
                RoundOutcome::Balanced | RoundOutcome::Stuck => return Ok(()),
                RoundOutcome::Deleted(n) => {
                    tracing::info!("Disk clean round {}: deleted {} indices", round, n)
                }
                RoundOutcome::RolledOver(n) => {
                    tracing::info!("Disk clean round {}: rolled over {} aliases", round, n)
                }
            }
        }
        tracing::warn!("Disk usage still above low watermark after {} rounds", rounds);
        Ok(())
    }

    async fn disk_round(&self, token: &CancellationToken, threshold: f64) -> Result<RoundOutcome> {
        let cfg = &self.cfg.disk;
        let Some(root) = self.loader.wait_and_get_indices(token).await else {
            return Err(Error::Cancelled);
        };
        let timeout = Duration::from_secs(self.cfg.request_timeout_secs);
        let stats = tokio::time::timeout(timeout, self.store.node_stats()).await??;
        let routing = tokio::time::timeout(timeout, self.store.shard_routing()).await??;

        let holders = holders_of(&routing);
        let candidates = sorted_candidates(&root);
        let evictable: HashSet<&str> = candidates.iter().map(|e| e.index.as_str()).collect();
        let mut nodes = node_usage(&stats, &holders, &evictable, cfg, threshold);

        let over: Vec<&NodeDiskUsage> = nodes
            .values()
            .filter(|u| u.used_percent >= threshold && u.shortfall(cfg.low_disk_usage_percent) > 0)
            .collect();
        if over.is_empty() {
            return Ok(RoundOutcome::Balanced);
        }
        for u in &over {
            tracing::info!(
                "Node {} ({}) disk used {:.1}%, index store {:.1}%, expect delete {} bytes",
                u.name,
                u.id,
                u.used_percent,
                u.store_percent,
                u.expect_delete
            );
        }
        let over: HashSet<String> = over.iter().map(|u| u.id.clone()).collect();

        let marked = select_for_deletion(&candidates, &holders, &mut nodes, cfg.min_indices_store);
        if !marked.is_empty() {
            let n = marked.len();
            self.delete_and_wait(marked, token).await?;
            self.loader.reload_indices().await?;
            return Ok(RoundOutcome::Deleted(n));
        }

        if let (Some(rollover), Some(body)) = (&self.rollover, &self.rollover_body) {
            let rolled = self
                .rollover_for_space(&root, &holders, &nodes, &over, rollover, body)
                .await?;
            if rolled > 0 {
                self.loader.reload_indices().await?;
                return Ok(RoundOutcome::RolledOver(rolled));
            }
        }
        tracing::warn!(
            "Disk usage over {:.1}% on {} nodes but no index left to clean",
            threshold,
            over.len()
        );
        Ok(RoundOutcome::Stuck)
    }

    /// 删无可删时强制滚动受压节点上的 active 索引，使其下一轮可被删除
    async fn rollover_for_space(
        &self,
        root: &IndexGroup,
        holders: &Holders,
        nodes: &HashMap<String, NodeDiskUsage>,
        over: &HashSet<String>,
        rollover: &Rollover,
        body: &serde_json::Value,
    ) -> Result<usize> {
        let cfg = &self.cfg.disk;
        let mut actives: Vec<&IndexEntry> = root
            .entries()
            .into_iter()
            .filter(|e| e.active && !e.fixed && e.num > 0)
            .collect();
        actives.sort_by(|a, b| IndexEntry::eviction_asc(a, b));

        let mut rollable: HashMap<&str, u64> = HashMap::new();
        for e in &actives {
            for (n, b) in holders.get(&e.index).into_iter().flatten() {
                *rollable.entry(n.as_str()).or_default() += b;
            }
        }
        // 与删除相同的门槛：滚动后的字节要能让节点的索引占比达标并高于保留下限
        let mut pending: HashMap<&str, u64> = over
            .iter()
            .filter_map(|id| {
                let u = nodes.get(id)?;
                let index_bytes = u.store_bytes + rollable.get(id.as_str()).copied().unwrap_or(0);
                let index_percent = index_bytes as f64 * 100.0 / u.total_bytes as f64;
                let eligible = index_percent >= cfg.min_indices_store_percent
                    && index_bytes > cfg.min_indices_store;
                if !eligible {
                    tracing::debug!(
                        "Node {} index store {:.1}% below rollover threshold",
                        u.id,
                        index_percent
                    );
                    return None;
                }
                Some((id.as_str(), u.shortfall(cfg.low_disk_usage_percent)))
            })
            .collect();

        let mut rolled = 0;
        for e in actives {
            let Some(held) = holders.get(&e.index) else {
                continue;
            };
            let short: Vec<(&str, u64)> = held
                .iter()
                .filter(|(n, b)| **b > 0 && pending.get(n.as_str()).is_some_and(|p| *p > 0))
                .map(|(n, b)| (n.as_str(), *b))
                .collect();
            if short.is_empty() {
                continue;
            }
            let Some(alias) = rollover.alias_for(e) else {
                continue;
            };
            tracing::warn!("Rolling over {} to free disk space", alias);
            if rollover.rollover_alias(&alias, body).await? {
                rolled += 1;
                for (n, b) in short {
                    if let Some(p) = pending.get_mut(n) {
                        *p = p.saturating_sub(b);
                    }
                }
            }
        }
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::KeyedRetention;
    use crate::config::{CleanerConfig, RolloverConfig, RolloverPatterns};
    use crate::store::{MemIndex, MemoryStore};
    use crate::testutil::{ago, node, ranged, started_loader, DAY, GIB};
    use std::sync::atomic::Ordering;

    fn entry(index: &str, max_t_secs: Option<u64>, size: u64) -> IndexEntry {
        IndexEntry {
            index: index.into(),
            max_t: max_t_secs.map(|s| std::time::UNIX_EPOCH + Duration::from_secs(s)),
            store_size: size,
            ..Default::default()
        }
    }

    #[test]
    fn oldest_hour_first_then_smallest() {
        let mut root = IndexGroup::default();
        let base = 10 * 86400;
        root.list = vec![
            entry("a", Some(base - 86400), 5),
            entry("b", Some(base - 2 * 86400 + 60), 1),
            entry("c", Some(base - 2 * 86400 + 120), 3),
            entry("d", Some(base - 3 * 86400), 9),
        ];
        let active = IndexEntry {
            active: true,
            ..entry("e", None, 0)
        };
        root.list.push(active);
        let names: Vec<_> = sorted_candidates(&root).iter().map(|e| e.index.as_str()).collect();
        assert_eq!(names, vec!["d", "b", "c", "a"]);
    }

    fn usage(id: &str, expect: u64, store: u64) -> NodeDiskUsage {
        NodeDiskUsage {
            id: id.into(),
            store_bytes: store,
            expect_delete: expect,
            pressured: true,
            ..Default::default()
        }
    }

    #[test]
    fn selection_respects_floor_and_target() {
        let candidates = vec![
            entry("i1", Some(1), 4),
            entry("i2", Some(2), 4),
            entry("i3", Some(3), 4),
            entry("i4", Some(4), 1),
        ];
        let refs: Vec<&IndexEntry> = candidates.iter().collect();
        let mut holders = Holders::new();
        for e in &candidates {
            holders.insert(e.index.clone(), BTreeMap::from([("n1".to_string(), e.store_size)]));
        }
        // n1: 13 字节可淘汰，下限 4，目标 9
        let mut nodes = HashMap::from([("n1".to_string(), usage("n1", 9, 13))]);
        let marked = select_for_deletion(&refs, &holders, &mut nodes, 4);
        assert_eq!(marked, vec!["i1", "i2", "i4"]);
        assert_eq!(nodes["n1"].deleted, 9);
        assert!(nodes["n1"].store_bytes - nodes["n1"].deleted >= 4);
    }

    #[test]
    fn unpressured_holders_are_ignored() {
        let e = entry("i1", Some(1), 4);
        let holders = Holders::from([(
            "i1".to_string(),
            BTreeMap::from([("n2".to_string(), 4u64)]),
        )]);
        let mut calm = usage("n2", 0, 4);
        calm.pressured = false;
        let mut nodes = HashMap::from([("n2".to_string(), calm)]);
        assert!(select_for_deletion(&[&e], &holders, &mut nodes, 0).is_empty());
    }

    fn disk_config() -> CleanerConfig {
        let mut cfg = CleanerConfig {
            enable: false,
            ..Default::default()
        };
        cfg.disk.enable = true;
        cfg.disk.high_disk_usage_percent = 85.0;
        cfg.disk.low_disk_usage_percent = 70.0;
        cfg.disk.min_indices_store_percent = 10.0;
        cfg.disk.min_indices_store = 15 * GIB;
        cfg
    }

    #[tokio::test]
    async fn evicts_oldest_down_to_floor_and_keeps_active() {
        let store = Arc::new(MemoryStore::new());
        let mut n1 = node("n1", 100 * GIB);
        n1.base_used_bytes = 50 * GIB;
        store.put_node(n1);
        for (i, days) in [5u32, 4, 3, 2].iter().enumerate() {
            let name = format!("spot-cpu-ns1-r-00000{}", i + 1);
            store.put_index(ranged(&name, ago(DAY * *days), 10 * GIB, &["n1"]));
        }
        store.put_index(MemIndex {
            store_size: 5 * GIB,
            nodes: vec!["n1".into()],
            ..MemIndex::new("spot-cpu-ns1-r-000005")
        });

        let shutdown = CancellationToken::new();
        let (loader, _e) = started_loader(store.clone(), &shutdown).await;
        let retention = Arc::new(KeyedRetention::with_default(365 * DAY));
        let cleaner = Cleaner::new(disk_config(), loader, retention, None).unwrap();

        cleaner.check_disk(&shutdown).await.unwrap();
        let left = store.index_names();
        assert_eq!(
            left,
            vec![
                "spot-cpu-ns1-r-000003",
                "spot-cpu-ns1-r-000004",
                "spot-cpu-ns1-r-000005"
            ]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn rolls_active_when_nothing_left_to_delete() {
        let store = Arc::new(MemoryStore::new());
        let mut n1 = node("n1", 100 * GIB);
        n1.base_used_bytes = 60 * GIB;
        store.put_node(n1);
        store.put_index(ranged("spot-cpu-ns1-r-000001", ago(2 * DAY), 10 * GIB, &["n1"]));
        store.put_index(MemIndex {
            store_size: 25 * GIB,
            nodes: vec!["n1".into()],
            aliases: vec!["spot-cpu-ns1-rollover".into()],
            ..MemIndex::new("spot-cpu-ns1-r-000002")
        });

        let shutdown = CancellationToken::new();
        let (loader, _e) = started_loader(store.clone(), &shutdown).await;
        let rollover = Rollover::new(
            RolloverConfig {
                patterns: vec![RolloverPatterns {
                    index: "spot-<metric>-<namespace>-r-{number}".into(),
                    alias: "spot-<metric>-<namespace>-rollover".into(),
                }],
                ..Default::default()
            },
            loader.clone(),
        )
        .unwrap();
        let mut cfg = disk_config();
        cfg.disk.min_indices_store = 0;
        cfg.disk.rollover_body_for_disk_clean = Some("{}".into());
        let retention = Arc::new(KeyedRetention::with_default(365 * DAY));
        let cleaner = Cleaner::new(cfg, loader, retention, Some(Arc::new(rollover))).unwrap();

        cleaner.check_disk(&shutdown).await.unwrap();
        assert_eq!(store.index_names(), vec!["spot-cpu-ns1-r-000003"]);
        let active = store.index("spot-cpu-ns1-r-000003").unwrap();
        assert_eq!(active.aliases, vec!["spot-cpu-ns1-rollover".to_string()]);
        shutdown.cancel();
    }

    fn rollover_for(loader: Arc<crate::loader::Loader>) -> Arc<Rollover> {
        let cfg = RolloverConfig {
            patterns: vec![RolloverPatterns {
                index: "spot-<metric>-<namespace>-r-{number}".into(),
                alias: "spot-<metric>-<namespace>-rollover".into(),
            }],
            ..Default::default()
        };
        Arc::new(Rollover::new(cfg, loader).unwrap())
    }

    #[tokio::test]
    async fn node_full_of_other_data_is_not_rolled() {
        let store = Arc::new(MemoryStore::new());
        let mut n1 = node("n1", 100 * GIB);
        n1.base_used_bytes = 90 * GIB;
        store.put_node(n1);
        store.put_index(ranged("spot-cpu-ns1-r-000001", ago(2 * DAY), GIB / 2, &["n1"]));
        store.put_index(MemIndex {
            store_size: GIB,
            nodes: vec!["n1".into()],
            aliases: vec!["spot-cpu-ns1-rollover".into()],
            ..MemIndex::new("spot-cpu-ns1-r-000002")
        });

        let shutdown = CancellationToken::new();
        let (loader, _e) = started_loader(store.clone(), &shutdown).await;
        let rollover = rollover_for(loader.clone());
        let mut cfg = disk_config();
        cfg.disk.min_indices_store = 0;
        cfg.disk.rollover_body_for_disk_clean = Some("{}".into());
        let retention = Arc::new(KeyedRetention::with_default(365 * DAY));
        let cleaner = Cleaner::new(cfg, loader, retention, Some(rollover)).unwrap();

        // 90% 被索引以外的数据占用，索引只占 1.5%：删除和滚动都不该发生
        cleaner.check_disk(&shutdown).await.unwrap();
        cleaner.check_disk(&shutdown).await.unwrap();
        assert_eq!(store.calls.rollover.load(Ordering::SeqCst), 0);
        assert_eq!(store.calls.delete.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.index_names(),
            vec!["spot-cpu-ns1-r-000001", "spot-cpu-ns1-r-000002"]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn calm_cluster_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        store.put_node(node("n1", 100 * GIB));
        store.put_index(ranged("spot-cpu-ns1-r-000001", ago(200 * DAY), 10 * GIB, &["n1"]));
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000002"));
        let shutdown = CancellationToken::new();
        let (loader, _e) = started_loader(store.clone(), &shutdown).await;
        let retention = Arc::new(KeyedRetention::with_default(365 * DAY));
        let cleaner = Cleaner::new(disk_config(), loader, retention, None).unwrap();

        cleaner.check_disk(&shutdown).await.unwrap();
        assert_eq!(store.index_names().len(), 2);
        shutdown.cancel();
    }
}
