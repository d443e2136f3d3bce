use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::parse_bytes;
use crate::error::{Error, Result};
use crate::index::entry::unix_nanos;
use crate::store::{
    CatIndex, DocumentStore, KvCache, NodeFsStats, RolloverResult, ShardRouting,
};

/// 内存中的一个索引；分片平均分布在 `nodes` 上
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemIndex {
    pub name: String,
    #[serde(default)]
    pub docs_count: u64,
    #[serde(default)]
    pub docs_deleted: u64,
    #[serde(default)]
    pub store_size: u64,
    #[serde(default, with = "unix_nanos")]
    pub min_t: Option<SystemTime>,
    #[serde(default, with = "unix_nanos")]
    pub max_t: Option<SystemTime>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl MemIndex {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn shard_bytes(&self) -> u64 {
        match self.nodes.len() {
            0 => 0,
            n => self.store_size / n as u64,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub total_bytes: u64,
    /// 索引分片以外的占用
    #[serde(default)]
    pub base_used_bytes: u64,
}

/// 可序列化的集群描述（CLI simulate 的输入）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub nodes: Vec<MemNode>,
    #[serde(default)]
    pub indices: Vec<MemIndex>,
}

/// 各接口调用计数
#[derive(Debug, Default)]
pub struct StoreCalls {
    pub list: AtomicUsize,
    pub time_range: AtomicUsize,
    pub create: AtomicUsize,
    pub delete: AtomicUsize,
    pub rollover: AtomicUsize,
}

#[derive(Default)]
struct State {
    indices: BTreeMap<String, MemIndex>,
    nodes: Vec<MemNode>,
}

/// 进程内文档存储：测试用的 fake，也是 `simulate` 子命令的后端
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub calls: StoreCalls,
    unavailable: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
    /// 删除包含这些索引的批次时返回错误
    failing_deletes: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(cluster: ClusterState) -> Self {
        let store = Self::new();
        {
            let mut st = store.state.lock();
            st.nodes = cluster.nodes;
            for idx in cluster.indices {
                st.indices.insert(idx.name.clone(), idx);
            }
        }
        store
    }

    pub fn put_index(&self, index: MemIndex) {
        self.state.lock().indices.insert(index.name.clone(), index);
    }

    pub fn put_node(&self, node: MemNode) {
        let mut st = self.state.lock();
        st.nodes.retain(|n| n.id != node.id);
        st.nodes.push(node);
    }

    pub fn index(&self, name: &str) -> Option<MemIndex> {
        self.state.lock().indices.get(name).cloned()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    /// 模拟存储端不可用：之后所有调用返回 `Error::Store`
    pub fn set_unavailable(&self, v: bool) {
        self.unavailable.store(v, Ordering::SeqCst);
    }

    /// 让 create_index 变慢，用于并发去重测试
    pub fn set_create_delay(&self, d: Duration) {
        *self.create_delay.lock() = Some(d);
    }

    /// 让 list_indices 变慢，用于 reload 合并测试
    pub fn set_list_delay(&self, d: Duration) {
        *self.list_delay.lock() = Some(d);
    }

    pub fn fail_deletes_of(&self, name: &str) {
        self.failing_deletes.lock().push(name.to_string());
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Store("store unavailable".into()));
        }
        Ok(())
    }

    fn used_bytes(st: &State, node: &MemNode) -> u64 {
        node.base_used_bytes
            + st
                .indices
                .values()
                .filter(|i| i.nodes.contains(&node.id))
                .map(|i| i.shard_bytes())
                .sum::<u64>()
    }
}

/// `-000001` → `-000002`，保持位宽
fn next_generation(name: &str) -> Option<String> {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let (head, num) = name.split_at(name.len() - digits);
    let n: u64 = num.parse().ok()?;
    Some(format!("{head}{:0width$}", n + 1, width = digits))
}

fn conditions_met(index: &MemIndex, body: &serde_json::Value) -> bool {
    let Some(conds) = body.get("conditions").and_then(|c| c.as_object()) else {
        return true;
    };
    if conds.is_empty() {
        return true;
    }
    conds.iter().any(|(k, v)| match k.as_str() {
        "max_size" => v
            .as_str()
            .and_then(|s| parse_bytes(s).ok())
            .is_some_and(|limit| index.store_size >= limit),
        "max_docs" => v.as_u64().is_some_and(|limit| index.docs_count >= limit),
        _ => false,
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_indices(&self, prefix: &str) -> Result<Vec<CatIndex>> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.check_available()?;
        let st = self.state.lock();
        Ok(st
            .indices
            .values()
            .filter(|i| i.name.starts_with(prefix))
            .map(|i| CatIndex {
                index: i.name.clone(),
                docs_count: i.docs_count,
                docs_deleted: i.docs_deleted,
                store_size: i.store_size,
            })
            .collect())
    }

    async fn time_range(
        &self,
        index: &str,
        _field: &str,
    ) -> Result<Option<(SystemTime, SystemTime)>> {
        self.calls.time_range.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let st = self.state.lock();
        let idx = st
            .indices
            .get(index)
            .ok_or_else(|| Error::NotFound(index.to_string()))?;
        Ok(idx.min_t.zip(idx.max_t))
    }

    async fn create_index(&self, index: &str, alias: Option<&str>) -> Result<()> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.check_available()?;
        let mut st = self.state.lock();
        if st.indices.contains_key(index) {
            return Err(Error::AlreadyExists(index.to_string()));
        }
        if let Some(alias) = alias {
            if st.indices.contains_key(alias) {
                return Err(Error::Store(format!(
                    "invalid alias name [{alias}], an index exists with the same name"
                )));
            }
        }
        let node = st
            .nodes
            .iter()
            .min_by_key(|n| Self::used_bytes(&st, n))
            .map(|n| n.id.clone());
        st.indices.insert(
            index.to_string(),
            MemIndex {
                name: index.to_string(),
                aliases: alias.map(|a| vec![a.to_string()]).unwrap_or_default(),
                nodes: node.into_iter().collect(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<()> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        {
            let failing = self.failing_deletes.lock();
            if let Some(name) = indices.iter().find(|n| failing.contains(*n)) {
                return Err(Error::Store(format!("delete index [{name}] rejected")));
            }
        }
        let mut st = self.state.lock();
        for name in indices {
            st.indices.remove(name);
        }
        Ok(())
    }

    async fn rollover(&self, alias: &str, body: &serde_json::Value) -> Result<RolloverResult> {
        self.calls.rollover.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut st = self.state.lock();
        let current = st
            .indices
            .values()
            .find(|i| i.aliases.iter().any(|a| a == alias))
            .cloned()
            .ok_or_else(|| Error::NotFound(alias.to_string()))?;

        let new_index = next_generation(&current.name).ok_or_else(|| {
            Error::Store(format!(
                "index name [{}] does not match pattern '^.*-\\d+$'",
                current.name
            ))
        })?;
        if !conditions_met(&current, body) {
            return Ok(RolloverResult {
                rolled_over: false,
                old_index: current.name,
                new_index,
            });
        }
        if st.indices.contains_key(&new_index) {
            return Err(Error::AlreadyExists(new_index));
        }

        if let Some(old) = st.indices.get_mut(&current.name) {
            old.aliases.retain(|a| a != alias);
        }
        st.indices.insert(
            new_index.clone(),
            MemIndex {
                name: new_index.clone(),
                aliases: vec![alias.to_string()],
                nodes: current.nodes.clone(),
                ..Default::default()
            },
        );
        Ok(RolloverResult {
            rolled_over: true,
            old_index: current.name,
            new_index,
        })
    }

    async fn node_stats(&self) -> Result<Vec<NodeFsStats>> {
        self.check_available()?;
        let st = self.state.lock();
        Ok(st
            .nodes
            .iter()
            .map(|n| NodeFsStats {
                id: n.id.clone(),
                name: if n.name.is_empty() {
                    n.id.clone()
                } else {
                    n.name.clone()
                },
                total_bytes: n.total_bytes,
                available_bytes: n.total_bytes.saturating_sub(Self::used_bytes(&st, n)),
            })
            .collect())
    }

    async fn shard_routing(&self) -> Result<Vec<ShardRouting>> {
        self.check_available()?;
        let st = self.state.lock();
        Ok(st
            .indices
            .values()
            .flat_map(|i| {
                let bytes = i.shard_bytes();
                i.nodes
                    .iter()
                    .enumerate()
                    .map(move |(n, node)| ShardRouting {
                        index: i.name.clone(),
                        node_id: node.clone(),
                        store_bytes: bytes,
                        primary: n == 0,
                    })
            })
            .collect())
    }
}

/// 进程内 KV 缓存，带过期
#[derive(Default)]
pub struct MemoryCache {
    map: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.map.lock();
        match map.get(key) {
            Some((v, deadline)) if *deadline > Instant::now() => return Ok(Some(v.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // 已过期
        map.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, expiry: Duration) -> Result<()> {
        self.map
            .lock()
            .insert(key.to_string(), (value, Instant::now() + expiry));
        Ok(())
    }
}
