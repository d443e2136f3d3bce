pub mod memory;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::{ClusterState, MemIndex, MemNode, MemoryCache, MemoryStore, StoreCalls};

/// `_cat/indices` 的一行
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatIndex {
    pub index: String,
    pub docs_count: u64,
    pub docs_deleted: u64,
    pub store_size: u64,
}

/// 节点文件系统统计
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFsStats {
    pub id: String,
    pub name: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// 分片路由表的一行：哪个索引的分片落在哪个节点
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub index: String,
    pub node_id: String,
    pub store_bytes: u64,
    pub primary: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloverResult {
    pub rolled_over: bool,
    pub old_index: String,
    pub new_index: String,
}

/// 外部文档存储（具体的 wire 协议不在本 crate 范围内）。
///
/// ## 契约
/// - `create_index` 遇到同名索引时必须返回 `Error::AlreadyExists`。
/// - `time_range` 对空索引返回 `Ok(None)`。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 列出名字以 `prefix` 开头的索引
    async fn list_indices(&self, prefix: &str) -> Result<Vec<CatIndex>>;

    /// 对时间字段做一次 min/max 聚合
    async fn time_range(&self, index: &str, field: &str)
        -> Result<Option<(SystemTime, SystemTime)>>;

    async fn create_index(&self, index: &str, alias: Option<&str>) -> Result<()>;

    async fn delete_indices(&self, indices: &[String]) -> Result<()>;

    /// 按条件滚动 alias；`body` 形如 `{"conditions": {"max_size": "20gb"}}`
    async fn rollover(&self, alias: &str, body: &serde_json::Value) -> Result<RolloverResult>;

    async fn node_stats(&self) -> Result<Vec<NodeFsStats>>;

    async fn shard_routing(&self) -> Result<Vec<ShardRouting>>;
}

/// 共享 KV 缓存（多个 loader 实例共享一份快照）
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, expiry: Duration) -> Result<()>;
}
