//! 单元测试共用的配置与时间工具

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::cluster::LocalElection;
use crate::config::{IndexPatterns, LoaderConfig};
use crate::loader::Loader;
use crate::store::{MemIndex, MemNode, MemoryStore};

pub fn loader_config() -> LoaderConfig {
    LoaderConfig {
        indices: vec![IndexPatterns {
            prefix: "spot-".into(),
            patterns: vec![
                "spot-<metric>-<namespace>-r-{number}".into(),
                "spot-<metric>-<namespace>.<key>-r-{number}".into(),
                "spot-<metric>-<namespace>-{timestamp}".into(),
                "spot-<metric>-<namespace>".into(),
            ],
        }],
        reload_interval_secs: 3600,
        wait_interval_ms: 10,
        ..Default::default()
    }
}

pub fn day(d: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(d * 86400)
}

pub fn ago(d: Duration) -> SystemTime {
    SystemTime::now() - d
}

pub const DAY: Duration = Duration::from_secs(86400);
pub const GIB: u64 = 1 << 30;

/// 带时间范围与大小的非空索引
pub fn ranged(name: &str, max_t: SystemTime, store_size: u64, nodes: &[&str]) -> MemIndex {
    MemIndex {
        docs_count: 100,
        store_size,
        min_t: Some(max_t - Duration::from_secs(3600)),
        max_t: Some(max_t),
        nodes: nodes.iter().map(|n| n.to_string()).collect(),
        ..MemIndex::new(name)
    }
}

pub fn node(id: &str, total_bytes: u64) -> MemNode {
    MemNode {
        id: id.into(),
        name: id.into(),
        total_bytes,
        base_used_bytes: 0,
    }
}

/// 启动好的 loader（reload 循环已运行，首个快照已发布）
pub async fn started_loader(
    store: Arc<MemoryStore>,
    shutdown: &CancellationToken,
) -> (Arc<Loader>, Arc<LocalElection>) {
    let loader = Arc::new(Loader::new(loader_config(), store).unwrap());
    let election = Arc::new(LocalElection::new(shutdown.clone()));
    loader.start(shutdown.clone(), election.as_ref());
    loader.wait_and_get_indices(shutdown).await.unwrap();
    (loader, election)
}
