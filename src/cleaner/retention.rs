use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::index::IndexEntry;

/// 保留策略：给出每个索引的 TTL。
///
/// `loading` 在本节点当选 leader 时运行，用于从外部刷新策略数据；默认什么都不做。
#[async_trait]
pub trait RetentionStrategy: Send + Sync {
    fn ttl(&self, entry: &IndexEntry) -> Duration;

    async fn loading(&self, _shutdown: CancellationToken) {}
}

/// 默认 TTL + 按 key 前缀覆盖，最长前缀优先
pub struct KeyedRetention {
    default_ttl: Duration,
    rules: Vec<(Vec<String>, Duration)>,
}

impl KeyedRetention {
    pub fn new(cfg: &RetentionConfig) -> Self {
        let mut rules: Vec<_> = cfg
            .rules
            .iter()
            .map(|r| (r.keys.clone(), Duration::from_secs(r.ttl_secs)))
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            default_ttl: Duration::from_secs(cfg.default_ttl_secs),
            rules,
        }
    }

    pub fn with_default(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            rules: Vec::new(),
        }
    }
}

#[async_trait]
impl RetentionStrategy for KeyedRetention {
    fn ttl(&self, entry: &IndexEntry) -> Duration {
        self.rules
            .iter()
            .find(|(prefix, _)| entry.keys.starts_with(prefix))
            .map_or(self.default_ttl, |(_, ttl)| *ttl)
    }
}
