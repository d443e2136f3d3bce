use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::{leader_task, Election};
use crate::config::RolloverConfig;
use crate::error::{Error, Result};
use crate::index::{IndexEntry, IndexFilter};
use crate::loader::Loader;
use crate::pattern::Pattern;
use crate::store::DocumentStore;

struct RolloverPatterns {
    index: Pattern,
    alias: Pattern,
}

/// 按条件滚动 alias：active 索引超过阈值后由存储端切到新一代索引
pub struct Rollover {
    cfg: RolloverConfig,
    loader: Arc<Loader>,
    store: Arc<dyn DocumentStore>,
    patterns: Vec<RolloverPatterns>,
    body: serde_json::Value,
}

impl Rollover {
    pub fn new(cfg: RolloverConfig, loader: Arc<Loader>) -> Result<Self> {
        let mut patterns = Vec::with_capacity(cfg.patterns.len());
        for p in &cfg.patterns {
            let index = Pattern::build(&p.index)?;
            index.check_vars()?;
            let alias = Pattern::build(&p.alias)?;
            if index.key_num() != alias.key_num() {
                return Err(Error::Config(format!(
                    "rollover patterns {:?} and {:?} have different keys",
                    p.index, p.alias
                )));
            }
            patterns.push(RolloverPatterns { index, alias });
        }
        let body = parse_body(&cfg.body)?;
        Ok(Self {
            cfg,
            store: loader.store().clone(),
            loader,
            patterns,
            body,
        })
    }

    /// leader 上的周期滚动：首轮延迟 `initial_delay_secs`，之后每 `interval_secs` 一次
    pub fn start(self: &Arc<Self>, election: &dyn Election) {
        if !self.cfg.enable {
            return;
        }
        let rollover = self.clone();
        election.on_leader(leader_task(move |token| rollover.clone().rollover_loop(token)));
    }

    /// 物理索引名 → alias（按配置顺序尝试模板对）
    pub fn alias_for(&self, entry: &IndexEntry) -> Option<String> {
        let invalid = &self.loader.config().invalid_chars;
        self.patterns.iter().find_map(|p| {
            let m = p.index.match_text(&entry.index, invalid)?;
            p.alias.fill(&m.keys).ok()
        })
    }

    /// 对所有通过过滤器的 active 索引发起一次按条件滚动。
    ///
    /// 第一个失败中止本轮；只要有滚动发生，结束时 reload 一次。
    pub async fn rollover_indices(
        &self,
        token: &CancellationToken,
        filter: Option<IndexFilter>,
    ) -> Result<()> {
        let Some(root) = self.loader.wait_and_get_indices(token).await else {
            return Err(Error::Cancelled);
        };
        let mut targets = Vec::new();
        root.walk(&mut |g| {
            if let Some(e) = g.list.first() {
                if e.active && filter.as_ref().map_or(true, |f| f(e)) {
                    targets.push(e.clone());
                }
            }
        });

        let mut rolled = 0usize;
        let mut result = Ok(());
        for entry in &targets {
            if token.is_cancelled() {
                result = Err(Error::Cancelled);
                break;
            }
            let Some(alias) = self.alias_for(entry) else {
                tracing::debug!("No rollover alias for index {}", entry.index);
                continue;
            };
            match self.rollover_alias(&alias, &self.body).await {
                Ok(true) => rolled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Rollover alias {} failed: {}", alias, e);
                    result = Err(e);
                    break;
                }
            }
        }

        if rolled > 0 {
            tracing::info!("Rolled over {} aliases", rolled);
            self.loader.reload_indices().await?;
        }
        result
    }

    /// 单个 alias 的滚动；返回是否真的切换了
    pub async fn rollover_alias(&self, alias: &str, body: &serde_json::Value) -> Result<bool> {
        let timeout = Duration::from_secs(self.cfg.request_timeout_secs);
        let res = tokio::time::timeout(timeout, self.store.rollover(alias, body)).await??;
        if res.rolled_over {
            tracing::info!(
                "Rollover alias {}: {} -> {}",
                alias,
                res.old_index,
                res.new_index
            );
        } else {
            tracing::debug!("Rollover alias {}: conditions not met", alias);
        }
        Ok(res.rolled_over)
    }

    async fn rollover_loop(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(self.cfg.initial_delay_secs)) => {}
        }
        let interval = Duration::from_secs(self.cfg.interval_secs.max(1));
        loop {
            if let Err(e) = self.rollover_indices(&shutdown, None).await {
                if e != Error::Cancelled {
                    tracing::error!("Rollover pass failed: {}", e);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// 解析滚动条件 body（JSON 文本）
pub fn parse_body(text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid rollover body: {e}")))
}
