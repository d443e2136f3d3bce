use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cleaner::{Cleaner, RetentionStrategy};
use crate::cluster::Election;
use crate::config::Config;
use crate::creator::Creator;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::rollover::Rollover;
use crate::stats::LifecycleReport;
use crate::store::{DocumentStore, KvCache};

/// 把各组件按配置组装起来，并持有进程级的 shutdown token
pub struct Service {
    pub loader: Arc<Loader>,
    pub creator: Arc<Creator>,
    pub cleaner: Arc<Cleaner>,
    pub rollover: Arc<Rollover>,
    shutdown: CancellationToken,
}

impl Service {
    pub fn build(
        cfg: Config,
        store: Arc<dyn DocumentStore>,
        cache: Option<Arc<dyn KvCache>>,
        retention: Arc<dyn RetentionStrategy>,
    ) -> Result<Self> {
        cfg.validate()?;
        let mut loader = Loader::new(cfg.loader.clone(), store)?;
        if cfg.loader.cache.is_some() {
            let kv = cache.ok_or_else(|| {
                Error::Config("loader.cache is configured but no cache was provided".into())
            })?;
            loader = loader.with_cache(kv)?;
        }
        let loader = Arc::new(loader);

        let creator = Arc::new(Creator::new(cfg.creator.clone(), loader.clone())?);
        let rollover = Arc::new(Rollover::new(cfg.rollover.clone(), loader.clone())?);
        let for_disk = (!cfg.rollover.patterns.is_empty()).then(|| rollover.clone());
        let cleaner = Arc::new(Cleaner::new(
            cfg.cleaner.clone(),
            loader.clone(),
            retention,
            for_disk,
        )?);

        Ok(Self {
            loader,
            creator,
            cleaner,
            rollover,
            shutdown: CancellationToken::new(),
        })
    }

    /// 启动所有后台循环；破坏性的循环通过 `election` 只在 leader 上运行
    pub fn start(&self, election: &dyn Election) {
        self.loader.start(self.shutdown.clone(), election);
        self.creator.start(self.shutdown.clone());
        self.cleaner.start(self.shutdown.clone(), election);
        self.rollover.start(election);
        tracing::info!("index-lifecycle service started");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down...");
        self.shutdown.cancel();
    }

    /// 定期打印快照报告
    pub async fn report_loop(self: Arc<Self>, interval: Duration) {
        let token = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Some(root) = self.loader.all_indices() {
                tracing::info!("\n{}", LifecycleReport::from_snapshot(&root));
            }
        }
    }
}
