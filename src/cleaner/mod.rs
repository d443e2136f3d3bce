pub mod disk;
pub mod retention;
mod ttl;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::{leader_task, Election};
use crate::config::CleanerConfig;
use crate::error::{Error, Result};
use crate::index::IndexFilter;
use crate::loader::Loader;
use crate::rollover::Rollover;
use crate::store::DocumentStore;

pub use disk::NodeDiskUsage;
pub use retention::{KeyedRetention, RetentionStrategy};

type Done = oneshot::Sender<Result<()>>;

/// 交给删除 worker 的一批索引
struct DeleteRequest {
    indices: Vec<String>,
    done: Option<Done>,
}

/// 一次 TTL 检查；周期触发的请求没有 `done`
struct CheckRequest {
    filter: Option<IndexFilter>,
    done: Option<Done>,
}

const QUEUE: usize = 16;

struct Receivers {
    delete: mpsc::Receiver<DeleteRequest>,
    check: mpsc::Receiver<CheckRequest>,
}

/// 索引清理：TTL 过期删除 + 磁盘水位淘汰。
///
/// 删除统一经过一个 worker 串行执行；TTL 检查循环在每个节点上消费手动请求，
/// 周期触发、磁盘检查与保留策略加载只在 leader 上运行。
pub struct Cleaner {
    cfg: CleanerConfig,
    loader: Arc<Loader>,
    store: Arc<dyn DocumentStore>,
    retention: Arc<dyn RetentionStrategy>,
    rollover: Option<Arc<Rollover>>,
    rollover_body: Option<serde_json::Value>,
    delete_tx: mpsc::Sender<DeleteRequest>,
    check_tx: mpsc::Sender<CheckRequest>,
    receivers: Mutex<Option<Receivers>>,
}

impl Cleaner {
    pub fn new(
        cfg: CleanerConfig,
        loader: Arc<Loader>,
        retention: Arc<dyn RetentionStrategy>,
        rollover: Option<Arc<Rollover>>,
    ) -> Result<Self> {
        if cfg.delete_batch_size == 0 {
            return Err(Error::Config("cleaner.delete_batch_size must be > 0".into()));
        }
        let rollover_body = cfg
            .disk
            .rollover_body_for_disk_clean
            .as_deref()
            .map(crate::rollover::parse_body)
            .transpose()?;
        if rollover_body.is_some() && rollover.is_none() {
            return Err(Error::Config(
                "cleaner.disk.rollover_body_for_disk_clean requires rollover patterns".into(),
            ));
        }
        let (delete_tx, delete) = mpsc::channel(QUEUE);
        let (check_tx, check) = mpsc::channel(QUEUE);
        Ok(Self {
            cfg,
            store: loader.store().clone(),
            loader,
            retention,
            rollover,
            rollover_body,
            delete_tx,
            check_tx,
            receivers: Mutex::new(Some(Receivers { delete, check })),
        })
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken, election: &dyn Election) {
        let Some(rx) = self.receivers.lock().take() else {
            tracing::warn!("Cleaner already started");
            return;
        };
        tokio::spawn(self.clone().delete_loop(rx.delete, shutdown.clone()));
        tokio::spawn(self.clone().check_loop(rx.check, shutdown));

        let retention = self.retention.clone();
        election.on_leader(leader_task(move |token| {
            let retention = retention.clone();
            async move { retention.loading(token).await }
        }));

        if self.cfg.enable {
            let cleaner = self.clone();
            election.on_leader(leader_task(move |token| cleaner.clone().ttl_ticker(token)));
        }
        if self.cfg.disk.enable {
            let cleaner = self.clone();
            election.on_leader(leader_task(move |token| cleaner.clone().disk_loop(token)));
        }
    }

    /// 手动触发一次 TTL 清理并等待结果
    pub async fn clean_indices(
        &self,
        token: &CancellationToken,
        filter: Option<IndexFilter>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = CheckRequest {
            filter,
            done: Some(tx),
        };
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            r = self.check_tx.send(req) => r.map_err(|_| Error::Cancelled)?,
        }
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            r = rx => r.map_err(|_| Error::Cancelled)?,
        }
    }

    /// 把一批索引交给删除 worker 并等待完成
    async fn delete_and_wait(&self, indices: Vec<String>, token: &CancellationToken) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = DeleteRequest {
            indices,
            done: Some(tx),
        };
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            r = self.delete_tx.send(req) => r.map_err(|_| Error::Cancelled)?,
        }
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            r = rx => r.map_err(|_| Error::Cancelled)?,
        }
    }

    async fn delete_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DeleteRequest>, shutdown: CancellationToken) {
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            let res = self.delete_batches(&req.indices).await;
            if let Some(done) = req.done {
                let _ = done.send(res);
            }
        }
        tracing::info!("Index delete worker stopped");
    }

    /// 分批删除；任何一批失败即停止，剩下的留给下一轮
    async fn delete_batches(&self, indices: &[String]) -> Result<()> {
        let timeout = Duration::from_secs(self.cfg.request_timeout_secs);
        for batch in indices.chunks(self.cfg.delete_batch_size) {
            let res = tokio::time::timeout(timeout, self.store.delete_indices(batch)).await;
            match res {
                Ok(Ok(())) => tracing::info!("Deleted indices: {:?}", batch),
                Ok(Err(e)) => {
                    tracing::error!("Delete indices {:?} failed: {}", batch, e);
                    return Err(e);
                }
                Err(_) => {
                    tracing::error!("Delete indices {:?} timed out", batch);
                    return Err(Error::Timeout);
                }
            }
        }
        Ok(())
    }

    async fn check_loop(self: Arc<Self>, mut rx: mpsc::Receiver<CheckRequest>, shutdown: CancellationToken) {
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            let res = self.clean_expired(req.filter.as_ref(), &shutdown).await;
            match req.done {
                Some(done) => {
                    let _ = done.send(res);
                }
                None => {
                    if let Err(e) = res {
                        if e != Error::Cancelled {
                            tracing::error!("Periodic index clean failed: {}", e);
                        }
                    }
                }
            }
        }
        tracing::info!("Index clean loop stopped");
    }

    /// leader 上的周期触发器
    async fn ttl_ticker(self: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_secs(self.cfg.check_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let req = CheckRequest {
                filter: None,
                done: None,
            };
            // 队列满说明上一轮还没处理完
            if self.check_tx.try_send(req).is_err() {
                tracing::debug!("Index clean still pending, skip this tick");
            }
        }
    }
}
