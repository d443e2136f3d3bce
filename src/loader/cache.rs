use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::index::IndexGroup;
use crate::loader::{CacheMode, Loader};

#[derive(Default)]
struct SyncState {
    leading: bool,
    synced: bool,
}

/// leader 切换时的同步闸门（mutex + notify 组成的条件变量）。
///
/// 刚当选、首轮缓存同步还没完成时，本节点的 reload 在此等待；
/// 其余时刻直接放行。
#[derive(Default)]
pub struct SyncGate {
    state: Mutex<SyncState>,
    notify: Notify,
}

impl SyncGate {
    pub fn begin_leading(&self) {
        let mut st = self.state.lock();
        st.leading = true;
        st.synced = false;
    }

    pub fn mark_synced(&self) {
        self.state.lock().synced = true;
        self.notify.notify_waiters();
    }

    pub fn end_leading(&self) {
        {
            let mut st = self.state.lock();
            st.leading = false;
            st.synced = false;
        }
        self.notify.notify_waiters();
    }

    pub fn is_leading(&self) -> bool {
        self.state.lock().leading
    }

    pub async fn wait_ready(&self) {
        loop {
            // 先注册再检查，避免错过检查与 await 之间的 notify
            let notified = self.notify.notified();
            {
                let st = self.state.lock();
                if !st.leading || st.synced {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Loader {
    pub(super) async fn read_cache(&self, mode: &CacheMode) -> Result<Option<IndexGroup>> {
        let timeout = self.cfg.request_timeout();
        let Some(blob) = tokio::time::timeout(timeout, mode.kv.get(&mode.cfg.key)).await?? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&blob)?))
    }

    pub(super) async fn write_cache(&self, mode: &CacheMode, group: &IndexGroup) -> Result<()> {
        let blob = serde_json::to_string(group)?;
        let expiry = Duration::from_secs(mode.cfg.expiration_secs);
        let timeout = self.cfg.request_timeout();
        tokio::time::timeout(timeout, mode.kv.set(&mode.cfg.key, blob, expiry)).await??;
        Ok(())
    }

    /// leader 上的缓存同步循环：存储端 → JSON → KvCache。
    ///
    /// 只写缓存，不发布快照；发布仍由 reload 循环负责。
    pub(super) async fn cache_sync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mode) = &self.cache else {
            return;
        };
        let interval = Duration::from_secs(mode.cfg.sync_interval_secs.max(1));
        self.gate.begin_leading();
        tracing::info!("Indices cache sync started, key={}", mode.cfg.key);
        loop {
            let res = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.load_from_store() => r,
            };
            match res {
                Ok(group) => {
                    if let Err(e) = self.write_cache(mode, &group).await {
                        tracing::warn!("Sync indices cache failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Load indices for cache sync failed: {}", e),
            }
            // 失败也放行，否则本节点的 reload 会一直卡住
            self.gate.mark_synced();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.gate.end_leading();
        tracing::info!("Indices cache sync stopped");
    }
}
