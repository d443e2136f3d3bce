use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::cleaner::Cleaner;
use crate::error::{Error, Result};
use crate::index::{IndexEntry, IndexFilter};

impl Cleaner {
    /// fixed 与 active 永不过期；时间范围未解析的索引不参与
    pub(crate) fn is_expired(&self, entry: &IndexEntry, now: SystemTime) -> bool {
        if entry.fixed || entry.active {
            return false;
        }
        match entry.max_t {
            // TTL 大到溢出时间范围即永不过期
            Some(t) => t
                .checked_add(self.retention.ttl(entry))
                .is_some_and(|deadline| now > deadline),
            None => false,
        }
    }

    /// 一轮 TTL 清理：找出过期索引，交给删除 worker，有删除时 reload
    pub(super) async fn clean_expired(
        &self,
        filter: Option<&IndexFilter>,
        token: &CancellationToken,
    ) -> Result<()> {
        let Some(root) = self.loader.wait_and_get_indices(token).await else {
            return Err(Error::Cancelled);
        };
        let now = SystemTime::now();
        let expired: Vec<String> = root
            .entries()
            .into_iter()
            .filter(|e| self.is_expired(e, now))
            .filter(|e| filter.map_or(true, |f| f(*e)))
            .map(|e| e.index.clone())
            .collect();
        if expired.is_empty() {
            tracing::debug!("No expired indices");
            return Ok(());
        }

        tracing::info!("Cleaning {} expired indices", expired.len());
        if let Err(e) = self.delete_and_wait(expired, token).await {
            // 前面的批次可能已经删掉，尽快让快照跟上
            self.loader.trigger_reload();
            return Err(e);
        }
        self.loader.reload_indices().await
    }
}
