mod cache;
mod query;
mod reload;

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::{leader_task, Election};
use crate::config::{LoaderCacheConfig, LoaderConfig};
use crate::error::{Error, Result};
use crate::index::{IndexGroup, MatchResult};
use crate::pattern::{Pattern, VarKind, VarValue};
use crate::store::{DocumentStore, KvCache};

pub use cache::SyncGate;
use reload::CachedRange;

/// 快照发布回调
pub type LoadListener = Arc<dyn Fn(&Arc<IndexGroup>) + Send + Sync>;

type Waiter = oneshot::Sender<Result<()>>;

/// 待处理的 reload 请求上限；满了说明已经有一次 reload 在排队
const TRIGGER_QUEUE: usize = 64;

/// 预编译的模板及其变量语义
pub(crate) struct CompiledPattern {
    pub pattern: Pattern,
    pub kinds: Vec<VarKind>,
}

pub(crate) struct PrefixPatterns {
    pub prefix: String,
    pub patterns: Vec<CompiledPattern>,
}

struct CacheMode {
    cfg: LoaderCacheConfig,
    kv: Arc<dyn KvCache>,
}

/// 索引加载器：周期性从存储端发现索引，构建按 key 分区的树并原子发布。
///
/// 读路径（`all_indices` / `indices`）无锁，只做一次 `ArcSwapOption::load_full`。
/// 所有 reload 请求汇入同一个循环，排队中的多个请求合并成一次 pass。
pub struct Loader {
    cfg: LoaderConfig,
    prefixes: Vec<PrefixPatterns>,
    store: Arc<dyn DocumentStore>,
    cache: Option<CacheMode>,
    snapshot: ArcSwapOption<IndexGroup>,
    listeners: RwLock<Vec<LoadListener>>,
    trigger_tx: mpsc::Sender<Option<Waiter>>,
    trigger_rx: Mutex<Option<mpsc::Receiver<Option<Waiter>>>>,
    time_ranges: DashMap<String, CachedRange>,
    gate: SyncGate,
}

impl Loader {
    pub fn new(cfg: LoaderConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let mut prefixes = Vec::with_capacity(cfg.indices.len());
        for group in &cfg.indices {
            let mut patterns = Vec::with_capacity(group.patterns.len());
            for text in &group.patterns {
                let pattern = Pattern::build(text)?;
                let kinds = pattern.var_kinds()?;
                patterns.push(CompiledPattern { pattern, kinds });
            }
            prefixes.push(PrefixPatterns {
                prefix: group.prefix.clone(),
                patterns,
            });
        }
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        Ok(Self {
            cfg,
            prefixes,
            store,
            cache: None,
            snapshot: ArcSwapOption::empty(),
            listeners: RwLock::new(Vec::new()),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            time_ranges: DashMap::new(),
            gate: SyncGate::default(),
        })
    }

    /// 启用共享缓存模式；配置里没有 `[loader.cache]` 时报错
    pub fn with_cache(mut self, kv: Arc<dyn KvCache>) -> Result<Self> {
        let cfg = self
            .cfg
            .cache
            .clone()
            .ok_or_else(|| Error::Config("loader.cache is not configured".into()))?;
        self.cache = Some(CacheMode { cfg, kv });
        Ok(self)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// 启动 reload 循环；缓存模式下额外注册 leader 上的缓存同步任务。
    ///
    /// 只能调用一次。
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken, election: &dyn Election) {
        let Some(rx) = self.trigger_rx.lock().take() else {
            tracing::warn!("Loader already started");
            return;
        };
        tokio::spawn(self.clone().reload_loop(rx, shutdown));

        if self.cache.is_some() {
            let loader = self.clone();
            election.on_leader(leader_task(move |token| loader.clone().cache_sync_loop(token)));
        }
    }

    /// 当前快照（非阻塞）；首次加载完成前为 None
    pub fn all_indices(&self) -> Option<Arc<IndexGroup>> {
        self.snapshot.load_full()
    }

    /// 等待首个快照；取消时返回 None
    pub async fn wait_and_get_indices(&self, token: &CancellationToken) -> Option<Arc<IndexGroup>> {
        loop {
            if let Some(g) = self.all_indices() {
                return Some(g);
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.cfg.wait_interval()) => {}
            }
        }
    }

    /// 请求一次 reload 并等待服务这次请求的那一轮 pass 的结果
    pub async fn reload_indices(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.trigger_tx
            .send(Some(tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// 请求一次 reload，不等待
    pub fn trigger_reload(&self) {
        // 队列满时已经有 reload 在排队
        let _ = self.trigger_tx.try_send(None);
    }

    /// 注册快照发布回调；已有快照时不会补发
    pub fn watch_load_event(&self, listener: impl Fn(&Arc<IndexGroup>) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// 物理索引名反查：按配置顺序尝试每个前缀下的每个模板
    pub fn match_index(&self, name: &str) -> Option<MatchResult> {
        self.prefixes
            .iter()
            .filter(|p| name.starts_with(&p.prefix))
            .find_map(|p| {
                p.patterns
                    .iter()
                    .find_map(|cp| self.match_pattern(&p.prefix, cp, name))
            })
    }

    fn match_pattern(&self, prefix: &str, cp: &CompiledPattern, name: &str) -> Option<MatchResult> {
        let m = cp.pattern.match_text(name, &self.cfg.invalid_chars)?;
        let mut num = -1;
        let mut timestamp = None;
        for (kind, value) in cp.kinds.iter().zip(&m.vars) {
            match kind.parse(value)? {
                VarValue::None => {}
                VarValue::Number(n) => num = n,
                VarValue::Timestamp(t) => timestamp = Some(t),
            }
        }
        Some(MatchResult {
            prefix: prefix.to_string(),
            pattern: cp.pattern.text().to_string(),
            keys: m.keys.iter().map(|k| k.to_string()).collect(),
            num,
            timestamp,
            fixed: cp.pattern.var_num() == 0,
        })
    }

    /// 原子替换快照并通知监听者
    fn publish(&self, group: Arc<IndexGroup>) {
        self.snapshot.store(Some(group.clone()));
        let listeners = self.listeners.read().clone();
        for l in &listeners {
            l(&group);
        }
    }

    /// 一轮加载：缓存模式下按 leader/follower 身份选择来源
    pub async fn load_once(&self) -> Result<()> {
        let group = match &self.cache {
            None => self.load_from_store().await?,
            Some(mode) => {
                self.gate.wait_ready().await;
                if self.gate.is_leading() {
                    let group = self.load_from_store().await?;
                    if let Err(e) = self.write_cache(mode, &group).await {
                        tracing::warn!("Refresh indices cache failed: {}", e);
                    }
                    group
                } else {
                    match self.read_cache(mode).await {
                        Ok(Some(group)) => group,
                        Ok(None) => {
                            tracing::debug!("Indices cache miss, loading from store");
                            self.load_from_store().await?
                        }
                        Err(e) => {
                            tracing::warn!("Read indices cache failed, loading from store: {}", e);
                            self.load_from_store().await?
                        }
                    }
                }
            }
        };
        let entries = group.entries().len();
        self.publish(Arc::new(group));
        tracing::debug!("Published indices snapshot: {} entries", entries);
        Ok(())
    }

    /// reload 主循环：合并排队中的请求，每一轮的结果回复给本轮收集到的所有等待方
    async fn reload_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Option<Waiter>>,
        shutdown: CancellationToken,
    ) {
        let interval = self.cfg.reload_interval();
        let mut waiters: Vec<Waiter> = Vec::new();
        loop {
            while let Ok(w) = rx.try_recv() {
                waiters.extend(w);
            }

            let res = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.load_once() => r,
            };
            if let Err(e) = &res {
                tracing::error!("Reload indices failed, keeping previous snapshot: {}", e);
            }
            for w in waiters.drain(..) {
                let _ = w.send(res.clone());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                t = rx.recv() => match t {
                    Some(w) => waiters.extend(w),
                    None => break,
                },
            }
        }
        tracing::info!("Indices reload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalElection;
    use crate::index::KeyPath;
    use crate::store::{MemIndex, MemoryCache, MemoryStore};
    use crate::testutil::{day, loader_config};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn ranged(name: &str, from: SystemTime, to: SystemTime) -> MemIndex {
        MemIndex {
            docs_count: 10,
            min_t: Some(from),
            max_t: Some(to),
            ..MemIndex::new(name)
        }
    }

    #[test]
    fn match_index_parses_vars() {
        let loader = Loader::new(loader_config(), Arc::new(MemoryStore::new())).unwrap();

        let m = loader.match_index("spot-cpu-ns1-r-000003").unwrap();
        assert_eq!(m.keys, vec!["cpu", "ns1"]);
        assert_eq!(m.num, 3);
        assert!(!m.fixed);

        let m = loader.match_index("spot-cpu-ns1.host-r-000001").unwrap();
        assert_eq!(m.keys, vec!["cpu", "ns1", "host"]);

        let m = loader.match_index("spot-cpu-ns1-86400000").unwrap();
        assert_eq!(m.timestamp, Some(day(1)));
        assert_eq!(m.num, -1);

        let m = loader.match_index("spot-cpu-ns1").unwrap();
        assert!(m.fixed);
        assert_eq!(m.pattern, "spot-<metric>-<namespace>");

        assert!(loader.match_index("other-cpu-ns1").is_none());
        assert!(loader.match_index("spot-cpu").is_none());
    }

    #[tokio::test]
    async fn load_builds_tree_with_one_active() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(ranged("spot-cpu-ns1-r-000001", day(1), day(2)));
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000002"));
        store.put_index(MemIndex::new("spot-cpu-ns1"));
        store.put_index(MemIndex::new("spot-bad"));
        let loader = Loader::new(loader_config(), store.clone()).unwrap();

        loader.load_once().await.unwrap();
        let root = loader.all_indices().unwrap();
        let g = root.get(&["cpu", "ns1"]).unwrap();
        assert_eq!(g.list.len(), 2);
        assert_eq!(g.list[0].index, "spot-cpu-ns1-r-000002");
        assert!(g.list[0].active);
        assert!(!g.list[1].active);
        // 非 active 的滚动索引查过时间范围，active 的没有
        assert_eq!(g.list[1].max_t, Some(day(2)));
        assert_eq!(g.list[0].max_t, None);
        assert_eq!(store.calls.time_range.load(Ordering::SeqCst), 1);
        assert_eq!(g.fixed.as_ref().unwrap().index, "spot-cpu-ns1");
    }

    #[tokio::test]
    async fn time_range_cache_reused_until_docs_change() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(ranged("spot-cpu-ns1-r-000001", day(1), day(2)));
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000002"));
        let loader = Loader::new(loader_config(), store.clone()).unwrap();

        loader.load_once().await.unwrap();
        loader.load_once().await.unwrap();
        assert_eq!(store.calls.time_range.load(Ordering::SeqCst), 1);

        let mut idx = store.index("spot-cpu-ns1-r-000001").unwrap();
        idx.docs_count += 1;
        idx.max_t = Some(day(3));
        store.put_index(idx);
        loader.load_once().await.unwrap();
        assert_eq!(store.calls.time_range.load(Ordering::SeqCst), 2);
        let root = loader.all_indices().unwrap();
        assert_eq!(root.get(&["cpu", "ns1"]).unwrap().list[1].max_t, Some(day(3)));
    }

    #[tokio::test]
    async fn timestamp_indices_get_a_day_window() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(MemIndex::new("spot-cpu-ns1-86400000"));
        store.put_index(MemIndex::new("spot-cpu-ns1-172800000"));
        let loader = Loader::new(loader_config(), store.clone()).unwrap();
        loader.load_once().await.unwrap();

        let root = loader.all_indices().unwrap();
        let g = root.get(&["cpu", "ns1"]).unwrap();
        assert_eq!(g.list[0].index, "spot-cpu-ns1-172800000");
        assert!(g.list[0].active);
        assert_eq!(g.list[1].min_t, Some(day(1)));
        assert_eq!(g.list[1].max_t, Some(day(2) - Duration::from_nanos(1)));
        assert_eq!(store.calls.time_range.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_reloads_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000001"));
        let loader = Arc::new(Loader::new(loader_config(), store.clone()).unwrap());
        let shutdown = CancellationToken::new();
        let election = LocalElection::new(shutdown.clone());
        loader.start(shutdown.clone(), &election);
        loader.wait_and_get_indices(&shutdown).await.unwrap();

        // 初次加载之后让每轮 pass 变慢，保证后续请求都在 pass 进行中到达
        store.set_list_delay(Duration::from_millis(200));
        let first = {
            let l = loader.clone();
            tokio::spawn(async move { l.reload_indices().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = loader.clone();
            handles.push(tokio::spawn(async move { l.reload_indices().await }));
        }
        assert_eq!(first.await.unwrap(), Ok(()));
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(()));
        }
        // 初次加载 + 进行中的一轮 + 排队请求合并后的一轮
        let lists = store.calls.list.load(Ordering::SeqCst);
        assert!(lists <= 3, "list calls: {lists}");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000001"));
        let loader = Arc::new(Loader::new(loader_config(), store.clone()).unwrap());
        let shutdown = CancellationToken::new();
        loader.start(shutdown.clone(), &LocalElection::new(shutdown.clone()));
        let before = loader.wait_and_get_indices(&shutdown).await.unwrap();

        store.set_unavailable(true);
        assert!(matches!(loader.reload_indices().await, Err(Error::Store(_))));
        let after = loader.all_indices().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn listeners_see_every_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(loader_config(), store).unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let s = seen.clone();
        loader.watch_load_event(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        loader.load_once().await.unwrap();
        loader.load_once().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_returns_none_when_cancelled() {
        let loader = Loader::new(loader_config(), Arc::new(MemoryStore::new())).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(loader.wait_and_get_indices(&token).await.is_none());
    }

    #[tokio::test]
    async fn cache_follower_reads_leader_blob() {
        let mut cfg = loader_config();
        cfg.cache = Some(LoaderCacheConfig::default());
        let kv = Arc::new(MemoryCache::new());

        // leader 写入 blob
        let leader_store = Arc::new(MemoryStore::new());
        leader_store.put_index(MemIndex::new("spot-cpu-ns1-r-000001"));
        let leader = Arc::new(
            Loader::new(cfg.clone(), leader_store)
                .unwrap()
                .with_cache(kv.clone())
                .unwrap(),
        );
        let shutdown = CancellationToken::new();
        let election = LocalElection::new(shutdown.clone());
        leader.start(shutdown.clone(), &election);
        leader.wait_and_get_indices(&shutdown).await.unwrap();
        let key = LoaderCacheConfig::default().key;
        for _ in 0..100 {
            if kv.get(&key).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // follower 的存储端是空的，只能从缓存拿到数据
        let follower_store = Arc::new(MemoryStore::new());
        let follower = Loader::new(cfg, follower_store.clone())
            .unwrap()
            .with_cache(kv)
            .unwrap();
        follower.load_once().await.unwrap();
        let names = follower
            .indices(
                &shutdown,
                UNIX_EPOCH,
                SystemTime::now(),
                &[KeyPath::new(["cpu", "ns1"])],
            )
            .await;
        assert_eq!(names, vec!["spot-cpu-ns1-r-000001".to_string()]);
        assert_eq!(follower_store.calls.list.load(Ordering::SeqCst), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_store() {
        let mut cfg = loader_config();
        cfg.cache = Some(LoaderCacheConfig::default());
        let store = Arc::new(MemoryStore::new());
        store.put_index(MemIndex::new("spot-cpu-ns1-r-000001"));
        let loader = Loader::new(cfg, store.clone())
            .unwrap()
            .with_cache(Arc::new(MemoryCache::new()))
            .unwrap();
        loader.load_once().await.unwrap();
        assert_eq!(store.calls.list.load(Ordering::SeqCst), 1);
        assert!(loader.all_indices().unwrap().get(&["cpu", "ns1"]).is_some());
    }

    #[test]
    fn cache_mode_requires_config() {
        let loader = Loader::new(loader_config(), Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            loader.with_cache(Arc::new(MemoryCache::new())),
            Err(Error::Config(_))
        ));
    }
}
