use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::CreatorConfig;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::pattern::Pattern;
use crate::store::DocumentStore;

/// 交给创建 worker 的一次请求
struct CreateRequest {
    keys: Vec<String>,
    index: String,
    alias: String,
    done: oneshot::Sender<Result<()>>,
}

struct AliasPatterns {
    first_index: Pattern,
    alias: Pattern,
}

/// 索引创建器。
///
/// 所有创建请求都经过同一个 channel 交给唯一的 worker 串行处理，
/// 所以同一个 alias 任何时刻最多只有一个创建请求在存储端执行。
pub struct Creator {
    cfg: CreatorConfig,
    loader: Arc<Loader>,
    store: Arc<dyn DocumentStore>,
    /// key 数 → 模板对
    patterns: HashMap<usize, AliasPatterns>,
    fixed_patterns: HashMap<usize, Pattern>,
    tx: mpsc::UnboundedSender<CreateRequest>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<CreateRequest>>>,
    /// 本进程已创建过的 alias，loader 每次发布快照时清空
    created: Arc<Mutex<HashSet<String>>>,
}

impl Creator {
    pub fn new(cfg: CreatorConfig, loader: Arc<Loader>) -> Result<Self> {
        let mut patterns = HashMap::new();
        for p in &cfg.patterns {
            let first_index = Pattern::build(&p.first_index)?;
            let alias = Pattern::build(&p.alias)?;
            for pt in [&first_index, &alias] {
                if pt.var_num() > 0 {
                    return Err(Error::Config(format!(
                        "creator pattern {:?} must not contain vars",
                        pt.text()
                    )));
                }
            }
            if first_index.key_num() != alias.key_num() {
                return Err(Error::Config(format!(
                    "creator patterns {:?} and {:?} have different keys",
                    p.first_index, p.alias
                )));
            }
            let arity = alias.key_num();
            if patterns
                .insert(arity, AliasPatterns { first_index, alias })
                .is_some()
            {
                return Err(Error::Config(format!(
                    "creator has two patterns with {arity} keys"
                )));
            }
        }

        let mut fixed_patterns = HashMap::new();
        for text in &cfg.fixed_patterns {
            let p = Pattern::build(text)?;
            if p.var_num() > 0 {
                return Err(Error::VarLength(text.clone()));
            }
            if fixed_patterns.insert(p.key_num(), p).is_some() {
                return Err(Error::Config(format!(
                    "creator has two fixed patterns with the same keys: {text:?}"
                )));
            }
        }

        let created: Arc<Mutex<HashSet<String>>> = Arc::default();
        let reset = created.clone();
        loader.watch_load_event(move |_| reset.lock().clear());

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            store: loader.store().clone(),
            loader,
            patterns,
            fixed_patterns,
            tx,
            rx: Mutex::new(Some(rx)),
            created,
        })
    }

    /// 启动唯一的创建 worker；只能调用一次
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let Some(rx) = self.rx.lock().take() else {
            tracing::warn!("Creator already started");
            return;
        };
        tokio::spawn(self.clone().create_loop(rx, shutdown));
    }

    /// 确保 keys 对应的 alias 存在。
    ///
    /// 返回的 receiver 在索引可写时收到 `Ok(())`；key 数不匹配时立即收到 `KeyLength`。
    pub fn ensure<S: AsRef<str>>(&self, keys: &[S]) -> (oneshot::Receiver<Result<()>>, String) {
        let (done, rx) = oneshot::channel();
        let (index, alias) = match self.target_of(keys) {
            Ok(t) => t,
            Err(e) => {
                let _ = done.send(Err(e));
                return (rx, String::new());
            }
        };
        if self.has_active(keys) {
            let _ = done.send(Ok(()));
            return (rx, alias);
        }
        let req = CreateRequest {
            keys: keys.iter().map(|k| k.as_ref().to_string()).collect(),
            index,
            alias: alias.clone(),
            done,
        };
        if let Err(mpsc::error::SendError(req)) = self.tx.send(req) {
            let _ = req.done.send(Err(Error::Cancelled));
        }
        (rx, alias)
    }

    /// keys 对应的 (首个索引名, alias)
    pub fn target_of<S: AsRef<str>>(&self, keys: &[S]) -> Result<(String, String)> {
        let Some(pair) = self.patterns.get(&keys.len()) else {
            return Err(self.arity_error(self.patterns.keys(), keys.len()));
        };
        Ok((pair.first_index.fill(keys)?, pair.alias.fill(keys)?))
    }

    /// 按 fixed 模板拼出索引名，不访问存储端
    pub fn fixed_index<S: AsRef<str>>(&self, keys: &[S]) -> Result<String> {
        match self.fixed_patterns.get(&keys.len()) {
            Some(p) => p.fill(keys),
            None => Err(self.arity_error(self.fixed_patterns.keys(), keys.len())),
        }
    }

    fn arity_error<'a>(&self, known: impl Iterator<Item = &'a usize>, got: usize) -> Error {
        Error::KeyLength {
            expected: known.copied().min().unwrap_or(0),
            got,
        }
    }

    /// 快照里该分区已经有带代际号的 active 索引
    fn has_active<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        self.loader
            .all_indices()
            .and_then(|root| {
                root.get(keys)
                    .and_then(|g| g.list.first())
                    .map(|e| e.active && e.num > 0)
            })
            .unwrap_or(false)
    }

    async fn create_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<CreateRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            let req = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            if self.created.lock().contains(&req.alias) || self.has_active(&req.keys) {
                let _ = req.done.send(Ok(()));
                continue;
            }
            let res = self.create_with_retry(&req, &shutdown).await;
            if res.is_ok() {
                self.created.lock().insert(req.alias.clone());
                self.loader.trigger_reload();
            }
            let _ = req.done.send(res);
        }

        rx.close();
        while let Ok(req) = rx.try_recv() {
            let _ = req.done.send(Err(Error::Cancelled));
        }
        tracing::info!("Index creator stopped");
    }

    async fn create_with_retry(&self, req: &CreateRequest, shutdown: &CancellationToken) -> Result<()> {
        let retry = Duration::from_secs(self.cfg.retry_interval_secs.max(1));
        loop {
            match self.try_create(req).await {
                Ok(()) => {
                    tracing::info!("Created index {} with alias {}", req.index, req.alias);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!("Index {} already exists", req.index);
                    return Ok(());
                }
                Err(e) => tracing::warn!(
                    "Create index {} failed, retry in {:?}: {}",
                    req.index,
                    retry,
                    e
                ),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    async fn try_create(&self, req: &CreateRequest) -> Result<()> {
        let timeout = Duration::from_secs(self.cfg.request_timeout_secs);
        if self.cfg.remove_conflicting_indices {
            let same = tokio::time::timeout(timeout, self.store.list_indices(&req.alias)).await??;
            if same.iter().any(|c| c.index == req.alias) {
                tracing::warn!("Removing index {} that conflicts with alias", req.alias);
                let names = [req.alias.clone()];
                tokio::time::timeout(timeout, self.store.delete_indices(&names)).await??;
            }
        }
        tokio::time::timeout(timeout, self.store.create_index(&req.index, Some(&req.alias))).await?
    }
}
