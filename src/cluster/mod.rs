use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// 成为 leader 时执行的任务；token 在失去 leader 身份或进程退出时取消
pub type LeaderTask =
    Arc<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// 把一个 async 闭包包装成 `LeaderTask`
pub fn leader_task<F, Fut>(f: F) -> LeaderTask
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |token| Box::pin(f(token)))
}

/// 选主能力。
///
/// 注册的任务在每次当选时启动一次，卸任时其 token 被取消。
/// 破坏性的循环（删除、滚动、缓存同步）只在这里面跑。
pub trait Election: Send + Sync {
    fn on_leader(&self, task: LeaderTask);
}

struct LocalState {
    leading: Option<CancellationToken>,
    tasks: Vec<LeaderTask>,
}

/// 单节点选主：启动即当选。
///
/// `step_down` / `campaign` 用于模拟 leader 切换。
pub struct LocalElection {
    shutdown: CancellationToken,
    state: Mutex<LocalState>,
}

impl LocalElection {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown: shutdown.clone(),
            state: Mutex::new(LocalState {
                leading: Some(shutdown.child_token()),
                tasks: Vec::new(),
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().leading.is_some()
    }

    /// 卸任：取消所有 leader 任务
    pub fn step_down(&self) {
        if let Some(token) = self.state.lock().leading.take() {
            tracing::info!("Stepping down from leader");
            token.cancel();
        }
    }

    /// 重新当选：以新的 token 重启所有已注册任务
    pub fn campaign(&self) {
        let mut st = self.state.lock();
        if st.leading.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        for task in &st.tasks {
            tokio::spawn(task(token.clone()));
        }
        st.leading = Some(token);
        tracing::info!("Became leader, {} tasks started", st.tasks.len());
    }
}

impl Election for LocalElection {
    fn on_leader(&self, task: LeaderTask) {
        let mut st = self.state.lock();
        if let Some(token) = &st.leading {
            tokio::spawn(task(token.clone()));
        }
        st.tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_restart_on_each_term() {
        let shutdown = CancellationToken::new();
        let election = LocalElection::new(shutdown.clone());
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let (s1, s2) = (started.clone(), stopped.clone());
        election.on_leader(leader_task(move |token| {
            let (s1, s2) = (s1.clone(), s2.clone());
            async move {
                s1.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
                s2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        election.step_down();
        assert!(!election.is_leader());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        election.campaign();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn follower_does_not_run_tasks() {
        let election = LocalElection::new(CancellationToken::new());
        election.step_down();
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        election.on_leader(leader_task(move |_| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
            }
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
