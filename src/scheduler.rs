use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::info;

/// 后台定时任务管理器
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个灵活调度任务
    ///
    /// - `next_run`: 接收当前时间，返回下一次执行时间；返回 None 时任务停止。
    /// - `task_gen`: 每次执行时生成任务。
    pub fn add_schedule<C, F, Fut>(&self, mut next_run: C, mut task_gen: F) -> u64
    where
        C: FnMut(DateTime<Local>) -> Option<DateTime<Local>> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut next_time = next_run(Local::now());

        let handle = tokio::spawn(async move {
            while let Some(target_time) = next_time {
                let now = Local::now();
                if target_time > now {
                    let wait = (target_time - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                }

                task_gen().await;
                next_time = next_run(Local::now());
            }
        });

        self.tasks.lock().insert(id, handle.abort_handle());
        id
    }

    /// 固定间隔执行，首次在一个间隔之后
    pub fn add_interval<F, Fut>(&self, every: Duration, task_gen: F) -> u64
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let step = chrono::Duration::from_std(every).unwrap_or(chrono::Duration::MAX);
        self.add_schedule(move |now| now.checked_add_signed(step), task_gen)
    }

    pub fn remove(&self, id: u64) {
        if let Some(handle) = self.tasks.lock().remove(&id) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            info!(target: "System", "正在清理 {} 个定时任务...", tasks.len());
        }
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
