use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("任务队列已满")]
    Full,
    #[error("工作池已关闭")]
    Closed,
    #[error("任务未完成即被丢弃")]
    Dropped,
    #[error("等待任务超时")]
    Timeout,
}

/// 固定数量工作者 + 有界队列
/// 队列满时 `submit` 等待空位，`try_submit` 立即失败。
/// `shutdown` 同时终止工作者与正在执行的任务。
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    running: Arc<parking_lot::Mutex<HashMap<usize, AbortHandle>>>,
    closed: Arc<AtomicBool>,
}

/// 任务完成句柄
pub struct TaskHandle<T>(oneshot::Receiver<T>);

impl<T> TaskHandle<T> {
    pub async fn wait(self) -> Result<T, PoolError> {
        self.0.await.map_err(|_| PoolError::Dropped)
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, PoolError> {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(PoolError::Dropped),
            Err(_) => Err(PoolError::Timeout),
        }
    }
}

impl WorkerPool {
    /// 启动工作者，需在 tokio 运行时内调用
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let running = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let running = running.clone();
                let closed = closed.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        // 任务 panic 不影响工作者本身
                        let task = tokio::spawn(job);
                        running.lock().insert(idx, task.abort_handle());
                        if closed.load(Ordering::SeqCst) {
                            task.abort();
                        }
                        let result = task.await;
                        running.lock().remove(&idx);
                        match result {
                            Ok(()) => {}
                            Err(e) if e.is_cancelled() => break,
                            Err(e) => {
                                error!(target: "System", "工作者 #{} 的任务异常退出: {}", idx, e)
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: parking_lot::Mutex::new(workers),
            running,
            closed,
        }
    }

    fn wrap<F, T>(fut: F) -> (Job, TaskHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        (job, TaskHandle(done_rx))
    }

    /// 提交任务，队列满时等待
    pub async fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = Self::wrap(fut);
        self.tx.send(job).await.map_err(|_| PoolError::Closed)?;
        Ok(handle)
    }

    /// 提交任务，队列满时立即返回 [`PoolError::Full`]
    pub fn try_submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = Self::wrap(fut);
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(target: "System", "工作池队列已满，丢弃任务");
                PoolError::Full
            }
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })?;
        Ok(handle)
    }

    /// 终止所有工作者与执行中的任务，未完成任务的句柄返回 [`PoolError::Dropped`]
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        for (_, job) in self.running.lock().drain() {
            job.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
