use crate::adapters::MessageSource;
use crate::error::GatewayError;
use crate::event::RawMessage;
use crate::gateway::Gateway;
use crate::gateway::api;
use crate::login::BotIdentity;
use crate::pipeline::{Outcome, Pipeline};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 空批次后的等待间隔
pub const IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// 读取出错后的退避时长
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// 接收循环：按到达顺序逐条处理每一批消息
pub struct Channel {
    source: Box<dyn MessageSource>,
    pipeline: Arc<Pipeline>,
    gateway: Arc<dyn Gateway>,
    identity: Arc<BotIdentity>,
    idle: Duration,
    backoff: Duration,
}

impl Channel {
    pub fn new(
        source: Box<dyn MessageSource>,
        pipeline: Arc<Pipeline>,
        gateway: Arc<dyn Gateway>,
        identity: Arc<BotIdentity>,
    ) -> Self {
        Self {
            source,
            pipeline,
            gateway,
            identity,
            idle: IDLE_INTERVAL,
            backoff: ERROR_BACKOFF,
        }
    }

    pub fn with_intervals(mut self, idle: Duration, backoff: Duration) -> Self {
        self.idle = idle;
        self.backoff = backoff;
        self
    }

    /// 运行直到 `shutdown` 完成；正在处理的批次会先处理完
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        info!(target: "Channel", "开始接收消息 (wxid: {})", self.identity.wxid());

        loop {
            let batch = tokio::select! {
                _ = &mut shutdown => break,
                batch = self.source.next_batch() => batch,
            };

            let pause = match batch {
                Ok(batch) if batch.is_empty() => self.idle,
                Ok(batch) => {
                    self.process_batch(&batch).await;
                    Duration::ZERO
                }
                Err(e) => {
                    self.on_error(&e).await;
                    self.backoff
                }
            };

            if !pause.is_zero() && sleep_or_shutdown(pause, shutdown.as_mut()).await {
                break;
            }
        }
        info!(target: "Channel", "接收循环已停止");
    }

    /// 处理一批消息，返回被分发的条数
    pub async fn process_batch(&self, batch: &[RawMessage]) -> usize {
        debug!(target: "Channel", "收到 {} 条消息", batch.len());
        let mut dispatched = 0;
        for raw in batch {
            if let Outcome::Dispatched(_) = self.pipeline.process(raw).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    async fn on_error(&self, e: &GatewayError) {
        if e.is_login_expired() {
            error!(target: "Channel", "获取消息出错，登录已失效: {}", e);
            self.resync_identity().await;
        } else if e.is_transient() {
            warn!(target: "Channel", "获取消息失败，{} 秒后重试: {}", self.backoff.as_secs(), e);
        } else {
            error!(target: "Channel", "获取消息出错: {}", e);
        }
    }

    /// 登录失效后重新拉取账号资料，保持机器人身份与网关一致
    pub async fn resync_identity(&self) {
        match api::get_profile(self.gateway.as_ref()).await {
            Ok(profile) => {
                let before = self.identity.wxid();
                if before != profile.wxid {
                    warn!(
                        target: "Channel",
                        "检测到 wxid 不一致，已同步: {} -> {}",
                        before,
                        profile.wxid
                    );
                }
                self.identity.update(profile);
            }
            Err(e) => error!(target: "Channel", "重新获取账号资料失败: {}", e),
        }
    }
}

/// 等待指定时长；期间收到关闭信号返回 true
async fn sleep_or_shutdown<F>(d: Duration, shutdown: Pin<&mut F>) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(d) => false,
    }
}
