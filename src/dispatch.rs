use crate::config::SharedConfig;
use crate::event::Context;
use crate::outbound::{Outbound, SendResult};
use crate::plugins::{enabled_plugins, run_chain};
use crate::pool::{PoolError, TaskHandle, WorkerPool};
use crate::reply::ReplyPipeline;
use std::sync::Arc;
use tracing::{debug, warn};

/// 分发结果
pub enum Dispatch {
    /// 插件终止了传递
    Stopped,
    /// 插件出错，消息被丢弃
    PluginFailed(String),
    /// 已交给工作池，句柄返回每条回复的发送结果
    Queued(TaskHandle<Vec<SendResult>>),
    /// 工作池拒绝了任务
    Rejected(PoolError),
}

pub struct Dispatcher {
    config: SharedConfig,
    pipeline: Arc<dyn ReplyPipeline>,
    outbound: Arc<Outbound>,
    pool: Arc<WorkerPool>,
}

impl Dispatcher {
    pub fn new(
        config: SharedConfig,
        pipeline: Arc<dyn ReplyPipeline>,
        outbound: Arc<Outbound>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            config,
            pipeline,
            outbound,
            pool,
        }
    }

    /// 执行分发前插件链，然后在工作池上生成并发送回复
    pub async fn dispatch(&self, ctx: Context) -> Dispatch {
        let plugins = enabled_plugins(&self.config.read());
        let ctx = match run_chain(&plugins, ctx, &self.config).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return Dispatch::Stopped,
            Err(e) => {
                warn!(target: "Plugin", "插件执行失败，丢弃消息: {}", e);
                return Dispatch::PluginFailed(e.to_string());
            }
        };

        let pipeline = self.pipeline.clone();
        let outbound = self.outbound.clone();
        match self
            .pool
            .submit(async move { respond(pipeline.as_ref(), &outbound, &ctx).await })
            .await
        {
            Ok(handle) => Dispatch::Queued(handle),
            Err(e) => {
                warn!(target: "Pipeline", "回复任务未能提交: {}", e);
                Dispatch::Rejected(e)
            }
        }
    }
}

/// 调用回复管线并依次发送全部回复
pub async fn respond(pipeline: &dyn ReplyPipeline, outbound: &Outbound, ctx: &Context) -> Vec<SendResult> {
    let replies = match pipeline.handle(ctx).await {
        Ok(replies) => replies,
        Err(e) => {
            warn!(target: "Pipeline", "回复管线处理失败 [{}]: {:#}", ctx.session_id, e);
            return Vec::new();
        }
    };
    if replies.is_empty() {
        debug!(target: "Pipeline", "会话 {} 无回复", ctx.session_id);
    }

    let mut results = Vec::with_capacity(replies.len());
    for reply in &replies {
        results.push(outbound.send(reply, ctx).await);
    }
    results
}
