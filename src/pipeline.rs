//! 入站消息流水线
//!
//! 规范化 -> 入口闸门 -> 分类/提取 -> 群上下文 -> 内容过滤 -> 图片下载 -> 触发 -> 分发

use crate::classify::{ExtractEnv, classify};
use crate::clock::Clock;
use crate::config::SharedConfig;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::event::{Context, RawMessage};
use crate::filter::{ContentFilter, DropReason, IngestGate, SpeechPolicy};
use crate::gateway::Gateway;
use crate::group::{GroupResolver, GroupStore};
use crate::login::BotIdentity;
use crate::media::{DOWNLOAD_TIMEOUT, ImageStore};
use crate::message::{ContentKind, InboundMessage};
use crate::normalize::normalize;
use crate::pool::WorkerPool;
use crate::trigger::{TriggerConfig, TriggerMatch, route_group, route_private, whitelisted};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 单条消息的处理结果
pub enum Outcome {
    /// 被入口闸门或内容过滤丢弃
    Dropped(DropReason),
    /// 群不在白名单中
    NotWhitelisted,
    /// 未命中触发条件
    NotTriggered,
    Dispatched(Dispatch),
}

pub struct Pipeline {
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    identity: Arc<BotIdentity>,
    pool: Arc<WorkerPool>,
    gate: IngestGate,
    filter: ContentFilter,
    groups: GroupResolver,
    images: Arc<ImageStore>,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(
        config: SharedConfig,
        clock: Arc<dyn Clock>,
        identity: Arc<BotIdentity>,
        gateway: Arc<dyn Gateway>,
        pool: Arc<WorkerPool>,
        store: Arc<GroupStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (ttl, speech, image_dir) = {
            let cfg = config.read();
            (
                Duration::from_secs(cfg.channel.message_cache_ttl_secs),
                SpeechPolicy {
                    private: cfg.channel.speech_recognition,
                    group: cfg.channel.group_speech_recognition,
                },
                cfg.channel.image_cache_dir.clone(),
            )
        };
        Self {
            gate: IngestGate::new(clock.clone()),
            filter: ContentFilter::new(ttl, clock.clone(), speech),
            groups: GroupResolver::new(store, gateway.clone(), pool.clone(), identity.clone()),
            images: Arc::new(ImageStore::new(image_dir, gateway)),
            config,
            clock,
            identity,
            pool,
            dispatcher,
        }
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn groups(&self) -> &GroupResolver {
        &self.groups
    }

    pub fn filter(&self) -> &ContentFilter {
        &self.filter
    }

    pub async fn process(&self, raw: &RawMessage) -> Outcome {
        let mut msg = normalize(raw, self.clock.now());
        if let Err(reason) = self.gate.admit(&msg) {
            debug!(target: "Pipeline", "入口丢弃 {}: {}", msg.id, reason);
            return Outcome::Dropped(reason);
        }

        classify(
            &mut msg,
            &ExtractEnv {
                image_cache_dir: self.images.dir(),
            },
        );
        self.groups.resolve(&mut msg);

        let bot_wxid = self.identity.wxid();
        if let Err(reason) = self.filter.check(&msg, &bot_wxid) {
            debug!(target: "Pipeline", "过滤 {} ({}): {}", msg.id, msg.sender_id, reason);
            return Outcome::Dropped(reason);
        }

        if msg.kind == ContentKind::Image {
            self.download_image(&mut msg).await;
        }

        let trigger = self.trigger_config();
        let group_name = msg
            .is_group
            .then(|| self.groups.group_name(&msg.from_user_id))
            .flatten();

        let matched = if msg.is_group {
            if !whitelisted(&msg.from_user_id, group_name.as_deref(), &trigger.group_name_white_list) {
                debug!(target: "Pipeline", "群 {} 不在白名单中", msg.from_user_id);
                return Outcome::NotWhitelisted;
            }
            route_group(&mut msg, &trigger, &bot_wxid)
        } else {
            route_private(&mut msg, &trigger.single_chat_prefix)
        };
        let Some(matched) = matched else {
            return Outcome::NotTriggered;
        };
        if matched != TriggerMatch::Passthrough {
            debug!(target: "Pipeline", "消息 {} 触发: {:?}", msg.id, matched);
        }

        let ctx = Context::from_message(msg, group_name);
        Outcome::Dispatched(self.dispatcher.dispatch(ctx).await)
    }

    fn trigger_config(&self) -> TriggerConfig {
        let cfg = self.config.read();
        let bot_name = if cfg.channel.nick_name.is_empty() {
            self.identity.nickname()
        } else {
            cfg.channel.nick_name.clone()
        };
        TriggerConfig {
            single_chat_prefix: cfg.channel.single_chat_prefix.clone(),
            group_chat_prefix: cfg.channel.group_chat_prefix.clone(),
            group_chat_keyword: cfg.channel.group_chat_keyword.clone(),
            group_name_white_list: cfg.channel.group_name_white_list.clone(),
            bot_name,
        }
    }

    /// 在工作池上下载图片；成功后 content 替换为本地路径，失败时保留原始 XML
    async fn download_image(&self, msg: &mut InboundMessage) {
        let Some(meta) = msg.image_meta().cloned() else {
            return;
        };
        if meta.aeskey.is_empty() {
            warn!(target: "Media", "图片消息 {} 缺少 aeskey，跳过下载", msg.id);
            return;
        }

        let images = self.images.clone();
        let id = msg.id.clone();
        let handle = match self
            .pool
            .submit(async move { images.fetch(&id, &meta).await })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(target: "Media", "图片下载任务未能提交: {}", e);
                return;
            }
        };

        match handle.wait_timeout(DOWNLOAD_TIMEOUT).await {
            Ok(Ok(Some(path))) => {
                info!(target: "Media", "图片消息 {} 已保存: {}", msg.id, path.display());
                msg.content = path.to_string_lossy().into_owned();
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(target: "Media", "图片消息 {} 下载失败: {}", msg.id, e),
            Err(e) => warn!(target: "Media", "图片消息 {} 下载未完成: {}", msg.id, e),
        }
    }
}
