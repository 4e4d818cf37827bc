//! 下游回复管线
//!
//! 适配器只负责产出 [`Context`]，回复内容由管线决定。内置两种实现：
//! `echo` 原样回显，`webhook` 将上下文 POST 给外部服务并发送其返回的回复。

use crate::config::ReplyConfig;
use crate::event::Context;
use crate::message::{ContentKind, Reply, ReplyContent, ReplyKind};
use anyhow::{Context as _, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Vec<Reply>>;
}

/// 按配置构建管线
pub fn from_config(cfg: &ReplyConfig) -> anyhow::Result<Arc<dyn ReplyPipeline>> {
    match cfg.mode.as_str() {
        "echo" => Ok(Arc::new(Echo)),
        "webhook" => {
            let url = cfg
                .webhook_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .context("reply.mode = \"webhook\" 需要配置 reply.webhook_url")?;
            Ok(Arc::new(Webhook::new(url, Duration::from_secs(cfg.timeout_secs))?))
        }
        other => bail!("未知的回复模式: {}", other),
    }
}

// ================== Echo ==================

/// 原样回显：文本回文本，图片回图片
pub struct Echo;

#[async_trait]
impl ReplyPipeline for Echo {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Vec<Reply>> {
        match ctx.kind {
            ContentKind::Text if !ctx.content.trim().is_empty() => {
                Ok(vec![Reply::text(ctx.content.clone())])
            }
            // 图片下载成功后 content 为本地路径
            ContentKind::Image => {
                let downloaded = fs::try_exists(&ctx.content).await.unwrap_or(false);
                Ok(downloaded
                    .then(|| Reply::new(ReplyKind::Image, ReplyContent::Path(ctx.content.clone().into())))
                    .into_iter()
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

// ================== Webhook ==================

const BASE64_SCHEME: &str = "base64://";

#[derive(Serialize)]
struct WebhookRequest<'a> {
    channel: &'a str,
    context: &'a Context,
}

/// 外部服务返回的单条回复
/// `content` 为文本、链接或本地路径；`image` 类型可用 `base64://` 直接携带字节。
#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(rename = "type")]
    kind: ReplyKind,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WebhookResponse {
    Wrapped { replies: Vec<WireReply> },
    List(Vec<WireReply>),
}

impl WireReply {
    fn into_reply(self) -> anyhow::Result<Reply> {
        let content = match (self.kind, self.content.strip_prefix(BASE64_SCHEME)) {
            (ReplyKind::Image, Some(data)) => {
                ReplyContent::Bytes(STANDARD.decode(data.trim()).context("图片 base64 无效")?)
            }
            (ReplyKind::Image | ReplyKind::Voice, None) => ReplyContent::Path(self.content.into()),
            _ => ReplyContent::Text(self.content),
        };
        Ok(Reply::new(self.kind, content))
    }
}

pub struct Webhook {
    http: reqwest::Client,
    url: String,
}

impl Webhook {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("无法创建 HTTP 客户端")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReplyPipeline for Webhook {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Vec<Reply>> {
        let resp = self
            .http
            .post(&self.url)
            .json(&WebhookRequest {
                channel: ctx.channel,
                context: ctx,
            })
            .send()
            .await
            .with_context(|| format!("请求 {} 失败", self.url))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            bail!("webhook 返回 HTTP {}", status);
        }

        let body = resp.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let parsed: WebhookResponse =
            serde_json::from_slice(&body).context("webhook 响应格式错误")?;
        let wire = match parsed {
            WebhookResponse::Wrapped { replies } => replies,
            WebhookResponse::List(list) => list,
        };
        debug!(target: "Pipeline", "webhook 返回 {} 条回复", wire.len());
        wire.into_iter().map(WireReply::into_reply).collect()
    }
}
