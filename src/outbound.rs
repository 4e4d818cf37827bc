//! 回复到网关发送接口的翻译

use crate::error::{GatewayError, MediaError};
use crate::event::Context;
use crate::gateway::Gateway;
use crate::gateway::api::{self, SendReceipt};
use crate::media::ScratchDir;
use crate::message::{Reply, ReplyContent, ReplyKind, excerpt};
use crate::transcode::Transcoder;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub mod video;
pub mod voice;

pub const TEXT_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(90);
pub const APP_TIMEOUT: Duration = Duration::from_secs(60);
pub const VOICE_TIMEOUT: Duration = Duration::from_secs(120);
pub const VIDEO_TIMEOUT: Duration = Duration::from_secs(300);

/// 小程序卡片的应用消息类型
pub const MINI_APP_TYPE: u32 = 33;

/// 无法识别 `<type>` 时的应用消息类型
pub const DEFAULT_APP_TYPE: u32 = 3;

static RE_APP_TYPE: OnceLock<Regex> = OnceLock::new();
static RE_BLANK_LINES: OnceLock<Regex> = OnceLock::new();

/// 发送结果，所有发送路径都以此返回，不向上抛出错误
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub create_time: Option<i64>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(receipt: SendReceipt) -> Self {
        Self {
            success: true,
            message_id: Some(receipt.message_id).filter(|s| !s.is_empty()),
            create_time: Some(receipt.create_time).filter(|t| *t > 0),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

impl From<Result<SendReceipt, GatewayError>> for SendResult {
    fn from(r: Result<SendReceipt, GatewayError>) -> Self {
        match r {
            Ok(receipt) => SendResult::sent(receipt),
            Err(e) => SendResult::failed(e),
        }
    }
}

/// 去掉 Markdown 标记，只保留文字
/// 强调、标题、代码标记被移除，列表保留为 `- ` / `1. ` 前缀，链接写成 `文字 (地址)`。
/// 夹在字母数字之间的单个 `*` / `_`（如 `2*3*4`）按原文保留。
pub fn strip_markdown(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut list_counters: Vec<Option<u64>> = Vec::new();
    let mut links: Vec<(usize, String)> = Vec::new();
    let mut emphasis: Vec<Option<char>> = Vec::new();

    for (event, range) in Parser::new(input).into_offset_iter() {
        match event {
            Event::Text(t) | Event::Code(t) | Event::Html(t) | Event::InlineHtml(t) => {
                out.push_str(&t)
            }
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Start(Tag::Emphasis) => {
                let marker = literal_marker(input, range.start, range.end);
                if let Some(m) = marker {
                    out.push(m);
                }
                emphasis.push(marker);
            }
            Event::End(TagEnd::Emphasis) => {
                if let Some(Some(m)) = emphasis.pop() {
                    out.push(m);
                }
            }
            Event::Start(Tag::Link { dest_url, .. }) | Event::Start(Tag::Image { dest_url, .. }) => {
                links.push((out.len(), dest_url.into_string()));
            }
            Event::End(TagEnd::Link) | Event::End(TagEnd::Image) => {
                if let Some((start, url)) = links.pop() {
                    let label = out[start..].trim();
                    if label.is_empty() {
                        out.push_str(&url);
                    } else if label != url {
                        out.push_str(&format!(" ({})", url));
                    }
                }
            }
            Event::Start(Tag::List(start)) => list_counters.push(start),
            Event::End(TagEnd::List(_)) => {
                list_counters.pop();
                out.push('\n');
            }
            Event::Start(Tag::Item) => match list_counters.last_mut() {
                Some(Some(n)) => {
                    out.push_str(&format!("{}. ", n));
                    *n += 1;
                }
                _ => out.push_str("- "),
            },
            Event::End(TagEnd::Item) => out.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::BlockQuote(_)) => out.push_str("\n\n"),
            Event::Rule => out.push_str("\n\n"),
            _ => {}
        }
    }

    let re = RE_BLANK_LINES.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));
    re.replace_all(out.trim(), "\n\n").into_owned()
}

/// 单个强调标记紧贴字母数字时视为普通字符，返回需要原样输出的标记
fn literal_marker(input: &str, start: usize, end: usize) -> Option<char> {
    let marker = input[start..].chars().next()?;
    let before = input[..start].chars().next_back();
    let after = input[end..].chars().next();
    let in_word = |c: Option<char>| c.is_some_and(char::is_alphanumeric);
    (in_word(before) || in_word(after)).then_some(marker)
}

/// 应用消息 XML 中的 `<type>`，缺失时为 3
pub fn app_type(xml: &str) -> u32 {
    let re = RE_APP_TYPE
        .get_or_init(|| Regex::new(r"(?i)<type>\s*(\d+)\s*</type>").expect("valid regex"));
    re.captures(xml)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(DEFAULT_APP_TYPE)
}

/// 出站翻译器
pub struct Outbound {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) transcoder: Arc<dyn Transcoder>,
    pub(crate) http: reqwest::Client,
    pub(crate) temp_dir: PathBuf,
    pub(crate) group_at_sender: bool,
    /// 分段语音之间的间隔
    pub(crate) segment_gap: Duration,
}

impl Outbound {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        transcoder: Arc<dyn Transcoder>,
        temp_dir: PathBuf,
        group_at_sender: bool,
    ) -> Self {
        Self {
            gateway,
            transcoder,
            http: reqwest::Client::new(),
            temp_dir,
            group_at_sender,
            segment_gap: Duration::from_millis(500),
        }
    }

    pub fn with_segment_gap(mut self, gap: Duration) -> Self {
        self.segment_gap = gap;
        self
    }

    /// 按回复类型发送到上下文对应的会话
    pub async fn send(&self, reply: &Reply, ctx: &Context) -> SendResult {
        let to = ctx.receiver_id.as_str();
        let result = match (reply.kind, &reply.content) {
            (ReplyKind::Text | ReplyKind::Error | ReplyKind::Info, _) => {
                let text = reply.as_text().unwrap_or_default();
                self.send_reply_text(ctx, &text).await
            }
            (ReplyKind::ImageUrl, content) => match text_of(content) {
                Some(url) => self.send_image_url(to, &url).await,
                None => SendResult::failed("图片链接为空"),
            },
            (ReplyKind::Image, ReplyContent::Bytes(bytes)) => {
                self.send_image_bytes(to, bytes).await
            }
            (ReplyKind::Image, content) => match text_of(content) {
                Some(path) => self.send_image_file(to, Path::new(&path)).await,
                None => SendResult::failed("图片路径为空"),
            },
            (ReplyKind::App, content) => match text_of(content) {
                Some(xml) => self.send_app(to, &xml, app_type(&xml)).await,
                None => SendResult::failed("应用消息为空"),
            },
            (ReplyKind::MiniApp, content) => match text_of(content) {
                Some(xml) => self.send_app(to, &xml, MINI_APP_TYPE).await,
                None => SendResult::failed("小程序消息为空"),
            },
            (ReplyKind::VideoUrl, content) => match text_of(content) {
                Some(url) => video::send_video_url(self, to, &url).await,
                None => SendResult::failed("视频链接为空"),
            },
            (ReplyKind::Voice, content) => match text_of(content) {
                Some(path) => voice::send_voice(self, to, Path::new(&path)).await,
                None => SendResult::failed("语音路径为空"),
            },
        };

        if result.success {
            info!(
                target: "Outbound",
                "发送 -> {} [{:?}]: {}",
                to,
                reply.kind,
                excerpt(&reply.as_text().unwrap_or_else(|| "<bytes>".to_string()), 50)
            );
        } else {
            warn!(
                target: "Outbound",
                "发送失败 -> {} [{:?}]: {}",
                to,
                reply.kind,
                result.error.as_deref().unwrap_or("未知错误")
            );
        }
        result
    }

    /// 文本回复：去格式，群聊按配置 @ 发送者
    async fn send_reply_text(&self, ctx: &Context, text: &str) -> SendResult {
        let mut body = strip_markdown(text);
        if body.is_empty() {
            return SendResult::failed("回复内容为空");
        }
        let mut at = Vec::new();
        if ctx.is_group && self.group_at_sender && !ctx.sender_id.is_empty() {
            let nick = if ctx.sender_nickname.is_empty() {
                &ctx.sender_id
            } else {
                &ctx.sender_nickname
            };
            body = format!("@{} {}", nick, body);
            at.push(ctx.sender_id.clone());
        }
        self.send_text_to(&ctx.receiver_id, &body, &at).await
    }

    pub async fn send_text_to(&self, to: &str, text: &str, at: &[String]) -> SendResult {
        api::send_text(self.gateway.as_ref(), to, text, at, TEXT_TIMEOUT)
            .await
            .into()
    }

    pub async fn send_app(&self, to: &str, xml: &str, content_type: u32) -> SendResult {
        api::send_app(self.gateway.as_ref(), to, xml, content_type, APP_TIMEOUT)
            .await
            .into()
    }

    pub async fn send_image_file(&self, to: &str, path: &Path) -> SendResult {
        match fs::read(path).await {
            Ok(bytes) => api::send_image(self.gateway.as_ref(), to, &bytes, IMAGE_TIMEOUT)
                .await
                .into(),
            Err(e) => SendResult::failed(format!("读取图片 {} 失败: {}", path.display(), e)),
        }
    }

    /// 字节图片先落到临时文件再发送
    async fn send_image_bytes(&self, to: &str, bytes: &[u8]) -> SendResult {
        let scratch = match ScratchDir::new(&self.temp_dir, "image") {
            Ok(s) => s,
            Err(e) => return SendResult::failed(e),
        };
        let path = scratch.file("reply.img");
        if let Err(e) = fs::write(&path, bytes).await {
            return SendResult::failed(e);
        }
        self.send_image_file(to, &path).await
    }

    async fn send_image_url(&self, to: &str, url: &str) -> SendResult {
        let bytes = match self.download(url, IMAGE_TIMEOUT).await {
            Ok(b) => b,
            Err(e) => return SendResult::failed(e),
        };
        self.send_image_bytes(to, &bytes).await
    }

    pub(crate) async fn download(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, MediaError> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(MediaError::Download(format!("{} 返回空内容", url)));
        }
        Ok(bytes.to_vec())
    }
}

fn text_of(content: &ReplyContent) -> Option<String> {
    match content {
        ReplyContent::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        ReplyContent::Path(p) => Some(p.to_string_lossy().into_owned()),
        ReplyContent::Bytes(_) => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::{ContentKind, InboundMessage};
    use crate::normalize::normalize;
    use crate::testing::FakeGateway;
    use crate::transcode::FfmpegTranscoder;
    use simd_json::json;
    use simd_json::prelude::*;

    pub(crate) fn ctx(group: bool) -> Context {
        let from = if group { "g1@chatroom" } else { "wxid_a" };
        let mut msg: InboundMessage = normalize(
            &json!({"msg_id": "1", "from_user_name": from, "type": 1, "content": "hi"}),
            0,
        );
        msg.sender_id = "wxid_a".to_string();
        msg.sender_nickname = "Alice".to_string();
        msg.kind = ContentKind::Text;
        Context::from_message(msg, None)
    }

    pub(crate) fn outbound(gw: Arc<FakeGateway>, temp: &Path) -> Outbound {
        Outbound::new(
            gw,
            Arc::new(FfmpegTranscoder::from_config(&Default::default())),
            temp.to_path_buf(),
            true,
        )
    }

    fn sent_item(gw: &FakeGateway, endpoint: &str, list: &str) -> simd_json::OwnedValue {
        let calls = gw.calls_to(endpoint);
        let params = calls.last().cloned().flatten().unwrap();
        params.get(list).and_then(|l| l.as_array()).unwrap()[0].clone()
    }

    #[test]
    fn markdown_markers_are_removed() {
        assert_eq!(
            strip_markdown("# 标题\n\n**粗体** 和 `code`\n\n- 一\n- 二"),
            "标题\n\n粗体 和 code\n\n- 一\n- 二"
        );
        assert_eq!(strip_markdown("第一行\n第二行"), "第一行\n第二行");
        assert_eq!(strip_markdown("1. a\n2. b"), "1. a\n2. b");
    }

    #[test]
    fn markdown_links_keep_their_target() {
        assert_eq!(
            strip_markdown("详情见 [文档](https://example.com/doc)"),
            "详情见 文档 (https://example.com/doc)"
        );
        assert_eq!(
            strip_markdown("<https://example.com>"),
            "https://example.com"
        );
    }

    #[test]
    fn literal_asterisks_survive() {
        assert_eq!(strip_markdown("2*3*4 = 24"), "2*3*4 = 24");
        assert_eq!(strip_markdown("snake_case_name"), "snake_case_name");
        assert_eq!(strip_markdown("**重点** 内容"), "重点 内容");
        assert_eq!(strip_markdown("这是 *强调* 文字"), "这是 强调 文字");
    }

    #[test]
    fn app_type_defaults_to_three() {
        assert_eq!(app_type("<appmsg><TYPE> 5 </TYPE></appmsg>"), 5);
        assert_eq!(app_type("<appmsg><title>x</title></appmsg>"), 3);
    }

    #[tokio::test]
    async fn group_text_mentions_sender() {
        let gw = FakeGateway::new();
        gw.respond(
            "/message/SendTextMessage",
            json!({"Code": 200, "Data": [{"NewMsgId": 42, "CreateTime": 100}]}),
        );
        let dir = tempfile::tempdir().unwrap();
        let out = outbound(gw.clone(), dir.path());

        let r = out.send(&Reply::text("**好的**"), &ctx(true)).await;
        assert!(r.success);
        assert_eq!(r.message_id.as_deref(), Some("42"));

        let item = sent_item(&gw, "/message/SendTextMessage", "MsgItem");
        assert_eq!(item.get("ToUserName").and_then(|v| v.as_str()), Some("g1@chatroom"));
        assert_eq!(item.get("TextContent").and_then(|v| v.as_str()), Some("@Alice 好的"));
        assert_eq!(
            item.get("AtWxIDList").and_then(|v| v.as_array()).map(|a| a.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn private_text_and_failures_become_results() {
        let gw = FakeGateway::new();
        gw.respond(
            "/message/SendTextMessage",
            json!({"Code": -1, "Text": "发送失败"}),
        );
        let dir = tempfile::tempdir().unwrap();
        let out = outbound(gw.clone(), dir.path());

        let r = out.send(&Reply::text("hi"), &ctx(false)).await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("发送失败"));
        let item = sent_item(&gw, "/message/SendTextMessage", "MsgItem");
        assert_eq!(item.get("TextContent").and_then(|v| v.as_str()), Some("hi"));

        let r = out
            .send(&Reply::new(ReplyKind::ImageUrl, ReplyContent::Text(" ".into())), &ctx(false))
            .await;
        assert!(!r.success);
    }

    #[tokio::test]
    async fn app_and_mini_app_types() {
        let gw = FakeGateway::new();
        gw.respond("/message/SendAppMessage", json!({"Code": 200, "Data": [{"NewMsgId": 1}]}));
        let dir = tempfile::tempdir().unwrap();
        let out = outbound(gw.clone(), dir.path());

        let xml = "<appmsg><type>5</type><url>http://a.b</url></appmsg>";
        assert!(out.send(&Reply::new(ReplyKind::App, ReplyContent::Text(xml.into())), &ctx(false)).await.success);
        let item = sent_item(&gw, "/message/SendAppMessage", "AppList");
        assert_eq!(item.get("ContentType").and_then(|v| v.as_u64()), Some(5));

        assert!(out.send(&Reply::new(ReplyKind::MiniApp, ReplyContent::Text(xml.into())), &ctx(false)).await.success);
        let item = sent_item(&gw, "/message/SendAppMessage", "AppList");
        assert_eq!(item.get("ContentType").and_then(|v| v.as_u64()), Some(33));
    }

    #[tokio::test]
    async fn image_bytes_use_a_cleaned_temp_file() {
        let gw = FakeGateway::new();
        gw.respond("/message/SendImageMessage", json!({"Code": 200, "Data": [{"NewMsgId": 9}]}));
        let dir = tempfile::tempdir().unwrap();
        let out = outbound(gw.clone(), dir.path());

        let r = out
            .send(&Reply::new(ReplyKind::Image, ReplyContent::Bytes(b"png".to_vec())), &ctx(false))
            .await;
        assert!(r.success);
        let item = sent_item(&gw, "/message/SendImageMessage", "MsgItem");
        assert_eq!(item.get("ImageContent").and_then(|v| v.as_str()), Some("cG5n"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
