use crate::message::{ContentKind, InboundMessage};
use std::path::Path;
use tracing::warn;

pub mod app;
pub mod image;
pub mod media;
pub mod system;
pub mod text;

/// 提取器运行所需的外部环境
pub struct ExtractEnv<'a> {
    /// 本地图片缓存目录，用于查找被引用的图片
    pub image_cache_dir: &'a Path,
}

/// 协议类型码到内容类型的映射
pub fn kind_for(code: &str) -> ContentKind {
    match code.trim() {
        "0" | "1" => ContentKind::Text,
        "3" => ContentKind::Image,
        "34" => ContentKind::Voice,
        "43" => ContentKind::Video,
        "47" => ContentKind::Emoji,
        "49" => ContentKind::XmlApp,
        "51" => ContentKind::StatusSync,
        "10000" => ContentKind::System,
        _ => ContentKind::Unknown,
    }
}

/// 按类型码分类，并运行对应类型的内容提取器
/// 提取器可能改写 kind（如 XML 引用消息转为文本）。
pub fn classify(msg: &mut InboundMessage, env: &ExtractEnv<'_>) {
    msg.kind = kind_for(&msg.raw_type);
    match msg.kind {
        ContentKind::Text => text::extract(msg),
        ContentKind::Emoji => text::extract_emoji(msg),
        ContentKind::Image => image::extract(msg),
        ContentKind::Voice => media::extract_voice(msg),
        ContentKind::Video => media::extract_video(msg),
        ContentKind::System => system::extract(msg),
        ContentKind::XmlApp => app::extract(msg, env),
        ContentKind::Unknown => {
            warn!(
                target: "Pipeline",
                "未知消息类型 {} (ID: {}): {}",
                msg.raw_type,
                msg.id,
                msg.excerpt(100)
            );
        }
        _ => {}
    }
}

/// 拆分群聊消息体的发送者前缀 "wxid:\n内容"
pub fn split_sender_prefix(content: &str) -> Option<(&str, &str)> {
    let idx = content.find(":\n")?;
    let sender = content[..idx].trim();
    if sender.is_empty()
        || sender.len() > 64
        || sender.contains(char::is_whitespace)
        || sender.contains('<')
    {
        return None;
    }
    Some((sender, &content[idx + 2..]))
}

/// 群聊消息剥离发送者前缀，发送者尚未确定时顺带记录
pub(crate) fn take_group_prefix(msg: &mut InboundMessage) {
    if !msg.is_group {
        return;
    }
    if let Some((sender, rest)) = split_sender_prefix(&msg.content) {
        let (sender, rest) = (sender.to_string(), rest.to_string());
        if msg.sender_id.is_empty() {
            msg.sender_id = sender;
        }
        msg.content = rest;
    }
}
