use crate::event::RawMessage;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// 群聊 ID 后缀
pub const GROUP_SUFFIX: &str = "@chatroom";

/// 群内发送者无法识别时的占位
pub const UNKNOWN_SENDER: &str = "未知发送者";

/// 系统消息的发送者占位
pub const SYSTEM_SENDER: &str = "系统消息";

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Voice,
    Video,
    Emoji,
    XmlApp,
    System,
    Pat,
    Sharing,
    StatusSync,
    Unknown,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentKind::Text => "文本",
            ContentKind::Image => "图片",
            ContentKind::Voice => "语音",
            ContentKind::Video => "视频",
            ContentKind::Emoji => "表情",
            ContentKind::XmlApp => "XML",
            ContentKind::System => "系统",
            ContentKind::Pat => "拍一拍",
            ContentKind::Sharing => "分享",
            ContentKind::StatusSync => "状态同步",
            ContentKind::Unknown => "未知",
        };
        f.write_str(s)
    }
}

/// 图片元数据 (来自 `<img>` 节点)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageMeta {
    pub aeskey: String,
    pub thumb_aeskey: String,
    pub md5: String,
    pub length: u64,
    pub cdn_url: String,
    /// CDN 下载类型：2 中图，1 缩略图
    pub file_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VoiceMeta {
    pub url: String,
    /// 毫秒
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoMeta {
    pub aeskey: String,
    pub cdn_url: String,
    pub length: u64,
    /// 秒
    pub play_length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatMeta {
    pub patter: String,
    pub patted: String,
    pub suffix: String,
}

/// 按类型区分的附加数据
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    Image(ImageMeta),
    Voice(VoiceMeta),
    Video(VideoMeta),
    Pat(PatMeta),
    Sharing { url: String },
}

/// 规范化后的入站消息
/// 在流水线各阶段中原地修改，直到生成 Context 或被过滤。
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    pub id: String,
    pub create_time: i64,
    pub is_group: bool,
    pub from_user_id: String,
    pub to_user_id: String,
    /// 实际发送者；群消息在发送者解析完成前为空
    pub sender_id: String,
    pub sender_nickname: String,
    pub content: String,
    pub raw_type: String,
    pub kind: ContentKind,
    pub at_list: BTreeSet<String>,
    /// 机器人在本群的群昵称
    pub self_display_name: String,
    pub is_at: bool,
    pub is_quote_text: bool,
    pub referenced_image_path: Option<PathBuf>,
    pub payload: Payload,
    #[serde(skip)]
    pub raw: RawMessage,
}

impl InboundMessage {
    /// 去重键：消息 ID + 发送者 + 创建时间
    pub fn dedup_key(&self) -> String {
        format!("{}_{}_{}", self.id, self.sender_id, self.create_time)
    }

    /// 会话 ID：群聊为群 ID，私聊为发送者
    pub fn session_id(&self) -> &str {
        if self.is_group {
            &self.from_user_id
        } else {
            &self.sender_id
        }
    }

    pub fn image_meta(&self) -> Option<&ImageMeta> {
        match &self.payload {
            Payload::Image(meta) => Some(meta),
            _ => None,
        }
    }

    /// 截取内容前若干字符，用于日志
    pub fn excerpt(&self, max_chars: usize) -> String {
        excerpt(&self.content, max_chars)
    }
}

pub fn excerpt(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// 回复类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Text,
    Error,
    Info,
    ImageUrl,
    Image,
    App,
    MiniApp,
    VideoUrl,
    Voice,
}

/// 回复内容
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyContent {
    Text(String),
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// 下游管线生成的回复
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub content: ReplyContent,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Text,
            content: ReplyContent::Text(s.into()),
        }
    }

    pub fn new(kind: ReplyKind, content: ReplyContent) -> Self {
        Self { kind, content }
    }

    /// 文本形式的内容 (路径会被转为字符串)
    pub fn as_text(&self) -> Option<String> {
        match &self.content {
            ReplyContent::Text(s) => Some(s.clone()),
            ReplyContent::Path(p) => Some(p.to_string_lossy().into_owned()),
            ReplyContent::Bytes(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("你好世界", 2), "你好...");
        assert_eq!(excerpt("abc", 5), "abc");
    }
}
