use crate::message::{ContentKind, InboundMessage};
use serde::Serialize;
use simd_json::OwnedValue;
use simd_json::prelude::*;
use std::path::PathBuf;

/// 网关原始消息，字段命名随协议版本变化
pub type RawMessage = OwnedValue;

/// 通道名称，随插件事件一起下发
pub const CHANNEL_NAME: &str = "wx8059";

// ================== 原始消息访问工具 ==================

/// 原始消息视图，按顺序尝试多个候选字段名
pub struct RawView<'a>(pub &'a RawMessage);

impl<'a> RawView<'a> {
    /// 第一个存在的字段值
    pub fn value(&self, keys: &[&str]) -> Option<&'a OwnedValue> {
        keys.iter()
            .filter_map(|k| self.0.get(*k))
            .find(|v| !v.is_null())
    }

    /// 第一个非空的字符串字段 (自动解包 `{str: ..}` / `{string: ..}`)
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.0.get(*k))
            .filter_map(unwrap_text)
            .find(|s| !s.is_empty())
    }

    /// 第一个可解析为整数的字段 (数字或数字字符串)
    pub fn int(&self, keys: &[&str]) -> Option<i64> {
        keys.iter().filter_map(|k| self.0.get(*k)).find_map(as_int)
    }

    /// 字符串列表字段：数组，或逗号分隔的字符串
    pub fn list(&self, keys: &[&str]) -> Vec<String> {
        for key in keys {
            let Some(v) = self.0.get(*key) else {
                continue;
            };
            if let Some(arr) = v.as_array() {
                let items: Vec<String> = arr
                    .iter()
                    .filter_map(unwrap_text)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !items.is_empty() {
                    return items;
                }
            } else if let Some(s) = unwrap_text(v) {
                let items = split_list(&s);
                if !items.is_empty() {
                    return items;
                }
            }
        }
        Vec::new()
    }
}

/// 解包字符串值
/// 映射中含 `str` 或 `string` 时取其值，否则将任意值转为字符串。
pub fn unwrap_text(v: &OwnedValue) -> Option<String> {
    if v.is_null() {
        return None;
    }
    if let Some(s) = v.as_str() {
        return Some(s.to_string());
    }
    if v.is_object() {
        if let Some(inner) = v.get("str").or_else(|| v.get("string")) {
            return unwrap_text(inner);
        }
        return simd_json::to_string(v).ok();
    }
    if let Some(i) = v.as_i64() {
        return Some(i.to_string());
    }
    if let Some(u) = v.as_u64() {
        return Some(u.to_string());
    }
    if let Some(f) = v.as_f64() {
        return Some(f.to_string());
    }
    if let Some(b) = v.as_bool() {
        return Some(b.to_string());
    }
    simd_json::to_string(v).ok()
}

fn as_int(v: &OwnedValue) -> Option<i64> {
    v.as_i64()
        .or_else(|| v.as_u64().map(|u| u as i64))
        .or_else(|| v.as_f64().map(|f| f as i64))
        .or_else(|| unwrap_text(v).and_then(|s| s.trim().parse().ok()))
}

/// 逗号分隔列表
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ================== 分发上下文 ==================

/// 交给回复管线的规范化上下文
#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub channel: &'static str,
    pub kind: ContentKind,
    pub content: String,
    pub is_group: bool,
    pub from_user_id: String,
    pub sender_id: String,
    pub sender_nickname: String,
    /// 会话连续性单元：群聊为群 ID，私聊为发送者
    pub session_id: String,
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub is_at: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_image_path: Option<PathBuf>,
    pub original: InboundMessage,
}

impl Context {
    pub fn from_message(msg: InboundMessage, group_name: Option<String>) -> Self {
        let session_id = msg.session_id().to_string();
        Self {
            channel: CHANNEL_NAME,
            kind: msg.kind,
            content: msg.content.clone(),
            is_group: msg.is_group,
            from_user_id: msg.from_user_id.clone(),
            sender_id: msg.sender_id.clone(),
            sender_nickname: msg.sender_nickname.clone(),
            receiver_id: session_id.clone(),
            session_id,
            group_name,
            is_at: msg.is_at,
            referenced_image_path: msg.referenced_image_path.clone(),
            original: msg,
        }
    }

    /// 日志中展示的发送者
    pub fn sender_label(&self) -> String {
        if self.sender_nickname.is_empty() || self.sender_nickname == self.sender_id {
            self.sender_id.clone()
        } else {
            format!("{}({})", self.sender_nickname, self.sender_id)
        }
    }
}
