use crate::event::{RawMessage, RawView, split_list};
use crate::message::{ContentKind, GROUP_SUFFIX, InboundMessage, Payload};
use crate::xml;
use std::collections::BTreeSet;
use tracing::debug;

// 各协议版本的字段别名，按优先级排列
pub const ID_KEYS: &[&str] = &["msg_id", "msgid", "MsgId", "id", "new_msg_id", "NewMsgId"];
pub const CREATE_TIME_KEYS: &[&str] = &["create_time", "timestamp", "CreateTime", "createTime"];
pub const FROM_KEYS: &[&str] = &["from_user_name", "fromUserName", "FromUserName"];
pub const TO_KEYS: &[&str] = &["to_user_name", "toUserName", "ToUserName"];
pub const CONTENT_KEYS: &[&str] = &["content", "Content"];
pub const TYPE_KEYS: &[&str] = &["msg_type", "type", "Type", "MsgType"];
pub const MSG_SOURCE_KEYS: &[&str] = &["msg_source", "MsgSource", "msgSource"];
pub const ROOM_KEYS: &[&str] = &["roomId", "room_id", "RoomId"];
pub const AT_LIST_KEYS: &[&str] = &["AtUserList", "at_list", "atlist"];

const SELF_DISPLAY_TAGS: &[&str] = &["selfDisplayName", "displayname", "nickname"];

/// 将一条原始消息转换为只含通用字段的 InboundMessage
/// 该阶段从不失败：缺失字段以空值/零值代替。
pub fn normalize(raw: &RawMessage, now: i64) -> InboundMessage {
    let view = RawView(raw);

    let id = view
        .text(ID_KEYS)
        .filter(|s| s.as_str() != "0")
        .unwrap_or_else(|| {
            let id = synthesize_id(raw, now);
            debug!(target: "Pipeline", "消息缺少 ID，生成替代 ID: {}", id);
            id
        });

    let create_time = view.int(CREATE_TIME_KEYS).filter(|t| *t > 0).unwrap_or(now);
    let from_user_id = view.text(FROM_KEYS).unwrap_or_default();
    let to_user_id = view.text(TO_KEYS).unwrap_or_default();
    let content = view.text(CONTENT_KEYS).unwrap_or_default();
    let raw_type = view.text(TYPE_KEYS).unwrap_or_default();

    let is_group = view.text(ROOM_KEYS).is_some()
        || from_user_id.ends_with(GROUP_SUFFIX)
        || to_user_id.ends_with(GROUP_SUFFIX);

    let msg_source = view.text(MSG_SOURCE_KEYS).unwrap_or_default();
    let mut at_list: BTreeSet<String> = BTreeSet::new();
    let mut self_display_name = String::new();
    if !msg_source.is_empty() {
        if let Some(list) = xml::text(&msg_source, &["atuserlist"]) {
            at_list.extend(split_list(&list));
        }
        self_display_name = SELF_DISPLAY_TAGS
            .iter()
            .find_map(|tag| xml::text(&msg_source, &[*tag]).filter(|s| !s.is_empty()))
            .unwrap_or_default();
    }
    if at_list.is_empty() {
        at_list.extend(view.list(AT_LIST_KEYS));
    }

    // 私聊中发送者即 From；群聊留待发送者解析阶段
    let sender_id = if is_group {
        String::new()
    } else {
        from_user_id.clone()
    };

    InboundMessage {
        id,
        create_time,
        is_group,
        from_user_id,
        to_user_id,
        sender_id,
        sender_nickname: String::new(),
        content,
        raw_type,
        kind: ContentKind::Unknown,
        at_list,
        self_display_name,
        is_at: false,
        is_quote_text: false,
        referenced_image_path: None,
        payload: Payload::None,
        raw: raw.clone(),
    }
}

/// 合成消息 ID：msg_<时间戳>_<内容摘要>
/// 同一条畸形消息跨时间重复投递时无法去重。
pub fn synthesize_id(raw: &RawMessage, now: i64) -> String {
    let body = simd_json::to_string(raw).unwrap_or_default();
    let digest = format!("{:x}", md5::compute(body.as_bytes()));
    format!("msg_{}_{}", now, &digest[..16])
}
