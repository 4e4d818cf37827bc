use super::take_group_prefix;
use crate::message::{ContentKind, InboundMessage};
use crate::xml;

/// 文本消息：剥离群聊发送者前缀
/// @ 列表已在规范化阶段从 MsgSource 与备用字段读取，字面量 `@昵称` 的匹配留给触发引擎。
pub fn extract(msg: &mut InboundMessage) {
    if !msg.is_group {
        return;
    }
    if msg.sender_id.is_empty() {
        take_group_prefix(msg);
        return;
    }

    let with_newline = format!("{}:\n", msg.sender_id);
    let bare = format!("{}:", msg.sender_id);
    if let Some(rest) = msg.content.strip_prefix(&with_newline) {
        msg.content = rest.to_string();
    } else if let Some(rest) = msg.content.strip_prefix(&bare) {
        msg.content = rest.to_string();
    }
}

/// 表情消息按文本处理，XML 消息体替换为占位文本
pub fn extract_emoji(msg: &mut InboundMessage) {
    take_group_prefix(msg);
    msg.kind = ContentKind::Text;
    if xml::looks_like_xml(&msg.content) {
        msg.content = "[表情]".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;

    #[test]
    fn group_text_takes_sender_from_prefix() {
        let raw = json!({"msg_id": "1", "from_user_name": "g@chatroom", "content": "alice:\nhello bot", "type": 1});
        let mut msg = normalize(&raw, 0);
        extract(&mut msg);
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.content, "hello bot");
    }

    #[test]
    fn known_sender_prefix_without_newline_is_stripped() {
        let raw = json!({"msg_id": "1", "from_user_name": "g@chatroom", "content": "alice:hello", "type": 1});
        let mut msg = normalize(&raw, 0);
        msg.sender_id = "alice".to_string();
        extract(&mut msg);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn emoji_becomes_placeholder_text() {
        let raw = json!({"msg_id": "1", "from_user_name": "g@chatroom", "content": "bob:\n<msg><emoji md5=\"x\"/></msg>", "type": 47});
        let mut msg = normalize(&raw, 0);
        extract_emoji(&mut msg);
        assert_eq!(msg.kind, ContentKind::Text);
        assert_eq!(msg.sender_id, "bob");
        assert_eq!(msg.content, "[表情]");
    }
}
