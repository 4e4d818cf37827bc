use super::take_group_prefix;
use crate::message::{ContentKind, InboundMessage, PatMeta, Payload, SYSTEM_SENDER};
use crate::xml;

/// 系统消息：识别拍一拍，其余归为系统通知
pub fn extract(msg: &mut InboundMessage) {
    take_group_prefix(msg);

    if msg.content.contains("<pat") {
        let body = xml::strip_to_xml(&msg.content).to_string();
        let field = |name: &str| xml::text(&body, &["pat", name]).unwrap_or_default();
        let meta = PatMeta {
            patter: field("fromusername"),
            patted: field("pattedusername"),
            suffix: field("patsuffix"),
        };

        if !meta.patter.is_empty() {
            msg.sender_id = meta.patter.clone();
        }
        msg.content = format!("{} 拍了拍 {}{}", meta.patter, meta.patted, meta.suffix);
        msg.kind = ContentKind::Pat;
        msg.payload = Payload::Pat(meta);
        return;
    }

    msg.sender_id = SYSTEM_SENDER.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;

    #[test]
    fn pat_reclassifies_with_patter_as_sender() {
        let body = "<sysmsg type=\"pat\"><pat><fromusername>wxid_a</fromusername><chatusername>g@chatroom</chatusername><pattedusername>wxid_bot</pattedusername><patsuffix>的脑袋</patsuffix></pat></sysmsg>";
        let raw = json!({"msg_id": "1", "from_user_name": "g@chatroom", "content": body, "type": 10000});
        let mut msg = normalize(&raw, 0);
        extract(&mut msg);

        assert_eq!(msg.kind, ContentKind::Pat);
        assert_eq!(msg.sender_id, "wxid_a");
        assert_eq!(msg.content, "wxid_a 拍了拍 wxid_bot的脑袋");
        assert_eq!(
            msg.payload,
            Payload::Pat(PatMeta {
                patter: "wxid_a".into(),
                patted: "wxid_bot".into(),
                suffix: "的脑袋".into(),
            })
        );
    }

    #[test]
    fn plain_notice_uses_system_sender() {
        let raw = json!({"msg_id": "2", "from_user_name": "g@chatroom", "content": "\"小王\"邀请\"小李\"加入了群聊", "type": 10000});
        let mut msg = normalize(&raw, 0);
        extract(&mut msg);
        assert_eq!(msg.kind, ContentKind::Unknown);
        assert_eq!(msg.sender_id, SYSTEM_SENDER);
    }
}
