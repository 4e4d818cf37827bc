use crate::message::{InboundMessage, Payload, VideoMeta, VoiceMeta};
use crate::xml;

/// 语音消息：保留原始 XML，仅提取发送者与语音地址
pub fn extract_voice(msg: &mut InboundMessage) {
    resolve_sender(msg, "voicemsg");
    let attr = |name: &str| xml::attr(&msg.content, "voicemsg", name).unwrap_or_default();

    let length = attr("voicelength")
        .parse()
        .or_else(|_| attr("length").parse())
        .unwrap_or(0);
    let meta = VoiceMeta {
        url: attr("voiceurl"),
        length,
    };
    msg.payload = Payload::Voice(meta);
}

/// 视频消息：保留原始 XML，按需由下游拉取
pub fn extract_video(msg: &mut InboundMessage) {
    resolve_sender(msg, "videomsg");
    let attr = |name: &str| xml::attr(&msg.content, "videomsg", name).unwrap_or_default();

    let meta = VideoMeta {
        aeskey: attr("aeskey"),
        cdn_url: attr("cdnvideourl"),
        length: attr("length").parse().unwrap_or(0),
        play_length: attr("playlength").parse().unwrap_or(0),
    };
    msg.payload = Payload::Video(meta);
}

/// 群聊语音/视频的发送者：正则优先，失败后再做严格解析
fn resolve_sender(msg: &mut InboundMessage, tag: &str) {
    if !msg.is_group || !msg.sender_id.is_empty() {
        return;
    }
    if let Some(sender) = xml::from_username_loose(&msg.content)
        .or_else(|| xml::attr(&msg.content, tag, "fromusername").filter(|s| !s.is_empty()))
    {
        msg.sender_id = sender;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;

    #[test]
    fn voice_keeps_raw_xml_and_reads_sender() {
        let body = "wxid_v:\n<msg><voicemsg endflag=\"1\" length=\"5000\" voicelength=\"3200\" fromusername=\"wxid_v\" voiceurl=\"http://v\"/></msg>";
        let raw = json!({"msg_id": "9", "from_user_name": "g@chatroom", "content": body, "type": 34});
        let mut msg = normalize(&raw, 0);
        extract_voice(&mut msg);

        assert_eq!(msg.sender_id, "wxid_v");
        assert_eq!(msg.content, body);
        assert_eq!(
            msg.payload,
            Payload::Voice(VoiceMeta {
                url: "http://v".to_string(),
                length: 3200,
            })
        );
    }

    #[test]
    fn video_metadata() {
        let body = "<msg><videomsg aeskey=\"vk\" cdnvideourl=\"cdn\" length=\"100\" playlength=\"7\" fromusername=\"wxid_p\"/></msg>";
        let raw = json!({"msg_id": "10", "from_user_name": "wxid_p", "content": body, "type": 43});
        let mut msg = normalize(&raw, 0);
        extract_video(&mut msg);

        assert_eq!(msg.sender_id, "wxid_p");
        match &msg.payload {
            Payload::Video(meta) => {
                assert_eq!(meta.aeskey, "vk");
                assert_eq!(meta.play_length, 7);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
