use super::take_group_prefix;
use crate::message::{ImageMeta, InboundMessage, Payload};
use crate::xml;
use tracing::warn;

/// 图片消息：解析 `<img>` 节点的 CDN 元数据
/// 下载由流水线在发送者确定后执行；解析失败时 content 保留原始 XML。
pub fn extract(msg: &mut InboundMessage) {
    take_group_prefix(msg);

    let parsed = xml::attrs(&msg.content, "img").unwrap_or_default();
    let get = |name: &str| -> String {
        parsed
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .or_else(|| xml::attr_loose(&msg.content, name))
            .unwrap_or_default()
    };

    let mid_url = get("cdnmidimgurl");
    let (cdn_url, file_type) = if mid_url.is_empty() {
        (get("cdnthumburl"), 1)
    } else {
        (mid_url, 2)
    };

    let meta = ImageMeta {
        aeskey: get("aeskey"),
        thumb_aeskey: get("cdnthumbaeskey"),
        md5: get("md5"),
        length: get("length").parse().unwrap_or(0),
        cdn_url,
        file_type,
    };

    if meta.aeskey.is_empty() {
        warn!(
            target: "Media",
            "图片消息缺少 aeskey，跳过下载 (ID: {}): {}",
            msg.id,
            msg.excerpt(100)
        );
    }

    msg.payload = Payload::Image(meta);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;

    #[test]
    fn parses_mid_image_metadata_in_group() {
        let body = "wxid_a:\n<?xml version=\"1.0\"?><msg><img aeskey=\"ak\" cdnthumbaeskey=\"tk\" md5=\"m5\" length=\"2048\" cdnmidimgurl=\"mid\" cdnthumburl=\"thumb\"/></msg>";
        let raw = json!({"msg_id": "5", "from_user_name": "g@chatroom", "content": body, "type": 3});
        let mut msg = normalize(&raw, 0);
        extract(&mut msg);

        assert_eq!(msg.sender_id, "wxid_a");
        let meta = msg.image_meta().unwrap();
        assert_eq!(meta.aeskey, "ak");
        assert_eq!(meta.thumb_aeskey, "tk");
        assert_eq!(meta.md5, "m5");
        assert_eq!(meta.length, 2048);
        assert_eq!(meta.cdn_url, "mid");
        assert_eq!(meta.file_type, 2);
    }

    #[test]
    fn missing_aeskey_keeps_raw_xml() {
        let body = "<msg><img cdnthumburl=\"thumb\" length=\"1\"/></msg>";
        let raw = json!({"msg_id": "6", "from_user_name": "wxid_b", "content": body, "type": 3});
        let mut msg = normalize(&raw, 0);
        extract(&mut msg);

        let meta = msg.image_meta().unwrap();
        assert!(meta.aeskey.is_empty());
        assert_eq!(meta.cdn_url, "thumb");
        assert_eq!(meta.file_type, 1);
        assert_eq!(msg.content, body);
    }
}
