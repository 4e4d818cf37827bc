use super::{ExtractEnv, take_group_prefix};
use crate::media;
use crate::message::{ContentKind, InboundMessage, Payload};
use crate::xml;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

static RE_LEAD_CHAR: OnceLock<Regex> = OnceLock::new();
static RE_LEAD_NAME: OnceLock<Regex> = OnceLock::new();

/// XML 应用消息：引用 (57) 与分享链接 (5)，其余保持 XmlApp
pub fn extract(msg: &mut InboundMessage, env: &ExtractEnv<'_>) {
    take_group_prefix(msg);

    let body = xml::strip_to_xml(&msg.content).to_string();
    let Some(app_type) = xml::text(&body, &["appmsg", "type"]) else {
        debug!(target: "Pipeline", "非 appmsg XML (ID: {}): {}", msg.id, msg.excerpt(100));
        return;
    };

    match app_type.as_str() {
        "57" => extract_quote(msg, &body, env),
        "5" => extract_sharing(msg, &body),
        _ => debug!(target: "Pipeline", "未处理的 appmsg 类型 {} (ID: {})", app_type, msg.id),
    }
}

// ================== 引用消息 ==================

fn extract_quote(msg: &mut InboundMessage, body: &str, env: &ExtractEnv<'_>) {
    let field = |path: &[&str]| xml::text(body, path).unwrap_or_default();
    let refer_type = field(&["refermsg", "type"]);
    let title = field(&["appmsg", "title"]);
    let display_name = field(&["refermsg", "displayname"]);
    let quoted = field(&["refermsg", "content"]);

    let handled = match refer_type.as_str() {
        "1" => quote_text(msg, &title, &display_name, &quoted),
        "49" => quote_chat_record(msg, &title, &display_name, &quoted),
        "3" => quote_image(msg, &title, &quoted, env),
        _ => false,
    };
    if handled {
        return;
    }

    debug!(
        target: "Pipeline",
        "未处理的引用类型 {} (ID: {})，标题: {}",
        refer_type,
        msg.id,
        title
    );
    msg.kind = ContentKind::XmlApp;
    msg.content = if title.is_empty() {
        format!("用户引用了一个未处理类型的消息 (类型：{})", refer_type)
    } else {
        format!(
            "用户引用了一个消息并提问：\"{}\" (类型：{}，未特殊处理)",
            title, refer_type
        )
    };
}

fn quote_text(msg: &mut InboundMessage, title: &str, display_name: &str, quoted: &str) -> bool {
    if title.is_empty() || display_name.is_empty() || quoted.is_empty() {
        return false;
    }
    let cleaned = clean_quoted(quoted);
    debug!(target: "Pipeline", "引用内容清理: '{}' -> '{}'", quoted, cleaned);

    msg.content = format!(
        "用户针对以下消息提问：\"{}\"\n\n被引用的消息来自\"{}\"：\n\"{}\"\n\n请基于被引用的消息回答用户的问题。",
        title, display_name, cleaned
    );
    msg.kind = ContentKind::Text;
    msg.is_quote_text = true;
    info!(target: "Pipeline", "文本引用消息已转为文本 (ID: {})", msg.id);
    true
}

fn quote_chat_record(
    msg: &mut InboundMessage,
    title: &str,
    display_name: &str,
    quoted: &str,
) -> bool {
    if quoted.is_empty() || xml::text(quoted, &["appmsg", "type"]).as_deref() != Some("19") {
        return false;
    }
    let summary = xml::text(quoted, &["appmsg", "des"]).unwrap_or_default();
    if title.is_empty() || display_name.is_empty() || summary.is_empty() {
        return false;
    }

    msg.content = format!(
        "用户针对以下聊天记录提问：\"{}\"\n\n被引用的聊天记录来自\"{}\"：\n（摘要：{}）\n\n请基于被引用的聊天记录内容回答用户的问题（注意：聊天记录可能包含多条消息）。",
        title, display_name, summary
    );
    msg.kind = ContentKind::Text;
    msg.is_quote_text = true;
    info!(target: "Pipeline", "聊天记录引用消息已转为文本 (ID: {})", msg.id);
    true
}

fn quote_image(
    msg: &mut InboundMessage,
    title: &str,
    quoted: &str,
    env: &ExtractEnv<'_>,
) -> bool {
    let aeskey = xml::attr(quoted, "img", "aeskey").unwrap_or_default();
    if aeskey.is_empty() {
        warn!(target: "Media", "被引用的图片缺少 aeskey (ID: {})", msg.id);
        return false;
    }

    match media::find_cached(env.image_cache_dir, &aeskey) {
        Some(path) => {
            info!(
                target: "Media",
                "命中引用图片缓存 (ID: {}): {}",
                msg.id,
                path.display()
            );
            msg.content = title.to_string();
            msg.kind = ContentKind::Text;
            msg.referenced_image_path = Some(path);
            true
        }
        None => {
            warn!(
                target: "Media",
                "引用图片 {} 不在缓存目录 {} 中 (ID: {})",
                aeskey,
                env.image_cache_dir.display(),
                msg.id
            );
            false
        }
    }
}

/// 去掉被引用文本开头的触发前缀与 @ 提及
/// 清理后为空时保留原文。
pub fn clean_quoted(quoted: &str) -> String {
    let lead_char =
        RE_LEAD_CHAR.get_or_init(|| Regex::new(r"^[a-zA-Z0-9]\s+").expect("valid regex"));
    let lead_name = RE_LEAD_NAME
        .get_or_init(|| Regex::new(r"^@?[\p{Han}\w]+\s+").expect("valid regex"));

    let step = lead_char.replace(quoted, "");
    let step = step.trim();
    let cleaned = lead_name.replace(step, "");
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        quoted.to_string()
    } else {
        cleaned.to_string()
    }
}

// ================== 分享链接 ==================

fn extract_sharing(msg: &mut InboundMessage, body: &str) {
    let raw_url = xml::text(body, &["appmsg", "url"]).unwrap_or_default();
    if raw_url.is_empty() {
        warn!(target: "Pipeline", "分享消息没有链接 (ID: {})", msg.id);
        return;
    }

    match normalize_url(&raw_url) {
        Some(url) => {
            info!(target: "Pipeline", "分享链接 (ID: {}): {}", msg.id, url);
            msg.content = url.clone();
            msg.kind = ContentKind::Sharing;
            msg.payload = Payload::Sharing { url };
        }
        None => warn!(target: "Pipeline", "分享链接无效 (ID: {}): {}", msg.id, raw_url),
    }
}

/// 补全协议头，并做最基本的合法性检查
pub fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let url = if raw.starts_with("http") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("//") {
        format!("http://{}", rest)
    } else {
        format!("http://{}", raw)
    };
    (url.contains('.') && !url.contains(char::is_whitespace)).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;
    use std::path::Path;

    fn run(content: &str, from: &str, dir: &Path) -> InboundMessage {
        let raw = json!({"msg_id": "42", "from_user_name": from, "content": content, "type": 49});
        let mut msg = normalize(&raw, 0);
        msg.kind = ContentKind::XmlApp;
        extract(&mut msg, &ExtractEnv { image_cache_dir: dir });
        msg
    }

    const TEXT_QUOTE: &str = "<msg><appmsg><title>Q</title><type>57</type><refermsg><type>1</type><displayname>D</displayname><content>T</content></refermsg></appmsg></msg>";

    #[test]
    fn text_quote_becomes_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let msg = run(TEXT_QUOTE, "wxid_a", dir.path());

        assert_eq!(msg.kind, ContentKind::Text);
        assert!(msg.is_quote_text);
        assert_eq!(
            msg.content,
            "用户针对以下消息提问：\"Q\"\n\n被引用的消息来自\"D\"：\n\"T\"\n\n请基于被引用的消息回答用户的问题。"
        );
    }

    #[test]
    fn group_quote_strips_sender_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("wxid_q:\n{}", TEXT_QUOTE);
        let msg = run(&body, "g@chatroom", dir.path());
        assert_eq!(msg.sender_id, "wxid_q");
        assert!(msg.is_quote_text);
    }

    #[test]
    fn quoted_text_cleaning() {
        assert_eq!(clean_quoted("x 今天天气"), "今天天气");
        assert_eq!(clean_quoted("@小艾 帮我看看"), "帮我看看");
        assert_eq!(clean_quoted("hello"), "hello");
        assert_eq!(clean_quoted("a "), "a ");
    }

    #[test]
    fn chat_record_quote() {
        let inner = "&lt;msg&gt;&lt;appmsg&gt;&lt;type&gt;19&lt;/type&gt;&lt;des&gt;A: hi\nB: yo&lt;/des&gt;&lt;/appmsg&gt;&lt;/msg&gt;";
        let body = format!(
            "<msg><appmsg><title>总结一下</title><type>57</type><refermsg><type>49</type><displayname>群友</displayname><content>{}</content></refermsg></appmsg></msg>",
            inner
        );
        let dir = tempfile::tempdir().unwrap();
        let msg = run(&body, "wxid_a", dir.path());

        assert_eq!(msg.kind, ContentKind::Text);
        assert!(msg.is_quote_text);
        assert!(msg.content.starts_with("用户针对以下聊天记录提问：\"总结一下\""));
        assert!(msg.content.contains("（摘要：A: hi\nB: yo）"));
    }

    #[test]
    fn image_quote_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("k123.png");
        std::fs::write(&cached, b"png").unwrap();

        let inner = "&lt;msg&gt;&lt;img aeskey=\"k123\" /&gt;&lt;/msg&gt;";
        let body = format!(
            "<msg><appmsg><title>这是哪里</title><type>57</type><refermsg><type>3</type><displayname>D</displayname><content>{}</content></refermsg></appmsg></msg>",
            inner
        );
        let msg = run(&body, "wxid_a", dir.path());

        assert_eq!(msg.kind, ContentKind::Text);
        assert_eq!(msg.content, "这是哪里");
        assert_eq!(msg.referenced_image_path.as_deref(), Some(cached.as_path()));
        assert!(!msg.is_quote_text);
    }

    #[test]
    fn image_quote_cache_miss_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let inner = "&lt;msg&gt;&lt;img aeskey=\"nope\" /&gt;&lt;/msg&gt;";
        let body = format!(
            "<msg><appmsg><title>这是哪里</title><type>57</type><refermsg><type>3</type><content>{}</content></refermsg></appmsg></msg>",
            inner
        );
        let msg = run(&body, "wxid_a", dir.path());

        assert_eq!(msg.kind, ContentKind::XmlApp);
        assert_eq!(
            msg.content,
            "用户引用了一个消息并提问：\"这是哪里\" (类型：3，未特殊处理)"
        );
    }

    #[test]
    fn untitled_unknown_quote() {
        let dir = tempfile::tempdir().unwrap();
        let body = "<msg><appmsg><title></title><type>57</type><refermsg><type>43</type></refermsg></appmsg></msg>";
        let msg = run(body, "wxid_a", dir.path());
        assert_eq!(msg.content, "用户引用了一个未处理类型的消息 (类型：43)");
    }

    #[test]
    fn sharing_link_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let body = "<msg><appmsg><title>t</title><type>5</type><url>//example.com/a</url></appmsg></msg>";
        let msg = run(body, "wxid_a", dir.path());

        assert_eq!(msg.kind, ContentKind::Sharing);
        assert_eq!(msg.content, "http://example.com/a");
        assert_eq!(
            msg.payload,
            Payload::Sharing {
                url: "http://example.com/a".to_string()
            }
        );
    }

    #[test]
    fn url_normalization_rules() {
        assert_eq!(normalize_url("https://a.b").as_deref(), Some("https://a.b"));
        assert_eq!(normalize_url("a.b/c").as_deref(), Some("http://a.b/c"));
        assert_eq!(normalize_url("localhost"), None);
        assert_eq!(normalize_url("a.b c"), None);
    }

    #[test]
    fn other_app_types_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let body = "<msg><appmsg><title>file</title><type>6</type></appmsg></msg>";
        let msg = run(body, "wxid_a", dir.path());
        assert_eq!(msg.kind, ContentKind::XmlApp);
        assert_eq!(msg.content, body);
    }
}
