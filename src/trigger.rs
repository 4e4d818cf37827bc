//! 触发规则：私聊前缀、群白名单、群前缀/关键词/@ 提及

use crate::config::ALL_GROUP;
use crate::message::{ContentKind, InboundMessage};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

static RE_QUOTE_QUESTION: OnceLock<Regex> = OnceLock::new();
static RE_ANY_MENTION: OnceLock<Regex> = OnceLock::new();

/// 消息被放行的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerMatch {
    Prefix(String),
    Keyword(String),
    Mention,
    /// 无需触发词 (空前缀或非文本消息)
    Passthrough,
}

/// 触发相关配置
#[derive(Debug, Clone, Default)]
pub struct TriggerConfig {
    pub single_chat_prefix: Vec<String>,
    pub group_chat_prefix: Vec<String>,
    pub group_chat_keyword: Vec<String>,
    pub group_name_white_list: Vec<String>,
    /// 机器人昵称，用于字面量 `@昵称` 匹配
    pub bot_name: String,
}

fn first_prefix<'a>(text: &str, prefixes: &'a [String]) -> Option<&'a str> {
    prefixes
        .iter()
        .map(String::as_str)
        .find(|p| !p.is_empty() && text.starts_with(p))
}

/// 私聊：命中前缀则剥离；未命中且未配置空前缀时丢弃
/// 非文本消息不受前缀约束。
pub fn route_private(msg: &mut InboundMessage, prefixes: &[String]) -> Option<TriggerMatch> {
    if msg.kind != ContentKind::Text {
        return Some(TriggerMatch::Passthrough);
    }
    if let Some(prefix) = first_prefix(&msg.content, prefixes) {
        msg.content = msg.content[prefix.len()..].trim().to_string();
        return Some(TriggerMatch::Prefix(prefix.to_string()));
    }
    if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
        return Some(TriggerMatch::Passthrough);
    }
    debug!(target: "Pipeline", "私聊消息未匹配前缀: {}", msg.excerpt(50));
    None
}

/// 群白名单：先按群名，再按群 ID；包含 `ALL_GROUP` 时全部放行
pub fn whitelisted(group_id: &str, group_name: Option<&str>, whitelist: &[String]) -> bool {
    if whitelist.iter().any(|g| g == ALL_GROUP) {
        return true;
    }
    let name = group_name.filter(|n| !n.is_empty()).unwrap_or(group_id);
    whitelist.iter().any(|g| g == name || g == group_id)
}

/// 剥离前缀；引用消息只处理其中的提问部分，再拼回原有结构
fn strip_prefix(msg: &mut InboundMessage, prefixes: &[String]) -> Option<String> {
    if msg.is_quote_text {
        let re = RE_QUOTE_QUESTION.get_or_init(|| {
            Regex::new(r#"(?s)^(用户针对以下(?:消息|聊天记录)提问：")(.*?)("\n\n)"#)
                .expect("valid regex")
        });
        if let Some(caps) = re.captures(&msg.content) {
            let question = &caps[2];
            let prefix = first_prefix(question, prefixes)?.to_string();
            let rebuilt = format!(
                "{}{}{}{}",
                &caps[1],
                question[prefix.len()..].trim(),
                &caps[3],
                &msg.content[caps[0].len()..]
            );
            msg.content = rebuilt;
            return Some(prefix);
        }
    }

    let prefix = first_prefix(&msg.content, prefixes)?.to_string();
    msg.content = msg.content[prefix.len()..].trim().to_string();
    Some(prefix)
}

/// 是否提及机器人：at 列表优先，其次字面量 `@昵称`
pub fn mentions_bot(msg: &InboundMessage, bot_wxid: &str, bot_name: &str) -> bool {
    if !bot_wxid.is_empty() && msg.at_list.contains(bot_wxid) {
        return true;
    }
    [bot_name, msg.self_display_name.as_str()]
        .iter()
        .filter(|n| !n.is_empty())
        .any(|n| msg.content.contains(&format!("@{}", n)))
}

/// 去掉一处 `@机器人`；都不匹配时用通用规则去掉第一个 `@xxx `
pub fn strip_mention(content: &str, bot_name: &str, display_name: &str) -> String {
    for name in [bot_name, display_name] {
        if name.is_empty() {
            continue;
        }
        for pattern in [
            format!("@{} ", name),
            format!("@{}\u{2005}", name),
            format!("@{}", name),
        ] {
            if content.contains(&pattern) {
                return content.replacen(&pattern, "", 1).trim().to_string();
            }
        }
    }

    let re = RE_ANY_MENTION
        .get_or_init(|| Regex::new(r"@[^\s]+[\s\u{2005}]+").expect("valid regex"));
    re.replace(content, "").trim().to_string()
}

/// 群聊触发：前缀 > 关键词 > @ 提及，均未命中返回 None
/// 调用前需已通过白名单；非文本消息直接放行。
pub fn route_group(
    msg: &mut InboundMessage,
    cfg: &TriggerConfig,
    bot_wxid: &str,
) -> Option<TriggerMatch> {
    if msg.kind != ContentKind::Text {
        return Some(TriggerMatch::Passthrough);
    }

    if let Some(prefix) = strip_prefix(msg, &cfg.group_chat_prefix) {
        return Some(TriggerMatch::Prefix(prefix));
    }

    if let Some(keyword) = cfg
        .group_chat_keyword
        .iter()
        .find(|k| !k.is_empty() && msg.content.contains(k.as_str()))
    {
        return Some(TriggerMatch::Keyword(keyword.clone()));
    }

    if mentions_bot(msg, bot_wxid, &cfg.bot_name) {
        msg.is_at = true;
        msg.content = strip_mention(&msg.content, &cfg.bot_name, &msg.self_display_name);
        return Some(TriggerMatch::Mention);
    }

    debug!(target: "Pipeline", "群聊消息未匹配触发条件: {}", msg.excerpt(50));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use simd_json::json;

    fn text(content: &str, group: bool) -> InboundMessage {
        let from = if group { "g1@chatroom" } else { "wxid_a" };
        let mut m = normalize(
            &json!({"msg_id": "1", "from_user_name": from, "type": 1, "content": content}),
            0,
        );
        m.kind = ContentKind::Text;
        m
    }

    fn prefixes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn cfg() -> TriggerConfig {
        TriggerConfig {
            group_chat_prefix: prefixes(&["bot"]),
            group_chat_keyword: prefixes(&["天气"]),
            group_name_white_list: prefixes(&[ALL_GROUP]),
            bot_name: "Bot".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn private_prefix_policy() {
        let mut m = text("bot hello", false);
        assert_eq!(
            route_private(&mut m, &prefixes(&["bot"])),
            Some(TriggerMatch::Prefix("bot".into()))
        );
        assert_eq!(m.content, "hello");

        let mut m = text("hello", false);
        assert_eq!(route_private(&mut m, &prefixes(&["bot"])), None);

        let mut m = text("hello", false);
        assert_eq!(
            route_private(&mut m, &prefixes(&["bot", ""])),
            Some(TriggerMatch::Passthrough)
        );
        assert_eq!(m.content, "hello");

        let mut img = text("<msg/>", false);
        img.kind = ContentKind::Image;
        assert!(route_private(&mut img, &prefixes(&["bot"])).is_some());
    }

    #[test]
    fn whitelist_by_name_then_id() {
        let list = prefixes(&["测试群", "g2@chatroom"]);
        assert!(whitelisted("g1@chatroom", Some("测试群"), &list));
        assert!(whitelisted("g2@chatroom", Some("别的群"), &list));
        assert!(!whitelisted("g3@chatroom", None, &list));
        assert!(whitelisted("g3@chatroom", None, &prefixes(&[ALL_GROUP])));
    }

    #[test]
    fn group_prefix_then_keyword() {
        let mut m = text("bot  你好 ", true);
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Prefix("bot".into()))
        );
        assert_eq!(m.content, "你好");

        let mut m = text("今天天气如何", true);
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Keyword("天气".into()))
        );
        assert_eq!(m.content, "今天天气如何");

        let mut m = text("随便聊聊", true);
        assert_eq!(route_group(&mut m, &cfg(), "wxid_bot"), None);
    }

    #[test]
    fn quote_question_keeps_scaffold() {
        let mut m = text(
            "用户针对以下消息提问：\"bot 这是什么\"\n\n被引用的消息来自\"Dora\"：\n\"hi\"\n\n请基于被引用的消息回答用户的问题。",
            true,
        );
        m.is_quote_text = true;
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Prefix("bot".into()))
        );
        assert_eq!(
            m.content,
            "用户针对以下消息提问：\"这是什么\"\n\n被引用的消息来自\"Dora\"：\n\"hi\"\n\n请基于被引用的消息回答用户的问题。"
        );
    }

    #[test]
    fn mention_via_at_list_or_literal_name() {
        let mut m = text("@Bot\u{2005}帮我查一下", true);
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Mention)
        );
        assert!(m.is_at);
        assert_eq!(m.content, "帮我查一下");

        let mut m = text("@小助手 在吗", true);
        m.self_display_name = "小助手".to_string();
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Mention)
        );
        assert_eq!(m.content, "在吗");
    }

    #[test]
    fn mention_strip_falls_back_to_first_at_token() {
        let mut m = text("@改过的名字 你好 @别人 再见", true);
        m.at_list.insert("wxid_bot".to_string());
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Mention)
        );
        assert_eq!(m.content, "你好 @别人 再见");
    }

    #[test]
    fn non_text_group_messages_skip_triggers() {
        let mut m = text("<msg><img/></msg>", true);
        m.kind = ContentKind::Image;
        assert_eq!(
            route_group(&mut m, &cfg(), "wxid_bot"),
            Some(TriggerMatch::Passthrough)
        );
    }
}
