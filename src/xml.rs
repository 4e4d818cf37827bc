//! 消息体中 XML 片段的宽松解析
//!
//! 微信的 XML 经常带有群聊发送者前缀、未闭合标签或转义嵌套，
//! 这里统一关闭结束标签校验，解析失败时返回 None，由调用方决定兜底。

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;
use std::sync::OnceLock;

static RE_FROM_ATTR: OnceLock<Regex> = OnceLock::new();
static RE_FROM_ELEM: OnceLock<Regex> = OnceLock::new();
static RE_ANY_ATTR: OnceLock<Regex> = OnceLock::new();

/// 内容是否为 XML 消息体
pub fn looks_like_xml(s: &str) -> bool {
    let t = s.trim_start();
    t.starts_with('<') || t.contains("<?xml") || t.contains("<msg")
}

/// 截掉 XML 之前的内容 (如群聊中的 "wxid:\n" 前缀)
pub fn strip_to_xml(s: &str) -> &str {
    match s.find('<') {
        Some(idx) => &s[idx..],
        None => s,
    }
}

fn reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    reader
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn read_attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// 读取第一个名为 `tag` 的元素上的属性
pub fn attr(xml: &str, tag: &str, name: &str) -> Option<String> {
    let mut reader = reader(strip_to_xml(xml));
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&e) == tag {
                    return read_attr(&e, name);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// 读取第一个名为 `tag` 的元素上的全部属性
pub fn attrs(xml: &str, tag: &str) -> Option<Vec<(String, String)>> {
    let mut reader = reader(strip_to_xml(xml));
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(&e) == tag {
                    let list = e
                        .attributes()
                        .flatten()
                        .filter_map(|a| {
                            let key = String::from_utf8_lossy(a.key.local_name().as_ref())
                                .into_owned();
                            a.unescape_value().ok().map(|v| (key, v.into_owned()))
                        })
                        .collect();
                    return Some(list);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// 读取路径末端元素的文本
/// `path` 只需匹配元素祖先链的末尾，如 `["appmsg", "type"]`
/// 不会命中 `refermsg` 下的 `type`。文本与 CDATA 会被拼接并去除首尾空白。
pub fn text(xml: &str, path: &[&str]) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let mut reader = reader(strip_to_xml(xml));
    let mut stack: Vec<String> = Vec::new();
    let mut depth_hit: Option<usize> = None;
    let mut buf = String::new();

    let at_path = |stack: &[String]| {
        stack.len() >= path.len()
            && stack[stack.len() - path.len()..]
                .iter()
                .zip(path)
                .all(|(a, b)| a == b)
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(local_name(&e));
                if depth_hit.is_none() && at_path(&stack) {
                    depth_hit = Some(stack.len());
                }
            }
            Ok(Event::Empty(e)) => {
                stack.push(local_name(&e));
                let hit = depth_hit.is_none() && at_path(&stack);
                stack.pop();
                if hit {
                    return Some(String::new());
                }
            }
            Ok(Event::End(_)) => {
                if depth_hit == Some(stack.len()) {
                    return Some(buf.trim().to_string());
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if depth_hit.is_some() {
                    match t.unescape() {
                        Ok(s) => buf.push_str(&s),
                        Err(_) => buf.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if depth_hit.is_some() {
                    buf.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) | Err(_) => {
                return depth_hit.map(|_| buf.trim().to_string());
            }
            _ => {}
        }
    }
}

/// 正则读取属性值，不要求 XML 结构完整
pub fn attr_loose(xml: &str, name: &str) -> Option<String> {
    let re = RE_ANY_ATTR.get_or_init(|| {
        Regex::new(r#"\b([\w:.-]+)\s*=\s*["']([^"']*)["']"#).expect("valid regex")
    });
    re.captures_iter(xml)
        .find(|c| &c[1] == name)
        .map(|c| c[2].to_string())
}

/// 正则优先提取 `fromusername`，对残缺 XML 更宽容
pub fn from_username_loose(xml: &str) -> Option<String> {
    let re_attr = RE_FROM_ATTR.get_or_init(|| {
        Regex::new(r#"fromusername\s*=\s*["']([^"']*)["']"#).expect("valid regex")
    });
    if let Some(v) = re_attr
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
    {
        return Some(v.to_string());
    }

    let re_elem = RE_FROM_ELEM.get_or_init(|| {
        Regex::new(r"<fromusername>(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?</fromusername>")
            .expect("valid regex")
    });
    re_elem
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTE: &str = r#"<?xml version="1.0"?>
<msg><appmsg appid="" sdkver="0"><title>这是什么</title><type>57</type>
<refermsg><type>1</type><svrid>1</svrid><displayname>Dora</displayname>
<content>hello &amp; bye</content></refermsg></appmsg></msg>"#;

    #[test]
    fn text_matches_path_suffix_only() {
        assert_eq!(text(QUOTE, &["appmsg", "type"]).as_deref(), Some("57"));
        assert_eq!(text(QUOTE, &["refermsg", "type"]).as_deref(), Some("1"));
        assert_eq!(
            text(QUOTE, &["refermsg", "content"]).as_deref(),
            Some("hello & bye")
        );
        assert_eq!(text(QUOTE, &["appmsg", "missing"]), None);
    }

    #[test]
    fn attr_skips_sender_prefix_and_reads_cdata() {
        let body = "wxid_a:\n<msg><img aeskey=\"k1\" length=\"12\"/></msg>";
        assert_eq!(attr(body, "img", "aeskey").as_deref(), Some("k1"));
        assert_eq!(attr(body, "img", "md5"), None);

        let src = "<msgsource><atuserlist><![CDATA[wxid_a,wxid_b]]></atuserlist></msgsource>";
        assert_eq!(
            text(src, &["atuserlist"]).as_deref(),
            Some("wxid_a,wxid_b")
        );
    }

    #[test]
    fn attr_loose_survives_truncated_xml() {
        let broken = r#"<msg><img aeskey="k2" cdnmidimgurl="u"#;
        assert_eq!(attr_loose(broken, "aeskey").as_deref(), Some("k2"));
        assert_eq!(attr(broken, "img", "cdnmidimgurl"), None);
    }

    #[test]
    fn attr_loose_matches_whole_names() {
        let xml = r#"<msg><img aeskey="k3" key='plain' md5="m"/><img length="9"/></msg>"#;
        assert_eq!(attr_loose(xml, "key").as_deref(), Some("plain"));
        assert_eq!(attr_loose(xml, "aeskey").as_deref(), Some("k3"));
        assert_eq!(attr_loose(xml, "length").as_deref(), Some("9"));
        assert_eq!(attr_loose(xml, "cdnurl"), None);
    }

    #[test]
    fn from_username_prefers_attribute() {
        let xml = r#"<msg><voicemsg fromusername="wxid_v" length="3"/></msg>"#;
        assert_eq!(from_username_loose(xml).as_deref(), Some("wxid_v"));

        let broken = "<msg><fromusername>wxid_e</fromusername><voicemsg";
        assert_eq!(from_username_loose(broken).as_deref(), Some("wxid_e"));
    }
}
