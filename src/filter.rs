//! 去重与时效过滤

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::message::{ContentKind, InboundMessage};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 不处理的系统账号与公众号
pub const BLOCKED_SENDERS: &[&str] = &[
    "weixin",
    "gh_6e99ff560306",
    "gh_3dfda90e39d6",
    "gh_25d9ac85a4bc",
];

/// 内容过滤阶段丢弃超过该时长的消息
pub const MAX_MESSAGE_AGE_SECS: i64 = 300;

/// 入口阶段丢弃超过该时长的消息
pub const INGEST_WINDOW_SECS: i64 = 60;

/// 入口阶段按 ID 去重的保留时长
pub const INGEST_TTL: Duration = Duration::from_secs(3600);

/// 消息被丢弃的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Blocked,
    SpeechDisabled,
    FromSelf,
    Stale,
    StatusSync,
    Duplicate,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Blocked => "发送者在屏蔽列表中",
            DropReason::SpeechDisabled => "未开启语音识别",
            DropReason::FromSelf => "机器人自己的消息",
            DropReason::Stale => "消息已过期",
            DropReason::StatusSync => "状态同步消息",
            DropReason::Duplicate => "重复消息",
        };
        f.write_str(s)
    }
}

/// 入口闸门：分类之前按 ID 去重并丢弃 60 秒前的消息
pub struct IngestGate {
    seen: TtlCache<String, ()>,
    clock: Arc<dyn Clock>,
}

impl IngestGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: TtlCache::new(INGEST_TTL, clock.clone()),
            clock,
        }
    }

    pub fn admit(&self, msg: &InboundMessage) -> Result<(), DropReason> {
        if msg.create_time < self.clock.now() - INGEST_WINDOW_SECS {
            return Err(DropReason::Stale);
        }
        if !self.seen.insert_if_absent(msg.id.clone(), ()) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }
}

/// 语音消息开关
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeechPolicy {
    pub private: bool,
    pub group: bool,
}

/// 内容过滤：屏蔽列表、语音开关、自身消息、过期、状态同步与去重
pub struct ContentFilter {
    seen: TtlCache<String, ()>,
    clock: Arc<dyn Clock>,
    speech: SpeechPolicy,
}

impl ContentFilter {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>, speech: SpeechPolicy) -> Self {
        Self {
            seen: TtlCache::new(ttl, clock.clone()),
            clock,
            speech,
        }
    }

    /// 依次检查各条规则；去重键在最后一步原子写入
    pub fn check(&self, msg: &InboundMessage, bot_wxid: &str) -> Result<(), DropReason> {
        if BLOCKED_SENDERS.contains(&msg.sender_id.as_str()) {
            return Err(DropReason::Blocked);
        }
        if msg.kind == ContentKind::Voice {
            let enabled = if msg.is_group {
                self.speech.group
            } else {
                self.speech.private
            };
            if !enabled {
                return Err(DropReason::SpeechDisabled);
            }
        }
        if !bot_wxid.is_empty() && msg.sender_id == bot_wxid {
            return Err(DropReason::FromSelf);
        }
        if msg.create_time < self.clock.now() - MAX_MESSAGE_AGE_SECS {
            return Err(DropReason::Stale);
        }
        if msg.kind == ContentKind::StatusSync {
            return Err(DropReason::StatusSync);
        }
        if !self.seen.insert_if_absent(msg.dedup_key(), ()) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }

    pub fn purge_expired(&self) -> usize {
        self.seen.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::normalize::normalize;
    use simd_json::json;

    const NOW: i64 = 1_700_000_000;

    fn msg(id: &str, sender: &str, create_time: i64) -> InboundMessage {
        let mut m = normalize(
            &json!({"msg_id": id, "from_user_name": sender, "create_time": create_time, "type": 1, "content": "hi"}),
            NOW,
        );
        m.kind = ContentKind::Text;
        m
    }

    fn filter(clock: Arc<ManualClock>) -> ContentFilter {
        ContentFilter::new(Duration::from_secs(3600), clock, SpeechPolicy::default())
    }

    #[test]
    fn duplicate_is_dropped_once_seen() {
        let f = filter(Arc::new(ManualClock::new(NOW)));
        let m = msg("1", "wxid_a", NOW);
        assert_eq!(f.check(&m, "wxid_bot"), Ok(()));
        assert_eq!(f.check(&m, "wxid_bot"), Err(DropReason::Duplicate));
        assert_eq!(f.check(&m.clone(), "wxid_bot"), Err(DropReason::Duplicate));
    }

    #[test]
    fn staleness_boundary_is_300_seconds() {
        let f = filter(Arc::new(ManualClock::new(NOW)));
        assert_eq!(f.check(&msg("1", "wxid_a", NOW - 300), ""), Ok(()));
        assert_eq!(
            f.check(&msg("2", "wxid_a", NOW - 301), ""),
            Err(DropReason::Stale)
        );
    }

    #[test]
    fn blocked_self_and_status_sync() {
        let f = filter(Arc::new(ManualClock::new(NOW)));
        assert_eq!(
            f.check(&msg("1", "weixin", NOW), "wxid_bot"),
            Err(DropReason::Blocked)
        );
        assert_eq!(
            f.check(&msg("2", "wxid_bot", NOW), "wxid_bot"),
            Err(DropReason::FromSelf)
        );
        let mut sync = msg("3", "wxid_a", NOW);
        sync.kind = ContentKind::StatusSync;
        assert_eq!(f.check(&sync, "wxid_bot"), Err(DropReason::StatusSync));
    }

    #[test]
    fn voice_respects_per_chat_switches() {
        let clock = Arc::new(ManualClock::new(NOW));
        let f = ContentFilter::new(
            Duration::from_secs(3600),
            clock,
            SpeechPolicy {
                private: true,
                group: false,
            },
        );
        let mut private = msg("1", "wxid_a", NOW);
        private.kind = ContentKind::Voice;
        assert_eq!(f.check(&private, ""), Ok(()));

        let mut group = msg("2", "wxid_a", NOW);
        group.kind = ContentKind::Voice;
        group.is_group = true;
        assert_eq!(f.check(&group, ""), Err(DropReason::SpeechDisabled));
    }

    #[test]
    fn ingest_gate_uses_id_and_sixty_second_window() {
        let clock = Arc::new(ManualClock::new(NOW));
        let gate = IngestGate::new(clock.clone());
        assert_eq!(gate.admit(&msg("1", "a", NOW - 60)), Ok(()));
        assert_eq!(gate.admit(&msg("1", "b", NOW)), Err(DropReason::Duplicate));
        assert_eq!(gate.admit(&msg("2", "a", NOW - 61)), Err(DropReason::Stale));

        clock.advance(3600);
        assert_eq!(gate.admit(&msg("1", "a", NOW + 3600)), Ok(()));
    }

    #[test]
    fn dedup_key_expires_with_ttl() {
        let clock = Arc::new(ManualClock::new(NOW));
        let f = filter(clock.clone());
        let m = msg("1", "wxid_a", NOW);
        assert_eq!(f.check(&m, ""), Ok(()));
        clock.advance(3600);
        // 过期后因时效规则被拒，而非去重
        assert_eq!(f.check(&m, ""), Err(DropReason::Stale));
        assert_eq!(f.purge_expired(), 1);
    }
}
