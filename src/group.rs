//! 群聊上下文：发送者识别、群信息缓存与昵称解析

use crate::classify::split_sender_prefix;
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::event::RawView;
use crate::gateway::{Gateway, api};
use crate::login::BotIdentity;
use crate::message::{GROUP_SUFFIX, InboundMessage, UNKNOWN_SENDER};
use crate::normalize::ROOM_KEYS;
use crate::pool::{TaskHandle, WorkerPool};
use crate::xml;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// 群主的成员标记
pub const OWNER_FLAG: i64 = 2049;

/// 原始消息中可能携带发送者的备用字段
pub const SENDER_KEYS: &[&str] = &["SenderUserName", "sender", "senderId", "fromUser"];

/// XML 消息体中可能携带发送者的元素
const SENDER_ELEMENTS: &[&str] = &["username", "fromusername", "sender", "from"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(rename = "UserName")]
    pub user_id: String,
    #[serde(rename = "NickName", default)]
    pub nickname: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
    #[serde(rename = "ChatroomMemberFlag", default)]
    pub flag: i64,
}

impl MemberInfo {
    pub fn is_owner(&self, owner_id: &str) -> bool {
        self.flag == OWNER_FLAG || (!owner_id.is_empty() && self.user_id == owner_id)
    }

    /// 群昵称优先，其次微信昵称
    pub fn preferred_name(&self) -> Option<&str> {
        [&self.display_name, &self.nickname]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "chatroomId")]
    pub chatroom_id: String,
    #[serde(rename = "nickName", default)]
    pub name: String,
    #[serde(rename = "chatRoomOwner", default)]
    pub owner_id: String,
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    #[serde(default)]
    pub last_update: i64,
    #[serde(rename = "memberCount", default)]
    pub member_count: i64,
}

impl GroupInfo {
    pub fn member(&self, user_id: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn owner(&self) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.is_owner(&self.owner_id))
    }
}

// ================== 群信息缓存 ==================

/// 群信息缓存，落盘为 `rooms.json` (以群 ID 为键)
pub struct GroupStore {
    path: PathBuf,
    ttl: i64,
    clock: Arc<dyn Clock>,
    groups: RwLock<BTreeMap<String, GroupInfo>>,
    refreshing: Mutex<HashSet<String>>,
}

impl GroupStore {
    /// 读取缓存文件；文件损坏时从空缓存开始
    pub fn load(path: PathBuf, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let groups = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, GroupInfo>>(&text) {
                Ok(groups) => {
                    info!(target: "Group", "已加载 {} 个群的缓存", groups.len());
                    groups
                }
                Err(e) => {
                    warn!(target: "Group", "群缓存文件 {} 解析失败，忽略: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            ttl: ttl.as_secs() as i64,
            clock,
            groups: RwLock::new(groups),
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn get(&self, group_id: &str) -> Option<GroupInfo> {
        self.groups.read().get(group_id).cloned()
    }

    /// 缓存存在且未过期
    pub fn is_fresh(&self, group_id: &str) -> bool {
        let now = self.clock.now();
        self.groups
            .read()
            .get(group_id)
            .is_some_and(|g| now - g.last_update < self.ttl)
    }

    /// 群名称；未缓存或名称为空时返回 None
    pub fn name(&self, group_id: &str) -> Option<String> {
        self.groups
            .read()
            .get(group_id)
            .map(|g| g.name.clone())
            .filter(|n| !n.is_empty() && n != group_id)
    }

    /// 成员在群内的展示名
    pub fn member_name(&self, group_id: &str, user_id: &str) -> Option<String> {
        self.groups
            .read()
            .get(group_id)
            .and_then(|g| g.member(user_id))
            .and_then(|m| m.preferred_name())
            .map(str::to_string)
    }

    pub fn upsert(&self, info: GroupInfo) {
        self.groups.write().insert(info.chatroom_id.clone(), info);
    }

    /// 标记开始刷新；已有刷新在进行时返回 false
    pub fn begin_refresh(&self, group_id: &str) -> bool {
        self.refreshing.lock().insert(group_id.to_string())
    }

    pub fn end_refresh(&self, group_id: &str) {
        self.refreshing.lock().remove(group_id);
    }

    /// 写出缓存 (先写临时文件再替换)
    pub async fn save(&self) -> std::io::Result<()> {
        let payload = {
            let groups = self.groups.read();
            serde_json::to_string_pretty(&*groups)?
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await
    }
}

/// 从网关拉取群信息与成员列表并写入缓存
/// 成员列表获取失败时保留旧成员。
pub async fn refresh_group(
    gw: &dyn Gateway,
    store: &GroupStore,
    group_id: &str,
) -> Result<GroupInfo, GatewayError> {
    let profile = api::get_group_info(gw, group_id).await?;
    let previous = store.get(group_id).unwrap_or_default();

    let (members, member_count) = match api::get_group_members(gw, group_id).await {
        Ok(list) => {
            let members: Vec<MemberInfo> = list
                .chatroom_member_list
                .into_iter()
                .map(|m| MemberInfo {
                    user_id: m.user_name,
                    nickname: m.nick_name,
                    display_name: m.display_name,
                    flag: m.chatroom_member_flag,
                })
                .collect();
            let count = if list.member_count > 0 {
                list.member_count
            } else {
                members.len() as i64
            };
            (members, count)
        }
        Err(e) => {
            warn!(target: "Group", "获取群 {} 成员失败: {}", group_id, e);
            (previous.members, previous.member_count)
        }
    };

    let owner_id = if profile.owner_id.is_empty() {
        members
            .iter()
            .find(|m| m.flag == OWNER_FLAG)
            .map(|m| m.user_id.clone())
            .unwrap_or(previous.owner_id)
    } else {
        profile.owner_id
    };

    let info = GroupInfo {
        chatroom_id: group_id.to_string(),
        name: profile.name.unwrap_or_else(|| group_id.to_string()),
        owner_id,
        members,
        last_update: store.now(),
        member_count,
    };
    store.upsert(info.clone());
    if let Err(e) = store.save().await {
        warn!(target: "Group", "群缓存写入失败: {}", e);
    }
    debug!(
        target: "Group",
        "群 {} ({}) 信息已刷新，成员 {} 人",
        info.name,
        group_id,
        info.member_count
    );
    Ok(info)
}

// ================== 发送者解析 ==================

/// 群 ID：From 为群时取 From，否则取房间字段或 To
pub fn group_id_of(msg: &InboundMessage) -> Option<String> {
    if msg.from_user_id.ends_with(GROUP_SUFFIX) {
        return Some(msg.from_user_id.clone());
    }
    RawView(&msg.raw)
        .text(ROOM_KEYS)
        .filter(|r| r.ends_with(GROUP_SUFFIX))
        .or_else(|| {
            msg.to_user_id
                .ends_with(GROUP_SUFFIX)
                .then(|| msg.to_user_id.clone())
        })
}

/// 发送者 ID 兜底：为空或含 `<` 时替换为占位
pub fn sanitize_sender(sender: &str) -> String {
    let s = sender.trim();
    if s.is_empty() || s.contains('<') {
        UNKNOWN_SENDER.to_string()
    } else {
        s.to_string()
    }
}

/// 按优先级确定群消息的发送者
pub fn resolve_sender(msg: &mut InboundMessage) {
    if !msg.is_group {
        if msg.sender_id.is_empty() {
            msg.sender_id = msg.from_user_id.clone();
        }
        msg.sender_id = sanitize_sender(&msg.sender_id);
        return;
    }

    // 房间字段携带群 ID 时 From 即发送者
    if let Some(group_id) = group_id_of(msg)
        && group_id != msg.from_user_id
    {
        if msg.sender_id.is_empty() && !msg.from_user_id.is_empty() {
            msg.sender_id = msg.from_user_id.clone();
        }
        msg.from_user_id = group_id;
    }

    if msg.sender_id.is_empty() {
        if !xml::looks_like_xml(&msg.content) {
            if let Some((sender, rest)) = split_sender_prefix(&msg.content) {
                let (sender, rest) = (sender.to_string(), rest.to_string());
                msg.sender_id = sender;
                msg.content = rest;
            }
        } else {
            let body = xml::strip_to_xml(&msg.content);
            let found = xml::attr_loose(body, "fromusername")
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    SENDER_ELEMENTS
                        .iter()
                        .find_map(|tag| xml::text(body, &[*tag]).filter(|s| !s.is_empty()))
                });
            if let Some(sender) = found {
                msg.sender_id = sender;
            }
        }
    }

    if msg.sender_id.is_empty()
        && let Some(sender) = RawView(&msg.raw).text(SENDER_KEYS)
    {
        msg.sender_id = sender;
    }

    if msg.sender_id.is_empty() {
        msg.sender_id = format!("unknown_{}", msg.from_user_id);
    }
    msg.sender_id = sanitize_sender(&msg.sender_id);
}

/// 群上下文解析器
pub struct GroupResolver {
    store: Arc<GroupStore>,
    gateway: Arc<dyn Gateway>,
    pool: Arc<WorkerPool>,
    identity: Arc<BotIdentity>,
}

impl GroupResolver {
    pub fn new(
        store: Arc<GroupStore>,
        gateway: Arc<dyn Gateway>,
        pool: Arc<WorkerPool>,
        identity: Arc<BotIdentity>,
    ) -> Self {
        Self {
            store,
            gateway,
            pool,
            identity,
        }
    }

    pub fn store(&self) -> &Arc<GroupStore> {
        &self.store
    }

    /// 填充发送者、昵称与机器人群昵称，缓存缺失时后台刷新，不阻塞当前消息
    pub fn resolve(&self, msg: &mut InboundMessage) {
        resolve_sender(msg);
        if !msg.is_group {
            if msg.sender_nickname.is_empty() {
                msg.sender_nickname = msg.sender_id.clone();
            }
            return;
        }

        let group_id = msg.from_user_id.clone();
        if !self.store.is_fresh(&group_id) {
            self.schedule_refresh(&group_id);
        }

        msg.sender_nickname = self
            .store
            .member_name(&group_id, &msg.sender_id)
            .unwrap_or_else(|| msg.sender_id.clone());

        if msg.self_display_name.is_empty() {
            let wxid = self.identity.wxid();
            msg.self_display_name = self
                .store
                .member_name(&group_id, &wxid)
                .unwrap_or_else(|| self.identity.nickname());
        }
    }

    pub fn group_name(&self, group_id: &str) -> Option<String> {
        self.store.name(group_id)
    }

    /// 提交后台刷新；同一群已在刷新或队列已满时返回 None
    pub fn schedule_refresh(&self, group_id: &str) -> Option<TaskHandle<()>> {
        if !self.store.begin_refresh(group_id) {
            return None;
        }
        let gateway = self.gateway.clone();
        let store = self.store.clone();
        let id = group_id.to_string();
        let submitted = self.pool.try_submit(async move {
            if let Err(e) = refresh_group(gateway.as_ref(), &store, &id).await {
                warn!(target: "Group", "刷新群 {} 信息失败: {}", id, e);
            }
            store.end_refresh(&id);
        });
        match submitted {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!(target: "Group", "群 {} 刷新未提交: {}", group_id, e);
                self.store.end_refresh(group_id);
                None
            }
        }
    }
}
