use super::{DEFAULT_TIMEOUT, Gateway};
use crate::error::GatewayError;
use crate::event::{RawMessage, RawView};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use simd_json::prelude::*;
use std::sync::OnceLock;
use std::time::Duration;

static RE_QR_LINK: OnceLock<Regex> = OnceLock::new();

// ================== 信封 ==================

/// 解开 `{Code, Data, Text}` 信封
/// 数组形式的响应取第一个元素；`Code == 200` 时返回 `Data`。
pub fn unwrap_envelope(body: OwnedValue) -> Result<OwnedValue, GatewayError> {
    let envelope = if body.is_array() {
        body.as_array()
            .and_then(|arr| arr.first().cloned())
            .ok_or_else(|| GatewayError::Decode("空响应列表".to_string()))?
    } else {
        body
    };

    let view = RawView(&envelope);
    let code = view.int(&["Code", "code"]).ok_or_else(|| {
        GatewayError::Decode(format!(
            "响应缺少 Code 字段: {}",
            crate::message::excerpt(&simd_json::to_string(&envelope).unwrap_or_default(), 100)
        ))
    })?;
    let text = view.text(&["Text", "text", "Error"]).unwrap_or_default();

    match code {
        200 => Ok(envelope
            .get("Data")
            .cloned()
            .unwrap_or_else(|| OwnedValue::from(()))),
        401 => Err(GatewayError::Auth(text)),
        _ => Err(GatewayError::Api {
            code,
            message: text,
        }),
    }
}

fn params<P: Serialize>(p: P) -> Result<Option<OwnedValue>, GatewayError> {
    Ok(Some(simd_json::serde::to_owned_value(p)?))
}

/// 列表形式的 Data 取第一项
fn first_item(data: &OwnedValue) -> &OwnedValue {
    data.as_array().and_then(|arr| arr.first()).unwrap_or(data)
}

// ================== 登录 ==================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginRequest<'a> {
    check: bool,
    proxy: &'a str,
}

/// 登录状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStatus {
    pub online: bool,
    /// 状态附带的 wxid (部分版本在线时返回)
    pub wxid: Option<String>,
    pub message: String,
}

fn login_status(data: &OwnedValue) -> LoginStatus {
    let view = RawView(data);
    let wxid = view.text(&["wxid", "userName"]).or_else(|| {
        data.get("userInfo")
            .and_then(|info| RawView(info).text(&["userName", "UserName"]))
    });
    LoginStatus {
        online: view.int(&["loginState"]) == Some(1),
        wxid,
        message: view.text(&["loginErrMsg"]).unwrap_or_default(),
    }
}

/// 当前 key 的在线状态
pub async fn check_login_status(gw: &dyn Gateway) -> Result<LoginStatus, GatewayError> {
    let data = gw
        .call_api("/login/GetLoginStatus", None, Method::GET, DEFAULT_TIMEOUT)
        .await?;
    Ok(login_status(&data))
}

/// 扫码登录进度
pub async fn check_qr_login(gw: &dyn Gateway) -> Result<LoginStatus, GatewayError> {
    let data = gw
        .call_api("/login/CheckLoginStatus", None, Method::GET, DEFAULT_TIMEOUT)
        .await?;
    Ok(login_status(&data))
}

/// 登录二维码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCode {
    /// 会话标识
    pub key: String,
    /// 微信原始二维码链接 (无法提取时为网关返回的原链接)
    pub url: String,
}

pub async fn get_qr_code(gw: &dyn Gateway, proxy: &str) -> Result<QrCode, GatewayError> {
    let data = gw
        .call_api(
            "/login/GetLoginQrCodeNew",
            params(LoginRequest {
                check: false,
                proxy,
            })?,
            Method::POST,
            DEFAULT_TIMEOUT,
        )
        .await?;
    let view = RawView(&data);
    let raw_url = view.text(&["QrCodeUrl", "QrUrl"]).unwrap_or_default();
    if raw_url.is_empty() {
        return Err(GatewayError::Decode("二维码链接为空".to_string()));
    }
    Ok(QrCode {
        key: view.text(&["Key", "Uuid"]).unwrap_or_default(),
        url: extract_qr_link(&raw_url).unwrap_or(raw_url),
    })
}

/// 从二维码生成服务的链接中取出 `url=` 后的微信原始链接
pub fn extract_qr_link(qr_code_url: &str) -> Option<String> {
    let re = RE_QR_LINK.get_or_init(|| {
        Regex::new(r"url=(http://weixin\.qq\.com/[^&\s]+)").expect("valid regex")
    });
    re.captures(qr_code_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// 唤醒登录，返回等待手机确认的 UUID
pub async fn awaken_login(gw: &dyn Gateway, proxy: &str) -> Result<String, GatewayError> {
    let data = gw
        .call_api(
            "/login/WakeUpLogin",
            params(LoginRequest {
                check: false,
                proxy,
            })?,
            Method::POST,
            DEFAULT_TIMEOUT,
        )
        .await?;
    RawView(&data)
        .text(&["UUID", "Uuid"])
        .ok_or_else(|| GatewayError::Decode("唤醒登录未返回 UUID".to_string()))
}

/// 使用管理 key 申请新的普通 key
pub async fn generate_auth_key(gw: &dyn Gateway) -> Result<String, GatewayError> {
    let data = gw
        .call_api("/admin/GenAuthKey2", None, Method::GET, DEFAULT_TIMEOUT)
        .await?;
    crate::event::unwrap_text(first_item(&data))
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::Decode("授权码为空".to_string()))
}

/// 登录账号资料
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub wxid: String,
    pub nickname: String,
}

pub async fn get_profile(gw: &dyn Gateway) -> Result<Profile, GatewayError> {
    let data = gw
        .call_api("/user/GetProfile", None, Method::GET, DEFAULT_TIMEOUT)
        .await?;
    let info = data.get("userInfo").unwrap_or(&data);
    let view = RawView(info);
    let wxid = view
        .text(&["userName", "UserName", "wxid"])
        .ok_or_else(|| GatewayError::Decode("资料中没有 wxid".to_string()))?;
    let nickname = view
        .text(&["nickName", "NickName", "nickname"])
        .unwrap_or_else(|| wxid.clone());
    Ok(Profile { wxid, nickname })
}

// ================== 消息同步 ==================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SyncRequest {
    count: u32,
}

/// HTTP 轮询新消息
pub async fn sync_messages(
    gw: &dyn Gateway,
    count: u32,
    timeout: Duration,
) -> Result<Vec<RawMessage>, GatewayError> {
    let data = gw
        .call_api(
            "/message/HttpSyncMsg",
            params(SyncRequest { count })?,
            Method::POST,
            timeout,
        )
        .await?;
    Ok(messages_in(&data))
}

/// 同步结果中的消息列表 (`AddMsgs` 或 `MsgList`)
pub fn messages_in(data: &OwnedValue) -> Vec<RawMessage> {
    ["AddMsgs", "MsgList"]
        .iter()
        .filter_map(|k| data.get(*k).and_then(|v| v.as_array()))
        .find(|arr| !arr.is_empty())
        .cloned()
        .unwrap_or_default()
}

// ================== 发送 ==================

/// 发送回执
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub create_time: i64,
}

fn receipt(data: &OwnedValue) -> Result<SendReceipt, GatewayError> {
    let mut item = first_item(data);

    // 转发类接口: {isSendSuccess, retCode, errMsg, resp: {...}}
    if let Some(ok) = item.get("isSendSuccess").and_then(|v| v.as_bool()) {
        let view = RawView(item);
        let ret_code = view.int(&["retCode"]).unwrap_or(0);
        if !ok || ret_code != 0 {
            return Err(GatewayError::Api {
                code: ret_code,
                message: view.text(&["errMsg"]).unwrap_or_else(|| "发送失败".to_string()),
            });
        }
        if let Some(resp) = item.get("resp") {
            item = resp;
        }
    }

    let view = RawView(item);
    Ok(SendReceipt {
        message_id: view
            .text(&["NewMsgId", "newMsgId", "MsgId", "msgId", "imageId", "ClientMsgId"])
            .unwrap_or_default(),
        create_time: view.int(&["CreateTime", "createTime"]).unwrap_or(0),
    })
}

#[derive(Serialize)]
struct MsgItem<'a> {
    #[serde(rename = "ToUserName")]
    to_user_name: &'a str,
    #[serde(rename = "MsgType")]
    msg_type: u8,
    #[serde(rename = "TextContent")]
    text_content: &'a str,
    #[serde(rename = "ImageContent")]
    image_content: &'a str,
    #[serde(rename = "AtWxIDList")]
    at_wx_id_list: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MsgItemRequest<'a> {
    msg_item: Vec<MsgItem<'a>>,
}

pub async fn send_text(
    gw: &dyn Gateway,
    to: &str,
    text: &str,
    at: &[String],
    timeout: Duration,
) -> Result<SendReceipt, GatewayError> {
    let req = MsgItemRequest {
        msg_item: vec![MsgItem {
            to_user_name: to,
            msg_type: 1,
            text_content: text,
            image_content: "",
            at_wx_id_list: at,
        }],
    };
    let data = gw
        .call_api(
            "/message/SendTextMessage",
            params(req)?,
            Method::POST,
            timeout,
        )
        .await?;
    receipt(&data)
}

pub async fn send_image(
    gw: &dyn Gateway,
    to: &str,
    image: &[u8],
    timeout: Duration,
) -> Result<SendReceipt, GatewayError> {
    let encoded = BASE64.encode(image);
    let req = MsgItemRequest {
        msg_item: vec![MsgItem {
            to_user_name: to,
            msg_type: 3,
            text_content: "",
            image_content: &encoded,
            at_wx_id_list: &[],
        }],
    };
    let data = gw
        .call_api(
            "/message/SendImageMessage",
            params(req)?,
            Method::POST,
            timeout,
        )
        .await?;
    receipt(&data)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VoiceRequest<'a> {
    to_user_name: &'a str,
    voice_data: String,
    voice_format: u8,
    voice_second: u32,
}

/// 发送 SILK 语音 (VoiceFormat 4)
pub async fn send_voice(
    gw: &dyn Gateway,
    to: &str,
    silk: &[u8],
    seconds: u32,
    timeout: Duration,
) -> Result<SendReceipt, GatewayError> {
    let req = VoiceRequest {
        to_user_name: to,
        voice_data: BASE64.encode(silk),
        voice_format: 4,
        voice_second: seconds,
    };
    let data = gw
        .call_api("/message/SendVoice", params(req)?, Method::POST, timeout)
        .await?;
    receipt(&data)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UploadVideoRequest<'a> {
    to_user_name: &'a str,
    video_data: &'a [u8],
    thumb_data: String,
}

/// CDN 上传结果，供转发视频使用
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoUpload {
    pub aes_key: String,
    pub cdn_video_url: String,
    pub length: i64,
    pub play_length: i64,
    pub thumb_length: i64,
}

pub async fn upload_video(
    gw: &dyn Gateway,
    to: &str,
    video: &[u8],
    thumb: &[u8],
    play_length: i64,
    timeout: Duration,
) -> Result<VideoUpload, GatewayError> {
    let thumb_data = BASE64.encode(thumb);
    let thumb_len = thumb_data.len() as i64;
    let req = UploadVideoRequest {
        to_user_name: to,
        video_data: video,
        thumb_data,
    };
    let data = gw
        .call_api("/message/CdnUploadVideo", params(req)?, Method::POST, timeout)
        .await?;
    let view = RawView(&data);
    let upload = VideoUpload {
        aes_key: view.text(&["FileAesKey"]).unwrap_or_default(),
        cdn_video_url: view.text(&["FileID"]).unwrap_or_default(),
        length: view.int(&["VideoDataSize"]).unwrap_or(video.len() as i64),
        play_length: view.int(&["PlayLength"]).unwrap_or(play_length),
        thumb_length: view.int(&["ThumbDataSize"]).unwrap_or(thumb_len),
    };
    if upload.aes_key.is_empty() || upload.cdn_video_url.is_empty() {
        return Err(GatewayError::Decode("视频上传未返回 CDN 信息".to_string()));
    }
    Ok(upload)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardVideoItem<'a> {
    to_user_name: &'a str,
    aes_key: &'a str,
    cdn_video_url: &'a str,
    length: i64,
    play_length: i64,
    cdn_thumb_length: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardVideoRequest<'a> {
    forward_video_list: Vec<ForwardVideoItem<'a>>,
}

pub async fn forward_video(
    gw: &dyn Gateway,
    to: &str,
    upload: &VideoUpload,
    timeout: Duration,
) -> Result<SendReceipt, GatewayError> {
    let req = ForwardVideoRequest {
        forward_video_list: vec![ForwardVideoItem {
            to_user_name: to,
            aes_key: &upload.aes_key,
            cdn_video_url: &upload.cdn_video_url,
            length: upload.length,
            play_length: upload.play_length,
            cdn_thumb_length: upload.thumb_length,
        }],
    };
    let data = gw
        .call_api(
            "/message/ForwardVideoMessage",
            params(req)?,
            Method::POST,
            timeout,
        )
        .await?;
    receipt(&data)
}

#[derive(Serialize)]
struct AppItem<'a> {
    #[serde(rename = "ToUserName")]
    to_user_name: &'a str,
    #[serde(rename = "ContentXML")]
    content_xml: &'a str,
    #[serde(rename = "ContentType")]
    content_type: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AppRequest<'a> {
    app_list: Vec<AppItem<'a>>,
}

/// 发送应用消息 (卡片、小程序等)
pub async fn send_app(
    gw: &dyn Gateway,
    to: &str,
    xml: &str,
    content_type: u32,
    timeout: Duration,
) -> Result<SendReceipt, GatewayError> {
    let req = AppRequest {
        app_list: vec![AppItem {
            to_user_name: to,
            content_xml: xml,
            content_type,
        }],
    };
    let data = gw
        .call_api("/message/SendAppMessage", params(req)?, Method::POST, timeout)
        .await?;
    receipt(&data)
}

// ================== 群聊 ==================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GroupInfoRequest<'a> {
    chat_room_wx_id_list: Vec<&'a str>,
}

/// 群基本信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupProfile {
    pub name: Option<String>,
    pub owner_id: String,
}

pub async fn get_group_info(gw: &dyn Gateway, group_id: &str) -> Result<GroupProfile, GatewayError> {
    let req = GroupInfoRequest {
        chat_room_wx_id_list: vec![group_id],
    };
    let data = gw
        .call_api(
            "/group/GetChatRoomInfo",
            params(req)?,
            Method::POST,
            DEFAULT_TIMEOUT,
        )
        .await?;

    let contact = data
        .get("contactList")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    let Some(contact) = contact else {
        return Ok(GroupProfile::default());
    };
    let view = RawView(contact);
    Ok(GroupProfile {
        name: view.text(&["nickName", "NickName"]),
        owner_id: view
            .text(&["chatRoomOwner", "ChatRoomOwner"])
            .unwrap_or_default(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GroupMembersRequest<'a> {
    chat_room_name: &'a str,
}

/// 群成员 (网关字段名)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatroomMember {
    pub user_name: String,
    pub nick_name: String,
    pub display_name: String,
    pub chatroom_member_flag: i64,
}

/// 群成员列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatroomMembers {
    pub member_count: i64,
    pub chatroom_member_list: Vec<ChatroomMember>,
}

pub async fn get_group_members(
    gw: &dyn Gateway,
    group_id: &str,
) -> Result<ChatroomMembers, GatewayError> {
    let data = gw
        .call_api(
            "/group/GetChatroomMemberDetail",
            params(GroupMembersRequest {
                chat_room_name: group_id,
            })?,
            Method::POST,
            DEFAULT_TIMEOUT,
        )
        .await?;
    let member_data = data
        .get("member_data")
        .cloned()
        .ok_or_else(|| GatewayError::Decode("响应中没有 member_data".to_string()))?;
    Ok(simd_json::serde::from_owned_value(member_data)?)
}

// ================== 媒体 ==================

#[derive(Serialize)]
struct CdnDownloadRequest<'a> {
    #[serde(rename = "AesKey")]
    aes_key: &'a str,
    #[serde(rename = "FileType")]
    file_type: u8,
    #[serde(rename = "FileURL")]
    file_url: &'a str,
}

/// CDN 下载，返回解码后的文件内容
pub async fn cdn_download(
    gw: &dyn Gateway,
    aes_key: &str,
    file_type: u8,
    file_url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, GatewayError> {
    let req = CdnDownloadRequest {
        aes_key,
        file_type,
        file_url,
    };
    let data = gw
        .call_api("/message/SendCdnDownload", params(req)?, Method::POST, timeout)
        .await?;
    let encoded = RawView(&data)
        .text(&["FileData", "fileData"])
        .ok_or_else(|| GatewayError::Decode("CDN 下载结果为空".to_string()))?;
    decode_file_data(&encoded)
}

/// 解码 base64 文件内容，兼容 `data:<mime>;base64,` 前缀
pub fn decode_file_data(encoded: &str) -> Result<Vec<u8>, GatewayError> {
    let body = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    BASE64
        .decode(body.trim())
        .map_err(|e| GatewayError::Decode(format!("base64 解码失败: {}", e)))
}
