//! 登录流程：在线检查 -> 唤醒登录 -> 扫码登录

use crate::config::{GatewayConfig, SharedConfig};
use crate::error::GatewayError;
use crate::gateway::api::{self, Profile};
use crate::gateway::Gateway;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// 二维码请求返回该文本时说明账号其实已登录
const ALREADY_BOUND: &str = "该链接已绑定微信号";

/// 机器人当前身份，登录完成或会话恢复后更新
#[derive(Debug, Default)]
pub struct BotIdentity {
    inner: RwLock<Profile>,
}

impl BotIdentity {
    pub fn new(wxid: &str, nickname: &str) -> Self {
        Self {
            inner: RwLock::new(Profile {
                wxid: wxid.to_string(),
                nickname: nickname.to_string(),
            }),
        }
    }

    pub fn wxid(&self) -> String {
        self.inner.read().wxid.clone()
    }

    pub fn nickname(&self) -> String {
        self.inner.read().nickname.clone()
    }

    pub fn update(&self, profile: Profile) {
        *self.inner.write() = profile;
    }
}

/// 各阶段的轮询节奏
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub proxy: String,
    pub awaken_initial_wait: Duration,
    pub awaken_interval: Duration,
    pub awaken_timeout: Duration,
    pub qr_interval: Duration,
    pub qr_timeout: Duration,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            proxy: String::new(),
            awaken_initial_wait: Duration::from_secs(10),
            awaken_interval: Duration::from_secs(5),
            awaken_timeout: Duration::from_secs(120),
            qr_interval: Duration::from_secs(2),
            qr_timeout: Duration::from_secs(240),
        }
    }
}

impl LoginOptions {
    /// 代理与超时取自 `[gateway]`，轮询间隔保持默认
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            proxy: cfg.proxy.clone(),
            awaken_timeout: Duration::from_secs(cfg.awaken_timeout_secs),
            qr_timeout: Duration::from_secs(cfg.qr_timeout_secs),
            ..Self::default()
        }
    }
}

/// 普通 key 为空而配置了管理 key 时，申请新 key 并写回配置文件
pub async fn ensure_key(
    gw: &dyn Gateway,
    config: &SharedConfig,
    config_path: &Path,
) -> anyhow::Result<()> {
    let (key, admin_key) = {
        let cfg = config.read();
        (cfg.gateway.key.clone(), cfg.gateway.admin_key.clone())
    };
    if !key.is_empty() {
        return Ok(());
    }
    if admin_key.is_empty() {
        anyhow::bail!("未配置 gateway.key，也没有可用于申请 key 的 gateway.admin_key");
    }

    info!(target: "Login", "未配置 key，使用管理 key 申请新 key");
    let new_key = api::generate_auth_key(gw).await?;
    gw.set_key(&new_key);

    let snapshot = {
        let mut cfg = config.write();
        cfg.gateway.key = new_key.clone();
        cfg.clone()
    };
    snapshot.save(config_path).await?;
    info!(target: "Login", "新 key 已写入配置: {}", new_key);
    Ok(())
}

async fn wait_online(
    gw: &dyn Gateway,
    interval: Duration,
    timeout: Duration,
    qr: bool,
) -> Result<bool, GatewayError> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let status = if qr {
            api::check_qr_login(gw).await
        } else {
            api::check_login_status(gw).await
        };
        match status {
            Ok(s) if s.online => return Ok(true),
            Ok(s) => {
                if !s.message.is_empty() {
                    debug!(target: "Login", "登录状态: {}", s.message);
                }
            }
            Err(e) if e.is_transient() => warn!(target: "Login", "检查登录状态失败: {}", e),
            Err(e) => debug!(target: "Login", "检查登录状态: {}", e),
        }
        sleep(interval).await;
    }
    Ok(false)
}

/// 完成登录并返回账号资料
pub async fn login(gw: &dyn Gateway, opts: &LoginOptions) -> Result<Profile, GatewayError> {
    match api::check_login_status(gw).await {
        Ok(status) if status.online => {
            info!(target: "Login", "当前 key 已在线");
            return api::get_profile(gw).await;
        }
        Ok(_) => {}
        Err(e) => warn!(target: "Login", "检查在线状态失败: {}", e),
    }

    match api::awaken_login(gw, &opts.proxy).await {
        Ok(uuid) => {
            info!(target: "Login", "已发送唤醒登录请求 (UUID: {})，请在手机上确认", uuid);
            sleep(opts.awaken_initial_wait).await;
            if wait_online(gw, opts.awaken_interval, opts.awaken_timeout, false).await? {
                info!(target: "Login", "唤醒登录成功");
                return api::get_profile(gw).await;
            }
            warn!(target: "Login", "唤醒登录超时，改用扫码登录");
        }
        Err(e) => info!(target: "Login", "唤醒登录不可用 ({})，改用扫码登录", e),
    }

    let qr = match api::get_qr_code(gw, &opts.proxy).await {
        Ok(qr) => qr,
        Err(e) if e.to_string().contains(ALREADY_BOUND) => {
            info!(target: "Login", "账号已绑定，重新检查在线状态");
            let status = api::check_login_status(gw).await?;
            if status.online {
                return api::get_profile(gw).await;
            }
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    info!(target: "Login", "请使用微信扫描二维码登录: {}", qr.url);
    if wait_online(gw, opts.qr_interval, opts.qr_timeout, true).await? {
        info!(target: "Login", "扫码登录成功");
        return api::get_profile(gw).await;
    }
    error!(target: "Login", "扫码登录超时");
    Err(GatewayError::Auth("扫码登录超时".to_string()))
}

// ================== 登录记录 ==================

/// `login.json` 中保存的登录信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub wxid: String,
    pub nickname: String,
    pub device_id: String,
    #[serde(default)]
    pub login_time: i64,
}

impl LoginRecord {
    pub fn new(profile: &Profile, device_name: &str, now: i64) -> Self {
        let digest = format!("{:x}", md5::compute(format!("{}{}", device_name, profile.wxid)));
        Self {
            wxid: profile.wxid.clone(),
            nickname: profile.nickname.clone(),
            device_id: digest[..16].to_string(),
            login_time: now,
        }
    }

    pub async fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(target: "Login", "登录记录 {} 解析失败: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::FakeGateway;
    use simd_json::json;
    use simd_json::prelude::*;
    use std::sync::Arc;

    fn fast() -> LoginOptions {
        LoginOptions {
            proxy: String::new(),
            awaken_initial_wait: Duration::from_millis(1),
            awaken_interval: Duration::from_millis(1),
            awaken_timeout: Duration::from_millis(20),
            qr_interval: Duration::from_millis(1),
            qr_timeout: Duration::from_millis(50),
        }
    }

    fn profile(gw: &FakeGateway) {
        gw.respond(
            "/user/GetProfile",
            json!({"Code": 200, "Data": {"userInfo": {"userName": {"str": "wxid_bot"}, "nickName": {"str": "Bot"}}}}),
        );
    }

    #[tokio::test]
    async fn online_key_skips_login() {
        let gw = FakeGateway::new();
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 1}}));
        profile(&gw);

        let p = login(gw.as_ref(), &fast()).await.unwrap();
        assert_eq!(p.wxid, "wxid_bot");
        assert_eq!(p.nickname, "Bot");
        assert!(gw.calls_to("/login/WakeUpLogin").is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_qr_when_awaken_fails() {
        let gw = FakeGateway::new();
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 0}}));
        gw.respond("/login/WakeUpLogin", json!({"Code": -1, "Text": "不支持"}));
        gw.respond(
            "/login/GetLoginQrCodeNew",
            json!({"Code": 200, "Data": {"Key": "k", "QrCodeUrl": "https://x/?url=http://weixin.qq.com/x/abc&s=1"}}),
        );
        gw.respond("/login/CheckLoginStatus", json!({"Code": 200, "Data": {"loginState": 0}}));
        gw.respond("/login/CheckLoginStatus", json!({"Code": 200, "Data": {"loginState": 1}}));
        profile(&gw);

        let p = login(gw.as_ref(), &fast()).await.unwrap();
        assert_eq!(p.wxid, "wxid_bot");
        assert!(gw.calls_to("/login/CheckLoginStatus").len() >= 2);
    }

    #[tokio::test]
    async fn bound_account_rechecks_status() {
        let gw = FakeGateway::new();
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 0}}));
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 1}}));
        gw.respond("/login/WakeUpLogin", json!({"Code": -1, "Text": "不支持"}));
        gw.respond(
            "/login/GetLoginQrCodeNew",
            json!({"Code": -3, "Text": "该链接已绑定微信号"}),
        );
        profile(&gw);

        let p = login(gw.as_ref(), &fast()).await.unwrap();
        assert_eq!(p.nickname, "Bot");
    }

    #[tokio::test]
    async fn configured_proxy_reaches_login_requests() {
        let mut cfg = AppConfig::default();
        cfg.gateway.proxy = "socks5://10.0.0.1:1080".to_string();
        cfg.gateway.qr_timeout_secs = 90;
        let from_cfg = LoginOptions::from_config(&cfg.gateway);
        assert_eq!(from_cfg.qr_timeout, Duration::from_secs(90));
        assert_eq!(from_cfg.awaken_timeout, Duration::from_secs(120));
        assert_eq!(from_cfg.qr_interval, LoginOptions::default().qr_interval);

        let gw = FakeGateway::new();
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 0}}));
        gw.respond("/login/GetLoginStatus", json!({"Code": 200, "Data": {"loginState": 1}}));
        gw.respond("/login/WakeUpLogin", json!({"Code": -1, "Text": "不支持"}));
        gw.respond(
            "/login/GetLoginQrCodeNew",
            json!({"Code": -3, "Text": "该链接已绑定微信号"}),
        );
        profile(&gw);

        let opts = LoginOptions {
            proxy: from_cfg.proxy,
            ..fast()
        };
        login(gw.as_ref(), &opts).await.unwrap();
        for endpoint in ["/login/WakeUpLogin", "/login/GetLoginQrCodeNew"] {
            let calls = gw.calls_to(endpoint);
            let proxy = calls[0]
                .as_ref()
                .and_then(|p| p.get("Proxy"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            assert_eq!(proxy.as_deref(), Some("socks5://10.0.0.1:1080"), "{}", endpoint);
        }
    }

    #[tokio::test]
    async fn admin_key_provisions_and_persists_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.gateway.admin_key = "admin".to_string();
        let shared = Arc::new(RwLock::new(cfg));

        let gw = FakeGateway::new();
        gw.respond("/admin/GenAuthKey2", json!({"Code": 200, "Data": ["fresh"]}));

        ensure_key(gw.as_ref(), &shared, &path).await.unwrap();
        assert_eq!(gw.key(), "fresh");
        assert_eq!(shared.read().gateway.key, "fresh");
        let saved = AppConfig::load_or_init(&path).await.unwrap();
        assert_eq!(saved.gateway.key, "fresh");
    }

    #[tokio::test]
    async fn missing_keys_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(RwLock::new(AppConfig::default()));
        let gw = FakeGateway::new();
        assert!(
            ensure_key(gw.as_ref(), &shared, &dir.path().join("c.toml"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn login_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("login.json");
        let record = LoginRecord::new(
            &Profile {
                wxid: "wxid_bot".into(),
                nickname: "Bot".into(),
            },
            "iPad",
            100,
        );
        assert_eq!(record.device_id.len(), 16);
        record.save(&path).await.unwrap();
        assert_eq!(LoginRecord::load(&path).await, Some(record));
    }
}
