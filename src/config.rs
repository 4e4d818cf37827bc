use crate::error::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use toml::Value;

/// 运行期共享配置
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// 群白名单中表示“全部群聊”的标记
pub const ALL_GROUP: &str = "ALL_GROUP";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    // 日志级别 (trace/debug/info/warn/error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // 数据目录 (群缓存、登录信息)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    // 协议网关连接配置
    #[serde(default)]
    pub gateway: GatewayConfig,

    // 消息路由与触发配置
    #[serde(default)]
    pub channel: ChannelConfig,

    // 媒体转码配置
    #[serde(default)]
    pub media: MediaConfig,

    // 回复管线配置
    #[serde(default)]
    pub reply: ReplyConfig,

    // 全局发送者过滤配置
    #[serde(default)]
    pub global_filter: GlobalFilterConfig,

    // 插件配置
    #[serde(flatten)]
    pub plugins: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub key: String,
    /// 管理 key，仅用于 `/admin/` 接口 (普通 key 为空时申请新 key)
    pub admin_key: String,
    /// 协议版本："8059" 使用 WebSocket 推送队列，"849"/"855" 使用 HTTP 轮询
    pub protocol_version: String,
    pub device_name: String,
    /// 登录时传给网关的代理地址，空为直连
    pub proxy: String,
    pub awaken_timeout_secs: u64,
    pub qr_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8059,
            key: String::new(),
            admin_key: String::new(),
            protocol_version: "8059".to_string(),
            device_name: "iPad".to_string(),
            proxy: String::new(),
            awaken_timeout_secs: 120,
            qr_timeout_secs: 240,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChannelConfig {
    /// 机器人在微信中的昵称，用于识别 @ 提及
    pub nick_name: String,
    pub single_chat_prefix: Vec<String>,
    pub group_chat_prefix: Vec<String>,
    pub group_chat_keyword: Vec<String>,
    pub group_name_white_list: Vec<String>,
    pub speech_recognition: bool,
    pub group_speech_recognition: bool,
    /// 群聊回复时是否 @ 发送者
    pub group_at_sender: bool,
    pub image_cache_dir: PathBuf,
    pub image_retention_days: u64,
    pub message_cache_ttl_secs: u64,
    pub group_cache_ttl_secs: u64,
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            nick_name: String::new(),
            single_chat_prefix: vec![String::new()],
            group_chat_prefix: vec!["bot".to_string()],
            group_chat_keyword: Vec::new(),
            group_name_white_list: vec![ALL_GROUP.to_string()],
            speech_recognition: false,
            group_speech_recognition: false,
            group_at_sender: true,
            image_cache_dir: PathBuf::from("tmp/images"),
            image_retention_days: 7,
            message_cache_ttl_secs: 3600,
            group_cache_ttl_secs: 24 * 3600,
            worker_count: 4,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// SILK 编码器可执行文件 (输入 PCM，输出 SILK)
    pub silk_encoder_path: String,
    pub temp_dir: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            silk_encoder_path: "silk_v3_encoder".to_string(),
            temp_dir: PathBuf::from("tmp/media"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReplyConfig {
    /// "echo" 原样回复 / "webhook" 转发至外部服务
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            mode: "echo".to_string(),
            webhook_url: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GlobalFilterConfig {
    #[serde(default)]
    pub enable_blacklist: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,

    #[serde(default)]
    pub enable_whitelist: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            gateway: GatewayConfig::default(),
            channel: ChannelConfig::default(),
            media: MediaConfig::default(),
            reply: ReplyConfig::default(),
            global_filter: GlobalFilterConfig::default(),
            plugins: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// 读取配置；文件不存在时写出默认配置
    pub async fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            let cfg = Self::default();
            cfg.save(path).await?;
            return Ok(cfg);
        }
        let text = fs::read_to_string(path).await?;
        Ok(toml::from_str(&text)?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, toml_string).await?;
        Ok(())
    }

    /// 群白名单是否放行全部群聊
    pub fn whitelist_disabled(&self) -> bool {
        self.channel
            .group_name_white_list
            .iter()
            .any(|g| g == ALL_GROUP)
    }
}

/// 辅助函数：构建默认配置 Value，并确保包含 enabled 字段
pub fn build_config<T: Serialize>(data: T) -> Value {
    let mut val = Value::try_from(data).unwrap_or(Value::Table(Default::default()));
    if let Value::Table(ref mut map) = val
        && !map.contains_key("enabled")
    {
        map.insert("enabled".to_string(), Value::Boolean(true));
    }
    val
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let text = r#"
            log_level = "debug"

            [gateway]
            key = "abc"

            [channel]
            nick_name = "Bot"
            group_chat_prefix = ["!ask"]

            [logger]
            enabled = false
        "#;
        let cfg: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.gateway.port, 8059);
        assert_eq!(cfg.gateway.key, "abc");
        assert_eq!(cfg.channel.group_chat_prefix, vec!["!ask".to_string()]);
        assert!(cfg.whitelist_disabled());
        assert_eq!(cfg.channel.image_retention_days, 7);
        assert_eq!(
            cfg.plugins["logger"].get("enabled").and_then(|v| v.as_bool()),
            Some(false)
        );
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = AppConfig::load_or_init(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(cfg.gateway.protocol_version, "8059");

        let again = AppConfig::load_or_init(&path).await.unwrap();
        assert_eq!(again.channel.group_cache_ttl_secs, 24 * 3600);
    }

    #[test]
    fn build_config_inserts_enabled() {
        #[derive(Serialize)]
        struct Demo {
            debug: bool,
        }
        let v = build_config(Demo { debug: true });
        assert_eq!(v.get("enabled").and_then(|v| v.as_bool()), Some(true));
    }
}
