use thiserror::Error;

/// 登录失效时网关返回的错误文本片段
pub const LOGIN_EXPIRED_MARKERS: &[&str] =
    &["请先登录", "您已退出微信", "登录已失效", "Please login first"];

/// 网关调用错误
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),

    #[error("请求超时")]
    Timeout,

    #[error("登录失效: {0}")]
    Auth(String),

    #[error("API 调用失败 (code={code}): {message}")]
    Api { code: i64, message: String },

    #[error("响应解析失败: {0}")]
    Decode(String),

    #[error("WebSocket 错误: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("地址无效: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(Box::new(e))
    }
}

impl From<simd_json::Error> for GatewayError {
    fn from(e: simd_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

impl GatewayError {
    /// 会话已失效，需要重新同步登录身份
    pub fn is_login_expired(&self) -> bool {
        match self {
            GatewayError::Auth(_) => true,
            GatewayError::Api { message, .. } => {
                LOGIN_EXPIRED_MARKERS.iter().any(|m| message.contains(m))
            }
            _ => false,
        }
    }

    /// 网络抖动类错误，下一轮重试即可
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::Timeout | GatewayError::WebSocket(_)
        )
    }
}

/// 媒体下载与转码错误
#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("下载失败: {0}")]
    Download(String),

    #[error("转码失败: {0}")]
    Transcode(String),

    #[error("不支持的媒体格式: {0}")]
    Unsupported(String),

    #[error("Base64 解码失败: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for MediaError {
    fn from(e: reqwest::Error) -> Self {
        MediaError::Download(e.to_string())
    }
}

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置格式错误: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("配置序列化失败: {0}")]
    Serialize(#[from] toml::ser::Error),
}
