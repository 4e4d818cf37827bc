use super::{Gateway, api};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use http::Method;
use http::header::CONTENT_TYPE;
use parking_lot::RwLock;
use simd_json::OwnedValue;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// 基于 reqwest 的网关客户端
/// 所有接口地址为 `http://host:port{endpoint}?key=<key>`。
pub struct HttpGateway {
    client: reqwest::Client,
    base: Url,
    key: RwLock<String>,
    admin_key: String,
}

impl HttpGateway {
    pub fn new(cfg: &GatewayConfig) -> Result<Self, GatewayError> {
        let base = Url::parse(&format!("http://{}:{}", cfg.host, cfg.port))?;
        Self::with_base(base, &cfg.key, &cfg.admin_key)
    }

    pub fn with_base(base: Url, key: &str, admin_key: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base,
            key: RwLock::new(key.to_string()),
            admin_key: admin_key.to_string(),
        })
    }

    /// 推送队列的 WebSocket 地址
    pub fn sync_ws_url(&self) -> Result<Url, GatewayError> {
        let mut url = self.base.join("/ws/GetSyncMsg")?;
        url.set_scheme(if self.base.scheme() == "https" { "wss" } else { "ws" })
            .map_err(|_| GatewayError::Decode("无法构造 WebSocket 地址".to_string()))?;
        url.query_pairs_mut().append_pair("key", &self.key.read());
        Ok(url)
    }

    /// 拼接接口地址，`/admin/` 下的接口使用管理 key
    fn endpoint_url(&self, endpoint: &str) -> Result<Url, GatewayError> {
        let endpoint = endpoint.strip_prefix("/api").unwrap_or(endpoint);
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        };
        let mut url = self.base.join(&path)?;

        let key = if path.starts_with("/admin/") && !self.admin_key.is_empty() {
            self.admin_key.clone()
        } else {
            self.key.read().clone()
        };
        if !key.is_empty() {
            url.query_pairs_mut().append_pair("key", &key);
        }
        Ok(url)
    }
}

fn map_reqwest(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(e)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn call_api(
        &self,
        endpoint: &str,
        params: Option<OwnedValue>,
        method: Method,
        timeout: Duration,
    ) -> Result<OwnedValue, GatewayError> {
        let url = self.endpoint_url(endpoint)?;
        debug!(target: "Gateway", "{} {}", method, endpoint);

        let req = if method == Method::GET {
            self.client.get(url)
        } else {
            let body = match &params {
                Some(p) => simd_json::to_string(p)?,
                None => "{}".to_string(),
            };
            self.client
                .request(method, url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
        };

        let resp = req.timeout(timeout).send().await.map_err(map_reqwest)?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Auth(format!("{} 返回 401", endpoint)));
        }

        let mut bytes = resp.bytes().await.map_err(map_reqwest)?.to_vec();
        let body = simd_json::to_owned_value(&mut bytes).map_err(|e| {
            warn!(target: "Gateway", "{} 响应不是 JSON (HTTP {}): {}", endpoint, status, e);
            GatewayError::Decode(format!("响应格式无效 (HTTP {})", status))
        })?;
        api::unwrap_envelope(body)
    }

    fn set_key(&self, key: &str) {
        *self.key.write() = key.to_string();
    }
}
