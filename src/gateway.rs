//! 协议网关客户端
//!
//! 网关以 HTTP + JSON 暴露全部接口，统一返回 `{Code, Data, Text}` 信封。
//! 核心流水线只依赖 [`Gateway`] trait，具体的 HTTP 实现见 [`client`]。

use crate::error::GatewayError;
use async_trait::async_trait;
use http::Method;
use simd_json::OwnedValue;
use std::time::Duration;

pub mod api;
pub mod client;

pub use client::HttpGateway;

/// 默认接口超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 协议网关
#[async_trait]
pub trait Gateway: Send + Sync {
    /// 调用接口，成功时返回信封中的 `Data`
    async fn call_api(
        &self,
        endpoint: &str,
        params: Option<OwnedValue>,
        method: Method,
        timeout: Duration,
    ) -> Result<OwnedValue, GatewayError>;

    /// 替换普通 key (由管理 key 申请得到新 key 后调用)
    fn set_key(&self, _key: &str) {}
}
