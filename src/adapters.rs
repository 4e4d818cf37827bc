use crate::error::GatewayError;
use crate::event::RawMessage;
use crate::gateway::Gateway;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use url::Url;

pub mod poll;
pub mod ws;

/// 单次读取的等待上限，超时返回空批次
pub const POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// 入站消息来源
/// 每次调用返回一批原始消息；超时返回空批次，连接类错误交给接收循环退避重试。
#[async_trait]
pub trait MessageSource: Send {
    async fn next_batch(&mut self) -> Result<Vec<RawMessage>, GatewayError>;
}

/// 构建消息来源所需的参数
#[derive(Clone)]
pub struct SourceParams {
    pub gateway: Arc<dyn Gateway>,
    /// WebSocket 推送队列地址
    pub sync_url: Url,
    pub timeout: Duration,
}

/// 来源构建函数签名
pub type SourceFactory = fn(SourceParams) -> Box<dyn MessageSource>;

/// 适配器定义
pub struct Adapter {
    /// 协议版本 (如 "8059")，在配置文件中通过 gateway.protocol_version 指定
    pub protocol: &'static str,
    pub description: &'static str,
    pub build: SourceFactory,
}

static ADAPTERS: OnceLock<Vec<Adapter>> = OnceLock::new();

/// 获取所有注册的适配器
pub fn get_adapters() -> &'static [Adapter] {
    ADAPTERS.get_or_init(|| {
        vec![
            Adapter {
                protocol: "8059",
                description: "WebSocket 推送队列",
                build: ws::build,
            },
            Adapter {
                protocol: "849",
                description: "HTTP 轮询",
                build: poll::build,
            },
            Adapter {
                protocol: "855",
                description: "HTTP 轮询",
                build: poll::build,
            },
        ]
    })
}

/// 根据协议版本查找适配器
pub fn find_adapter(protocol: &str) -> Option<&'static Adapter> {
    get_adapters().iter().find(|a| a.protocol == protocol)
}
