//! 测试辅助：可编排响应的网关

use crate::error::GatewayError;
use crate::gateway::{Gateway, api};
use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use simd_json::OwnedValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// 记录调用并按接口返回预设信封的网关
/// 每个接口的最后一个成功响应会被重复使用。
#[derive(Default)]
pub struct FakeGateway {
    scripted: Mutex<HashMap<String, VecDeque<Result<OwnedValue, GatewayError>>>>,
    calls: Mutex<Vec<(String, Option<OwnedValue>)>>,
    key: Mutex<String>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 预设一个 `{Code, Data, Text}` 信封
    pub fn respond(&self, endpoint: &str, envelope: OwnedValue) {
        self.scripted
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(Ok(envelope));
    }

    /// 预设一次调用失败
    pub fn fail(&self, endpoint: &str, err: GatewayError) {
        self.scripted
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(Err(err));
    }

    /// 某接口收到的全部参数
    pub fn calls_to(&self, endpoint: &str) -> Vec<Option<OwnedValue>> {
        self.calls
            .lock()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn key(&self) -> String {
        self.key.lock().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn call_api(
        &self,
        endpoint: &str,
        params: Option<OwnedValue>,
        _method: Method,
        _timeout: Duration,
    ) -> Result<OwnedValue, GatewayError> {
        self.calls.lock().push((endpoint.to_string(), params));

        let next = {
            let mut scripted = self.scripted.lock();
            match scripted.get_mut(endpoint) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => match queue.front() {
                    Some(Ok(v)) => Some(Ok(v.clone())),
                    _ => queue.pop_front(),
                },
                None => None,
            }
        };

        match next {
            Some(Ok(envelope)) => api::unwrap_envelope(envelope),
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::Api {
                code: 404,
                message: format!("未预设响应: {}", endpoint),
            }),
        }
    }

    fn set_key(&self, key: &str) {
        *self.key.lock() = key.to_string();
    }
}
