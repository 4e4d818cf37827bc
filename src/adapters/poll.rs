use super::{MessageSource, SourceParams};
use crate::error::GatewayError;
use crate::event::RawMessage;
use crate::gateway::{Gateway, api};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// HTTP 轮询 `/message/HttpSyncMsg`
pub struct PollSource {
    gateway: Arc<dyn Gateway>,
    timeout: Duration,
}

pub fn build(params: SourceParams) -> Box<dyn MessageSource> {
    Box::new(PollSource {
        gateway: params.gateway,
        timeout: params.timeout,
    })
}

#[async_trait]
impl MessageSource for PollSource {
    async fn next_batch(&mut self) -> Result<Vec<RawMessage>, GatewayError> {
        match api::sync_messages(self.gateway.as_ref(), 0, self.timeout).await {
            Err(GatewayError::Timeout) => Ok(Vec::new()),
            other => other,
        }
    }
}
