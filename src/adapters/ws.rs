use super::{MessageSource, SourceParams};
use crate::error::GatewayError;
use crate::event::{RawMessage, RawView};
use crate::gateway::api;
use crate::normalize::ID_KEYS;
use async_trait::async_trait;
use futures_util::StreamExt;
use simd_json::prelude::*;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket 推送队列 `/ws/GetSyncMsg`
/// 连接按需建立，断开后由下一次读取重连。
pub struct WsSource {
    url: Url,
    read_timeout: Duration,
    stream: Option<WsStream>,
}

pub fn build(params: SourceParams) -> Box<dyn MessageSource> {
    Box::new(WsSource {
        url: params.sync_url,
        read_timeout: params.timeout,
        stream: None,
    })
}

/// 解析一帧推送：单条消息、消息数组或 `{Code:200, Data:{MsgList}}`
pub fn parse_frame(text: &str) -> Vec<RawMessage> {
    let mut bytes = text.as_bytes().to_vec();
    let value = match simd_json::to_owned_value(&mut bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "Channel", "推送帧不是 JSON: {} ({})", crate::message::excerpt(text, 100), e);
            return Vec::new();
        }
    };

    if let Some(arr) = value.as_array() {
        return arr.clone();
    }
    if RawView(&value).text(ID_KEYS).is_some() {
        return vec![value];
    }
    match RawView(&value).int(&["Code", "code"]) {
        Some(200) => value
            .get("Data")
            .map(api::messages_in)
            .unwrap_or_default(),
        Some(code) => {
            debug!(
                target: "Channel",
                "推送帧 Code={}: {}",
                code,
                RawView(&value).text(&["Text", "text"]).unwrap_or_default()
            );
            Vec::new()
        }
        None => Vec::new(),
    }
}

impl WsSource {
    async fn connected(&mut self) -> Result<&mut WsStream, GatewayError> {
        if self.stream.is_none() {
            let (stream, _) = connect_async(self.url.as_str()).await?;
            info!(target: "Channel", "推送队列已连接: {}", self.url.path());
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| GatewayError::Decode("WebSocket 未连接".to_string()))
    }
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next_batch(&mut self) -> Result<Vec<RawMessage>, GatewayError> {
        let read_timeout = self.read_timeout;
        let stream = self.connected().await?;

        let frame = match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(frame) => frame,
            Err(_) => return Ok(Vec::new()),
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => Ok(parse_frame(text.as_str())),
            Some(Ok(WsMessage::Binary(data))) => {
                Ok(parse_frame(&String::from_utf8_lossy(&data)))
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                self.stream = None;
                Err(GatewayError::WebSocket(Box::new(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                )))
            }
            Some(Ok(_)) => Ok(Vec::new()),
            Some(Err(e)) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGateway;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;

    #[test]
    fn frame_shapes() {
        assert_eq!(parse_frame(r#"{"msg_id": "1", "content": "hi"}"#).len(), 1);
        assert_eq!(
            parse_frame(r#"{"Code": 200, "Data": {"MsgList": [{"msg_id": "1"}, {"msg_id": "2"}]}}"#).len(),
            2
        );
        assert_eq!(parse_frame(r#"[{"msg_id": "1"}]"#).len(), 1);
        assert!(parse_frame(r#"{"Code": 300, "Text": "无新消息"}"#).is_empty());
        assert!(parse_frame("not json").is_empty());
    }

    #[tokio::test]
    async fn reads_frames_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(WsMessage::Text(r#"{"msg_id": "7", "content": "hi"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let mut source = build(SourceParams {
            gateway: FakeGateway::new(),
            sync_url: Url::parse(&format!("ws://{}/ws/GetSyncMsg?key=k", addr)).unwrap(),
            timeout: Duration::from_secs(2),
        });

        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        let err = source.next_batch().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn idle_connection_yields_empty_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut source = build(SourceParams {
            gateway: FakeGateway::new(),
            sync_url: Url::parse(&format!("ws://{}/ws/GetSyncMsg", addr)).unwrap(),
            timeout: Duration::from_millis(100),
        });
        assert!(source.next_batch().await.unwrap().is_empty());
    }
}
