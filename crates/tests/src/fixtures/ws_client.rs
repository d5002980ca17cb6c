use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

/// Push-binding test client speaking `{type, data}` frames.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub connection_id: String,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("WS connect failed");
        let mut client = Self {
            stream,
            connection_id: String::new(),
        };
        let connected = client.expect("connected").await;
        client.connection_id = connected["connectionId"].as_str().unwrap().to_string();
        client
    }

    pub async fn send(&mut self, kind: &str, data: Value) {
        let frame = if data.is_null() {
            serde_json::json!({ "type": kind })
        } else {
            serde_json::json!({ "type": kind, "data": data })
        };
        self.stream
            .send(Message::text(frame.to_string()))
            .await
            .expect("WS send failed");
    }

    pub async fn join(&mut self, meeting_id: &str, user_id: &str, user_name: &str) -> Value {
        self.send(
            "join-meeting",
            serde_json::json!({
                "meetingId": meeting_id,
                "userId": user_id,
                "userName": user_name,
            }),
        )
        .await;
        let existing = self.expect("existing-participants").await;
        self.expect("meeting-state").await;
        existing
    }

    /// Next JSON frame, or `None` after `wait` of silence.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<Value> {
        loop {
            let msg = tokio::time::timeout(wait, self.stream.next()).await.ok()??;
            match msg.expect("WS receive failed") {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Skips frames until one of `kind` arrives and returns its `data`.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let frame = self
                .next_frame(Duration::from_secs(5))
                .await
                .unwrap_or_else(|| panic!("Timeout waiting for {}", kind));
            if frame["type"] == kind {
                return frame["data"].clone();
            }
        }
    }

    /// Asserts no frame of `kind` arrives within `wait`.
    pub async fn expect_none(&mut self, kind: &str, wait: Duration) {
        while let Some(frame) = self.next_frame(wait).await {
            assert_ne!(frame["type"], kind, "unexpected {} frame: {}", kind, frame);
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
