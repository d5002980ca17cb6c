use chrono::Utc;
use rendezvous_api::{build_router, state::AppState};
use rendezvous_client::HttpTransport;
use rendezvous_config::Settings;
use rendezvous_services::{ManualClock, RetentionPolicy, SignalStore, store::MemoryStore};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::ws_client::WsClient;

/// A running test application backed by an in-process store and a clock the
/// test controls.
pub struct TestApp {
    pub addr: SocketAddr,
    pub base_url: String,
    pub settings: Settings,
    pub client: reqwest::Client,
    pub store: Arc<dyn SignalStore>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_settings(|_| {}).await
    }

    /// Spawn a test server with customized settings.
    ///
    /// The `mutator` closure receives a `&mut Settings` after defaults are applied.
    pub async fn spawn_with_settings(mutator: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = Settings::default();
        mutator(&mut settings);

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let policy = RetentionPolicy::from_settings(&settings.presence, &settings.events);
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new(policy, clock.clone()));

        let app_state = AppState::with_store(settings.clone(), store.clone(), clock.clone());
        let app = build_router(app_state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base_url = format!("http://{}", addr);
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");

        Self {
            addr,
            base_url,
            settings,
            client,
            store,
            clock,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn transport(&self) -> HttpTransport {
        HttpTransport::new(&self.base_url).expect("Failed to build transport")
    }

    pub async fn ws(&self) -> WsClient {
        WsClient::connect(&format!("ws://{}/ws", self.addr)).await
    }

    /// POST `/peer-discovery` and return status plus body.
    pub async fn register(&self, meeting_id: &str, user_id: &str, user_name: &str) -> (u16, Value) {
        self.send_json(
            self.client
                .post(self.url(&format!("/peer-discovery?meetingId={}", meeting_id)))
                .json(&serde_json::json!({
                    "userId": user_id,
                    "userName": user_name,
                })),
        )
        .await
    }

    pub async fn lookup(&self, meeting_id: &str) -> (u16, Value) {
        self.send_json(
            self.client
                .get(self.url(&format!("/peer-discovery?meetingId={}", meeting_id))),
        )
        .await
    }

    pub async fn post_signal(&self, room_id: &str, body: Value) -> (u16, Value) {
        self.send_json(
            self.client
                .post(self.url(&format!("/signal?roomId={}", room_id)))
                .json(&body),
        )
        .await
    }

    pub async fn get_signal(&self, room_id: &str, kind: Option<&str>) -> (u16, Value) {
        let mut path = format!("/signal?roomId={}", room_id);
        if let Some(kind) = kind {
            path.push_str(&format!("&type={}", kind));
        }
        self.send_json(self.client.get(self.url(&path))).await
    }

    pub async fn send_json(&self, request: reqwest::RequestBuilder) -> (u16, Value) {
        let resp = request.send().await.expect("Request failed");
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }
}
