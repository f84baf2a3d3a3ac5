#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::memory::InMemoryStore;
use application::{HubDependencies, RealtimeHub, SystemClock};
use chrono::Utc;
use config::RealtimeConfig;
use domain::{Chat, ChatId, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: RealtimeHub,
    pub store: Arc<InMemoryStore>,
    pub jwt: Arc<JwtService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-that-is-long-enough".into(),
            expiration_hours: 1,
        }));
        let hub = RealtimeHub::new(HubDependencies {
            identity: jwt.clone(),
            store: store.store(),
            clock: Arc::new(SystemClock),
            settings: RealtimeConfig::default(),
        });

        let app = router(AppState::new(hub.clone(), Arc::clone(&jwt)));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            hub,
            store,
            jwt,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token_for(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub async fn chat(&self, participants: &[UserId]) -> ChatId {
        let chat = Chat::new(ChatId::generate(), participants.iter().copied(), Utc::now())
            .expect("valid chat");
        let id = chat.id;
        self.store.insert_chat(chat).await;
        id
    }

    pub async fn connect(&self, user_id: UserId) -> WsStream {
        let url = format!(
            "ws://{}/api/v1/ws?token={}",
            self.addr,
            self.token_for(user_id)
        );
        let (stream, _) = connect_async(url).await.expect("websocket connect");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.hub.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn send_json(stream: &mut WsStream, value: Value) {
    stream
        .send(TungsteniteMessage::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一条满足条件的 JSON 帧，其余帧跳过
pub async fn expect_frame(stream: &mut WsStream, predicate: impl Fn(&Value) -> bool) -> Value {
    let wait = async {
        while let Some(message) = stream.next().await {
            if let TungsteniteMessage::Text(text) = message.expect("frame") {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                if predicate(&value) {
                    return value;
                }
            }
        }
        panic!("stream ended before expected frame");
    };
    tokio::time::timeout(Duration::from_secs(3), wait)
        .await
        .expect("timed out waiting for frame")
}

pub async fn expect_ack(stream: &mut WsStream, request_id: &str) -> Value {
    expect_frame(stream, |value| {
        value["type"] == "ack" && value["requestId"] == request_id
    })
    .await
}

pub async fn expect_type(stream: &mut WsStream, event_type: &str) -> Value {
    expect_frame(stream, |value| value["type"] == event_type).await
}
