#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::memory::{InMemoryIdentity, InMemoryStore};
use application::{
    Ack, ClientEvent, ClientFrame, ConnectionHandle, HubDependencies, RealtimeHub, ServerEvent,
    SystemClock,
};
use chrono::Utc;
use config::RealtimeConfig;
use domain::{Chat, ChatId, MessageId, MessageKind, UserId};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

pub struct Harness {
    pub hub: RealtimeHub,
    pub store: Arc<InMemoryStore>,
    pub identity: Arc<InMemoryIdentity>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(RealtimeConfig::default())
    }

    pub fn with_settings(settings: RealtimeConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let identity = Arc::new(InMemoryIdentity::new());
        let hub = RealtimeHub::new(HubDependencies {
            identity: identity.clone(),
            store: store.store(),
            clock: Arc::new(SystemClock),
            settings,
        });
        Self {
            hub,
            store,
            identity,
        }
    }

    pub async fn chat(&self, participants: &[UserId]) -> ChatId {
        let chat = Chat::new(ChatId::generate(), participants.iter().copied(), Utc::now())
            .expect("valid chat");
        let id = chat.id;
        self.store.insert_chat(chat).await;
        id
    }

    pub async fn connect(&self, user_id: UserId) -> Client {
        let token = format!("token-{}", uuid::Uuid::new_v4());
        self.identity.register(token.clone(), user_id);
        let accepted = self.hub.connect(&token).await.expect("connect");
        Client {
            hub: self.hub.clone(),
            handle: accepted.handle,
            events: accepted.events,
        }
    }
}

pub struct Client {
    hub: RealtimeHub,
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ServerEvent>,
}

impl Client {
    pub fn user_id(&self) -> UserId {
        self.handle.user_id
    }

    pub async fn request(&self, event: ClientEvent) -> Ack {
        self.hub
            .handle(&self.handle, ClientFrame::new(event).with_request_id("req"))
            .await
    }

    pub async fn join(&self, chat_id: ChatId) -> Ack {
        self.request(ClientEvent::JoinRoom {
            conversation_id: chat_id,
        })
        .await
    }

    pub async fn send_text(&self, chat_id: ChatId, content: &str, token: Option<&str>) -> Ack {
        self.request(ClientEvent::SendMessage {
            conversation_id: chat_id,
            content: content.to_string(),
            kind: MessageKind::Text,
            metadata: JsonValue::Null,
            idempotency_token: token.map(str::to_string),
        })
        .await
    }

    pub async fn mark_delivered(&self, ids: Vec<MessageId>) -> Ack {
        self.request(ClientEvent::MarkDelivered { message_ids: ids })
            .await
    }

    pub async fn mark_read(&self, chat_id: ChatId, id: MessageId) -> Ack {
        self.request(ClientEvent::MarkRead {
            message_id: id,
            conversation_id: Some(chat_id),
        })
        .await
    }

    /// 取出当前队列中的所有事件
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    /// 等待下一个满足条件的事件，跳过其他事件
    pub async fn expect<F>(&mut self, mut predicate: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

pub fn message_id(ack: &Ack) -> MessageId {
    assert!(ack.ok, "expected ok ack, got {ack:?}");
    let data = ack.data.as_ref().expect("ack data");
    serde_json::from_value(data["messageId"].clone()).expect("message id")
}

pub fn reason(ack: &Ack) -> &str {
    assert!(!ack.ok, "expected error ack, got {ack:?}");
    ack.error.as_ref().map(|e| e.reason.as_str()).unwrap_or("")
}

pub fn new_messages(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ServerEvent::NewMessage { .. }))
        .count()
}
