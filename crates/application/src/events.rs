//! 实时通道的线协议
//!
//! 客户端与服务端的事件都用 JSON 对象表示，`type` 字段携带 kebab-case 的事件名，
//! 其余字段为 camelCase。

use domain::{
    ChatId, IdempotencyToken, Message, MessageId, MessageKind, MessageStatus, Notification,
    NotificationId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ApplicationError;

/// 客户端发来的一帧：可选的请求 ID 加上事件本体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        conversation_id: ChatId,
    },
    LeaveRoom {
        conversation_id: ChatId,
    },
    SendMessage {
        conversation_id: ChatId,
        #[serde(default)]
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        metadata: JsonValue,
        #[serde(default)]
        idempotency_token: Option<String>,
    },
    MarkDelivered {
        message_ids: Vec<MessageId>,
    },
    MarkRead {
        message_id: MessageId,
        #[serde(default)]
        conversation_id: Option<ChatId>,
    },
    SetPresence {
        online: bool,
    },
    MarkNotificationRead {
        notification_id: NotificationId,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::MarkDelivered { .. } => "mark-delivered",
            ClientEvent::MarkRead { .. } => "mark-read",
            ClientEvent::SetPresence { .. } => "set-presence",
            ClientEvent::MarkNotificationRead { .. } => "mark-notification-read",
        }
    }
}

impl ClientFrame {
    pub fn new(event: ClientEvent) -> Self {
        Self {
            request_id: None,
            event,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// ack 的关联信息：请求 ID，以及发送消息时的幂等令牌
    pub fn correlation(&self) -> Correlation {
        let idempotency_token = match &self.event {
            ClientEvent::SendMessage {
                idempotency_token, ..
            } => idempotency_token.clone(),
            _ => None,
        };
        Correlation {
            request_id: self.request_id.clone(),
            idempotency_token,
        }
    }
}

/// 用来把 ack 对应回客户端请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub request_id: Option<String>,
    pub idempotency_token: Option<String>,
}

/// 服务端推送的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_token: Option<IdempotencyToken>,
    },
    MessageStatusChanged {
        message_id: MessageId,
        conversation_id: ChatId,
        status: MessageStatus,
        /// 已读账本的大小，只有已读事件携带
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_by: Option<usize>,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
        last_active: Timestamp,
    },
    NewNotification {
        notification: Notification,
    },
    NotificationRead {
        notification_id: NotificationId,
    },
    Ack(Ack),
}

/// 对每个客户端请求的应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    /// 机器可读的原因，例如 `authorization_error`
    pub reason: String,
    pub message: String,
}

impl Ack {
    pub fn ok(correlation: Correlation, data: JsonValue) -> Self {
        Self {
            request_id: correlation.request_id,
            idempotency_token: correlation.idempotency_token,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(correlation: Correlation, error: &ApplicationError) -> Self {
        Self {
            request_id: correlation.request_id,
            idempotency_token: correlation.idempotency_token,
            ok: false,
            data: None,
            error: Some(AckError {
                reason: error.code().to_string(),
                message: error.to_string(),
            }),
        }
    }
}
