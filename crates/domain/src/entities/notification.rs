//! 通知实体定义

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value_objects::{MessageId, NotificationId, Timestamp, UserId};

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// 新消息
    Message,
    ConnectionRequest,
    ConnectionAccepted,
    System,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationType::Message => write!(f, "message"),
            NotificationType::ConnectionRequest => write!(f, "connection_request"),
            NotificationType::ConnectionAccepted => write!(f, "connection_accepted"),
            NotificationType::System => write!(f, "system"),
        }
    }
}

/// 通知实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// 通知ID
    pub id: NotificationId,
    /// 接收者
    pub user_id: UserId,
    /// 通知类型
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    /// 负载（标题、正文、会话信息等）
    pub payload: JsonValue,
    /// 关联的消息，消息类通知用它来做已读联动
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_message_id: Option<MessageId>,
    /// 是否已读
    pub read: bool,
    /// 创建时间
    pub created_at: Timestamp,
    /// 阅读时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
}

impl Notification {
    pub fn new(
        id: NotificationId,
        user_id: UserId,
        notification_type: NotificationType,
        payload: JsonValue,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            notification_type,
            payload,
            related_message_id: None,
            read: false,
            created_at,
            read_at: None,
        }
    }

    /// 关联到一条消息
    pub fn for_message(mut self, message_id: MessageId) -> Self {
        self.related_message_id = Some(message_id);
        self
    }

    /// 标记为已读；已读的通知不再修改
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.read_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn mark_read_only_once() {
        let mut notification = Notification::new(
            NotificationId::generate(),
            UserId::generate(),
            NotificationType::Message,
            JsonValue::Null,
            Utc::now(),
        );
        assert!(notification.mark_read(Utc::now()));
        let first_read_at = notification.read_at;
        assert!(!notification.mark_read(Utc::now()));
        assert_eq!(notification.read_at, first_read_at);
    }

    #[test]
    fn notification_type_uses_snake_case() {
        let json = serde_json::to_string(&NotificationType::ConnectionRequest).unwrap();
        assert_eq!(json, "\"connection_request\"");
        assert_eq!(NotificationType::ConnectionRequest.to_string(), "connection_request");
    }
}
