//! 通知分发
//!
//! 通知总是先持久化，再推送到接收者的所有在线连接；离线用户只做持久化。

use std::sync::Arc;

use domain::{ConnectionId, MessageId, Notification, NotificationId, NotificationType, UserId};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::events::ServerEvent;
use crate::repository::NotificationRepository;
use crate::session::SessionRegistry;

pub struct NotificationDispatcher {
    store: Arc<dyn NotificationRepository>,
    sessions: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationRepository>,
        sessions: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sessions,
            clock,
        }
    }

    pub async fn notify(
        &self,
        recipient: UserId,
        notification_type: NotificationType,
        payload: JsonValue,
        related_message_id: Option<MessageId>,
    ) -> Result<Notification, ApplicationError> {
        let mut notification = Notification::new(
            NotificationId::generate(),
            recipient,
            notification_type,
            payload,
            self.clock.now(),
        );
        if let Some(message_id) = related_message_id {
            notification = notification.for_message(message_id);
        }

        let notification = self.store.create(notification).await?;
        let delivered = self.sessions.route_to_user(
            recipient,
            &ServerEvent::NewNotification {
                notification: notification.clone(),
            },
            None,
        );

        info!(
            notification_id = %notification.id,
            user_id = %recipient,
            notification_type = %notification.notification_type,
            delivered,
            "notification dispatched"
        );
        Ok(notification)
    }

    /// 用户显式标记通知已读，推送给该用户的所有连接
    pub async fn mark_read(
        &self,
        user_id: UserId,
        notification_id: NotificationId,
    ) -> Result<Notification, ApplicationError> {
        let existing = self
            .store
            .find_by_id(notification_id)
            .await?
            .filter(|notification| notification.user_id == user_id)
            .ok_or_else(|| ApplicationError::not_found("notification", notification_id))?;

        if existing.read {
            return Ok(existing);
        }

        match self.store.mark_read(notification_id, self.clock.now()).await? {
            Some(updated) => {
                self.push_read(user_id, updated.id, None);
                Ok(updated)
            }
            // 并发的另一次已读已经生效
            None => Ok(existing),
        }
    }

    /// 消息被读后联动标记对应通知，推送给读者的其他连接
    pub async fn mark_read_for_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        origin: Option<ConnectionId>,
    ) -> Result<Option<NotificationId>, ApplicationError> {
        let Some(unread) = self
            .store
            .find_unread_for_message(user_id, message_id)
            .await?
        else {
            debug!(user_id = %user_id, message_id = %message_id, "no unread notification for message");
            return Ok(None);
        };

        match self.store.mark_read(unread.id, self.clock.now()).await? {
            Some(updated) => {
                self.push_read(user_id, updated.id, origin);
                Ok(Some(updated.id))
            }
            None => Ok(None),
        }
    }

    fn push_read(&self, user_id: UserId, notification_id: NotificationId, except: Option<ConnectionId>) {
        let delivered = self.sessions.route_to_user(
            user_id,
            &ServerEvent::NotificationRead { notification_id },
            except,
        );
        debug!(
            user_id = %user_id,
            notification_id = %notification_id,
            delivered,
            "notification read pushed"
        );
    }
}
