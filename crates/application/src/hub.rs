//! 实时中枢
//!
//! 持有会话注册表、房间、在线状态、投递引擎和通知分发器。生命周期与服务器一致：
//! 启动时创建，`shutdown` 时关闭全部连接。

use std::sync::Arc;

use config::RealtimeConfig;
use domain::{ConnectionId, MessageId, Notification, NotificationType, UserId};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::delivery::{DeliveryDependencies, MessageDeliveryEngine, SendMessageRequest};
use crate::error::ApplicationError;
use crate::events::{Ack, ClientEvent, ClientFrame, ServerEvent};
use crate::identity::IdentityVerifier;
use crate::notification::NotificationDispatcher;
use crate::participants::ParticipantDirectory;
use crate::presence::PresenceTracker;
use crate::repository::Store;
use crate::room::RoomManager;
use crate::session::{ConnectionHandle, SessionRegistry, SessionTransition};

pub struct HubDependencies {
    pub identity: Arc<dyn IdentityVerifier>,
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub settings: RealtimeConfig,
}

/// 新接纳的连接：出站句柄加上待写往客户端的事件流
pub struct AcceptedConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ServerEvent>,
}

struct HubInner {
    identity: Arc<dyn IdentityVerifier>,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceTracker>,
    delivery: MessageDeliveryEngine,
    notifications: Arc<NotificationDispatcher>,
    settings: RealtimeConfig,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new(deps: HubDependencies) -> Self {
        let HubDependencies {
            identity,
            store,
            clock,
            settings,
        } = deps;

        let sessions = Arc::new(SessionRegistry::new());
        let directory = Arc::new(ParticipantDirectory::new(Arc::clone(&store.chats)));
        let rooms = Arc::new(RoomManager::new(Arc::clone(&directory)));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&sessions),
            Arc::clone(&directory),
            Arc::clone(&store.presence),
            Arc::clone(&clock),
            settings.presence_grace(),
        ));
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store.notifications),
            Arc::clone(&sessions),
            Arc::clone(&clock),
        ));
        let delivery = MessageDeliveryEngine::new(DeliveryDependencies {
            messages: Arc::clone(&store.messages),
            chats: Arc::clone(&store.chats),
            directory,
            rooms: Arc::clone(&rooms),
            sessions: Arc::clone(&sessions),
            notifications: Arc::clone(&notifications),
            clock,
            settings: settings.clone(),
        });

        Self {
            inner: Arc::new(HubInner {
                identity,
                sessions,
                rooms,
                presence,
                delivery,
                notifications,
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 校验凭证并注册连接。凭证无效时返回 `Authentication`，不会产生任何状态
    pub async fn connect(&self, credential: &str) -> Result<AcceptedConnection, ApplicationError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ApplicationError::Transport("server is shutting down".into()));
        }

        let user_id = self.inner.identity.verify(credential).await?;
        let (handle, events) = ConnectionHandle::new(
            user_id,
            self.inner.settings.outbound_queue_capacity,
            self.inner.shutdown.child_token(),
        );

        let transition = self.inner.sessions.register(handle.clone())?;
        if transition == SessionTransition::CameOnline {
            debug!(user_id = %user_id, "first connection for user");
        }
        self.inner.presence.connected(user_id).await;

        // 连接关闭（客户端断开、队列溢出或服务关闭）时统一清理
        let hub = self.clone();
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            hub.disconnect(watched.id);
        });

        info!(connection_id = %handle.id, user_id = %user_id, "connection accepted");
        Ok(AcceptedConnection { handle, events })
    }

    /// 清理连接，可重复调用
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some(removed) = self.inner.sessions.unregister(connection_id) else {
            return;
        };
        let left = self.inner.rooms.leave_all(connection_id);
        if removed.went_offline {
            self.inner.presence.disconnected(removed.user_id);
        }
        info!(
            connection_id = %connection_id,
            user_id = %removed.user_id,
            rooms_left = left.len(),
            "connection closed"
        );
    }

    /// 处理一帧客户端事件并生成 ack。
    ///
    /// 操作在独立任务中执行：连接断开或 ack 超时都不会中断已开始的持久化。
    pub async fn handle(&self, origin: &ConnectionHandle, frame: ClientFrame) -> Ack {
        let correlation = frame.correlation();
        let event_name = frame.event.name();

        let hub = self.clone();
        let origin_handle = origin.clone();
        let task = tokio::spawn(async move { hub.dispatch(&origin_handle, frame.event).await });

        match tokio::time::timeout(self.inner.settings.ack_timeout(), task).await {
            Ok(Ok(Ok(data))) => Ack::ok(correlation, data),
            Ok(Ok(Err(err))) => {
                warn!(
                    connection_id = %origin.id,
                    user_id = %origin.user_id,
                    event = event_name,
                    reason = err.code(),
                    error = %err,
                    "client event rejected"
                );
                Ack::error(correlation, &err)
            }
            Ok(Err(join_error)) => {
                warn!(event = event_name, error = %join_error, "client event task failed");
                Ack::error(
                    correlation,
                    &ApplicationError::Transport("operation aborted".into()),
                )
            }
            Err(_) => {
                warn!(connection_id = %origin.id, event = event_name, "ack timed out");
                Ack::error(correlation, &ApplicationError::Timeout)
            }
        }
    }

    async fn dispatch(
        &self,
        origin: &ConnectionHandle,
        event: ClientEvent,
    ) -> Result<JsonValue, ApplicationError> {
        match event {
            ClientEvent::JoinRoom { conversation_id } => {
                self.inner
                    .rooms
                    .join(origin.id, origin.user_id, conversation_id)
                    .await?;
                // 加入期间连接已被清理，撤销这次加入
                if !self.inner.sessions.contains(origin.id) {
                    self.inner.rooms.leave(origin.id, conversation_id);
                    return Err(ApplicationError::Transport("connection closed".into()));
                }
                Ok(json!({ "conversationId": conversation_id }))
            }
            ClientEvent::LeaveRoom { conversation_id } => {
                self.inner.rooms.leave(origin.id, conversation_id);
                Ok(json!({ "conversationId": conversation_id }))
            }
            ClientEvent::SendMessage {
                conversation_id,
                content,
                kind,
                metadata,
                idempotency_token,
            } => {
                let outcome = self
                    .inner
                    .delivery
                    .send(
                        origin,
                        SendMessageRequest {
                            chat_id: conversation_id,
                            content,
                            kind,
                            metadata,
                            idempotency_token,
                        },
                    )
                    .await?;
                Ok(json!({
                    "messageId": outcome.message.id,
                    "conversationId": outcome.message.chat_id,
                    "status": outcome.message.status,
                    "createdAt": outcome.message.created_at,
                    "duplicate": outcome.duplicate,
                }))
            }
            ClientEvent::MarkDelivered { message_ids } => {
                let updates = self.inner.delivery.mark_delivered(origin, message_ids).await?;
                Ok(json!({ "updated": updates }))
            }
            ClientEvent::MarkRead {
                message_id,
                conversation_id,
            } => {
                let update = self
                    .inner
                    .delivery
                    .mark_read(origin, message_id, conversation_id)
                    .await?;
                Ok(serde_json::to_value(update).unwrap_or(JsonValue::Null))
            }
            ClientEvent::SetPresence { online } => {
                self.inner.presence.set_presence(origin.user_id, online).await;
                Ok(json!({ "online": online }))
            }
            ClientEvent::MarkNotificationRead { notification_id } => {
                let notification = self
                    .inner
                    .notifications
                    .mark_read(origin.user_id, notification_id)
                    .await?;
                Ok(json!({ "notificationId": notification.id, "read": notification.read }))
            }
        }
    }

    /// 供外部流程（如好友请求）分发通知
    pub async fn notify(
        &self,
        recipient: UserId,
        notification_type: NotificationType,
        payload: JsonValue,
        related_message_id: Option<MessageId>,
    ) -> Result<Notification, ApplicationError> {
        self.inner
            .notifications
            .notify(recipient, notification_type, payload, related_message_id)
            .await
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner.sessions.is_online(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.connection_count()
    }

    pub fn settings(&self) -> &RealtimeConfig {
        &self.inner.settings
    }

    /// 关闭全部连接并拒绝新连接
    pub fn shutdown(&self) {
        let open = self.inner.sessions.connection_count();
        self.inner.shutdown.cancel();
        for handle in self.inner.sessions.all_connections() {
            self.disconnect(handle.id);
        }
        info!(connections = open, "realtime hub shut down");
    }
}
