//! 消息投递引擎
//!
//! 负责发送、送达确认和已读确认三条路径。每个会话有一条串行的"车道"：
//! 持久化与广播都在车道锁内完成，因此同一会话的广播顺序与持久化顺序一致。
//! 通知分发在释放车道锁之后进行，且每个接收者的失败互不影响。

use std::sync::Arc;

use config::RealtimeConfig;
use dashmap::DashMap;
use domain::{
    ChatId, IdempotencyToken, Message, MessageDraft, MessageId, MessageKind, MessageStatus,
    NotificationType, RepositoryError, Timestamp, UserId,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::events::ServerEvent;
use crate::notification::NotificationDispatcher;
use crate::participants::ParticipantDirectory;
use crate::repository::{ChatRepository, MessageRepository};
use crate::room::RoomManager;
use crate::session::{ConnectionHandle, SessionRegistry};

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: JsonValue,
    pub idempotency_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// 幂等令牌命中已存在的消息，未重复广播
    pub duplicate: bool,
}

/// 一次状态变化，同时用作广播内容和 ack 数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_id: MessageId,
    pub conversation_id: ChatId,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_by: Option<usize>,
}

impl StatusUpdate {
    fn of(message: &Message, read_by: Option<usize>) -> Self {
        Self {
            message_id: message.id,
            conversation_id: message.chat_id,
            status: message.status,
            read_by,
        }
    }

    fn to_event(&self) -> ServerEvent {
        ServerEvent::MessageStatusChanged {
            message_id: self.message_id,
            conversation_id: self.conversation_id,
            status: self.status,
            read_by: self.read_by,
        }
    }
}

/// 会话车道：串行化持久化与广播，并发放单调递增的时间戳
#[derive(Debug, Default)]
struct Lane {
    last_issued: Option<Timestamp>,
}

impl Lane {
    fn next_timestamp(&mut self, now: Timestamp) -> Timestamp {
        let issued = match self.last_issued {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_issued = Some(issued);
        issued
    }
}

/// 持有一条车道的引用，释放时若已无其他使用者则把车道从表中移除
struct LaneLease<'a> {
    lanes: &'a DashMap<ChatId, Arc<Mutex<Lane>>>,
    chat_id: ChatId,
    lane: Arc<Mutex<Lane>>,
}

impl Drop for LaneLease<'_> {
    fn drop(&mut self) {
        // 表里一份加上自己一份
        self.lanes
            .remove_if(&self.chat_id, |_, lane| Arc::strong_count(lane) == 2);
    }
}

enum CasOutcome {
    Updated(Message),
    Unchanged(Message),
}

pub struct DeliveryDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub directory: Arc<ParticipantDirectory>,
    pub rooms: Arc<RoomManager>,
    pub sessions: Arc<SessionRegistry>,
    pub notifications: Arc<NotificationDispatcher>,
    pub clock: Arc<dyn Clock>,
    pub settings: RealtimeConfig,
}

pub struct MessageDeliveryEngine {
    deps: DeliveryDependencies,
    lanes: DashMap<ChatId, Arc<Mutex<Lane>>>,
}

impl MessageDeliveryEngine {
    pub fn new(deps: DeliveryDependencies) -> Self {
        Self {
            deps,
            lanes: DashMap::new(),
        }
    }

    fn lane(&self, chat_id: ChatId) -> LaneLease<'_> {
        let lane = Arc::clone(self.lanes.entry(chat_id).or_default().value());
        LaneLease {
            lanes: &self.lanes,
            chat_id,
            lane,
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub async fn send(
        &self,
        origin: &ConnectionHandle,
        request: SendMessageRequest,
    ) -> Result<SendOutcome, ApplicationError> {
        let sender_id = origin.user_id;
        let chat_id = request.chat_id;

        let idempotency_token = request
            .idempotency_token
            .map(IdempotencyToken::parse)
            .transpose()?;
        let draft = MessageDraft {
            chat_id,
            sender_id,
            content: request.content,
            kind: request.kind,
            metadata: request.metadata,
            idempotency_token,
        }
        .validate(self.deps.settings.max_content_length)?;

        let participants = self
            .deps
            .directory
            .ensure_participant(chat_id, sender_id, "send-message")
            .await?;

        let lease = self.lane(chat_id);
        let mut guard = lease.lane.lock().await;

        if let Some(token) = &draft.idempotency_token {
            if let Some(existing) = self
                .deps
                .messages
                .find_by_idempotency_token(sender_id, chat_id, token.clone())
                .await?
            {
                info!(
                    message_id = %existing.id,
                    chat_id = %chat_id,
                    idempotency_token = %token,
                    "duplicate send, returning persisted message"
                );
                return Ok(SendOutcome {
                    message: existing,
                    duplicate: true,
                });
            }
        }

        // 新建的车道从会话的最后一条消息时间继续，保证时间戳严格递增
        if guard.last_issued.is_none() {
            match self.deps.chats.find_by_id(chat_id).await {
                Ok(Some(chat)) => guard.last_issued = chat.last_message_at,
                Ok(None) => {}
                Err(err) => {
                    warn!(chat_id = %chat_id, error = %err, "failed to load last message time");
                }
            }
        }
        let created_at = guard.next_timestamp(self.deps.clock.now());
        let mut message = Message::from_draft(MessageId::generate(), draft, created_at);
        message.mark_sent();

        let message = self.deps.messages.create(message).await.map_err(|err| {
            warn!(chat_id = %chat_id, sender_id = %sender_id, error = %err, "failed to persist message");
            ApplicationError::from(err)
        })?;

        if let Err(err) = self
            .deps
            .chats
            .advance_last_message(chat_id, message.id, message.created_at)
            .await
        {
            warn!(chat_id = %chat_id, message_id = %message.id, error = %err, "failed to advance last message pointer");
        }

        let event = ServerEvent::NewMessage {
            message: message.clone(),
            idempotency_token: message.idempotency_token.clone(),
        };
        let delivered = self
            .deps
            .sessions
            .route_to_connections(self.deps.rooms.members_of(chat_id), &event);
        let present = self.deps.rooms.users_in(chat_id);
        drop(guard);
        drop(lease);

        info!(
            message_id = %message.id,
            chat_id = %chat_id,
            sender_id = %sender_id,
            delivered,
            "message sent"
        );

        let absent: Vec<UserId> = participants
            .others(sender_id)
            .filter(|user_id| !present.contains(user_id))
            .collect();
        self.notify_absent(&message, absent).await;

        Ok(SendOutcome {
            message,
            duplicate: false,
        })
    }

    async fn notify_absent(&self, message: &Message, recipients: Vec<UserId>) {
        if recipients.is_empty() {
            return;
        }

        let payload = json!({
            "conversationId": message.chat_id,
            "messageId": message.id,
            "senderId": message.sender_id,
            "kind": message.kind,
            "preview": message.preview(self.deps.settings.notification_preview_chars),
        });

        let results = join_all(recipients.iter().map(|recipient| {
            self.deps.notifications.notify(
                *recipient,
                NotificationType::Message,
                payload.clone(),
                Some(message.id),
            )
        }))
        .await;

        let mut notified = Vec::with_capacity(recipients.len());
        for (recipient, result) in recipients.iter().zip(results) {
            match result {
                Ok(_) => notified.push(*recipient),
                Err(err) => warn!(
                    message_id = %message.id,
                    recipient = %recipient,
                    error = %err,
                    "failed to notify absent participant"
                ),
            }
        }

        self.clear_notifications_read_meanwhile(message.id, notified)
            .await;
    }

    /// 通知落地之前接收者可能已经读过消息，此时那次已读找不到通知，这里补上
    async fn clear_notifications_read_meanwhile(&self, message_id: MessageId, notified: Vec<UserId>) {
        if notified.is_empty() {
            return;
        }
        let current = match self.deps.messages.find_by_id(message_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "failed to reload message after notifying");
                return;
            }
        };

        for recipient in notified.into_iter().filter(|user_id| current.is_read_by(*user_id)) {
            if let Err(err) = self
                .deps
                .notifications
                .mark_read_for_message(recipient, message_id, None)
                .await
            {
                warn!(
                    message_id = %message_id,
                    recipient = %recipient,
                    error = %err,
                    "failed to clear notification for already read message"
                );
            }
        }
    }

    /// 批量送达确认。整批先校验，任一条不合法则整批拒绝且不修改任何状态
    pub async fn mark_delivered(
        &self,
        origin: &ConnectionHandle,
        message_ids: Vec<MessageId>,
    ) -> Result<Vec<StatusUpdate>, ApplicationError> {
        let user_id = origin.user_id;
        if message_ids.is_empty() {
            return Err(ApplicationError::validation(
                "messageIds",
                "at least one message id is required",
            ));
        }

        let mut unique: Vec<MessageId> = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }

        let mut targets = Vec::with_capacity(unique.len());
        for id in unique {
            let message = self
                .deps
                .messages
                .find_by_id(id)
                .await?
                .ok_or_else(|| ApplicationError::not_found("message", id))?;
            self.deps
                .directory
                .ensure_participant(message.chat_id, user_id, "mark-delivered")
                .await?;
            targets.push(message);
        }

        let mut updates = Vec::new();
        for message in targets {
            // 发送者自己的消息不需要送达确认
            if message.sender_id == user_id {
                continue;
            }

            let lease = self.lane(message.chat_id);
            let _guard = lease.lane.lock().await;
            if let CasOutcome::Updated(saved) = self
                .update_with_retry(message.id, |candidate| candidate.mark_delivered())
                .await?
            {
                let update = StatusUpdate::of(&saved, None);
                self.broadcast_status(&update);
                updates.push(update);
            }
        }

        debug!(user_id = %user_id, updated = updates.len(), "delivery acknowledged");
        Ok(updates)
    }

    /// 已读确认。重复已读和发送者自己的已读都是空操作
    pub async fn mark_read(
        &self,
        origin: &ConnectionHandle,
        message_id: MessageId,
        chat_id: Option<ChatId>,
    ) -> Result<StatusUpdate, ApplicationError> {
        let reader_id = origin.user_id;
        let message = self
            .deps
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;

        if let Some(chat_id) = chat_id {
            if chat_id != message.chat_id {
                return Err(ApplicationError::validation(
                    "conversationId",
                    "message does not belong to this conversation",
                ));
            }
        }

        let participants = self
            .deps
            .directory
            .ensure_participant(message.chat_id, reader_id, "mark-read")
            .await?;

        if message.sender_id == reader_id {
            return Ok(StatusUpdate::of(&message, Some(message.read_count())));
        }

        let update = {
            let lease = self.lane(message.chat_id);
            let _guard = lease.lane.lock().await;
            let now = self.deps.clock.now();
            match self
                .update_with_retry(message_id, |candidate| {
                    candidate
                        .record_read(reader_id, now, participants.iter())
                        .recorded
                })
                .await?
            {
                CasOutcome::Updated(saved) => {
                    let update = StatusUpdate::of(&saved, Some(saved.read_count()));
                    self.broadcast_status(&update);
                    info!(
                        message_id = %message_id,
                        reader_id = %reader_id,
                        status = ?saved.status,
                        read_by = saved.read_count(),
                        "message read"
                    );
                    update
                }
                CasOutcome::Unchanged(current) => {
                    StatusUpdate::of(&current, Some(current.read_count()))
                }
            }
        };

        if let Err(err) = self
            .deps
            .notifications
            .mark_read_for_message(reader_id, message_id, Some(origin.id))
            .await
        {
            warn!(
                message_id = %message_id,
                reader_id = %reader_id,
                error = %err,
                "failed to mark message notification read"
            );
        }

        Ok(update)
    }

    /// 读取最新版本、应用修改并做版本检查写入，冲突时重试
    async fn update_with_retry<F>(
        &self,
        message_id: MessageId,
        mut mutate: F,
    ) -> Result<CasOutcome, ApplicationError>
    where
        F: FnMut(&mut Message) -> bool,
    {
        let limit = self.deps.settings.read_retry_limit.max(1);
        for attempt in 1..=limit {
            let mut current = self
                .deps
                .messages
                .find_by_id(message_id)
                .await?
                .ok_or_else(|| ApplicationError::not_found("message", message_id))?;

            if !mutate(&mut current) {
                return Ok(CasOutcome::Unchanged(current));
            }

            let expected_version = current.version;
            match self.deps.messages.update(current, expected_version).await {
                Ok(saved) => return Ok(CasOutcome::Updated(saved)),
                Err(RepositoryError::Conflict) => {
                    debug!(message_id = %message_id, attempt, "version conflict, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(message_id = %message_id, limit, "giving up after repeated version conflicts");
        Err(ApplicationError::Store(RepositoryError::Conflict))
    }

    fn broadcast_status(&self, update: &StatusUpdate) {
        let delivered = self.deps.sessions.route_to_connections(
            self.deps.rooms.members_of(update.conversation_id),
            &update.to_event(),
        );
        debug!(
            message_id = %update.message_id,
            status = ?update.status,
            delivered,
            "status change broadcast"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::InMemoryStore;
    use crate::repository::{MockMessageRepository, NotificationRepository};
    use async_trait::async_trait;
    use chrono::Utc;
    use domain::{Chat, Notification, NotificationId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        engine: MessageDeliveryEngine,
        chat_id: ChatId,
        alice: ConnectionHandle,
        bob: ConnectionHandle,
        bob_rx: mpsc::Receiver<ServerEvent>,
        store: Arc<InMemoryStore>,
    }

    async fn fixture(messages: Option<Arc<dyn MessageRepository>>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (alice, _alice_rx) =
            ConnectionHandle::new(UserId::generate(), 16, CancellationToken::new());
        let (bob, bob_rx) = ConnectionHandle::new(UserId::generate(), 16, CancellationToken::new());
        sessions.register(alice.clone()).unwrap();
        sessions.register(bob.clone()).unwrap();

        let chat = Chat::new(ChatId::generate(), [alice.user_id, bob.user_id], Utc::now()).unwrap();
        let chat_id = chat.id;
        store.insert_chat(chat).await;

        let directory = Arc::new(ParticipantDirectory::new(store.clone()));
        let rooms = Arc::new(RoomManager::new(Arc::clone(&directory)));
        rooms.join(bob.id, bob.user_id, chat_id).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifications = Arc::new(NotificationDispatcher::new(
            store.clone(),
            Arc::clone(&sessions),
            Arc::clone(&clock),
        ));
        let engine = MessageDeliveryEngine::new(DeliveryDependencies {
            messages: messages.unwrap_or_else(|| store.clone() as Arc<dyn MessageRepository>),
            chats: store.clone(),
            directory,
            rooms,
            sessions,
            notifications,
            clock,
            settings: RealtimeConfig::default(),
        });

        Fixture {
            engine,
            chat_id,
            alice,
            bob,
            bob_rx,
            store,
        }
    }

    fn text(chat_id: ChatId, content: &str) -> SendMessageRequest {
        SendMessageRequest {
            chat_id,
            content: content.into(),
            kind: MessageKind::Text,
            metadata: JsonValue::Null,
            idempotency_token: None,
        }
    }

    #[test]
    fn lane_timestamps_strictly_increase() {
        let mut lane = Lane::default();
        let now = Utc::now();
        let first = lane.next_timestamp(now);
        let second = lane.next_timestamp(now);
        let third = lane.next_timestamp(now - chrono::Duration::seconds(1));
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn store_failure_means_no_broadcast() {
        let mut messages = MockMessageRepository::new();
        messages
            .expect_create()
            .returning(|_| Err(RepositoryError::storage("write failed")));
        let mut f = fixture(Some(Arc::new(messages))).await;

        let result = f.engine.send(&f.alice, text(f.chat_id, "hello")).await;

        assert!(matches!(result, Err(ApplicationError::Store(_))));
        assert!(f.bob_rx.try_recv().is_err());
        assert_eq!(f.store.notification_count().await, 0);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_persistence() {
        let mut messages = MockMessageRepository::new();
        messages.expect_create().never();
        let f = fixture(Some(Arc::new(messages))).await;

        let result = f.engine.send(&f.alice, text(f.chat_id, "  ")).await;
        assert!(matches!(result, Err(ApplicationError::Validation { .. })));
    }

    #[tokio::test]
    async fn read_retries_after_version_conflict() {
        let mut f = fixture(None).await;
        let sent = f
            .engine
            .send(&f.alice, text(f.chat_id, "hi"))
            .await
            .unwrap()
            .message;
        while f.bob_rx.try_recv().is_ok() {}

        let stored = sent.clone();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let mut messages = MockMessageRepository::new();
        messages
            .expect_find_by_id()
            .returning(move |_| Ok(Some(stored.clone())));
        messages.expect_update().returning(move |mut message, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RepositoryError::Conflict)
            } else {
                message.version += 1;
                Ok(message)
            }
        });

        let engine = MessageDeliveryEngine::new(DeliveryDependencies {
            messages: Arc::new(messages),
            ..f.engine.deps
        });
        let update = engine.mark_read(&f.bob, sent.id, Some(f.chat_id)).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(update.status, MessageStatus::Read);
        assert_eq!(update.read_by, Some(1));
    }

    #[tokio::test]
    async fn conversation_mismatch_is_validation_error() {
        let f = fixture(None).await;
        let sent = f
            .engine
            .send(&f.alice, text(f.chat_id, "hi"))
            .await
            .unwrap()
            .message;

        let result = f
            .engine
            .mark_read(&f.bob, sent.id, Some(ChatId::generate()))
            .await;
        assert!(matches!(result, Err(ApplicationError::Validation { .. })));
    }

    #[tokio::test]
    async fn idle_lanes_are_released() {
        let f = fixture(None).await;
        let sent = f
            .engine
            .send(&f.alice, text(f.chat_id, "hi"))
            .await
            .unwrap()
            .message;
        f.engine.mark_read(&f.bob, sent.id, None).await.unwrap();
        assert_eq!(f.engine.lane_count(), 0);

        let next = f
            .engine
            .send(&f.alice, text(f.chat_id, "again"))
            .await
            .unwrap()
            .message;
        assert!(next.created_at > sent.created_at);
    }

    /// 通知写入变慢，让已读先于通知落地
    struct SlowNotificationWrites {
        inner: Arc<InMemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl NotificationRepository for SlowNotificationWrites {
        async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError> {
            tokio::time::sleep(self.delay).await;
            NotificationRepository::create(&*self.inner, notification).await
        }

        async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>, RepositoryError> {
            NotificationRepository::find_by_id(&*self.inner, id).await
        }

        async fn find_unread_for_message(
            &self,
            user_id: UserId,
            message_id: MessageId,
        ) -> Result<Option<Notification>, RepositoryError> {
            self.inner.find_unread_for_message(user_id, message_id).await
        }

        async fn mark_read(
            &self,
            id: NotificationId,
            at: Timestamp,
        ) -> Result<Option<Notification>, RepositoryError> {
            NotificationRepository::mark_read(&*self.inner, id, at).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_before_notification_lands_still_clears_it() {
        let store = Arc::new(InMemoryStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (alice, _alice_rx) =
            ConnectionHandle::new(UserId::generate(), 16, CancellationToken::new());
        let (carol, _carol_rx) =
            ConnectionHandle::new(UserId::generate(), 16, CancellationToken::new());
        sessions.register(alice.clone()).unwrap();
        sessions.register(carol.clone()).unwrap();

        let chat = Chat::new(ChatId::generate(), [alice.user_id, carol.user_id], Utc::now()).unwrap();
        let chat_id = chat.id;
        store.insert_chat(chat).await;

        let directory = Arc::new(ParticipantDirectory::new(store.clone()));
        let rooms = Arc::new(RoomManager::new(Arc::clone(&directory)));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::new(SlowNotificationWrites {
                inner: store.clone(),
                delay: Duration::from_millis(100),
            }),
            Arc::clone(&sessions),
            Arc::clone(&clock),
        ));
        let engine = MessageDeliveryEngine::new(DeliveryDependencies {
            messages: store.clone(),
            chats: store.clone(),
            directory,
            rooms,
            sessions,
            notifications,
            clock,
            settings: RealtimeConfig::default(),
        });

        let mut request = text(chat_id, "ping");
        request.idempotency_token = Some("ping-1".into());
        let token = IdempotencyToken::parse("ping-1").unwrap();

        let read_early = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let persisted = MessageRepository::find_by_idempotency_token(
                &*store,
                alice.user_id,
                chat_id,
                token,
            )
            .await
            .unwrap()
            .expect("message persisted before its notification");
            engine.mark_read(&carol, persisted.id, None).await.unwrap()
        };
        let (sent, update) = tokio::join!(engine.send(&alice, request), read_early);

        assert!(sent.is_ok());
        assert_eq!(update.status, MessageStatus::Read);
        let notifications = store.notifications_for(carol.user_id).await;
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].read);
    }
}
