//! 存储端口
//!
//! 持久化由外部系统负责，核心只依赖这里定义的创建、读取和条件更新原语。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    Chat, ChatId, IdempotencyToken, Message, MessageId, Notification, NotificationId,
    PresenceState, RepositoryError, Timestamp, UserId,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 持久化新消息，返回存储后的副本
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 按 (发送者, 会话, 幂等令牌) 查找已存在的消息
    async fn find_by_idempotency_token(
        &self,
        sender_id: UserId,
        chat_id: ChatId,
        token: IdempotencyToken,
    ) -> Result<Option<Message>, RepositoryError>;

    /// 条件更新：存储中的版本必须等于 `expected_version`，否则返回 `Conflict`。
    /// 成功后版本号加一。
    async fn update(
        &self,
        message: Message,
        expected_version: u64,
    ) -> Result<Message, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn find_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError>;

    async fn list_for_participant(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError>;

    /// 按时间戳推进最后一条消息指针（后写者胜），返回是否更新
    async fn advance_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError>;

    async fn find_by_id(&self, id: NotificationId)
        -> Result<Option<Notification>, RepositoryError>;

    /// 查找用户关于某条消息的未读通知
    async fn find_unread_for_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<Option<Notification>, RepositoryError>;

    /// 原子地将未读通知标记为已读；通知不存在或已读时返回 `None`
    async fn mark_read(
        &self,
        id: NotificationId,
        at: Timestamp,
    ) -> Result<Option<Notification>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn save(&self, state: PresenceState) -> Result<(), RepositoryError>;
}

/// 核心依赖的全部存储端口
#[derive(Clone)]
pub struct Store {
    pub messages: Arc<dyn MessageRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub presence: Arc<dyn PresenceRepository>,
}
