//! 内存实现
//!
//! 存储端口和身份端口的内存版本，供单机运行和测试使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use domain::{
    Chat, ChatId, DomainError, IdempotencyToken, Message, MessageId, Notification,
    NotificationId, PresenceState, RepositoryError, Timestamp, UserId,
};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::ApplicationError;
use crate::identity::IdentityVerifier;
use crate::repository::{
    ChatRepository, MessageRepository, NotificationRepository, PresenceRepository, Store,
};

#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    chats: RwLock<HashMap<ChatId, Chat>>,
    notifications: RwLock<HashMap<NotificationId, Notification>>,
    presence: RwLock<HashMap<UserId, PresenceState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把同一个实例作为全部存储端口
    pub fn store(self: &Arc<Self>) -> Store {
        Store {
            messages: self.clone(),
            chats: self.clone(),
            notifications: self.clone(),
            presence: self.clone(),
        }
    }

    pub async fn insert_chat(&self, chat: Chat) {
        self.chats.write().await.insert(chat.id, chat);
    }

    pub async fn chat(&self, id: ChatId) -> Option<Chat> {
        self.chats.read().await.get(&id).cloned()
    }

    pub async fn message(&self, id: MessageId) -> Option<Message> {
        self.messages.read().await.get(&id).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn notifications_for(&self, user_id: UserId) -> Vec<Notification> {
        let mut found: Vec<Notification> = self
            .notifications
            .read()
            .await
            .values()
            .filter(|notification| notification.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|notification| notification.created_at);
        found
    }

    pub async fn notification_count(&self) -> usize {
        self.notifications.read().await.len()
    }

    pub async fn presence_of(&self, user_id: UserId) -> Option<PresenceState> {
        self.presence.read().await.get(&user_id).copied()
    }

    /// 导入种子会话，返回导入数量
    pub async fn apply_seed(&self, seed: SeedData, now: Timestamp) -> Result<usize, DomainError> {
        let mut imported = 0;
        for entry in seed.chats {
            let chat = Chat::new(entry.id, entry.participant_ids, now)?;
            self.insert_chat(chat).await;
            imported += 1;
        }
        Ok(imported)
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        if let Some(token) = &message.idempotency_token {
            let taken = messages.values().any(|existing| {
                existing.sender_id == message.sender_id
                    && existing.chat_id == message.chat_id
                    && existing.idempotency_token.as_ref() == Some(token)
            });
            if taken {
                return Err(RepositoryError::Conflict);
            }
        }
        messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn find_by_idempotency_token(
        &self,
        sender_id: UserId,
        chat_id: ChatId,
        token: IdempotencyToken,
    ) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|message| {
                message.sender_id == sender_id
                    && message.chat_id == chat_id
                    && message.idempotency_token.as_ref() == Some(&token)
            })
            .cloned())
    }

    async fn update(
        &self,
        mut message: Message,
        expected_version: u64,
    ) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .get_mut(&message.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict);
        }
        message.version = expected_version + 1;
        *stored = message.clone();
        Ok(message)
    }
}

#[async_trait]
impl ChatRepository for InMemoryStore {
    async fn find_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError> {
        Ok(self.chats.read().await.get(&id).cloned())
    }

    async fn list_for_participant(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError> {
        Ok(self
            .chats
            .read()
            .await
            .values()
            .filter(|chat| chat.is_participant(user_id))
            .cloned()
            .collect())
    }

    async fn advance_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        at: Timestamp,
    ) -> Result<bool, RepositoryError> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(RepositoryError::NotFound)?;
        Ok(chat.advance_last_message(message_id, at))
    }
}

#[async_trait]
impl NotificationRepository for InMemoryStore {
    async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError> {
        let mut notifications = self.notifications.write().await;
        if notifications.contains_key(&notification.id) {
            return Err(RepositoryError::Conflict);
        }
        notifications.insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn find_by_id(
        &self,
        id: NotificationId,
    ) -> Result<Option<Notification>, RepositoryError> {
        Ok(self.notifications.read().await.get(&id).cloned())
    }

    async fn find_unread_for_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> Result<Option<Notification>, RepositoryError> {
        Ok(self
            .notifications
            .read()
            .await
            .values()
            .find(|notification| {
                notification.user_id == user_id
                    && notification.related_message_id == Some(message_id)
                    && !notification.read
            })
            .cloned())
    }

    async fn mark_read(
        &self,
        id: NotificationId,
        at: Timestamp,
    ) -> Result<Option<Notification>, RepositoryError> {
        let mut notifications = self.notifications.write().await;
        Ok(notifications
            .get_mut(&id)
            .filter(|notification| !notification.read)
            .map(|notification| {
                notification.mark_read(at);
                notification.clone()
            }))
    }
}

#[async_trait]
impl PresenceRepository for InMemoryStore {
    async fn save(&self, state: PresenceState) -> Result<(), RepositoryError> {
        self.presence.write().await.insert(state.user_id, state);
        Ok(())
    }
}

/// 种子数据文件格式
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    #[serde(default)]
    pub chats: Vec<SeedChat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedChat {
    pub id: ChatId,
    pub participant_ids: Vec<UserId>,
}

impl SeedData {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 令牌 -> 用户 的静态身份表
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    tokens: DashMap<String, UserId>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: impl Into<String>, user_id: UserId) {
        self.tokens.insert(token.into(), user_id);
    }
}

#[async_trait]
impl IdentityVerifier for InMemoryIdentity {
    async fn verify(&self, credential: &str) -> Result<UserId, ApplicationError> {
        self.tokens
            .get(credential.trim())
            .map(|entry| *entry.value())
            .ok_or_else(|| ApplicationError::Authentication("unknown credential".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{MessageDraft, MessageKind};

    fn message(sender: UserId, chat: ChatId) -> Message {
        let draft = MessageDraft {
            chat_id: chat,
            sender_id: sender,
            content: "hi".into(),
            kind: MessageKind::Text,
            metadata: serde_json::json!({}),
            idempotency_token: None,
        };
        Message::from_draft(MessageId::generate(), draft, Utc::now())
    }

    #[tokio::test]
    async fn stale_version_update_conflicts() {
        let store = InMemoryStore::new();
        let original = MessageRepository::create(&store, message(UserId::generate(), ChatId::generate()))
            .await
            .unwrap();

        let updated = store.update(original.clone(), 0).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(
            store.update(original, 0).await.unwrap_err(),
            RepositoryError::Conflict
        );
    }

    #[tokio::test]
    async fn notification_marked_read_once() {
        let store = InMemoryStore::new();
        let user = UserId::generate();
        let notification = Notification::new(
            NotificationId::generate(),
            user,
            domain::NotificationType::System,
            serde_json::Value::Null,
            Utc::now(),
        );
        let id = notification.id;
        NotificationRepository::create(&store, notification).await.unwrap();

        assert!(store.mark_read(id, Utc::now()).await.unwrap().is_some());
        assert!(store.mark_read(id, Utc::now()).await.unwrap().is_none());
    }

    #[test]
    fn seed_file_parses() {
        let chat = ChatId::generate();
        let a = UserId::generate();
        let b = UserId::generate();
        let text = format!(r#"{{"chats":[{{"id":"{chat}","participantIds":["{a}","{b}"]}}]}}"#);
        let seed = SeedData::from_json(&text).unwrap();
        assert_eq!(seed.chats[0].participant_ids, vec![a, b]);
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let identity = InMemoryIdentity::new();
        let user = UserId::generate();
        identity.register("token-a", user);
        assert_eq!(identity.verify("token-a").await.unwrap(), user);
        assert!(matches!(
            identity.verify("nope").await,
            Err(ApplicationError::Authentication(_))
        ));
    }
}
