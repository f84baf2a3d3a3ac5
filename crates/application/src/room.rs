//! 房间管理
//!
//! 房间表示"当前正在查看某个会话"的连接集合，只作为在场信号使用，
//! 不代表会话成员关系。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ChatId, ConnectionId, UserId};
use tracing::{debug, warn};

use crate::error::ApplicationError;
use crate::participants::ParticipantDirectory;

pub struct RoomManager {
    directory: Arc<ParticipantDirectory>,
    /// 会话 -> (连接 -> 用户)
    rooms: DashMap<ChatId, HashMap<ConnectionId, UserId>>,
    /// 连接 -> 已加入的会话
    joined: DashMap<ConnectionId, HashSet<ChatId>>,
}

impl RoomManager {
    pub fn new(directory: Arc<ParticipantDirectory>) -> Self {
        Self {
            directory,
            rooms: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    /// 加入房间。非参与者返回 `Authorization`，且不修改任何状态
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<(), ApplicationError> {
        if let Err(err) = self
            .directory
            .ensure_participant(chat_id, user_id, "join-room")
            .await
        {
            warn!(
                connection_id = %connection_id,
                user_id = %user_id,
                chat_id = %chat_id,
                error = %err,
                "join rejected"
            );
            return Err(err);
        }

        self.rooms
            .entry(chat_id)
            .or_default()
            .insert(connection_id, user_id);
        self.joined.entry(connection_id).or_default().insert(chat_id);

        debug!(connection_id = %connection_id, chat_id = %chat_id, "joined room");
        Ok(())
    }

    /// 离开房间，未加入时为空操作
    pub fn leave(&self, connection_id: ConnectionId, chat_id: ChatId) {
        if let Entry::Occupied(mut entry) = self.rooms.entry(chat_id) {
            entry.get_mut().remove(&connection_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        if let Entry::Occupied(mut entry) = self.joined.entry(connection_id) {
            entry.get_mut().remove(&chat_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// 断开连接时离开所有房间，返回离开的会话
    pub fn leave_all(&self, connection_id: ConnectionId) -> Vec<ChatId> {
        let chats: Vec<ChatId> = self
            .joined
            .remove(&connection_id)
            .map(|(_, chats)| chats.into_iter().collect())
            .unwrap_or_default();

        for chat_id in &chats {
            if let Entry::Occupied(mut entry) = self.rooms.entry(*chat_id) {
                entry.get_mut().remove(&connection_id);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
        chats
    }

    pub fn members_of(&self, chat_id: ChatId) -> Vec<ConnectionId> {
        self.rooms
            .get(&chat_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// 当前在房间中的用户（任一设备在场即算）
    pub fn users_in(&self, chat_id: ChatId) -> HashSet<UserId> {
        self.rooms
            .get(&chat_id)
            .map(|members| members.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: ConnectionId, chat_id: ChatId) -> bool {
        self.rooms
            .get(&chat_id)
            .is_some_and(|members| members.contains_key(&connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use chrono::Utc;
    use domain::Chat;

    async fn setup() -> (RoomManager, ChatId, UserId, UserId) {
        let store = Arc::new(InMemoryStore::new());
        let member = UserId::generate();
        let other = UserId::generate();
        let chat = Chat::new(ChatId::generate(), [member, other], Utc::now()).unwrap();
        let chat_id = chat.id;
        store.insert_chat(chat).await;
        let directory = Arc::new(ParticipantDirectory::new(store));
        (RoomManager::new(directory), chat_id, member, other)
    }

    #[tokio::test]
    async fn participant_can_join_and_leave() {
        let (rooms, chat_id, member, _) = setup().await;
        let conn = ConnectionId::generate();

        rooms.join(conn, member, chat_id).await.unwrap();
        assert_eq!(rooms.members_of(chat_id), vec![conn]);
        assert!(rooms.users_in(chat_id).contains(&member));

        rooms.leave(conn, chat_id);
        assert!(rooms.members_of(chat_id).is_empty());
        // 重复离开不报错
        rooms.leave(conn, chat_id);
    }

    #[tokio::test]
    async fn outsider_join_is_rejected_without_mutation() {
        let (rooms, chat_id, _, _) = setup().await;
        let outsider = UserId::generate();
        let conn = ConnectionId::generate();

        let err = rooms.join(conn, outsider, chat_id).await.unwrap_err();
        assert!(matches!(err, ApplicationError::Authorization { .. }));
        assert!(rooms.members_of(chat_id).is_empty());
        assert!(rooms.leave_all(conn).is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let (rooms, _, member, _) = setup().await;
        let err = rooms
            .join(ConnectionId::generate(), member, ChatId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn leave_all_clears_every_room() {
        let (rooms, chat_id, member, _) = setup().await;
        let conn = ConnectionId::generate();
        rooms.join(conn, member, chat_id).await.unwrap();

        assert_eq!(rooms.leave_all(conn), vec![chat_id]);
        assert!(!rooms.is_member(conn, chat_id));
    }
}
