//! 会话参与者目录
//!
//! 参与者集合在本服务中不可变，因此第一次读取后缓存在内存中。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use domain::{ChatId, UserId};

use crate::error::ApplicationError;
use crate::repository::ChatRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    ids: Vec<UserId>,
}

impl Participants {
    pub fn new(ids: Vec<UserId>) -> Self {
        Self { ids }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.ids.contains(&user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserId> {
        self.ids.iter()
    }

    pub fn others(&self, user_id: UserId) -> impl Iterator<Item = UserId> + '_ {
        self.ids.iter().copied().filter(move |id| *id != user_id)
    }
}

pub struct ParticipantDirectory {
    chats: Arc<dyn ChatRepository>,
    cache: DashMap<ChatId, Arc<Participants>>,
}

impl ParticipantDirectory {
    pub fn new(chats: Arc<dyn ChatRepository>) -> Self {
        Self {
            chats,
            cache: DashMap::new(),
        }
    }

    pub async fn participants(&self, chat_id: ChatId) -> Result<Arc<Participants>, ApplicationError> {
        if let Some(cached) = self.cache.get(&chat_id) {
            return Ok(Arc::clone(cached.value()));
        }

        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation", chat_id))?;
        let participants = Arc::new(Participants::new(chat.participant_ids));
        self.cache.insert(chat_id, Arc::clone(&participants));
        Ok(participants)
    }

    /// 非参与者返回 `Authorization`
    pub async fn ensure_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        action: &str,
    ) -> Result<Arc<Participants>, ApplicationError> {
        let participants = self.participants(chat_id).await?;
        if participants.contains(user_id) {
            Ok(participants)
        } else {
            Err(ApplicationError::authorization(format!(
                "{action} on conversation {chat_id}"
            )))
        }
    }

    /// 与用户共享任一会话的其他用户
    pub async fn peers_of(&self, user_id: UserId) -> Result<HashSet<UserId>, ApplicationError> {
        let chats = self.chats.list_for_participant(user_id).await?;
        let mut peers = HashSet::new();
        for chat in chats {
            peers.extend(chat.other_participants(user_id));
            self.cache
                .entry(chat.id)
                .or_insert_with(|| Arc::new(Participants::new(chat.participant_ids.clone())));
        }
        Ok(peers)
    }
}
