//! 会话实体定义
//!
//! 会话在本服务中只读：参与者集合由外部系统维护，这里只推进最后一条消息指针。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 会话实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// 会话ID
    pub id: ChatId,
    /// 参与者列表（不含重复）
    pub participant_ids: Vec<UserId>,
    /// 最后一条消息
    pub last_message_id: Option<MessageId>,
    /// 最后一条消息的时间
    pub last_message_at: Option<Timestamp>,
    /// 创建时间
    pub created_at: Timestamp,
}

impl Chat {
    /// 创建会话，参与者会被去重且至少需要一人
    pub fn new(
        id: ChatId,
        participants: impl IntoIterator<Item = UserId>,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let mut participant_ids: Vec<UserId> = Vec::new();
        for user_id in participants {
            if !participant_ids.contains(&user_id) {
                participant_ids.push(user_id);
            }
        }

        if participant_ids.is_empty() {
            return Err(DomainError::validation_error(
                "participant_ids",
                "a chat needs at least one participant",
            ));
        }

        Ok(Self {
            id,
            participant_ids,
            last_message_id: None,
            last_message_at: None,
            created_at,
        })
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant_ids.contains(&user_id)
    }

    /// 除指定用户以外的参与者
    pub fn other_participants(&self, user_id: UserId) -> impl Iterator<Item = UserId> + '_ {
        self.participant_ids
            .iter()
            .copied()
            .filter(move |id| *id != user_id)
    }

    /// 按时间戳推进最后一条消息指针（后写者胜）。
    ///
    /// 早于当前指针的写入被忽略，返回是否发生了更新。
    pub fn advance_last_message(&mut self, message_id: MessageId, at: Timestamp) -> bool {
        match self.last_message_at {
            Some(current) if current > at => false,
            Some(current) if current == at && self.last_message_id == Some(message_id) => false,
            _ => {
                self.last_message_id = Some(message_id);
                self.last_message_at = Some(at);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn duplicate_participants_are_collapsed() {
        let a = UserId::generate();
        let chat = Chat::new(ChatId::generate(), [a, a], Utc::now()).unwrap();
        assert_eq!(chat.participant_ids, vec![a]);
        assert!(Chat::new(ChatId::generate(), [], Utc::now()).is_err());
    }

    #[test]
    fn last_message_pointer_keeps_latest_timestamp() {
        let mut chat = Chat::new(ChatId::generate(), [UserId::generate()], Utc::now()).unwrap();
        let now = Utc::now();
        let newer = MessageId::generate();
        let older = MessageId::generate();

        assert!(chat.advance_last_message(newer, now));
        assert!(!chat.advance_last_message(older, now - Duration::seconds(1)));
        assert_eq!(chat.last_message_id, Some(newer));
        assert_eq!(chat.last_message_at, Some(now));
    }

    #[test]
    fn other_participants_excludes_self() {
        let a = UserId::generate();
        let b = UserId::generate();
        let chat = Chat::new(ChatId::generate(), [a, b], Utc::now()).unwrap();
        assert_eq!(chat.other_participants(a).collect::<Vec<_>>(), vec![b]);
    }
}
