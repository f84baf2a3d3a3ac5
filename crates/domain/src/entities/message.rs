//! 消息实体定义
//!
//! 包含消息的投递状态机与已读账本。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ChatId, IdempotencyToken, MessageId, Timestamp, UserId};

/// 消息类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// 文本消息
    #[default]
    Text,
    Image,
    Video,
    File,
    Location,
}

impl MessageKind {
    /// 只有文本消息要求正文非空，媒体消息的内容放在 metadata 中
    pub fn requires_content(&self) -> bool {
        matches!(self, MessageKind::Text)
    }
}

/// 消息投递状态
///
/// 顺序即状态机方向：`Pending < Sent < Delivered < Read`，状态只能前进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
}

/// 已读账本中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub reader_id: UserId,
    pub read_at: Timestamp,
}

/// 发送请求经过校验前的草稿
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: JsonValue,
    pub idempotency_token: Option<IdempotencyToken>,
}

impl MessageDraft {
    /// 校验正文与 metadata，返回规范化后的草稿
    pub fn validate(mut self, max_content_length: usize) -> DomainResult<Self> {
        if self.kind.requires_content() && self.content.trim().is_empty() {
            return Err(DomainError::validation_error(
                "content",
                "text messages require content",
            ));
        }

        if self.content.chars().count() > max_content_length {
            return Err(DomainError::validation_error(
                "content",
                format!("cannot exceed {max_content_length} characters"),
            ));
        }

        self.metadata = match self.metadata {
            JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
            JsonValue::Object(map) => JsonValue::Object(map),
            _ => {
                return Err(DomainError::validation_error(
                    "metadata",
                    "must be a JSON object",
                ))
            }
        };

        Ok(self)
    }
}

/// 一次已读操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// 账本是否新增了记录；重复已读为 false
    pub recorded: bool,
    pub status: MessageStatus,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "conversationId")]
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: JsonValue,
    pub status: MessageStatus,
    pub read_by: Vec<ReadReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<IdempotencyToken>,
    pub created_at: Timestamp,
    /// 乐观并发版本号，每次持久化更新加一
    #[serde(default)]
    pub version: u64,
}

impl Message {
    /// 由已校验的草稿创建消息，初始状态为 `Pending`
    pub fn from_draft(id: MessageId, draft: MessageDraft, created_at: Timestamp) -> Self {
        Self {
            id,
            chat_id: draft.chat_id,
            sender_id: draft.sender_id,
            content: draft.content,
            kind: draft.kind,
            metadata: draft.metadata,
            status: MessageStatus::Pending,
            read_by: Vec::new(),
            idempotency_token: draft.idempotency_token,
            created_at,
            version: 0,
        }
    }

    /// 单调推进状态；目标状态不高于当前状态时不做任何修改
    pub fn advance_to(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    pub fn mark_sent(&mut self) -> bool {
        self.advance_to(MessageStatus::Sent)
    }

    /// 只有处于 `Sent` 的消息会被推进为 `Delivered`
    pub fn mark_delivered(&mut self) -> bool {
        if self.status == MessageStatus::Sent {
            self.advance_to(MessageStatus::Delivered)
        } else {
            false
        }
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|receipt| receipt.reader_id == user_id)
    }

    pub fn read_count(&self) -> usize {
        self.read_by.len()
    }

    /// 记录一次已读并重新计算状态。
    ///
    /// 只有当除发送者外的所有参与者都出现在账本中时，状态才会变为 `Read`；
    /// 否则 `Sent` 的消息推进到 `Delivered`。发送者自己的已读以及重复已读都是空操作。
    pub fn record_read<'a>(
        &mut self,
        reader_id: UserId,
        read_at: Timestamp,
        participants: impl IntoIterator<Item = &'a UserId>,
    ) -> ReadOutcome {
        if reader_id == self.sender_id || self.is_read_by(reader_id) {
            return ReadOutcome {
                recorded: false,
                status: self.status,
            };
        }

        self.read_by.push(ReadReceipt { reader_id, read_at });

        let readers: HashSet<UserId> = self.read_by.iter().map(|r| r.reader_id).collect();
        let mut others = participants
            .into_iter()
            .filter(|user_id| **user_id != self.sender_id)
            .peekable();
        let has_others = others.peek().is_some();
        let everyone_read = others.all(|user_id| readers.contains(user_id));

        if has_others && everyone_read {
            self.advance_to(MessageStatus::Read);
        } else if self.status == MessageStatus::Sent {
            self.advance_to(MessageStatus::Delivered);
        }

        ReadOutcome {
            recorded: true,
            status: self.status,
        }
    }

    /// 通知中使用的正文预览，按字符截断
    pub fn preview(&self, max_chars: usize) -> String {
        if self.content.chars().count() <= max_chars {
            self.content.clone()
        } else {
            let truncated: String = self.content.chars().take(max_chars).collect();
            format!("{truncated}...")
        }
    }
}
