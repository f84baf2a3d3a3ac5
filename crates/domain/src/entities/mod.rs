//! 领域实体定义
//!
//! 包含实时消息中继的核心实体：会话、消息、通知和在线状态。

pub mod chat;
pub mod message;
pub mod notification;
pub mod presence;

// 重新导出核心实体
pub use chat::Chat;
pub use message::{
    Message, MessageDraft, MessageKind, MessageStatus, ReadOutcome, ReadReceipt,
};
pub use notification::{Notification, NotificationType};
pub use presence::PresenceState;
