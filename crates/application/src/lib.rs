//! 应用层实现。
//!
//! 实时中继的核心：会话注册、房间、在线状态、消息投递状态机和通知分发，
//! 以及对外部协作方（存储、身份校验）的端口抽象。

pub mod clock;
pub mod delivery;
pub mod error;
pub mod events;
pub mod hub;
pub mod identity;
pub mod memory;
pub mod notification;
pub mod participants;
pub mod presence;
pub mod repository;
pub mod room;
pub mod session;

pub use clock::{Clock, SystemClock};
pub use delivery::{MessageDeliveryEngine, SendMessageRequest, SendOutcome, StatusUpdate};
pub use error::ApplicationError;
pub use events::{Ack, AckError, ClientEvent, ClientFrame, Correlation, ServerEvent};
pub use hub::{AcceptedConnection, HubDependencies, RealtimeHub};
pub use identity::IdentityVerifier;
pub use notification::NotificationDispatcher;
pub use participants::ParticipantDirectory;
pub use presence::PresenceTracker;
pub use repository::{
    ChatRepository, MessageRepository, NotificationRepository, PresenceRepository, Store,
};
pub use room::RoomManager;
pub use session::{ConnectionHandle, SessionRegistry};
