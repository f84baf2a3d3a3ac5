//! 实时消息中继的核心领域模型
//!
//! 包含会话、消息、通知等核心实体，以及消息状态机和已读账本规则。

pub mod entities;
pub mod errors;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use value_objects::*;
