use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// 生成随机的 v4 标识。
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(value: &str) -> Result<Self, DomainError> {
                Uuid::parse_str(value.trim())
                    .map(Self)
                    .map_err(|_| DomainError::validation_error(stringify!($name), "malformed identifier"))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

uuid_id!(
    /// 用户唯一标识。
    UserId
);

uuid_id!(
    /// 会话（聊天）唯一标识。
    ChatId
);

uuid_id!(
    /// 消息唯一标识。
    MessageId
);

uuid_id!(
    /// 通知唯一标识。
    NotificationId
);

uuid_id!(
    /// 单条实时连接的标识，由会话注册表分配。
    ConnectionId
);

/// 客户端生成的幂等令牌，用于把乐观发送的本地副本与服务端消息对应起来。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error(
                "idempotency_token",
                "cannot be empty",
            ));
        }
        if value.len() > 128 {
            return Err(DomainError::validation_error("idempotency_token", "too long"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed_identifier() {
        assert!(ChatId::parse("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(ChatId::parse(&id.to_string()).unwrap(), ChatId::from(id));
    }

    #[test]
    fn ids_serialize_as_plain_uuid_strings() {
        let id = MessageId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn idempotency_token_is_trimmed_and_non_empty() {
        assert!(IdempotencyToken::parse("   ").is_err());
        assert_eq!(IdempotencyToken::parse(" t1 ").unwrap().as_str(), "t1");
        assert!(IdempotencyToken::parse("x".repeat(129)).is_err());
    }
}
