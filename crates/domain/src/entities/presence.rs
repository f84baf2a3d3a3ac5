use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 用户的在线状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: UserId,
    pub online: bool,
    pub last_active: Timestamp,
}

impl PresenceState {
    pub fn online(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            online: true,
            last_active: at,
        }
    }

    pub fn offline(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            online: false,
            last_active: at,
        }
    }
}
