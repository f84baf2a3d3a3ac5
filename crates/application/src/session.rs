//! 会话注册表
//!
//! 记录每个用户当前打开的实时连接（多设备）。用户在线当且仅当连接集合非空。

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ConnectionId, UserId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ApplicationError;
use crate::events::ServerEvent;

/// 一条实时连接的出站端
///
/// 出站队列有界；队列满时连接会被强制断开，不会阻塞其他成员的投递。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    sender: mpsc::Sender<ServerEvent>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    /// 创建连接句柄和对应的出站接收端
    pub fn new(
        user_id: UserId,
        capacity: usize,
        closer: CancellationToken,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::generate(),
            user_id,
            sender,
            closer,
        };
        (handle, receiver)
    }

    /// 非阻塞投递。队列溢出或已关闭时触发强制断开并返回 false
    pub fn deliver(&self, event: ServerEvent) -> bool {
        if self.closer.is_cancelled() {
            return false;
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    "outbound queue overflow, forcing disconnect"
                );
                self.closer.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "outbound channel closed");
                self.closer.cancel();
                false
            }
        }
    }

    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// 连接被关闭时完成
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }
}

/// 注册时的会话变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// 空 -> 非空
    CameOnline,
    AlreadyOnline,
}

/// 注销结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistered {
    pub user_id: UserId,
    /// 这是用户最后一条连接
    pub went_offline: bool,
}

/// 会话注册表
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<SessionTransition, ApplicationError> {
        let connection_id = handle.id;
        let user_id = handle.user_id;

        match self.connections.entry(connection_id) {
            Entry::Occupied(_) => {
                return Err(ApplicationError::validation(
                    "connection_id",
                    "connection already registered",
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        let transition = {
            let mut set = self.users.entry(user_id).or_default();
            let was_empty = set.is_empty();
            set.insert(connection_id);
            if was_empty {
                SessionTransition::CameOnline
            } else {
                SessionTransition::AlreadyOnline
            }
        };

        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            ?transition,
            "connection registered"
        );
        Ok(transition)
    }

    /// 注销连接；未知连接返回 `None`
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Unregistered> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        let user_id = handle.user_id;

        let went_offline = match self.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(&connection_id);
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };

        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            went_offline,
            "connection unregistered"
        );
        Some(Unregistered {
            user_id,
            went_offline,
        })
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users
            .get(&user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .get(&connection_id)
            .map(|handle| handle.value().clone())
    }

    pub fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        let ids: Vec<ConnectionId> = match self.users.get(&user_id) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| self.connection(id))
            .collect()
    }

    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 投递到一组连接，返回成功入队的数量
    pub fn route_to_connections(
        &self,
        connection_ids: impl IntoIterator<Item = ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        connection_ids
            .into_iter()
            .filter_map(|id| self.connection(id))
            .filter(|handle| handle.deliver(event.clone()))
            .count()
    }

    /// 投递到用户的全部连接，可排除一条（例如请求的来源连接）
    pub fn route_to_user(
        &self,
        user_id: UserId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        self.connections_for(user_id)
            .into_iter()
            .filter(|handle| Some(handle.id) != except)
            .filter(|handle| handle.deliver(event.clone()))
            .count()
    }
}
