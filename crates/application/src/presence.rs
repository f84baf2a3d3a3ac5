//! 在线状态跟踪
//!
//! 在线/离线完全由会话注册表的连接数推导：
//! - 空 -> 非空：立即标记在线并广播给共享会话的用户
//! - 非空 -> 空：启动宽限计时器，期满仍无连接才确认离线；期间重连会取消计时器且不发出任何事件
//!
//! 同一用户的持久化与广播经由该用户的发布闸门串行执行，每次发布都读取最新状态，
//! 因此最后一次落地的广播和存储总是与当前状态一致。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use domain::{PresenceState, Timestamp, UserId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::ServerEvent;
use crate::participants::ParticipantDirectory;
use crate::repository::PresenceRepository;
use crate::session::SessionRegistry;

#[derive(Debug)]
struct PresenceEntry {
    online: bool,
    last_active: Timestamp,
    /// 全局递增，过期的计时器据此放弃
    epoch: u64,
    pending: Option<CancellationToken>,
    /// 最近一次已广播的在线标志
    published: Option<bool>,
    gate: Arc<Mutex<()>>,
}

impl PresenceEntry {
    fn new(now: Timestamp) -> Self {
        Self {
            online: false,
            last_active: now,
            epoch: 0,
            pending: None,
            published: None,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn snapshot(&self, user_id: UserId) -> PresenceState {
        if self.online {
            PresenceState::online(user_id, self.last_active)
        } else {
            PresenceState::offline(user_id, self.last_active)
        }
    }
}

pub struct PresenceTracker {
    sessions: Arc<SessionRegistry>,
    directory: Arc<ParticipantDirectory>,
    store: Arc<dyn PresenceRepository>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    entries: DashMap<UserId, PresenceEntry>,
    next_epoch: AtomicU64,
}

impl PresenceTracker {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        directory: Arc<ParticipantDirectory>,
        store: Arc<dyn PresenceRepository>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        Self {
            sessions,
            directory,
            store,
            clock,
            grace,
            entries: DashMap::new(),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn bump_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// 用户新建了一条连接
    pub async fn connected(&self, user_id: UserId) {
        let now = self.clock.now();
        let announce = {
            let mut entry = self
                .entries
                .entry(user_id)
                .or_insert_with(|| PresenceEntry::new(now));
            entry.epoch = self.bump_epoch();
            if let Some(pending) = entry.pending.take() {
                pending.cancel();
                debug!(user_id = %user_id, "reconnected within grace window");
            }
            entry.last_active = now;
            let announce = !entry.online;
            entry.online = true;
            announce
        };

        if announce {
            self.publish(user_id).await;
        }
    }

    /// 用户最后一条连接断开，安排离线确认
    pub fn disconnected(self: &Arc<Self>, user_id: UserId) {
        let now = self.clock.now();
        let token = CancellationToken::new();
        let epoch = {
            let mut entry = self
                .entries
                .entry(user_id)
                .or_insert_with(|| PresenceEntry::new(now));
            entry.epoch = self.bump_epoch();
            if let Some(previous) = entry.pending.replace(token.clone()) {
                previous.cancel();
            }
            entry.last_active = now;
            entry.epoch
        };

        let tracker = Arc::clone(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => tracker.confirm_offline(user_id, epoch).await,
            }
        });
    }

    /// 客户端显式上报在线状态
    pub async fn set_presence(&self, user_id: UserId, online: bool) {
        if online {
            if self.sessions.is_online(user_id) {
                self.connected(user_id).await;
            }
            return;
        }

        let now = self.clock.now();
        let announce = match self.entries.get_mut(&user_id) {
            Some(mut entry) => {
                entry.epoch = self.bump_epoch();
                if let Some(pending) = entry.pending.take() {
                    pending.cancel();
                }
                let was_online = entry.online;
                entry.online = false;
                entry.last_active = now;
                was_online
            }
            None => false,
        };

        if announce {
            self.publish(user_id).await;
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries.get(&user_id).is_some_and(|entry| entry.online)
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.entries.len()
    }

    async fn confirm_offline(&self, user_id: UserId, epoch: u64) {
        {
            let Some(mut entry) = self.entries.get_mut(&user_id) else {
                return;
            };
            if entry.epoch != epoch || self.sessions.is_online(user_id) {
                return;
            }
            entry.pending = None;
            entry.online = false;
        }

        info!(user_id = %user_id, "offline confirmed after grace window");
        self.publish(user_id).await;
    }

    /// 持久化并广播给与该用户共享会话的所有在线连接
    async fn publish(&self, user_id: UserId) {
        let Some(gate) = self.entries.get(&user_id).map(|entry| Arc::clone(&entry.gate)) else {
            return;
        };
        let _turn = gate.lock().await;
        self.publish_current(user_id).await;
        self.reclaim(user_id);
    }

    /// 拿到闸门后再读状态：排队期间的多次变化合并为一次发布
    async fn publish_current(&self, user_id: UserId) {
        let state = {
            let Some(entry) = self.entries.get(&user_id) else {
                return;
            };
            if entry.published == Some(entry.online) {
                return;
            }
            entry.snapshot(user_id)
        };

        if let Err(err) = self.store.save(state).await {
            warn!(user_id = %user_id, error = %err, "failed to persist presence");
        }

        match self.directory.peers_of(user_id).await {
            Ok(peers) => {
                let event = ServerEvent::PresenceChanged {
                    user_id,
                    online: state.online,
                    last_active: state.last_active,
                };
                let delivered: usize = peers
                    .into_iter()
                    .map(|peer| self.sessions.route_to_user(peer, &event, None))
                    .sum();
                info!(user_id = %user_id, online = state.online, delivered, "presence changed");
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "failed to resolve presence peers");
            }
        }

        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            entry.published = Some(state.online);
        }
    }

    /// 已离线、无待确认计时器且离线已广播的用户不再保留条目
    fn reclaim(&self, user_id: UserId) {
        let sessions = &self.sessions;
        let removed = self.entries.remove_if(&user_id, |_, entry| {
            !entry.online
                && entry.pending.is_none()
                && entry.published == Some(false)
                && !sessions.is_online(user_id)
        });
        if removed.is_some() {
            debug!(user_id = %user_id, "presence entry reclaimed");
        }
    }
}
