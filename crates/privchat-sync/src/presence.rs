//! 在线状态管理模块
//!
//! 功能包括：
//! - 缓存其他用户的在线状态（带过期时间和容量上限）
//! - 处理频道推送的状态变化
//! - 通过乐观存储管理自己的在线状态

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PresenceCacheConfig;
use crate::error::{PrivchatSyncError, Result};
use crate::events::{event_builders, ChangeCause, EventManager};
use crate::optimistic::{ChangeObserver, MutationId, OptimisticStateStore, Persister, StoreTiming};

/// 在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    Available,
    Busy,
    DoNotDisturb,
    Invisible,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Available => "available",
            PresenceStatus::Busy => "busy",
            PresenceStatus::DoNotDisturb => "do-not-disturb",
            PresenceStatus::Invisible => "invisible",
            PresenceStatus::Offline => "offline",
        }
    }

    /// 对其他用户是否显示为在线
    pub fn appears_online(&self) -> bool {
        matches!(
            self,
            PresenceStatus::Available | PresenceStatus::Busy | PresenceStatus::DoNotDisturb
        )
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PrivchatSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(PresenceStatus::Available),
            "busy" => Ok(PresenceStatus::Busy),
            "do-not-disturb" => Ok(PresenceStatus::DoNotDisturb),
            "invisible" => Ok(PresenceStatus::Invisible),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(PrivchatSyncError::InvalidArgument(format!("未知在线状态: {}", other))),
        }
    }
}

/// 自己在线状态在乐观存储中的唯一键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresenceSlot;

impl fmt::Display for PresenceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("presence")
    }
}

/// 用户在线状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    /// 最后在线时间（UTC 毫秒）
    pub last_seen_at: i64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: PresenceRecord,
    cached_at: Instant,
}

/// 缓存统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceCacheStats {
    /// 已缓存的用户数
    pub cached_users: usize,
    /// 已订阅的用户数
    pub subscribed_users: usize,
    /// 最大缓存大小
    pub max_cache_size: usize,
    /// 缓存TTL（秒）
    pub cache_ttl_secs: u64,
}

/// 把自己在线状态的可见变化转发为事件
struct OwnPresenceEvents {
    event_manager: Arc<EventManager>,
}

impl ChangeObserver<PresenceSlot, PresenceStatus> for OwnPresenceEvents {
    fn on_visible_change(&self, _slot: PresenceSlot, value: Option<&PresenceStatus>, cause: ChangeCause) {
        if let Some(status) = value {
            self.event_manager
                .emit(event_builders::own_presence_changed(*status, cause));
        }
    }
}

/// 在线状态管理器
pub struct PresenceManager {
    /// 其他用户的在线状态缓存
    status_cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    /// 当前订阅的用户列表
    subscribed_users: RwLock<HashSet<String>>,
    /// 事件管理器（用于发布状态变化事件）
    event_manager: Arc<EventManager>,
    /// 缓存配置
    config: PresenceCacheConfig,
    /// 自己的在线状态
    own: OptimisticStateStore<PresenceSlot, PresenceStatus>,
}

/// 丢弃超过 TTL 的条目，返回丢弃数量
fn retain_fresh(cache: &mut HashMap<String, CacheEntry>, ttl: Duration) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    before - cache.len()
}

impl PresenceManager {
    pub fn new(event_manager: Arc<EventManager>, config: PresenceCacheConfig, timing: StoreTiming) -> Self {
        let own = OptimisticStateStore::new("presence", event_manager.clone(), timing);
        own.add_observer(Arc::new(OwnPresenceEvents {
            event_manager: event_manager.clone(),
        }));

        Self {
            status_cache: Arc::new(RwLock::new(HashMap::new())),
            subscribed_users: RwLock::new(HashSet::new()),
            event_manager,
            config,
            own,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache_ttl_secs)
    }

    /// 记录订阅（实际的频道订阅由会话完成）
    pub fn add_subscription(&self, user_ids: Vec<String>) {
        let mut subscribed = self.subscribed_users.write();
        subscribed.extend(user_ids);
        debug!("在线状态订阅数: {}", subscribed.len());
    }

    pub fn remove_subscription(&self, user_ids: &[String]) {
        let mut subscribed = self.subscribed_users.write();
        for user_id in user_ids {
            subscribed.remove(user_id);
        }
        debug!("移除 {} 个在线状态订阅，剩余: {}", user_ids.len(), subscribed.len());
    }

    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscribed_users.read().contains(user_id)
    }

    pub fn subscribed_users(&self) -> Vec<String> {
        self.subscribed_users.read().iter().cloned().collect()
    }

    /// 更新缓存，返回状态是否发生变化
    pub fn update_status(&self, record: PresenceRecord) -> bool {
        let mut cache = self.status_cache.write();

        if cache.len() >= self.config.max_cache_size && !cache.contains_key(&record.user_id) {
            // 淘汰最早缓存的条目
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(user_id, _)| user_id.clone());
            if let Some(oldest) = oldest {
                warn!("在线状态缓存已满 ({})，淘汰 {}", self.config.max_cache_size, oldest);
                cache.remove(&oldest);
            }
        }

        let changed = cache
            .get(&record.user_id)
            .map(|entry| entry.record.status != record.status)
            .unwrap_or(true);
        cache.insert(
            record.user_id.clone(),
            CacheEntry {
                record,
                cached_at: Instant::now(),
            },
        );
        changed
    }

    /// 获取用户在线状态，过期条目视为未知
    pub fn get_status(&self, user_id: &str) -> Option<PresenceRecord> {
        let ttl = self.ttl();
        self.status_cache
            .read()
            .get(user_id)
            .filter(|entry| entry.cached_at.elapsed() < ttl)
            .map(|entry| entry.record.clone())
    }

    pub fn batch_get_status(&self, user_ids: &[String]) -> HashMap<String, PresenceRecord> {
        user_ids
            .iter()
            .filter_map(|user_id| self.get_status(user_id).map(|record| (user_id.clone(), record)))
            .collect()
    }

    /// 处理频道推送的其他用户状态
    pub fn handle_status_change(&self, record: PresenceRecord) {
        let user_id = record.user_id.clone();
        let status = record.status;
        let last_seen_at = record.last_seen_at;

        if self.update_status(record) {
            self.event_manager
                .emit(event_builders::user_presence_changed(&user_id, status, last_seen_at));
            info!("✅ 用户 {} 在线状态变为 {}", user_id, status);
        } else {
            debug!("用户 {} 在线状态未变化: {}", user_id, status);
        }
    }

    /// 清理过期条目，返回清理数量
    pub fn evict_stale(&self) -> usize {
        retain_fresh(&mut self.status_cache.write(), self.ttl())
    }

    pub fn get_cache_stats(&self) -> PresenceCacheStats {
        PresenceCacheStats {
            cached_users: self.status_cache.read().len(),
            subscribed_users: self.subscribed_users.read().len(),
            max_cache_size: self.config.max_cache_size,
            cache_ttl_secs: self.config.cache_ttl_secs,
        }
    }

    /// 启动过期清理任务，直到 `cancel` 被取消
    pub fn start_cleanup_task(&self, cancel: CancellationToken) {
        let cache = self.status_cache.clone();
        let ttl = self.ttl();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = retain_fresh(&mut cache.write(), ttl);
                        if evicted > 0 {
                            debug!("清理 {} 条过期在线状态", evicted);
                        }
                    }
                }
            }
        });
    }

    /// 自己的当前在线状态（未加载时视为 available）
    pub fn own_status(&self) -> PresenceStatus {
        self.own.read(PresenceSlot).unwrap_or(PresenceStatus::Available)
    }

    /// 载入自己已确认的在线状态
    pub fn load_own_status(&self, status: PresenceStatus) {
        self.own.load_confirmed([(PresenceSlot, status)]);
    }

    /// 修改自己的在线状态（乐观更新）
    pub fn set_own_status(&self, status: PresenceStatus) -> MutationId {
        self.own.propose(PresenceSlot, status)
    }

    /// 自己状态的频道回显
    pub fn apply_own_echo(&self, status: PresenceStatus) {
        self.own.apply_remote(PresenceSlot, status);
    }

    pub fn attach_persister(&self, persister: Arc<dyn Persister<PresenceSlot, PresenceStatus>>) {
        self.own.attach_persister(persister);
    }

    pub fn detach_persister(&self) {
        self.own.detach_persister();
    }

    pub fn own_store(&self) -> &OptimisticStateStore<PresenceSlot, PresenceStatus> {
        &self.own
    }
}
