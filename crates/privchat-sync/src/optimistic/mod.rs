//! 乐观状态存储
//!
//! 功能包括：
//! - `read` 返回当前最佳已知值（有未决编辑时为乐观值）
//! - `propose` 立即生效并异步请求持久化
//! - 持久化失败 / 看门狗超时后回滚
//! - 访客模式（未挂载持久化器）只修改本地内存
//!
//! 状态变更在一次加锁内完成，读者看不到中间状态。

mod journal;

pub use journal::{new_mutation_id, EditJournal, MutationId, OptimisticEdit};

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PrivchatSyncError, Result};
use crate::events::{event_builders, ChangeCause, EventManager};
use crate::reconcile::{reconcile, Decision, ReconcileEvent};
use crate::retry_policy::RetryPolicy;

/// 状态键约束
pub trait StateKey: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {}
impl<T> StateKey for T where T: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// 状态值约束
pub trait StateValue: Clone + PartialEq + Debug + Send + Sync + 'static {}
impl<T> StateValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// 持久化器（权威存储的写入口）
#[async_trait]
pub trait Persister<K, V>: Send + Sync {
    async fn persist(&self, key: K, value: V) -> Result<()>;
}

/// 状态变化观察者
///
/// 回调在状态提交之后、下一次状态变更之前按顺序执行。
/// 实现方不应在回调里同步发起新的 `propose`。
pub trait ChangeObserver<K, V>: Send + Sync {
    /// 可见值变化（含回滚）
    fn on_visible_change(&self, key: K, value: Option<&V>, cause: ChangeCause);

    /// 已确认值变化
    fn on_confirmed_change(&self, _key: K, _value: Option<&V>) {}
}

/// 乐观存储的时间参数
#[derive(Debug, Clone)]
pub struct StoreTiming {
    pub watchdog_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for StoreTiming {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::from(&crate::config::PersistRetryConfig::default()),
        }
    }
}

struct StoreState<K, V> {
    confirmed: HashMap<K, V>,
    journal: EditJournal<K, V>,
    watchdogs: HashMap<MutationId, CancellationToken>,
    scopes: HashMap<String, CancellationToken>,
}

impl<K: StateKey, V: StateValue> StoreState<K, V> {
    fn visible(&self, key: &K) -> Option<&V> {
        self.journal
            .get(key)
            .map(|edit| &edit.proposed)
            .or_else(|| self.confirmed.get(key))
    }

    fn cancel_watchdog(&mut self, mutation_id: &str) {
        if let Some(token) = self.watchdogs.remove(mutation_id) {
            token.cancel();
        }
    }
}

/// 一次状态提交产生的通知
struct Notice<K, V> {
    key: K,
    visible: Option<(Option<V>, ChangeCause)>,
    confirmed: Option<Option<V>>,
}

struct StoreInner<K, V> {
    name: &'static str,
    state: Mutex<StoreState<K, V>>,
    /// 串行化“提交 + 通知”，保证观察者按提交顺序看到变化
    turn: ReentrantMutex<()>,
    persister: RwLock<Option<Arc<dyn Persister<K, V>>>>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver<K, V>>>>,
    event_manager: Arc<EventManager>,
    timing: StoreTiming,
    saving_failed: AtomicBool,
}

/// 乐观状态存储
pub struct OptimisticStateStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Clone for OptimisticStateStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: StateKey, V: StateValue> OptimisticStateStore<K, V> {
    pub fn new(name: &'static str, event_manager: Arc<EventManager>, timing: StoreTiming) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                state: Mutex::new(StoreState {
                    confirmed: HashMap::new(),
                    journal: EditJournal::new(),
                    watchdogs: HashMap::new(),
                    scopes: HashMap::new(),
                }),
                turn: ReentrantMutex::new(()),
                persister: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                event_manager,
                timing,
                saving_failed: AtomicBool::new(false),
            }),
        }
    }

    /// 挂载持久化器（登录后）
    pub fn attach_persister(&self, persister: Arc<dyn Persister<K, V>>) {
        *self.inner.persister.write() = Some(persister);
        info!("[{}] 已挂载持久化器", self.inner.name);
    }

    /// 卸载持久化器（登出后进入访客模式），在途请求照常完成
    pub fn detach_persister(&self) {
        *self.inner.persister.write() = None;
        info!("[{}] 已卸载持久化器，进入访客模式", self.inner.name);
    }

    pub fn is_guest(&self) -> bool {
        self.inner.persister.read().is_none()
    }

    pub fn add_observer(&self, observer: Arc<dyn ChangeObserver<K, V>>) {
        self.inner.observers.write().push(observer);
    }

    /// 当前最佳已知值
    pub fn read(&self, key: K) -> Option<V> {
        self.inner.state.lock().visible(&key).cloned()
    }

    /// 已确认值
    pub fn confirmed(&self, key: K) -> Option<V> {
        self.inner.state.lock().confirmed.get(&key).cloned()
    }

    /// 未决编辑
    pub fn pending(&self, key: K) -> Option<OptimisticEdit<V>> {
        self.inner.state.lock().journal.get(&key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().journal.len()
    }

    /// 所有键的可见值快照
    pub fn snapshot(&self) -> HashMap<K, V> {
        let state = self.inner.state.lock();
        let mut snapshot = state.confirmed.clone();
        for key in state.journal.keys() {
            if let Some(edit) = state.journal.get(&key) {
                snapshot.insert(key, edit.proposed.clone());
            }
        }
        snapshot
    }

    /// 最近一次乐观更新是否以失败告终
    pub fn saving_failed(&self) -> bool {
        self.inner.saving_failed.load(Ordering::SeqCst)
    }

    /// 载入已确认值（初次加载或重新拉取）
    ///
    /// 有未决编辑的键只更新已确认值，可见值保持乐观值。
    pub fn load_confirmed<I>(&self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let _turn = self.inner.turn.lock();
        let mut notices = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for (key, value) in values {
                let before = state.visible(&key).cloned();
                if let Some(edit) = state.journal.get_mut(&key) {
                    edit.rollback_target = Some(value.clone());
                }
                let confirmed_changed = state.confirmed.get(&key) != Some(&value);
                state.confirmed.insert(key, value);
                let after = state.visible(&key).cloned();
                notices.push(Notice {
                    key,
                    visible: (before != after).then(|| (after, ChangeCause::Loaded)),
                    confirmed: confirmed_changed.then(|| state.confirmed.get(&key).cloned()),
                });
            }
        }
        self.inner.notify(notices);
    }

    /// 提出修改
    pub fn propose(&self, key: K, value: V) -> MutationId {
        self.propose_scoped(key, value, None)
    }

    /// 提出修改，并把看门狗绑定到视图作用域
    pub fn propose_scoped(&self, key: K, value: V, scope: Option<&str>) -> MutationId {
        let _turn = self.inner.turn.lock();
        let mutation_id = new_mutation_id();
        let persister = self.inner.persister.read().clone();

        let (notice, watchdog) = {
            let mut state = self.inner.state.lock();
            let before = state.visible(&key).cloned();

            let watchdog = match persister {
                None => {
                    // 访客模式：只改本地内存，直接视为已确认
                    if let Some(edit) = state.journal.remove(&key) {
                        state.cancel_watchdog(&edit.mutation_id);
                    }
                    state.confirmed.insert(key, value.clone());
                    None
                }
                Some(_) => {
                    let confirmed = state.confirmed.get(&key).cloned();
                    let replaced = state.journal.begin(
                        key,
                        mutation_id.clone(),
                        value.clone(),
                        confirmed,
                        scope.map(str::to_string),
                    );
                    if let Some(replaced) = replaced {
                        debug!("[{}] {} 的编辑 {} 被 {} 取代", self.inner.name, key, replaced, mutation_id);
                        state.cancel_watchdog(&replaced);
                    }
                    let token = match scope {
                        Some(scope) => state
                            .scopes
                            .entry(scope.to_string())
                            .or_insert_with(CancellationToken::new)
                            .child_token(),
                        None => CancellationToken::new(),
                    };
                    state.watchdogs.insert(mutation_id.clone(), token.clone());
                    Some(token)
                }
            };

            let changed = before.as_ref() != Some(&value);
            let guest = watchdog.is_none();
            (
                Notice {
                    key,
                    visible: changed.then(|| (Some(value.clone()), ChangeCause::LocalProposal)),
                    confirmed: (guest && changed).then(|| Some(value.clone())),
                },
                watchdog,
            )
        };
        self.inner.notify(vec![notice]);

        match (persister, watchdog) {
            (Some(persister), Some(token)) => {
                debug!("[{}] 乐观更新 {} = {:?} ({})", self.inner.name, key, value, mutation_id);
                self.spawn_persistence(persister, key, value, mutation_id.clone());
                self.spawn_watchdog(key, mutation_id.clone(), token);
            }
            _ => debug!("[{}] 访客模式更新 {} = {:?}", self.inner.name, key, value),
        }

        mutation_id
    }

    /// 应用远端回显
    pub fn apply_remote(&self, key: K, value: V) {
        self.inner.apply(key, ReconcileEvent::RemoteEcho(value));
    }

    /// 取消某视图作用域下的看门狗（不取消在途持久化）
    pub fn cancel_scope(&self, scope: &str) {
        let token = self.inner.state.lock().scopes.remove(scope);
        if let Some(token) = token {
            token.cancel();
            debug!("[{}] 已取消作用域 {} 的看门狗", self.inner.name, scope);
        }
    }

    fn spawn_persistence(&self, persister: Arc<dyn Persister<K, V>>, key: K, value: V, mutation_id: MutationId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let event = match inner.persist_with_retry(persister.as_ref(), key, value).await {
                Ok(()) => ReconcileEvent::PersistSucceeded(mutation_id),
                Err(e) => ReconcileEvent::PersistFailed {
                    mutation_id,
                    reason: e.to_string(),
                },
            };
            inner.apply(key, event);
        });
    }

    fn spawn_watchdog(&self, key: K, mutation_id: MutationId, token: CancellationToken) {
        let inner = self.inner.clone();
        let timeout = inner.timing.watchdog_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!("[{}] {} 的乐观更新 {} 超时未确认", inner.name, key, mutation_id);
                    inner.apply(key, ReconcileEvent::WatchdogExpired(mutation_id));
                }
            }
        });
    }
}

impl<K: StateKey, V: StateValue> StoreInner<K, V> {
    async fn persist_with_retry(&self, persister: &dyn Persister<K, V>, key: K, value: V) -> Result<()> {
        let mut retries = 0;
        loop {
            let attempt = tokio::time::timeout(self.timing.attempt_timeout, persister.persist(key, value.clone())).await;
            let error = match attempt {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => PrivchatSyncError::Timeout(format!("持久化 {} 超时", key)),
            };

            if !self.timing.retry.should_retry(retries, &error) {
                return Err(error);
            }
            let delay = self.timing.retry.delay_for(retries).unwrap_or_default();
            retries += 1;
            warn!("[{}] 持久化 {} 失败: {}，{:?} 后第 {} 次重试", self.name, key, error, delay, retries);
            tokio::time::sleep(delay).await;
        }
    }

    /// 执行一次合并
    fn apply(&self, key: K, event: ReconcileEvent<V>) {
        let _turn = self.turn.lock();
        let (notice, decision) = {
            let mut state = self.state.lock();
            let before = state.visible(&key).cloned();
            let decision = reconcile(state.journal.get(&key), event);
            let mut cause = ChangeCause::Remote;
            let mut confirmed_changed = false;

            match &decision {
                Decision::Adopt(value) => {
                    confirmed_changed = state.confirmed.get(&key) != Some(value);
                    state.confirmed.insert(key, value.clone());
                }
                Decision::Resolve { mutation_id } => {
                    state.cancel_watchdog(mutation_id);
                    if let Some(edit) = state.journal.remove(&key) {
                        confirmed_changed = state.confirmed.get(&key) != Some(&edit.proposed);
                        state.confirmed.insert(key, edit.proposed);
                    }
                }
                Decision::AdvanceRollback { value, superseded } => {
                    if let Some(edit) = state.journal.get_mut(&key) {
                        edit.rollback_target = Some(value.clone());
                        edit.superseded.retain(|(id, _)| id != superseded);
                    }
                    confirmed_changed = state.confirmed.get(&key) != Some(value);
                    state.confirmed.insert(key, value.clone());
                }
                Decision::RemoteWins { value, discarded } => {
                    state.cancel_watchdog(discarded);
                    state.journal.remove(&key);
                    confirmed_changed = state.confirmed.get(&key) != Some(value);
                    state.confirmed.insert(key, value.clone());
                }
                Decision::Revert { mutation_id, to, .. } => {
                    state.cancel_watchdog(mutation_id);
                    state.journal.remove(&key);
                    cause = ChangeCause::Reverted;
                    confirmed_changed = state.confirmed.get(&key) != to.as_ref();
                    match to {
                        Some(value) => {
                            state.confirmed.insert(key, value.clone());
                        }
                        None => {
                            state.confirmed.remove(&key);
                        }
                    }
                }
                Decision::Ignore => {}
            }

            let after = state.visible(&key).cloned();
            (
                Notice {
                    key,
                    visible: (before != after).then(|| (after, cause)),
                    confirmed: confirmed_changed.then(|| state.confirmed.get(&key).cloned()),
                },
                decision,
            )
        };

        match &decision {
            Decision::Resolve { mutation_id } => {
                self.saving_failed.store(false, Ordering::SeqCst);
                debug!("[{}] ✅ {} 的乐观更新 {} 已确认", self.name, key, mutation_id);
                self.event_manager
                    .emit(event_builders::mutation_resolved(key.to_string(), mutation_id.clone()));
            }
            Decision::Revert { mutation_id, reason, .. } => {
                self.saving_failed.store(true, Ordering::SeqCst);
                warn!("[{}] ⚠️ {} 的乐观更新 {} 失败，已回滚: {}", self.name, key, mutation_id, reason);
                self.event_manager.emit(event_builders::mutation_failed(
                    key.to_string(),
                    mutation_id.clone(),
                    reason.clone(),
                ));
            }
            Decision::RemoteWins { discarded, .. } => {
                info!("[{}] {} 收到冲突的远端值，丢弃乐观更新 {}", self.name, key, discarded);
            }
            Decision::Ignore => debug!("[{}] 忽略与 {} 无关的合并事件", self.name, key),
            _ => {}
        }

        self.notify(vec![notice]);
    }

    fn notify(&self, notices: Vec<Notice<K, V>>) {
        let observers = self.observers.read().clone();
        for notice in notices {
            for observer in &observers {
                if let Some(confirmed) = &notice.confirmed {
                    observer.on_confirmed_change(notice.key, confirmed.as_ref());
                }
                if let Some((value, cause)) = &notice.visible {
                    observer.on_visible_change(notice.key, value.as_ref(), *cause);
                }
            }
        }
    }
}
