//! 输入状态管理模块
//!
//! 功能包括：
//! - 发送输入状态前的防抖（避免频繁发送）
//! - 跟踪其他用户在各会话中的输入状态
//! - 超时未刷新的输入状态自动清除

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TypingConfig;
use crate::events::{event_builders, EventManager};

/// 本地输入状态
#[derive(Debug, Clone)]
struct OutgoingTyping {
    started_at: Instant,
    last_sent_at: Instant,
}

struct TypingInner {
    /// 当前正在输入的会话
    outgoing: RwLock<HashMap<String, OutgoingTyping>>,
    /// 会话 → (用户 → 最后一次收到输入状态的时间)
    remote: RwLock<HashMap<String, HashMap<String, Instant>>>,
    event_manager: Arc<EventManager>,
    config: TypingConfig,
}

impl TypingInner {
    fn auto_clear(&self) -> Duration {
        Duration::from_secs(self.config.auto_clear_secs)
    }

    /// 清除超时的输入状态，为每个被清除的远端用户发出停止事件
    fn expire(&self) -> usize {
        let auto_clear = self.auto_clear();
        let now = Instant::now();

        self.outgoing.write().retain(|chat_id, state| {
            let keep = now.duration_since(state.started_at) < auto_clear;
            if !keep {
                debug!("会话 {} 的本地输入状态已自动清除", chat_id);
            }
            keep
        });

        let mut expired = Vec::new();
        {
            let mut remote = self.remote.write();
            for (chat_id, users) in remote.iter_mut() {
                users.retain(|user_id, seen_at| {
                    let keep = now.duration_since(*seen_at) < auto_clear;
                    if !keep {
                        expired.push((chat_id.clone(), user_id.clone()));
                    }
                    keep
                });
            }
            remote.retain(|_, users| !users.is_empty());
        }

        for (chat_id, user_id) in &expired {
            debug!("用户 {} 在会话 {} 的输入状态超时", user_id, chat_id);
            self.event_manager
                .emit(event_builders::typing_indicator(chat_id, user_id, false));
        }
        expired.len()
    }
}

/// 输入状态管理器
pub struct TypingManager {
    inner: Arc<TypingInner>,
}

impl TypingManager {
    pub fn new(event_manager: Arc<EventManager>, config: TypingConfig) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                outgoing: RwLock::new(HashMap::new()),
                remote: RwLock::new(HashMap::new()),
                event_manager,
                config,
            }),
        }
    }

    /// 记录开始输入
    ///
    /// 返回 true 表示需要发送通知，false 表示在防抖间隔内，不需要发送
    pub fn start_typing(&self, chat_id: &str) -> bool {
        let now = Instant::now();
        let debounce = Duration::from_secs(self.inner.config.debounce_interval_secs);
        let mut outgoing = self.inner.outgoing.write();

        match outgoing.get_mut(chat_id) {
            Some(state) => {
                if now.duration_since(state.last_sent_at) < debounce {
                    debug!("会话 {} 的输入状态在防抖间隔内", chat_id);
                    return false;
                }
                state.last_sent_at = now;
                // 持续输入时刷新自动清除计时
                state.started_at = now;
                true
            }
            None => {
                outgoing.insert(
                    chat_id.to_string(),
                    OutgoingTyping {
                        started_at: now,
                        last_sent_at: now,
                    },
                );
                true
            }
        }
    }

    /// 停止输入，返回是否需要发送停止通知
    pub fn stop_typing(&self, chat_id: &str) -> bool {
        let was_typing = self.inner.outgoing.write().remove(chat_id).is_some();
        debug!("会话 {} 停止输入", chat_id);
        was_typing
    }

    /// 处理其他用户的输入状态
    pub fn handle_typing_change(&self, chat_id: &str, user_id: &str, is_typing: bool) {
        let changed = {
            let mut remote = self.inner.remote.write();
            if is_typing {
                remote
                    .entry(chat_id.to_string())
                    .or_default()
                    .insert(user_id.to_string(), Instant::now())
                    .is_none()
            } else {
                let removed = remote
                    .get_mut(chat_id)
                    .map(|users| users.remove(user_id).is_some())
                    .unwrap_or(false);
                if remote.get(chat_id).map(|users| users.is_empty()).unwrap_or(false) {
                    remote.remove(chat_id);
                }
                removed
            }
        };

        debug!(
            "📥 用户 {} 在会话 {} is_typing={} (changed={})",
            user_id, chat_id, is_typing, changed
        );
        if changed {
            self.inner
                .event_manager
                .emit(event_builders::typing_indicator(chat_id, user_id, is_typing));
        }
    }

    /// 会话中正在输入的用户（已排序，不含已超时的）
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let auto_clear = self.inner.auto_clear();
        let mut users: Vec<String> = self
            .inner
            .remote
            .read()
            .get(chat_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, seen_at)| seen_at.elapsed() < auto_clear)
                    .map(|(user_id, _)| user_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// 清除某会话的所有输入状态（离开会话时）
    pub fn clear_chat(&self, chat_id: &str) {
        self.inner.outgoing.write().remove(chat_id);
        self.inner.remote.write().remove(chat_id);
    }

    /// 立即清理超时状态，返回清除的远端条目数
    pub fn expire_stale(&self) -> usize {
        self.inner.expire()
    }

    /// 启动自动清理任务，直到 `cancel` 被取消
    pub fn start_cleanup_task(&self, cancel: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        inner.expire();
                    }
                }
            }
        });
    }

    pub fn get_stats(&self) -> TypingStats {
        TypingStats {
            active_typing_count: self.inner.outgoing.read().len(),
            remote_typing_count: self.inner.remote.read().values().map(|users| users.len()).sum(),
        }
    }
}

/// 输入状态统计
#[derive(Debug, Clone)]
pub struct TypingStats {
    pub active_typing_count: usize,
    pub remote_typing_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use tokio::time::sleep;

    fn manager() -> (TypingManager, Arc<EventManager>) {
        let event_manager = Arc::new(EventManager::new(100));
        (
            TypingManager::new(event_manager.clone(), TypingConfig::default()),
            event_manager,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_debounce() {
        let (manager, _) = manager();

        assert!(manager.start_typing("c1"));
        assert!(!manager.start_typing("c1"));

        sleep(Duration::from_secs(4)).await;
        assert!(manager.start_typing("c1"));
    }

    #[tokio::test]
    async fn test_stop_typing() {
        let (manager, _) = manager();

        manager.start_typing("c1");
        assert_eq!(manager.get_stats().active_typing_count, 1);

        assert!(manager.stop_typing("c1"));
        assert!(!manager.stop_typing("c1"));
        assert_eq!(manager.get_stats().active_typing_count, 0);
    }

    #[tokio::test]
    async fn test_remote_typing_tracked_per_chat() {
        let (manager, events) = manager();
        let mut rx = events.subscribe();

        manager.handle_typing_change("c1", "bob", true);
        manager.handle_typing_change("c1", "alice", true);
        manager.handle_typing_change("c1", "bob", true);
        manager.handle_typing_change("c2", "carol", true);

        assert_eq!(manager.typing_users("c1"), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(manager.typing_users("c2"), vec!["carol".to_string()]);

        manager.handle_typing_change("c1", "bob", false);
        assert_eq!(manager.typing_users("c1"), vec!["alice".to_string()]);

        let mut indicators = 0;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::TypingIndicator { .. } = event {
                indicators += 1;
            }
        }
        // 重复的 is_typing=true 不重复发事件
        assert_eq!(indicators, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_auto_expires() {
        let (manager, events) = manager();
        manager.handle_typing_change("c1", "bob", true);
        let mut rx = events.subscribe();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.typing_users("c1").is_empty());

        assert_eq!(manager.expire_stale(), 1);
        match rx.try_recv().unwrap() {
            SyncEvent::TypingIndicator { chat_id, user_id, is_typing, .. } => {
                assert_eq!(chat_id, "c1");
                assert_eq!(user_id, "bob");
                assert!(!is_typing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.get_stats().remote_typing_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_cancel() {
        let (manager, _) = manager();
        let cancel = CancellationToken::new();
        manager.start_cleanup_task(cancel.clone());

        manager.handle_typing_change("c1", "bob", true);
        sleep(Duration::from_secs(7)).await;
        assert_eq!(manager.get_stats().remote_typing_count, 0);

        cancel.cancel();
        manager.handle_typing_change("c1", "bob", true);
        sleep(Duration::from_secs(7)).await;
        assert_eq!(manager.get_stats().remote_typing_count, 1);
    }
}
