//! 事件系统模块 - 向 UI 层广播同步状态变化
//!
//! 功能包括：
//! - 偏好设置可见值变更事件（含回滚）
//! - 乐观更新确认/失败事件
//! - 频道订阅状态事件
//! - 在线状态、输入状态事件
//! - 事件广播和订阅机制

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::channel::SubscriptionState;
use crate::preferences::{PreferenceKey, PreferenceValue};
use crate::presence::PresenceStatus;

/// 可见值变化的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    /// 初次加载
    Loaded,
    /// 本地乐观更新
    LocalProposal,
    /// 远端回显或其他会话的修改
    Remote,
    /// 失败或超时后的回滚
    Reverted,
}

/// 同步层事件
#[derive(Debug, Clone, Serialize)]
pub enum SyncEvent {
    /// 偏好设置可见值变更
    PreferenceChanged {
        key: PreferenceKey,
        value: PreferenceValue,
        cause: ChangeCause,
        timestamp: i64,
    },
    /// 乐观更新已被确认
    MutationResolved {
        key: String,
        mutation_id: String,
        timestamp: i64,
    },
    /// 乐观更新失败（显式失败或看门狗超时，对 UI 而言无区别）
    MutationFailed {
        key: String,
        mutation_id: String,
        reason: String,
        timestamp: i64,
    },
    /// 频道订阅状态变更
    ChannelStateChanged {
        topic: String,
        state: SubscriptionState,
        timestamp: i64,
    },
    /// 频道重试预算耗尽
    ChannelUnavailable {
        topic: String,
        attempts: u32,
        timestamp: i64,
    },
    /// 其他用户在线状态变更
    UserPresenceChanged {
        user_id: String,
        status: PresenceStatus,
        last_seen_at: i64,
        timestamp: i64,
    },
    /// 本会话自己的在线状态可见值变更
    OwnPresenceChanged {
        status: PresenceStatus,
        cause: ChangeCause,
        timestamp: i64,
    },
    /// 正在输入指示器
    TypingIndicator {
        chat_id: String,
        user_id: String,
        is_typing: bool,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::PreferenceChanged { .. } => "preference_changed",
            SyncEvent::MutationResolved { .. } => "mutation_resolved",
            SyncEvent::MutationFailed { .. } => "mutation_failed",
            SyncEvent::ChannelStateChanged { .. } => "channel_state_changed",
            SyncEvent::ChannelUnavailable { .. } => "channel_unavailable",
            SyncEvent::UserPresenceChanged { .. } => "user_presence_changed",
            SyncEvent::OwnPresenceChanged { .. } => "own_presence_changed",
            SyncEvent::TypingIndicator { .. } => "typing_indicator",
        }
    }

    /// 获取事件关联的主题名
    pub fn topic(&self) -> Option<&str> {
        match self {
            SyncEvent::ChannelStateChanged { topic, .. } => Some(topic),
            SyncEvent::ChannelUnavailable { topic, .. } => Some(topic),
            _ => None,
        }
    }

    /// 获取事件相关的用户ID
    pub fn user_id(&self) -> Option<&str> {
        match self {
            SyncEvent::UserPresenceChanged { user_id, .. } => Some(user_id),
            SyncEvent::TypingIndicator { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::PreferenceChanged { timestamp, .. }
            | SyncEvent::MutationResolved { timestamp, .. }
            | SyncEvent::MutationFailed { timestamp, .. }
            | SyncEvent::ChannelStateChanged { timestamp, .. }
            | SyncEvent::ChannelUnavailable { timestamp, .. }
            | SyncEvent::UserPresenceChanged { timestamp, .. }
            | SyncEvent::OwnPresenceChanged { timestamp, .. }
            | SyncEvent::TypingIndicator { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 主题过滤器
    pub topics: Option<Vec<String>>,
    /// 用户ID过滤器
    pub user_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn with_user_ids(mut self, user_ids: Vec<String>) -> Self {
        self.user_ids = Some(user_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref topics) = self.topics {
            match event.topic() {
                Some(topic) if topics.iter().any(|t| t == topic) => {}
                _ => return false, // 事件没有主题但过滤器要求有
            }
        }

        if let Some(ref user_ids) = self.user_ids {
            match event.user_id() {
                Some(user_id) if user_ids.iter().any(|u| u == user_id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
///
/// `emit` 是同步的：事件在状态变更的同一执行片段内发出，不跨越 await。
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端），仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`event_type` 为 `"*"` 时监听全部事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn preference_changed(key: PreferenceKey, value: PreferenceValue, cause: ChangeCause) -> SyncEvent {
        SyncEvent::PreferenceChanged {
            key,
            value,
            cause,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_resolved(key: String, mutation_id: String) -> SyncEvent {
        SyncEvent::MutationResolved {
            key,
            mutation_id,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_failed(key: String, mutation_id: String, reason: String) -> SyncEvent {
        SyncEvent::MutationFailed {
            key,
            mutation_id,
            reason,
            timestamp: now_millis(),
        }
    }

    pub fn channel_state_changed(topic: &str, state: SubscriptionState) -> SyncEvent {
        SyncEvent::ChannelStateChanged {
            topic: topic.to_string(),
            state,
            timestamp: now_millis(),
        }
    }

    pub fn channel_unavailable(topic: &str, attempts: u32) -> SyncEvent {
        SyncEvent::ChannelUnavailable {
            topic: topic.to_string(),
            attempts,
            timestamp: now_millis(),
        }
    }

    pub fn user_presence_changed(user_id: &str, status: PresenceStatus, last_seen_at: i64) -> SyncEvent {
        SyncEvent::UserPresenceChanged {
            user_id: user_id.to_string(),
            status,
            last_seen_at,
            timestamp: now_millis(),
        }
    }

    pub fn own_presence_changed(status: PresenceStatus, cause: ChangeCause) -> SyncEvent {
        SyncEvent::OwnPresenceChanged {
            status,
            cause,
            timestamp: now_millis(),
        }
    }

    pub fn typing_indicator(chat_id: &str, user_id: &str, is_typing: bool) -> SyncEvent {
        SyncEvent::TypingIndicator {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            is_typing,
            timestamp: now_millis(),
        }
    }
}
