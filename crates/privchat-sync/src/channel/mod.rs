//! 频道订阅管理模块
//!
//! 功能包括：
//! - 按主题名去重订阅，多个订阅者共享同一个传输连接（引用计数）
//! - 按到达顺序向订阅者转发传输层的状态与消息
//! - Error / TimedOut 后指数退避重连，预算耗尽后报告 ChannelUnavailable
//! - 传输层关闭时注销主题，订阅流结束，之后的订阅重新打开连接
//! - 幂等关闭：传输连接只释放一次

mod transport;

pub use transport::{ChannelTransport, ConnectionId, TransportConnection, TransportEvent, TransportStatus};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PrivchatSyncError;
use crate::events::{event_builders, EventManager};
use crate::retry_policy::RetryPolicy;
use crate::topic::Topic;

/// 订阅状态（仅由传输层报告驱动）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    Error,
    Closed,
}

/// 投递给订阅者的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// 状态变更
    State(SubscriptionState),
    /// 主题消息
    Message(Value),
    /// 重试预算耗尽，频道不可用
    Unavailable { attempts: u32 },
}

type SubscriberId = u64;

struct ChannelEntry {
    topic: Topic,
    generation: u64,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<ChannelEvent>>,
    state: SubscriptionState,
    connection: Option<ConnectionId>,
    cancel: CancellationToken,
    /// 重试预算耗尽后的尝试次数
    exhausted: Option<u32>,
}

/// 广播结果
enum Delivery {
    Delivered,
    /// 条目已不存在或所有订阅者已离开，需要释放的连接
    Orphaned(Option<ConnectionId>),
}

struct ChannelInner {
    transport: Arc<dyn ChannelTransport>,
    policy: RetryPolicy,
    event_manager: Arc<EventManager>,
    entries: Mutex<HashMap<String, ChannelEntry>>,
    next_id: AtomicU64,
}

/// 频道订阅管理器
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
}

/// 订阅句柄
///
/// 实现了 [`Stream`]，按顺序产出该主题的 [`ChannelEvent`]。
/// 句柄被丢弃而未关闭时，下一次投递会发现并释放它占用的引用。
pub struct SubscriptionHandle {
    id: SubscriberId,
    generation: u64,
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<ChannelEvent>,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 接收下一个事件，订阅被关闭后返回 None
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }
}

impl Stream for SubscriptionHandle {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        policy: RetryPolicy,
        event_manager: Arc<EventManager>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                policy,
                event_manager,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 订阅主题（已存在时复用连接）
    pub fn subscribe(&self, topic: &Topic) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut entries = self.inner.entries.lock();
        let generation = match entries.get_mut(topic.name()) {
            Some(entry) => {
                // 迟到的订阅者先拿到当前状态
                let _ = tx.send(ChannelEvent::State(entry.state));
                if let Some(attempts) = entry.exhausted {
                    // 不可用的频道：有新订阅者时重新开始一轮重连
                    info!("频道 {} 此前不可用（{} 次尝试），重新连接", topic, attempts);
                    entry.exhausted = None;
                    entry.state = SubscriptionState::Connecting;
                    entry.cancel = CancellationToken::new();
                    for sender in entry.subscribers.values() {
                        let _ = sender.send(ChannelEvent::State(SubscriptionState::Connecting));
                    }
                    let _ = tx.send(ChannelEvent::State(SubscriptionState::Connecting));
                    self.spawn_pump(topic.clone(), entry.generation, entry.cancel.clone());
                }
                entry.subscribers.insert(id, tx);
                debug!("复用频道 {}，引用计数: {}", topic, entry.subscribers.len());
                entry.generation
            }
            None => {
                let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let _ = tx.send(ChannelEvent::State(SubscriptionState::Connecting));
                let mut subscribers = HashMap::new();
                subscribers.insert(id, tx);
                entries.insert(
                    topic.name().to_string(),
                    ChannelEntry {
                        topic: topic.clone(),
                        generation,
                        subscribers,
                        state: SubscriptionState::Connecting,
                        connection: None,
                        cancel: cancel.clone(),
                        exhausted: None,
                    },
                );
                info!("📡 打开频道: {}", topic);
                self.spawn_pump(topic.clone(), generation, cancel);
                generation
            }
        };
        drop(entries);

        SubscriptionHandle {
            id,
            generation,
            topic: topic.clone(),
            receiver: rx,
            closed: false,
        }
    }

    /// 关闭订阅（幂等）
    ///
    /// 最后一个订阅者离开时才真正关闭传输连接。
    pub async fn close(&self, handle: &mut SubscriptionHandle) {
        if handle.closed {
            return;
        }
        handle.closed = true;

        let released = {
            let mut entries = self.inner.entries.lock();
            let last = match entries.get_mut(handle.topic.name()) {
                Some(entry) if entry.generation == handle.generation => {
                    entry.subscribers.remove(&handle.id);
                    debug!("关闭订阅 {}，剩余引用: {}", handle.topic, entry.subscribers.len());
                    entry.subscribers.is_empty()
                }
                _ => false,
            };
            if last {
                entries.remove(handle.topic.name()).map(|entry| {
                    entry.cancel.cancel();
                    entry.connection
                })
            } else {
                None
            }
        };

        if let Some(connection) = released {
            info!("🔌 频道 {} 无订阅者，释放传输连接", handle.topic);
            if let Some(connection) = connection {
                self.inner.transport.close(connection).await;
            }
            self.inner
                .event_manager
                .emit(event_builders::channel_state_changed(handle.topic.name(), SubscriptionState::Closed));
        }
        handle.receiver.close();
    }

    /// 关闭所有频道
    pub async fn close_all(&self) {
        let drained: Vec<ChannelEntry> = self.inner.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.cancel.cancel();
            if let Some(connection) = entry.connection {
                self.inner.transport.close(connection).await;
            }
            info!("🔌 关闭频道: {}", entry.topic);
        }
    }

    /// 当前某主题的引用计数（未订阅时为 0）
    pub fn ref_count(&self, topic: &Topic) -> usize {
        self.inner
            .entries
            .lock()
            .get(topic.name())
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// 当前某主题的订阅状态
    pub fn state(&self, topic: &Topic) -> Option<SubscriptionState> {
        self.inner.entries.lock().get(topic.name()).map(|entry| entry.state)
    }

    /// 所有活跃主题
    pub fn active_topics(&self) -> Vec<Topic> {
        self.inner
            .entries
            .lock()
            .values()
            .map(|entry| entry.topic.clone())
            .collect()
    }

    /// 已耗尽重试预算的主题
    pub fn unavailable_topics(&self) -> Vec<Topic> {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| entry.exhausted.is_some())
            .map(|entry| entry.topic.clone())
            .collect()
    }

    fn spawn_pump(&self, topic: Topic, generation: u64, cancel: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.pump(topic, generation, cancel).await;
        });
    }
}

impl ChannelInner {
    /// 每个主题一个泵任务，保证同一主题事件的顺序
    async fn pump(self: Arc<Self>, topic: Topic, generation: u64, cancel: CancellationToken) {
        let mut retries: u32 = 0;

        loop {
            if retries > 0 {
                if let Delivery::Orphaned(_) =
                    self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Connecting))
                {
                    return;
                }
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.transport.open(&topic) => opened,
            };

            let failure = match opened {
                Ok(mut connection) => {
                    if !self.attach(&topic, generation, connection.id) {
                        // 打开期间订阅已全部关闭
                        self.transport.close(connection.id).await;
                        return;
                    }

                    let failure = loop {
                        let event = tokio::select! {
                            _ = cancel.cancelled() => return,
                            event = connection.events.recv() => event,
                        };
                        let (delivery, outcome) = match event {
                            Some(TransportEvent::Status(TransportStatus::Subscribed)) => {
                                retries = 0;
                                (self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Subscribed)), None)
                            }
                            Some(TransportEvent::Status(TransportStatus::Error(message))) => (
                                self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Error)),
                                Some(Some(PrivchatSyncError::Transport(message))),
                            ),
                            Some(TransportEvent::Status(TransportStatus::TimedOut)) => (
                                self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Error)),
                                Some(Some(PrivchatSyncError::Timeout(format!("订阅超时: {}", topic)))),
                            ),
                            Some(TransportEvent::Status(TransportStatus::Closed)) => (
                                self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Closed)),
                                Some(None),
                            ),
                            Some(TransportEvent::Message(payload)) => {
                                (self.deliver(&topic, generation, ChannelEvent::Message(payload)), None)
                            }
                            None => (
                                self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Error)),
                                Some(Some(PrivchatSyncError::Transport("事件流意外结束".to_string()))),
                            ),
                        };

                        if let Delivery::Orphaned(orphan) = delivery {
                            if let Some(id) = orphan {
                                self.transport.close(id).await;
                            }
                            return;
                        }
                        if let Some(outcome) = outcome {
                            break outcome;
                        }
                    };

                    if let Some(id) = self.detach(&topic, generation) {
                        self.transport.close(id).await;
                    }
                    failure
                }
                Err(e) => {
                    if let Delivery::Orphaned(_) =
                        self.deliver(&topic, generation, ChannelEvent::State(SubscriptionState::Error))
                    {
                        return;
                    }
                    Some(e)
                }
            };

            let error = match failure {
                Some(error) => error,
                None => {
                    info!("频道 {} 被传输层关闭，注销主题", topic);
                    self.retire(&topic, generation);
                    return;
                }
            };

            let delay = if error.is_retryable() {
                self.policy.delay_for(retries)
            } else {
                None
            };

            match delay {
                Some(delay) => {
                    retries += 1;
                    warn!("频道 {} 出错: {}，{:?} 后第 {} 次重连", topic, error, delay, retries);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let attempts = retries + 1;
                    warn!("❌ 频道 {} 不可用（{} 次尝试）: {}", topic, attempts, error);
                    self.mark_exhausted(&topic, generation, attempts);
                    return;
                }
            }
        }
    }

    /// 向所有订阅者投递事件，并顺带清理已丢弃的句柄
    fn deliver(&self, topic: &Topic, generation: u64, event: ChannelEvent) -> Delivery {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(topic.name()) {
            Some(entry) if entry.generation == generation => entry,
            _ => return Delivery::Orphaned(None),
        };

        let state_changed = match event {
            ChannelEvent::State(state) => {
                let changed = entry.state != state;
                entry.state = state;
                changed
            }
            _ => false,
        };

        entry
            .subscribers
            .retain(|_, sender| sender.send(event.clone()).is_ok());

        if entry.subscribers.is_empty() {
            debug!("频道 {} 的订阅者已全部丢弃句柄", topic);
            let connection = entries.remove(topic.name()).and_then(|entry| {
                entry.cancel.cancel();
                entry.connection
            });
            return Delivery::Orphaned(connection);
        }
        drop(entries);

        if state_changed {
            if let ChannelEvent::State(state) = event {
                self.event_manager
                    .emit(event_builders::channel_state_changed(topic.name(), state));
            }
        }
        Delivery::Delivered
    }

    fn attach(&self, topic: &Topic, generation: u64, connection: ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(topic.name()) {
            Some(entry) if entry.generation == generation && !entry.cancel.is_cancelled() => {
                entry.connection = Some(connection);
                true
            }
            _ => false,
        }
    }

    fn detach(&self, topic: &Topic, generation: u64) -> Option<ConnectionId> {
        let mut entries = self.entries.lock();
        match entries.get_mut(topic.name()) {
            Some(entry) if entry.generation == generation => entry.connection.take(),
            _ => None,
        }
    }

    /// 注销主题：丢弃订阅者的发送端，订阅流随之结束
    fn retire(&self, topic: &Topic, generation: u64) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(topic.name()), Some(entry) if entry.generation == generation) {
            if let Some(entry) = entries.remove(topic.name()) {
                entry.cancel.cancel();
                debug!("频道 {} 已注销，{} 个订阅者的流结束", topic, entry.subscribers.len());
            }
        }
    }

    fn mark_exhausted(&self, topic: &Topic, generation: u64, attempts: u32) {
        {
            let mut entries = self.entries.lock();
            let entry = match entries.get_mut(topic.name()) {
                Some(entry) if entry.generation == generation => entry,
                _ => return,
            };
            entry.exhausted = Some(attempts);
            entry.state = SubscriptionState::Error;
            for sender in entry.subscribers.values() {
                let _ = sender.send(ChannelEvent::Unavailable { attempts });
            }
        }
        self.event_manager
            .emit(event_builders::channel_unavailable(topic.name(), attempts));
    }
}
