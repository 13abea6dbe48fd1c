//! 单元测试使用的协作方替身

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::{ChannelTransport, ConnectionId, TransportConnection, TransportEvent, TransportStatus};
use crate::effects::{AppearanceSink, SoundBackend, SoundCue};
use crate::error::{PrivchatSyncError, Result};
use crate::events::ChangeCause;
use crate::notification::{WindowHost, WindowId, WindowInfo};
use crate::optimistic::{ChangeObserver, Persister};
use crate::preferences::{FontSize, PreferenceKey, Theme};
use crate::presence::PresenceStatus;
use crate::store::AuthoritativeStore;
use crate::topic::Topic;

// ---------------------------------------------------------------------------
// 频道传输
// ---------------------------------------------------------------------------

/// 打开连接时的行为
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    /// 握手成功
    Subscribe,
    /// 连接打开后立即报告该状态
    FailWith(TransportStatus),
    /// open 直接返回错误
    OpenError(PrivchatSyncError),
}

#[derive(Default)]
struct TransportState {
    default_behavior: Option<OpenBehavior>,
    behaviors: VecDeque<OpenBehavior>,
    connections: HashMap<ConnectionId, (String, mpsc::UnboundedSender<TransportEvent>)>,
    opened: Vec<(ConnectionId, String, Instant)>,
    open_attempts: Vec<Instant>,
    closed: Vec<ConnectionId>,
}

pub struct MockTransport {
    state: Mutex<TransportState>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            next_id: AtomicU64::new(100),
        }
    }

    pub fn set_default_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().default_behavior = Some(behavior);
    }

    pub fn push_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().behaviors.push_back(behavior);
    }

    /// open 被调用的次数（含失败）
    pub fn open_count(&self) -> usize {
        self.state.lock().open_attempts.len()
    }

    pub fn open_instants(&self) -> Vec<Instant> {
        self.state.lock().open_attempts.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed.len()
    }

    pub fn closed_connections(&self) -> Vec<ConnectionId> {
        self.state.lock().closed.clone()
    }

    pub fn last_connection(&self) -> Option<ConnectionId> {
        self.state.lock().opened.last().map(|(id, _, _)| *id)
    }

    /// 打开过的主题名（按顺序）
    pub fn opened_topics(&self) -> Vec<String> {
        self.state.lock().opened.iter().map(|(_, topic, _)| topic.clone()).collect()
    }

    /// 当前仍打开的某主题连接
    pub fn live_connection(&self, topic: &str) -> Option<ConnectionId> {
        self.state
            .lock()
            .connections
            .iter()
            .find(|(_, (name, _))| name == topic)
            .map(|(id, _)| *id)
    }

    pub fn push(&self, connection: ConnectionId, event: TransportEvent) {
        if let Some((_, sender)) = self.state.lock().connections.get(&connection) {
            let _ = sender.send(event);
        }
    }

    /// 向某主题当前的连接推送消息
    pub fn push_message(&self, topic: &str, payload: Value) {
        if let Some(connection) = self.live_connection(topic) {
            self.push(connection, TransportEvent::Message(payload));
        }
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    async fn open(&self, topic: &Topic) -> Result<TransportConnection> {
        let mut state = self.state.lock();
        state.open_attempts.push(Instant::now());
        let behavior = state
            .behaviors
            .pop_front()
            .or_else(|| state.default_behavior.clone())
            .unwrap_or(OpenBehavior::Subscribe);

        let status = match behavior {
            OpenBehavior::Subscribe => TransportStatus::Subscribed,
            OpenBehavior::FailWith(status) => status,
            OpenBehavior::OpenError(error) => return Err(error),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(status));
        state.connections.insert(id, (topic.name().to_string(), tx));
        state.opened.push((id, topic.name().to_string(), Instant::now()));
        Ok(TransportConnection { id, events: rx })
    }

    async fn close(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.connections.remove(&connection);
        state.closed.push(connection);
    }
}

// ---------------------------------------------------------------------------
// 持久化
// ---------------------------------------------------------------------------

/// 持久化调用的行为
#[derive(Debug, Clone)]
pub enum PersistBehavior {
    Succeed,
    Fail(PrivchatSyncError),
    /// 永不返回
    Hang,
    /// 延迟后成功
    Delay(Duration),
}

impl PersistBehavior {
    async fn run(self) -> Result<()> {
        match self {
            PersistBehavior::Succeed => Ok(()),
            PersistBehavior::Fail(error) => Err(error),
            PersistBehavior::Hang => std::future::pending().await,
            PersistBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct Behaviors {
    queue: Mutex<VecDeque<PersistBehavior>>,
    default: Mutex<Option<PersistBehavior>>,
}

impl Behaviors {
    fn next(&self) -> PersistBehavior {
        self.queue
            .lock()
            .pop_front()
            .or_else(|| self.default.lock().clone())
            .unwrap_or(PersistBehavior::Succeed)
    }
}

pub struct MockPersister<K, V> {
    calls: Mutex<Vec<(K, V)>>,
    behaviors: Behaviors,
}

impl<K: Clone, V: Clone> MockPersister<K, V> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            behaviors: Behaviors::default(),
        }
    }

    pub fn push(&self, behavior: PersistBehavior) {
        self.behaviors.queue.lock().push_back(behavior);
    }

    pub fn set_default(&self, behavior: PersistBehavior) {
        *self.behaviors.default.lock() = Some(behavior);
    }

    pub fn calls(&self) -> Vec<(K, V)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl<K, V> Persister<K, V> for MockPersister<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn persist(&self, key: K, value: V) -> Result<()> {
        self.calls.lock().push((key, value));
        let behavior = self.behaviors.next();
        behavior.run().await
    }
}

/// 权威存储替身
pub struct MockStore {
    preferences: Mutex<HashMap<String, Value>>,
    fetch_error: Mutex<Option<PrivchatSyncError>>,
    behaviors: Behaviors,
    preference_calls: Mutex<Vec<(String, PreferenceKey, Value)>>,
    presence_calls: Mutex<Vec<(String, PresenceStatus)>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            preferences: Mutex::new(HashMap::new()),
            fetch_error: Mutex::new(None),
            behaviors: Behaviors::default(),
            preference_calls: Mutex::new(Vec::new()),
            presence_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_preferences(preferences: Value) -> Self {
        let store = Self::new();
        if let Value::Object(map) = preferences {
            store.preferences.lock().extend(map);
        }
        store
    }

    pub fn fail_fetch(&self, error: PrivchatSyncError) {
        *self.fetch_error.lock() = Some(error);
    }

    pub fn push(&self, behavior: PersistBehavior) {
        self.behaviors.queue.lock().push_back(behavior);
    }

    pub fn set_default(&self, behavior: PersistBehavior) {
        *self.behaviors.default.lock() = Some(behavior);
    }

    pub fn preference_calls(&self) -> Vec<(String, PreferenceKey, Value)> {
        self.preference_calls.lock().clone()
    }

    pub fn presence_calls(&self) -> Vec<(String, PresenceStatus)> {
        self.presence_calls.lock().clone()
    }
}

#[async_trait]
impl AuthoritativeStore for MockStore {
    async fn fetch_preferences(&self, _user_id: &str) -> Result<HashMap<String, Value>> {
        if let Some(error) = self.fetch_error.lock().clone() {
            return Err(error);
        }
        Ok(self.preferences.lock().clone())
    }

    async fn persist_preference(&self, user_id: &str, key: PreferenceKey, value: &Value) -> Result<()> {
        self.preference_calls
            .lock()
            .push((user_id.to_string(), key, value.clone()));
        let behavior = self.behaviors.next();
        behavior.run().await?;
        self.preferences.lock().insert(key.as_str().to_string(), value.clone());
        Ok(())
    }

    async fn persist_presence(&self, user_id: &str, status: PresenceStatus) -> Result<()> {
        self.presence_calls.lock().push((user_id.to_string(), status));
        let behavior = self.behaviors.next();
        behavior.run().await
    }
}

// ---------------------------------------------------------------------------
// 观察者与表现层
// ---------------------------------------------------------------------------

pub struct RecordingObserver<K, V> {
    visible: Mutex<Vec<(K, Option<V>, ChangeCause)>>,
    confirmed: Mutex<Vec<(K, Option<V>)>>,
}

impl<K: PartialEq + Clone, V: Clone> RecordingObserver<K, V> {
    pub fn new() -> Self {
        Self {
            visible: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
        }
    }

    pub fn visible_values(&self, key: K) -> Vec<Option<V>> {
        self.visible
            .lock()
            .iter()
            .filter(|(k, _, _)| *k == key)
            .map(|(_, v, _)| v.clone())
            .collect()
    }

    pub fn confirmed_values(&self, key: K) -> Vec<Option<V>> {
        self.confirmed
            .lock()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn last_cause(&self, key: K) -> Option<ChangeCause> {
        self.visible
            .lock()
            .iter()
            .rev()
            .find(|(k, _, _)| *k == key)
            .map(|(_, _, cause)| *cause)
    }
}

impl<K, V> ChangeObserver<K, V> for RecordingObserver<K, V>
where
    K: Debug + Clone + Send + Sync,
    V: Debug + Clone + Send + Sync,
{
    fn on_visible_change(&self, key: K, value: Option<&V>, cause: ChangeCause) {
        self.visible.lock().push((key, value.cloned(), cause));
    }

    fn on_confirmed_change(&self, key: K, value: Option<&V>) {
        self.confirmed.lock().push((key, value.cloned()));
    }
}

#[derive(Default)]
pub struct RecordingAppearance {
    themes: Mutex<Vec<Theme>>,
    font_scales: Mutex<Vec<f32>>,
}

impl RecordingAppearance {
    pub fn themes(&self) -> Vec<Theme> {
        self.themes.lock().clone()
    }

    pub fn font_scales(&self) -> Vec<f32> {
        self.font_scales.lock().clone()
    }
}

impl AppearanceSink for RecordingAppearance {
    fn set_theme_class(&self, theme: Theme) {
        self.themes.lock().push(theme);
    }

    fn set_font_scale(&self, _font_size: FontSize, scale: f32) {
        self.font_scales.lock().push(scale);
    }
}

#[derive(Default)]
pub struct RecordingSoundBackend {
    played: Mutex<Vec<(SoundCue, f64)>>,
}

impl RecordingSoundBackend {
    pub fn played(&self) -> Vec<(SoundCue, f64)> {
        self.played.lock().clone()
    }
}

impl SoundBackend for RecordingSoundBackend {
    fn play(&self, cue: SoundCue, volume: f64) {
        self.played.lock().push((cue, volume));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowCall {
    Focus(WindowId),
    Navigate(WindowId, String),
    Open(String),
}

pub struct MockWindowHost {
    windows: Mutex<Vec<WindowInfo>>,
    calls: Mutex<Vec<WindowCall>>,
}

impl MockWindowHost {
    pub fn new(windows: Vec<WindowInfo>) -> Self {
        Self {
            windows: Mutex::new(windows),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<WindowCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WindowHost for MockWindowHost {
    async fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        Ok(self.windows.lock().clone())
    }

    async fn focus(&self, window: WindowId) -> Result<()> {
        self.calls.lock().push(WindowCall::Focus(window));
        Ok(())
    }

    async fn navigate(&self, window: WindowId, route: &str) -> Result<()> {
        self.calls.lock().push(WindowCall::Navigate(window, route.to_string()));
        Ok(())
    }

    async fn open_window(&self, route: &str) -> Result<WindowId> {
        let mut windows = self.windows.lock();
        let id = windows.len() as WindowId + 1;
        windows.push(WindowInfo {
            id,
            focused: true,
            visible: true,
        });
        self.calls.lock().push(WindowCall::Open(route.to_string()));
        Ok(id)
    }
}
