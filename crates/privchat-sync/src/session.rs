//! 同步会话
//!
//! 应用根对象：显式创建并持有所有组件（没有全局单例），负责
//! 加载偏好设置、订阅标准主题，并把频道消息分发给对应组件。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::PreferenceCache;
use crate::channel::{ChannelEvent, ChannelManager, ChannelTransport};
use crate::config::SyncConfig;
use crate::effects::{
    AppearanceSink, FontSizeEffect, SideEffectDispatcher, SoundBackend, SoundCue, SoundService,
    SoundSettingsEffect, ThemeEffect,
};
use crate::error::{PrivchatSyncError, Result};
use crate::events::{event_builders, ChangeCause, EventManager, SyncEvent};
use crate::notification::{NotificationContent, NotificationRouter, PushPayload, RouteOutcome, WindowHost};
use crate::optimistic::{ChangeObserver, MutationId, OptimisticStateStore, StoreTiming};
use crate::preferences::{LoadIssue, PreferenceKey, PreferenceMap, PreferenceValue};
use crate::presence::{PresenceManager, PresenceStatus};
use crate::remote::RemoteChange;
use crate::retry_policy::RetryPolicy;
use crate::store::{AuthoritativeStore, PreferencePersister, PresencePersister};
use crate::topic::{Topic, TopicPurpose};
use crate::typing::TypingManager;

/// 外部协作方
pub struct Collaborators {
    pub store: Arc<dyn AuthoritativeStore>,
    pub transport: Arc<dyn ChannelTransport>,
    pub appearance: Arc<dyn AppearanceSink>,
    pub sound: Arc<dyn SoundBackend>,
    pub windows: Arc<dyn WindowHost>,
}

/// 会话健康状态（供 UI 显示“保存失败”或离线提示）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHealth {
    pub saving_failed: bool,
    pub unavailable_topics: Vec<String>,
    pub pending_mutations: usize,
}

/// 偏好设置可见值变化 → 事件
struct PreferenceEvents {
    event_manager: Arc<EventManager>,
}

impl ChangeObserver<PreferenceKey, PreferenceValue> for PreferenceEvents {
    fn on_visible_change(&self, key: PreferenceKey, value: Option<&PreferenceValue>, cause: ChangeCause) {
        let value = value.copied().unwrap_or_else(|| key.default_value());
        self.event_manager
            .emit(event_builders::preference_changed(key, value, cause));
    }
}

type CacheWrite = (PreferenceKey, PreferenceValue);

/// 已确认值 → 缓存写入队列（由写入任务落盘）
struct CacheWriter {
    queue: mpsc::UnboundedSender<CacheWrite>,
}

impl ChangeObserver<PreferenceKey, PreferenceValue> for CacheWriter {
    fn on_visible_change(&self, _key: PreferenceKey, _value: Option<&PreferenceValue>, _cause: ChangeCause) {}

    fn on_confirmed_change(&self, key: PreferenceKey, value: Option<&PreferenceValue>) {
        let value = value.copied().unwrap_or_else(|| key.default_value());
        if self.queue.send((key, value)).is_err() {
            debug!("缓存写入任务已结束，丢弃 {}", key);
        }
    }
}

/// 把队列中已有的写入合并为一批
fn drain_batch(first: CacheWrite, queue: &mut mpsc::UnboundedReceiver<CacheWrite>) -> Vec<CacheWrite> {
    let mut batch = vec![first];
    while let Ok(item) = queue.try_recv() {
        batch.push(item);
    }
    batch
}

async fn write_batch(cache: &PreferenceCache, user_id: Option<&str>, batch: Vec<CacheWrite>) {
    let cache = cache.clone();
    let user_id = user_id.map(str::to_string);
    let count = batch.len();
    match tokio::task::spawn_blocking(move || cache.store_values(user_id.as_deref(), &batch)).await {
        Ok(Ok(())) => debug!("写入 {} 个偏好缓存", count),
        Ok(Err(e)) => warn!("写入偏好缓存失败: {}", e),
        Err(e) => error!("偏好缓存写入任务异常: {}", e),
    }
}

/// 缓存写入任务：批量落盘，关闭时写完剩余队列后退出
async fn run_cache_writer(
    cache: PreferenceCache,
    user_id: Option<String>,
    mut queue: mpsc::UnboundedReceiver<CacheWrite>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let batch = drain_batch(first, &mut queue);
        write_batch(&cache, user_id.as_deref(), batch).await;
    }

    if let Ok(first) = queue.try_recv() {
        let batch = drain_batch(first, &mut queue);
        write_batch(&cache, user_id.as_deref(), batch).await;
    }
    debug!("偏好缓存写入任务退出");
}

/// 频道消息分发
#[derive(Clone)]
struct MessageRouter {
    user_id: Option<String>,
    preferences: OptimisticStateStore<PreferenceKey, PreferenceValue>,
    presence: Arc<PresenceManager>,
    typing: Arc<TypingManager>,
    sound: Arc<SoundService>,
}

impl MessageRouter {
    fn is_self(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    fn route(&self, topic: &Topic, payload: Value) {
        if topic.purpose() == TopicPurpose::ChatMessages {
            debug!("📥 会话 {} 收到新消息", topic.entity_id());
            self.sound.play(SoundCue::MessageReceived);
            return;
        }

        let change = match RemoteChange::from_json(&payload) {
            Ok(change) => change,
            Err(e) => {
                warn!("丢弃频道 {} 上无法解析的消息: {}", topic, e);
                return;
            }
        };

        match change {
            RemoteChange::Preference { key, value } => match RemoteChange::typed_preference(&key, &value) {
                Ok((key, value)) => self.preferences.apply_remote(key, value),
                Err(e) => warn!("丢弃频道 {} 上的偏好变更: {}", topic, e),
            },
            RemoteChange::Presence {
                user_id,
                status,
                last_seen_at,
            } => {
                if self.is_self(&user_id) {
                    self.presence.apply_own_echo(status);
                } else {
                    self.presence
                        .handle_status_change(RemoteChange::presence_record(&user_id, status, last_seen_at));
                }
            }
            RemoteChange::Typing {
                chat_id,
                user_id,
                is_typing,
            } => {
                if !self.is_self(&user_id) {
                    self.typing.handle_typing_change(&chat_id, &user_id, is_typing);
                }
            }
        }
    }
}

struct RouteTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 同步会话
pub struct SyncSession {
    config: SyncConfig,
    user_id: Option<String>,
    store: Arc<dyn AuthoritativeStore>,
    event_manager: Arc<EventManager>,
    channels: ChannelManager,
    preferences: OptimisticStateStore<PreferenceKey, PreferenceValue>,
    sound: Arc<SoundService>,
    presence: Arc<PresenceManager>,
    typing: Arc<TypingManager>,
    notifications: NotificationRouter,
    cache: PreferenceCache,
    router: MessageRouter,
    routes: Mutex<HashMap<String, RouteTask>>,
    cache_queue: Mutex<Option<mpsc::UnboundedReceiver<CacheWrite>>>,
    cache_writer: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl SyncSession {
    /// 创建会话，`user_id` 为 None 表示访客
    pub async fn new(config: SyncConfig, user_id: Option<String>, collaborators: Collaborators) -> Result<Self> {
        let cache = match &config.data_dir {
            Some(dir) => PreferenceCache::open(dir).await?,
            None => PreferenceCache::temporary()?,
        };
        Self::with_cache(config, user_id, collaborators, cache)
    }

    /// 使用已打开的缓存创建会话
    pub fn with_cache(
        config: SyncConfig,
        user_id: Option<String>,
        collaborators: Collaborators,
        cache: PreferenceCache,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(uid) = &user_id {
            // 用户ID必须能组成合法主题名
            Topic::user_direct(uid)?;
        }

        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));
        let timing = StoreTiming {
            watchdog_timeout: config.watchdog_timeout(),
            attempt_timeout: config.persist_attempt_timeout(),
            retry: RetryPolicy::from(&config.persist_retry),
        };
        let channels = ChannelManager::new(
            collaborators.transport,
            RetryPolicy::from(&config.channel_retry),
            event_manager.clone(),
        );

        let sound = Arc::new(SoundService::new(collaborators.sound));
        let effects = Arc::new(SideEffectDispatcher::new());
        effects.register(Arc::new(ThemeEffect::new(collaborators.appearance.clone())));
        effects.register(Arc::new(FontSizeEffect::new(collaborators.appearance)));
        effects.register(Arc::new(SoundSettingsEffect::enabled(sound.clone())));
        effects.register(Arc::new(SoundSettingsEffect::volume(sound.clone())));

        let preferences = OptimisticStateStore::new("preferences", event_manager.clone(), timing.clone());
        preferences.add_observer(effects);
        preferences.add_observer(Arc::new(PreferenceEvents {
            event_manager: event_manager.clone(),
        }));
        let (cache_tx, cache_rx) = mpsc::unbounded_channel();
        preferences.add_observer(Arc::new(CacheWriter { queue: cache_tx }));

        let presence = Arc::new(PresenceManager::new(
            event_manager.clone(),
            config.presence.clone(),
            timing,
        ));
        let typing = Arc::new(TypingManager::new(event_manager.clone(), config.typing.clone()));

        if let Some(uid) = &user_id {
            preferences.attach_persister(Arc::new(PreferencePersister::new(collaborators.store.clone(), uid.clone())));
            presence.attach_persister(Arc::new(PresencePersister::new(collaborators.store.clone(), uid.clone())));
        }

        let router = MessageRouter {
            user_id: user_id.clone(),
            preferences: preferences.clone(),
            presence: presence.clone(),
            typing: typing.clone(),
            sound: sound.clone(),
        };

        Ok(Self {
            notifications: NotificationRouter::new(config.notification.clone(), collaborators.windows),
            config,
            user_id,
            store: collaborators.store,
            event_manager,
            channels,
            preferences,
            sound,
            presence,
            typing,
            cache,
            router,
            routes: Mutex::new(HashMap::new()),
            cache_queue: Mutex::new(Some(cache_rx)),
            cache_writer: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 启动：加载偏好设置并订阅标准主题（重复调用无副作用）
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(PrivchatSyncError::ShuttingDown("会话已关闭".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("同步会话已启动，忽略重复调用");
            return Ok(());
        }

        if let Some(queue) = self.cache_queue.lock().take() {
            let task = tokio::spawn(run_cache_writer(
                self.cache.clone(),
                self.user_id.clone(),
                queue,
                self.shutdown.clone(),
            ));
            *self.cache_writer.lock() = Some(task);
        }

        let map = self.load_preferences().await;
        self.preferences.load_confirmed(map.iter());

        if let Some(uid) = &self.user_id {
            self.presence.load_own_status(PresenceStatus::Available);
            self.spawn_route(Topic::user_direct(uid)?);
            self.spawn_route(Topic::presence(uid)?);
        }

        self.presence.start_cleanup_task(self.shutdown.child_token());
        self.typing.start_cleanup_task(self.shutdown.child_token());

        info!(
            "🚀 同步会话已启动 ({}, user: {})",
            crate::version::client_tag(),
            self.user_id.as_deref().unwrap_or("guest")
        );
        Ok(())
    }

    /// 远端 → 本地缓存 → 默认值
    async fn load_preferences(&self) -> PreferenceMap {
        if let Some(uid) = &self.user_id {
            match self.store.fetch_preferences(uid).await {
                Ok(raw) => {
                    let (map, issues) = PreferenceMap::from_raw(&raw);
                    for issue in issues {
                        match issue {
                            LoadIssue::Missing(key) => debug!("偏好设置 {} 缺失，使用默认值", key),
                            other => warn!("偏好设置加载问题: {:?}", other),
                        }
                    }
                    info!("从权威存储加载偏好设置完成");
                    return map;
                }
                Err(e) => warn!("拉取偏好设置失败，尝试本地缓存: {}", e),
            }
        }

        match self.cache.load(self.user_id.as_deref()) {
            Ok(Some(raw)) => {
                info!("从本地缓存加载偏好设置");
                PreferenceMap::from_raw(&raw).0
            }
            Ok(None) => {
                debug!("没有缓存的偏好设置，使用默认值");
                PreferenceMap::default()
            }
            Err(e) => {
                warn!("读取偏好缓存失败，使用默认值: {}", e);
                PreferenceMap::default()
            }
        }
    }

    fn spawn_route(&self, topic: Topic) {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get(topic.name()) {
            // 频道被传输层关闭后分发任务已结束，重新订阅
            if !route.task.is_finished() {
                return;
            }
            debug!("频道 {} 的分发任务已结束，重新订阅", topic);
        }

        let mut handle = self.channels.subscribe(&topic);
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let channels = self.channels.clone();
        let router = self.router.clone();
        let name = topic.name().to_string();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = handle.next_event() => event,
                };
                match event {
                    Some(ChannelEvent::Message(payload)) => router.route(&topic, payload),
                    Some(ChannelEvent::State(state)) => debug!("频道 {} 状态: {:?}", topic, state),
                    Some(ChannelEvent::Unavailable { attempts }) => {
                        warn!("频道 {} 在 {} 次尝试后不可用", topic, attempts)
                    }
                    None => break,
                }
            }
            channels.close(&mut handle).await;
        });

        routes.insert(name, RouteTask { cancel, task });
    }

    async fn stop_route(&self, topic: &Topic) {
        let route = self.routes.lock().remove(topic.name());
        if let Some(route) = route {
            route.cancel.cancel();
            if let Err(e) = route.task.await {
                error!("频道 {} 的分发任务异常结束: {}", topic, e);
            }
        }
    }

    /// 进入会话：订阅消息与输入状态主题
    pub fn watch_chat(&self, chat_id: &str) -> Result<()> {
        let messages = Topic::chat_messages(chat_id)?;
        let typing = Topic::chat_typing(chat_id)?;
        self.spawn_route(messages);
        self.spawn_route(typing);
        Ok(())
    }

    /// 离开会话
    pub async fn unwatch_chat(&self, chat_id: &str) -> Result<()> {
        self.stop_route(&Topic::chat_messages(chat_id)?).await;
        self.stop_route(&Topic::chat_typing(chat_id)?).await;
        self.typing.clear_chat(chat_id);
        Ok(())
    }

    /// 关注其他用户的在线状态
    pub fn watch_presence(&self, user_id: &str) -> Result<()> {
        self.spawn_route(Topic::presence(user_id)?);
        self.presence.add_subscription(vec![user_id.to_string()]);
        Ok(())
    }

    pub async fn unwatch_presence(&self, user_id: &str) -> Result<()> {
        if self.user_id.as_deref() != Some(user_id) {
            self.stop_route(&Topic::presence(user_id)?).await;
        }
        self.presence.remove_subscription(&[user_id.to_string()]);
        Ok(())
    }

    /// 当前偏好设置值
    pub fn preference(&self, key: PreferenceKey) -> PreferenceValue {
        self.preferences.read(key).unwrap_or_else(|| key.default_value())
    }

    /// 当前全部偏好设置
    pub fn preferences(&self) -> PreferenceMap {
        let mut map = PreferenceMap::default();
        for (key, value) in self.preferences.snapshot() {
            if let Err(e) = map.set(key, value) {
                warn!("忽略非法的偏好设置值: {}", e);
            }
        }
        map
    }

    /// 修改偏好设置
    pub fn propose_preference(&self, key: PreferenceKey, value: PreferenceValue) -> Result<MutationId> {
        self.propose_preference_in(key, value, None)
    }

    /// 在某个视图内修改偏好设置，离开视图时调用 [`leave_view`](Self::leave_view)
    pub fn propose_preference_in(
        &self,
        key: PreferenceKey,
        value: PreferenceValue,
        scope: Option<&str>,
    ) -> Result<MutationId> {
        if !key.accepts(&value) {
            return Err(PrivchatSyncError::InvalidArgument(format!("{} 不接受值 {}", key, value)));
        }
        if let PreferenceValue::Level(level) = value {
            PreferenceValue::level(level)?;
        }
        Ok(self.preferences.propose_scoped(key, value, scope))
    }

    /// 离开视图：取消其看门狗，在途的保存照常完成
    pub fn leave_view(&self, scope: &str) {
        self.preferences.cancel_scope(scope);
        self.presence.own_store().cancel_scope(scope);
    }

    /// 修改自己的在线状态
    pub fn set_presence(&self, status: PresenceStatus) -> MutationId {
        self.presence.set_own_status(status)
    }

    pub fn own_presence(&self) -> PresenceStatus {
        self.presence.own_status()
    }

    /// 开始输入，返回是否需要发送输入通知
    pub fn start_typing(&self, chat_id: &str) -> bool {
        self.typing.start_typing(chat_id)
    }

    pub fn stop_typing(&self, chat_id: &str) -> bool {
        self.typing.stop_typing(chat_id)
    }

    /// 处理推送载荷
    ///
    /// 关闭桌面通知时返回 None；否则返回展示内容并播放提示音。
    pub fn handle_push(&self, raw: Option<&str>) -> Option<NotificationContent> {
        if self.preference(PreferenceKey::DesktopNotifications).as_bool() == Some(false) {
            debug!("桌面通知已关闭，忽略推送");
            return None;
        }
        let content = self.notifications.render(&PushPayload::parse(raw));
        self.sound.play(SoundCue::Notification);
        Some(content)
    }

    /// 点击通知
    pub async fn open_notification(&self, content: &NotificationContent) -> Result<RouteOutcome> {
        self.notifications.handle_click(content).await
    }

    pub fn health(&self) -> SessionHealth {
        let own = self.presence.own_store();
        SessionHealth {
            saving_failed: self.preferences.saving_failed() || own.saving_failed(),
            unavailable_topics: self
                .channels
                .unavailable_topics()
                .into_iter()
                .map(|topic| topic.name().to_string())
                .collect(),
            pending_mutations: self.preferences.pending_count() + own.pending_count(),
        }
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn typing(&self) -> &TypingManager {
        &self.typing
    }

    pub fn sound(&self) -> &SoundService {
        &self.sound
    }

    /// 关闭会话：停止分发任务并释放所有频道（在途保存不取消）
    pub async fn shutdown(&self) {
        info!("🛑 关闭同步会话");
        self.shutdown.cancel();

        let routes: Vec<(String, RouteTask)> = self.routes.lock().drain().collect();
        for (name, route) in routes {
            route.cancel.cancel();
            if let Err(e) = route.task.await {
                error!("频道 {} 的分发任务异常结束: {}", name, e);
            }
        }
        self.channels.close_all().await;

        let writer = self.cache_writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("偏好缓存写入任务异常结束: {}", e);
            }
        }
        let unstarted = self.cache_queue.lock().take();
        if let Some(mut queue) = unstarted {
            if let Ok(first) = queue.try_recv() {
                write_batch(&self.cache, self.user_id.as_deref(), drain_batch(first, &mut queue)).await;
            }
        }

        if let Err(e) = self.cache.flush().await {
            warn!("刷新偏好缓存失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TransportEvent, TransportStatus};
    use crate::preferences::Theme;
    use crate::testing::{
        MockStore, MockTransport, MockWindowHost, PersistBehavior, RecordingAppearance, RecordingSoundBackend,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        session: SyncSession,
        store: Arc<MockStore>,
        transport: Arc<MockTransport>,
        appearance: Arc<RecordingAppearance>,
        sound: Arc<RecordingSoundBackend>,
    }

    fn fixture_with_cache(user_id: Option<&str>, store: MockStore, cache: PreferenceCache) -> Fixture {
        let store = Arc::new(store);
        let transport = Arc::new(MockTransport::new());
        let appearance = Arc::new(RecordingAppearance::default());
        let sound = Arc::new(RecordingSoundBackend::default());
        let collaborators = Collaborators {
            store: store.clone(),
            transport: transport.clone(),
            appearance: appearance.clone(),
            sound: sound.clone(),
            windows: Arc::new(MockWindowHost::new(vec![])),
        };
        let session = SyncSession::with_cache(
            SyncConfig::default(),
            user_id.map(str::to_string),
            collaborators,
            cache,
        )
        .unwrap();
        Fixture {
            session,
            store,
            transport,
            appearance,
            sound,
        }
    }

    fn fixture(user_id: Option<&str>, store: MockStore) -> Fixture {
        fixture_with_cache(user_id, store, PreferenceCache::temporary().unwrap())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_theme_change_stays_local() {
        let f = fixture(None, MockStore::new());
        f.session.start().await.unwrap();

        f.session
            .propose_preference(PreferenceKey::Theme, PreferenceValue::Theme(Theme::Dark))
            .unwrap();
        assert_eq!(f.session.preference(PreferenceKey::Theme), PreferenceValue::Theme(Theme::Dark));
        settle().await;

        assert!(f.store.preference_calls().is_empty());
        assert_eq!(f.transport.open_count(), 0);
        assert_eq!(f.appearance.themes(), vec![Theme::System, Theme::Dark]);
        assert!(!f.session.health().saving_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_in_start_loads_remote_and_applies_echoes() {
        let store = MockStore::with_preferences(json!({"theme": "dark", "fontSize": "large", "wallpaper": "x"}));
        let f = fixture(Some("u1"), store);
        f.session.start().await.unwrap();

        assert_eq!(f.session.preference(PreferenceKey::Theme), PreferenceValue::Theme(Theme::Dark));
        assert_eq!(
            f.session.preference(PreferenceKey::SoundVolume),
            PreferenceKey::SoundVolume.default_value()
        );
        settle().await;

        let mut topics = f.transport.opened_topics();
        topics.sort();
        assert_eq!(topics, vec!["presence:u1".to_string(), "user:u1".to_string()]);

        // 其他会话修改了主题
        f.transport
            .push_message("user:u1", json!({"type": "preference", "key": "theme", "value": "light"}));
        // 格式错误的消息被丢弃
        f.transport.push_message("user:u1", json!({"type": "preference", "key": "theme"}));
        settle().await;

        assert_eq!(f.session.preference(PreferenceKey::Theme), PreferenceValue::Theme(Theme::Light));
        assert_eq!(f.appearance.themes(), vec![Theme::Dark, Theme::Light]);
        assert!(f.store.preference_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_volume_changes_settle_on_last_value() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();

        for volume in [0.1, 0.2, 0.3, 0.4, 0.5] {
            f.session
                .propose_preference(PreferenceKey::SoundVolume, PreferenceValue::Level(volume))
                .unwrap();
        }
        assert_eq!(f.session.preference(PreferenceKey::SoundVolume), PreferenceValue::Level(0.5));
        settle().await;

        assert_eq!(f.session.preference(PreferenceKey::SoundVolume), PreferenceValue::Level(0.5));
        assert_eq!(f.store.preference_calls().len(), 5);
        assert_eq!(f.session.health().pending_mutations, 0);
        assert_eq!(f.session.sound().volume(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_save_reverts_and_reports_health() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();
        f.store
            .push(PersistBehavior::Fail(PrivchatSyncError::store(Some("42501"), "permission denied")));
        let mut events = f.session.subscribe_events();

        f.session
            .propose_preference(PreferenceKey::CompactView, PreferenceValue::Bool(true))
            .unwrap();
        settle().await;

        assert_eq!(f.session.preference(PreferenceKey::CompactView), PreferenceValue::Bool(false));
        assert!(f.session.health().saving_failed);
        assert_eq!(f.store.preference_calls().len(), 1);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::MutationFailed { key, .. } = event {
                assert_eq!(key, "compactView");
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_proposals_are_rejected() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();

        assert!(f
            .session
            .propose_preference(PreferenceKey::SoundVolume, PreferenceValue::Level(1.5))
            .is_err());
        assert!(f
            .session
            .propose_preference(PreferenceKey::Theme, PreferenceValue::Bool(true))
            .is_err());
        assert_eq!(f.session.health().pending_mutations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_falls_back_to_cache() {
        let cache = PreferenceCache::temporary().unwrap();
        let mut cached = PreferenceMap::default();
        cached
            .set(PreferenceKey::Theme, PreferenceValue::Theme(Theme::Dark))
            .unwrap();
        cache.store_map(Some("u1"), &cached).unwrap();

        let store = MockStore::new();
        store.fail_fetch(PrivchatSyncError::Transport("offline".into()));
        let f = fixture_with_cache(Some("u1"), store, cache);
        f.session.start().await.unwrap();

        assert_eq!(f.session.preference(PreferenceKey::Theme), PreferenceValue::Theme(Theme::Dark));
        assert_eq!(f.session.preferences(), cached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_chat_routes_typing_and_messages() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();
        f.session.watch_chat("c1").unwrap();
        f.session.watch_chat("c1").unwrap();
        settle().await;

        let typing_topic = Topic::chat_typing("c1").unwrap();
        assert_eq!(f.session.channels().ref_count(&typing_topic), 1);

        f.transport.push_message(
            "chat:c1:typing",
            json!({"type": "typing", "chatId": "c1", "userId": "u2", "isTyping": true}),
        );
        f.transport.push_message(
            "chat:c1:typing",
            json!({"type": "typing", "chatId": "c1", "userId": "u1", "isTyping": true}),
        );
        f.transport.push_message("chat:c1:messages", json!({"id": "m1"}));
        settle().await;

        assert_eq!(f.session.typing().typing_users("c1"), vec!["u2".to_string()]);
        assert_eq!(f.sound.played(), vec![(SoundCue::MessageReceived, 0.7)]);

        f.session.unwatch_chat("c1").await.unwrap();
        assert_eq!(f.session.channels().ref_count(&typing_topic), 0);
        assert!(f.session.typing().typing_users("c1").is_empty());
        assert_eq!(f.transport.close_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_routing() {
        let store = MockStore::new();
        store.set_default(PersistBehavior::Hang);
        let f = fixture(Some("u1"), store);
        f.session.start().await.unwrap();
        f.session.watch_presence("u2").unwrap();
        settle().await;

        f.session.set_presence(PresenceStatus::Busy);
        assert_eq!(f.session.own_presence(), PresenceStatus::Busy);
        assert_eq!(f.session.health().pending_mutations, 1);

        f.transport
            .push_message("presence:u1", json!({"type": "presence", "userId": "u1", "status": "busy"}));
        f.transport.push_message(
            "presence:u2",
            json!({"type": "presence", "userId": "u2", "status": "invisible", "lastSeenAt": 42}),
        );
        settle().await;

        assert_eq!(f.session.health().pending_mutations, 0);
        assert_eq!(f.session.presence().own_store().confirmed(crate::presence::PresenceSlot), Some(PresenceStatus::Busy));
        let u2 = f.session.presence().get_status("u2").unwrap();
        assert_eq!(u2.status, PresenceStatus::Invisible);
        assert_eq!(u2.last_seen_at, 42);
        assert_eq!(f.store.presence_calls(), vec![("u1".to_string(), PresenceStatus::Busy)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_notifications_follow_preferences() {
        let f = fixture(None, MockStore::new());
        f.session.start().await.unwrap();

        let content = f
            .session
            .handle_push(Some(r#"{"body":"hey","data":{"chatId":"c1","messageId":"m9"}}"#))
            .unwrap();
        assert_eq!(content.body, "hey");
        assert_eq!(content.route, "/chat/c1#m9");
        assert_eq!(f.sound.played(), vec![(SoundCue::Notification, 0.7)]);

        let outcome = f.session.open_notification(&content).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Opened { .. }));

        f.session
            .propose_preference(PreferenceKey::DesktopNotifications, PreferenceValue::Bool(false))
            .unwrap();
        assert!(f.session.handle_push(Some("{}")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_keeps_state_and_channels() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();
        f.session.set_presence(PresenceStatus::Busy);
        settle().await;
        assert_eq!(f.transport.open_count(), 2);

        f.session.start().await.unwrap();
        settle().await;

        assert_eq!(f.session.own_presence(), PresenceStatus::Busy);
        assert_eq!(f.transport.open_count(), 2);
        assert_eq!(f.session.channels().ref_count(&Topic::presence("u1").unwrap()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_chat_reopens_after_transport_close() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();
        f.session.watch_chat("c1").unwrap();
        settle().await;
        assert_eq!(f.transport.open_count(), 4);

        let messages = Topic::chat_messages("c1").unwrap();
        let connection = f.transport.live_connection(messages.name()).unwrap();
        f.transport
            .push(connection, TransportEvent::Status(TransportStatus::Closed));
        settle().await;
        assert_eq!(f.session.channels().state(&messages), None);

        f.session.watch_chat("c1").unwrap();
        settle().await;

        assert_eq!(f.transport.open_count(), 5);
        assert_eq!(f.session.channels().ref_count(&messages), 1);
        f.transport.push_message(messages.name(), json!({"id": "m2"}));
        settle().await;
        assert_eq!(f.sound.played(), vec![(SoundCue::MessageReceived, 0.7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_preferences_reach_cache_by_shutdown() {
        let cache = PreferenceCache::temporary().unwrap();
        let f = fixture_with_cache(Some("u1"), MockStore::new(), cache.clone());
        f.session.start().await.unwrap();

        f.session
            .propose_preference(PreferenceKey::Theme, PreferenceValue::Theme(Theme::Dark))
            .unwrap();
        f.session
            .propose_preference(PreferenceKey::CompactView, PreferenceValue::Bool(true))
            .unwrap();
        settle().await;
        f.session.shutdown().await;

        let raw = cache.load(Some("u1")).unwrap().unwrap();
        assert_eq!(raw.get("theme"), Some(&json!("dark")));
        assert_eq!(raw.get("compactView"), Some(&json!(true)));
        assert!(cache.load(None).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_all_channels() {
        let f = fixture(Some("u1"), MockStore::new());
        f.session.start().await.unwrap();
        f.session.watch_chat("c9").unwrap();
        settle().await;
        assert_eq!(f.transport.open_count(), 4);

        f.session.shutdown().await;

        assert_eq!(f.transport.close_count(), 4);
        assert!(f.session.channels().active_topics().is_empty());
        assert!(f.session.start().await.is_err());
    }
}
