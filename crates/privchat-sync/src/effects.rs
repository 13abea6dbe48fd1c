//! 偏好设置副作用
//!
//! 每个副作用只依赖一个键的可见值，可见值变化（包括回滚）时执行。
//! 调度器记录每个副作用最后应用的值，重复值直接跳过。
//! 副作用只拿到值本身，拿不到存储句柄。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::events::ChangeCause;
use crate::optimistic::ChangeObserver;
use crate::preferences::{FontSize, PreferenceKey, PreferenceMap, PreferenceValue, Theme};

/// 副作用
pub trait SideEffect: Send + Sync {
    /// 唯一名称，用于去重记录
    fn name(&self) -> &'static str;

    /// 关注的键
    fn key(&self) -> PreferenceKey;

    fn apply(&self, value: &PreferenceValue);
}

/// 副作用调度器
#[derive(Default)]
pub struct SideEffectDispatcher {
    effects: RwLock<Vec<Arc<dyn SideEffect>>>,
    last_applied: Mutex<HashMap<&'static str, PreferenceValue>>,
}

impl SideEffectDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, effect: Arc<dyn SideEffect>) {
        debug!("注册副作用 {} ({})", effect.name(), effect.key());
        self.effects.write().push(effect);
    }

    /// 把一个键的可见值分发给关注它的副作用，返回实际执行的数量
    pub fn dispatch(&self, key: PreferenceKey, value: &PreferenceValue) -> usize {
        let effects: Vec<Arc<dyn SideEffect>> = self
            .effects
            .read()
            .iter()
            .filter(|effect| effect.key() == key)
            .cloned()
            .collect();

        let mut applied = 0;
        for effect in effects {
            {
                let mut last = self.last_applied.lock();
                if last.get(effect.name()) == Some(value) {
                    continue;
                }
                last.insert(effect.name(), *value);
            }
            effect.apply(value);
            applied += 1;
        }
        applied
    }

    /// 用完整映射初始化所有副作用
    pub fn prime(&self, map: &PreferenceMap) {
        for (key, value) in map.iter() {
            self.dispatch(key, &value);
        }
    }
}

impl ChangeObserver<PreferenceKey, PreferenceValue> for SideEffectDispatcher {
    fn on_visible_change(&self, key: PreferenceKey, value: Option<&PreferenceValue>, _cause: ChangeCause) {
        let default_value = key.default_value();
        self.dispatch(key, value.unwrap_or(&default_value));
    }
}

/// 外观输出（由表现层实现）
pub trait AppearanceSink: Send + Sync {
    fn set_theme_class(&self, theme: Theme);
    fn set_font_scale(&self, font_size: FontSize, scale: f32);
}

/// 主题副作用
pub struct ThemeEffect {
    sink: Arc<dyn AppearanceSink>,
}

impl ThemeEffect {
    pub fn new(sink: Arc<dyn AppearanceSink>) -> Self {
        Self { sink }
    }
}

impl SideEffect for ThemeEffect {
    fn name(&self) -> &'static str {
        "theme"
    }

    fn key(&self) -> PreferenceKey {
        PreferenceKey::Theme
    }

    fn apply(&self, value: &PreferenceValue) {
        if let PreferenceValue::Theme(theme) = value {
            self.sink.set_theme_class(*theme);
        }
    }
}

/// 字号副作用
pub struct FontSizeEffect {
    sink: Arc<dyn AppearanceSink>,
}

impl FontSizeEffect {
    pub fn new(sink: Arc<dyn AppearanceSink>) -> Self {
        Self { sink }
    }
}

impl SideEffect for FontSizeEffect {
    fn name(&self) -> &'static str {
        "font_size"
    }

    fn key(&self) -> PreferenceKey {
        PreferenceKey::FontSize
    }

    fn apply(&self, value: &PreferenceValue) {
        if let PreferenceValue::FontSize(size) = value {
            self.sink.set_font_scale(*size, size.scale());
        }
    }
}

/// 提示音
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundCue {
    MessageReceived,
    MessageSent,
    Notification,
}

/// 音频输出（由表现层实现）
pub trait SoundBackend: Send + Sync {
    fn play(&self, cue: SoundCue, volume: f64);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SoundSettings {
    enabled: bool,
    volume: f64,
}

/// 提示音服务，由会话显式创建并持有
pub struct SoundService {
    backend: Arc<dyn SoundBackend>,
    settings: RwLock<SoundSettings>,
}

impl SoundService {
    pub fn new(backend: Arc<dyn SoundBackend>) -> Self {
        let enabled = PreferenceKey::SoundEnabled.default_value().as_bool().unwrap_or(true);
        let volume = PreferenceKey::SoundVolume.default_value().as_level().unwrap_or(1.0);
        Self {
            backend,
            settings: RwLock::new(SoundSettings { enabled, volume }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.write().enabled = enabled;
        info!("提示音已{}", if enabled { "开启" } else { "关闭" });
    }

    pub fn set_volume(&self, volume: f64) {
        self.settings.write().volume = volume.clamp(0.0, 1.0);
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    pub fn volume(&self) -> f64 {
        self.settings.read().volume
    }

    /// 播放提示音，关闭或音量为 0 时不播放
    pub fn play(&self, cue: SoundCue) -> bool {
        let settings = *self.settings.read();
        if !settings.enabled || settings.volume <= 0.0 {
            debug!("提示音 {:?} 被跳过", cue);
            return false;
        }
        self.backend.play(cue, settings.volume);
        true
    }
}

/// 声音设置副作用（开关或音量）
pub struct SoundSettingsEffect {
    key: PreferenceKey,
    service: Arc<SoundService>,
}

impl SoundSettingsEffect {
    pub fn enabled(service: Arc<SoundService>) -> Self {
        Self {
            key: PreferenceKey::SoundEnabled,
            service,
        }
    }

    pub fn volume(service: Arc<SoundService>) -> Self {
        Self {
            key: PreferenceKey::SoundVolume,
            service,
        }
    }
}

impl SideEffect for SoundSettingsEffect {
    fn name(&self) -> &'static str {
        match self.key {
            PreferenceKey::SoundEnabled => "sound_enabled",
            _ => "sound_volume",
        }
    }

    fn key(&self) -> PreferenceKey {
        self.key
    }

    fn apply(&self, value: &PreferenceValue) {
        match value {
            PreferenceValue::Bool(enabled) => self.service.set_enabled(*enabled),
            PreferenceValue::Level(volume) => self.service.set_volume(*volume),
            _ => {}
        }
    }
}
