//! 同步层配置
//!
//! 所有配置均可序列化，既可以通过 [`SyncConfigBuilder`] 构建，
//! 也可以从 JSON 文件加载（缺失字段使用默认值）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PrivchatSyncError, Result};

/// Privchat 同步层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 数据存储目录（偏好缓存），None 表示不落盘
    pub data_dir: Option<PathBuf>,
    /// 频道重连配置
    pub channel_retry: ChannelRetryConfig,
    /// 持久化重试配置
    pub persist_retry: PersistRetryConfig,
    /// 乐观更新看门狗超时（毫秒）
    pub watchdog_timeout_ms: u64,
    /// 单次持久化请求超时（毫秒）
    pub persist_attempt_timeout_ms: u64,
    /// 在线状态缓存配置
    pub presence: PresenceCacheConfig,
    /// 输入状态配置
    pub typing: TypingConfig,
    /// 通知默认值
    pub notification: NotificationDefaults,
    /// 事件配置
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

/// 频道重连配置（指数退避）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRetryConfig {
    /// 最大尝试次数（含首次打开），耗尽后报告频道不可用
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

/// 持久化重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistRetryConfig {
    /// 最大重试次数（不含首次请求）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

/// 在线状态缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceCacheConfig {
    /// 缓存过期时间（秒），超过即视为陈旧
    pub cache_ttl_secs: u64,
    /// 最大缓存条目数
    pub max_cache_size: usize,
}

/// 输入状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// 防抖间隔（秒）- 多久发送一次输入状态
    pub debounce_interval_secs: u64,
    /// 自动清除时间（秒）- 超过多久自动认为停止输入
    pub auto_clear_secs: u64,
}

/// 推送通知默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            channel_retry: ChannelRetryConfig::default(),
            persist_retry: PersistRetryConfig::default(),
            watchdog_timeout_ms: 10_000,
            persist_attempt_timeout_ms: 5_000,
            presence: PresenceCacheConfig::default(),
            typing: TypingConfig::default(),
            notification: NotificationDefaults::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl Default for ChannelRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl Default for PersistRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for PresenceCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,   // 5分钟
            max_cache_size: 10000, // 最多缓存10000个用户
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_interval_secs: 3, // 3秒发送一次
            auto_clear_secs: 5,        // 5秒后自动清除
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Privchat".to_string(),
            body: "You have a new message".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-72x72.png".to_string(),
            tag: "privchat-message".to_string(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| PrivchatSyncError::Config(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.channel_retry.max_attempts == 0 {
            return Err(PrivchatSyncError::Config(
                "channel_retry.max_attempts 必须大于 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.channel_retry.jitter_factor) {
            return Err(PrivchatSyncError::Config(
                "channel_retry.jitter_factor 必须在 0.0-1.0 之间".to_string(),
            ));
        }
        if self.channel_retry.backoff_factor < 1.0 || self.persist_retry.backoff_factor < 1.0 {
            return Err(PrivchatSyncError::Config("backoff_factor 不能小于 1.0".to_string()));
        }
        if self.watchdog_timeout_ms == 0 || self.persist_attempt_timeout_ms == 0 {
            return Err(PrivchatSyncError::Config("超时时间必须大于 0".to_string()));
        }
        if self.presence.cache_ttl_secs == 0 || self.typing.auto_clear_secs == 0 {
            return Err(PrivchatSyncError::Config(
                "presence.cache_ttl_secs 与 typing.auto_clear_secs 必须大于 0".to_string(),
            ));
        }
        if self.event_config.buffer_size == 0 {
            return Err(PrivchatSyncError::Config("event_config.buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn persist_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_attempt_timeout_ms)
    }
}

/// 同步层配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn channel_retry(mut self, retry: ChannelRetryConfig) -> Self {
        self.config.channel_retry = retry;
        self
    }

    pub fn persist_retry(mut self, retry: PersistRetryConfig) -> Self {
        self.config.persist_retry = retry;
        self
    }

    /// 设置看门狗超时
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.config.watchdog_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn persist_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.persist_attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn presence(mut self, presence: PresenceCacheConfig) -> Self {
        self.config.presence = presence;
        self
    }

    pub fn typing(mut self, typing: TypingConfig) -> Self {
        self.config.typing = typing;
        self
    }

    pub fn notification(mut self, notification: NotificationDefaults) -> Self {
        self.config.notification = notification;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_config.buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
