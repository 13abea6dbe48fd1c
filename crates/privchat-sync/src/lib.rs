//! Privchat Sync - 客户端状态同步层
//!
//! 让用户的可变状态（偏好设置、在线状态、正在输入）在多个活跃会话与
//! 权威存储之间保持一致：
//! - 📡 频道订阅：按主题去重、引用计数、指数退避重连
//! - ⚡ 乐观更新：本地立即生效，失败或超时自动回滚
//! - 🔄 冲突合并：最后确认的写入获胜
//! - 🎨 副作用：主题、字号、提示音随可见值变化
//! - 🔔 推送通知：解析载荷并路由到会话窗口
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use privchat_sync::{Collaborators, PreferenceKey, PreferenceValue, SyncConfig, SyncSession, Theme};
//!
//! async fn run(collaborators: Collaborators) -> privchat_sync::Result<()> {
//!     let config = SyncConfig::builder().data_dir("/path/to/data").build()?;
//!     let session = SyncSession::new(config, Some("user123".to_string()), collaborators).await?;
//!     session.start().await?;
//!
//!     session.propose_preference(PreferenceKey::Theme, PreferenceValue::Theme(Theme::Dark))?;
//!     session.watch_chat("chat42")?;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod channel;
pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod logging;
pub mod notification;
pub mod optimistic;
pub mod preferences;
pub mod presence;
pub mod reconcile;
pub mod remote;
pub mod retry_policy;
pub mod session;
pub mod store;
pub mod topic;
pub mod typing;
pub mod version;

#[cfg(test)]
mod testing;

// 重新导出核心类型，方便使用
pub use cache::PreferenceCache;
pub use channel::{
    ChannelEvent, ChannelManager, ChannelTransport, ConnectionId, SubscriptionHandle, SubscriptionState,
    TransportConnection, TransportEvent, TransportStatus,
};
pub use config::{
    ChannelRetryConfig, EventConfig, NotificationDefaults, PersistRetryConfig, PresenceCacheConfig, SyncConfig,
    SyncConfigBuilder, TypingConfig,
};
pub use effects::{
    AppearanceSink, FontSizeEffect, SideEffect, SideEffectDispatcher, SoundBackend, SoundCue, SoundService,
    SoundSettingsEffect, ThemeEffect,
};
pub use error::{ErrorClass, PrivchatSyncError, Result};
pub use events::{ChangeCause, EventFilter, EventManager, EventStats, SyncEvent};
pub use logging::init_logging;
pub use notification::{
    NotificationContent, NotificationRouter, PushData, PushPayload, RouteOutcome, WindowHost, WindowId, WindowInfo,
};
pub use optimistic::{ChangeObserver, MutationId, OptimisticEdit, OptimisticStateStore, Persister, StoreTiming};
pub use preferences::{FontSize, LoadIssue, PreferenceKey, PreferenceMap, PreferenceValue, Theme};
pub use presence::{PresenceCacheStats, PresenceManager, PresenceRecord, PresenceStatus};
pub use reconcile::{reconcile, Decision, ReconcileEvent};
pub use remote::RemoteChange;
pub use retry_policy::RetryPolicy;
pub use session::{Collaborators, SessionHealth, SyncSession};
pub use store::AuthoritativeStore;
pub use topic::{Topic, TopicPurpose};
pub use typing::{TypingManager, TypingStats};
pub use version::SDK_VERSION;
