//! 权威存储接口
//!
//! 权威存储（服务端关系型数据库）由外部实现，这里只定义同步层使用的
//! 三个调用，以及把它们适配为乐观存储持久化器的包装。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::optimistic::Persister;
use crate::preferences::{PreferenceKey, PreferenceValue};
use crate::presence::{PresenceSlot, PresenceStatus};

/// 权威存储
///
/// 错误应通过 [`PrivchatSyncError::store`](crate::error::PrivchatSyncError::store)
/// 构造，以便 42501 被识别为不可重试的授权失败。
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    /// 拉取用户偏好设置的原始映射
    async fn fetch_preferences(&self, user_id: &str) -> Result<HashMap<String, Value>>;

    /// 持久化单个偏好设置
    async fn persist_preference(&self, user_id: &str, key: PreferenceKey, value: &Value) -> Result<()>;

    /// 持久化自己的在线状态
    async fn persist_presence(&self, user_id: &str, status: PresenceStatus) -> Result<()>;
}

/// 偏好设置持久化器（绑定到登录用户）
pub struct PreferencePersister {
    store: Arc<dyn AuthoritativeStore>,
    user_id: String,
}

impl PreferencePersister {
    pub fn new(store: Arc<dyn AuthoritativeStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl Persister<PreferenceKey, PreferenceValue> for PreferencePersister {
    async fn persist(&self, key: PreferenceKey, value: PreferenceValue) -> Result<()> {
        debug!("持久化偏好设置 {}={} (user {})", key, value, self.user_id);
        self.store
            .persist_preference(&self.user_id, key, &value.to_json())
            .await
    }
}

/// 在线状态持久化器
pub struct PresencePersister {
    store: Arc<dyn AuthoritativeStore>,
    user_id: String,
}

impl PresencePersister {
    pub fn new(store: Arc<dyn AuthoritativeStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl Persister<PresenceSlot, PresenceStatus> for PresencePersister {
    async fn persist(&self, _slot: PresenceSlot, status: PresenceStatus) -> Result<()> {
        debug!("持久化在线状态 {:?} (user {})", status, self.user_id);
        self.store.persist_presence(&self.user_id, status).await
    }
}
