//! 偏好设置本地缓存 - 基于 sled
//!
//! 每个用户一个 Tree（`user_{uid}`），访客共用 `guest`。
//! 值以 JSON 存储，读取时由 [`PreferenceMap::from_raw`] 重新校验。

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use sled::{Db, Tree};
use tracing::{debug, info, warn};

use crate::error::{PrivchatSyncError, Result};
use crate::preferences::{PreferenceKey, PreferenceMap, PreferenceValue};

const GUEST_TREE: &str = "guest";

fn tree_name(user_id: Option<&str>) -> String {
    match user_id {
        Some(uid) => format!("user_{}", uid),
        None => GUEST_TREE.to_string(),
    }
}

/// 偏好设置缓存
#[derive(Debug, Clone)]
pub struct PreferenceCache {
    db: Db,
}

impl PreferenceCache {
    /// 打开缓存数据库
    pub async fn open(base_path: &Path) -> Result<Self> {
        let cache_path = base_path.join("preferences");
        tokio::fs::create_dir_all(&cache_path)
            .await
            .map_err(|e| PrivchatSyncError::IO(format!("创建缓存目录失败: {}", e)))?;

        // 切换账号后旧实例可能刚释放锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&cache_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(PrivchatSyncError::KvStore(format!("打开 sled 数据库失败: {}", e)));
                    }
                    warn!("缓存数据库被占用，第 {} 次重试", attempt);
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS << attempt)).await;
                }
            }
        };

        info!("偏好缓存已打开: {}", cache_path.display());
        Ok(Self { db })
    }

    /// 不落盘的临时缓存
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, user_id: Option<&str>) -> Result<Tree> {
        let name = tree_name(user_id);
        self.db
            .open_tree(&name)
            .map_err(|e| PrivchatSyncError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))
    }

    /// 读取缓存的原始映射，从未写入过时返回 None
    pub fn load(&self, user_id: Option<&str>) -> Result<Option<HashMap<String, Value>>> {
        let tree = self.tree(user_id)?;
        if tree.is_empty() {
            return Ok(None);
        }

        let mut raw = HashMap::new();
        for item in tree.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).to_string();
            match serde_json::from_slice::<Value>(&value) {
                Ok(value) => {
                    raw.insert(key, value);
                }
                Err(e) => warn!("缓存值 {} 无法解析，忽略: {}", key, e),
            }
        }
        debug!("从缓存读取 {} 个偏好设置", raw.len());
        Ok(Some(raw))
    }

    /// 写入完整映射
    pub fn store_map(&self, user_id: Option<&str>, map: &PreferenceMap) -> Result<()> {
        let tree = self.tree(user_id)?;
        let mut batch = sled::Batch::default();
        for (key, value) in map.iter() {
            batch.insert(key.as_str(), serde_json::to_vec(&value.to_json())?);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    /// 批量写入若干键（同一批原子生效）
    pub fn store_values(&self, user_id: Option<&str>, values: &[(PreferenceKey, PreferenceValue)]) -> Result<()> {
        let tree = self.tree(user_id)?;
        let mut batch = sled::Batch::default();
        for (key, value) in values {
            batch.insert(key.as_str(), serde_json::to_vec(&value.to_json())?);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
