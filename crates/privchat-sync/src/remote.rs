//! 频道消息的线上格式
//!
//! ```json
//! {"type":"preference","key":"theme","value":"dark"}
//! {"type":"presence","userId":"u1","status":"busy","lastSeenAt":1700000000000}
//! {"type":"typing","chatId":"c1","userId":"u2","isTyping":true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PrivchatSyncError, Result};
use crate::preferences::{PreferenceKey, PreferenceValue};
use crate::presence::{PresenceRecord, PresenceStatus};

/// 远端变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteChange {
    #[serde(rename_all = "camelCase")]
    Preference { key: String, value: Value },
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: String,
        status: PresenceStatus,
        #[serde(default)]
        last_seen_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        chat_id: String,
        user_id: String,
        is_typing: bool,
    },
}

impl RemoteChange {
    pub fn from_json(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| PrivchatSyncError::MalformedPayload(format!("{}: {}", e, payload)))
    }

    /// 解析偏好变更为类型化的键值
    pub fn typed_preference(key: &str, value: &Value) -> Result<(PreferenceKey, PreferenceValue)> {
        let key: PreferenceKey = key
            .parse()
            .map_err(|_| PrivchatSyncError::MalformedPayload(format!("未知的偏好键: {}", key)))?;
        let value = key
            .parse_value(value)
            .map_err(|e| PrivchatSyncError::MalformedPayload(e.to_string()))?;
        Ok((key, value))
    }

    pub fn presence_record(user_id: &str, status: PresenceStatus, last_seen_at: i64) -> PresenceRecord {
        PresenceRecord {
            user_id: user_id.to_string(),
            status,
            last_seen_at,
        }
    }
}
