//! 频道主题命名
//!
//! 主题由 (用途, 实体ID) 确定性派生，同一对输入永远得到同一个主题名：
//!
//! | 用途 | 主题格式 |
//! |------|----------|
//! | 在线状态 | `presence:{id}` |
//! | 会话消息流 | `chat:{id}:messages` |
//! | 会话输入状态流 | `chat:{id}:typing` |
//! | 用户私有流 | `user:{id}` |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PrivchatSyncError, Result};

const MAX_ENTITY_ID_LEN: usize = 128;

fn entity_id_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$"))
        .as_ref()
        .map_err(|e| PrivchatSyncError::Config(e.to_string()))
}

/// 主题用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicPurpose {
    /// 在线状态
    Presence,
    /// 会话消息流
    ChatMessages,
    /// 会话输入状态流
    ChatTyping,
    /// 用户私有流（偏好设置回显等）
    UserDirect,
}

/// 频道主题
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    purpose: TopicPurpose,
    entity_id: String,
    name: String,
}

impl Topic {
    /// 从用途和实体ID派生主题
    pub fn new(purpose: TopicPurpose, entity_id: &str) -> Result<Self> {
        if entity_id.len() > MAX_ENTITY_ID_LEN || !entity_id_pattern()?.is_match(entity_id) {
            return Err(PrivchatSyncError::InvalidArgument(format!(
                "非法的实体ID: {:?}",
                entity_id
            )));
        }

        let name = match purpose {
            TopicPurpose::Presence => format!("presence:{}", entity_id),
            TopicPurpose::ChatMessages => format!("chat:{}:messages", entity_id),
            TopicPurpose::ChatTyping => format!("chat:{}:typing", entity_id),
            TopicPurpose::UserDirect => format!("user:{}", entity_id),
        };

        Ok(Self {
            purpose,
            entity_id: entity_id.to_string(),
            name,
        })
    }

    pub fn presence(user_id: &str) -> Result<Self> {
        Self::new(TopicPurpose::Presence, user_id)
    }

    pub fn chat_messages(chat_id: &str) -> Result<Self> {
        Self::new(TopicPurpose::ChatMessages, chat_id)
    }

    pub fn chat_typing(chat_id: &str) -> Result<Self> {
        Self::new(TopicPurpose::ChatTyping, chat_id)
    }

    pub fn user_direct(user_id: &str) -> Result<Self> {
        Self::new(TopicPurpose::UserDirect, user_id)
    }

    pub fn purpose(&self) -> TopicPurpose {
        self.purpose
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
