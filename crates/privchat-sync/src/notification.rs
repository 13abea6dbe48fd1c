//! 推送通知路由
//!
//! 功能包括：
//! - 解析推送载荷（格式错误时回退到默认文案）
//! - 生成通知展示内容与可恢复的路由
//! - 点击通知时聚焦已有窗口并导航，没有窗口时打开一个新窗口

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NotificationDefaults;
use crate::error::Result;

/// 推送附带的数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// 推送载荷
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub data: Option<PushData>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub badge: Option<String>,
}

impl PushPayload {
    /// 宽松解析：缺失或非法的载荷得到空载荷
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw,
            None => {
                warn!("推送载荷为空，使用默认通知");
                return Self::default();
            }
        };
        match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("推送载荷解析失败，使用默认通知: {}", e);
                Self::default()
            }
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.chat_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.message_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// 点击后要打开的路由：`/chat/{chatId}[#messageId]`，没有会话时为 `/`
    pub fn route(&self) -> String {
        match (self.chat_id(), self.message_id()) {
            (Some(chat_id), Some(message_id)) => format!("/chat/{}#{}", chat_id, message_id),
            (Some(chat_id), None) => format!("/chat/{}", chat_id),
            (None, _) => "/".to_string(),
        }
    }
}

/// 通知展示内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub route: String,
}

pub type WindowId = u64;

/// 宿主窗口信息
#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    pub id: WindowId,
    pub focused: bool,
    pub visible: bool,
}

/// 窗口宿主（由表现层实现）
#[async_trait]
pub trait WindowHost: Send + Sync {
    async fn list_windows(&self) -> Result<Vec<WindowInfo>>;
    async fn focus(&self, window: WindowId) -> Result<()>;
    async fn navigate(&self, window: WindowId, route: &str) -> Result<()>;
    async fn open_window(&self, route: &str) -> Result<WindowId>;
}

/// 点击通知的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// 聚焦并导航了已有窗口
    Focused { window: WindowId, route: String },
    /// 打开了新窗口
    Opened { window: WindowId, route: String },
}

/// 通知路由器
pub struct NotificationRouter {
    defaults: NotificationDefaults,
    host: Arc<dyn WindowHost>,
}

impl NotificationRouter {
    pub fn new(defaults: NotificationDefaults, host: Arc<dyn WindowHost>) -> Self {
        Self { defaults, host }
    }

    /// 生成展示内容
    pub fn render(&self, payload: &PushPayload) -> NotificationContent {
        let pick = |value: &Option<String>, default: &str| {
            value
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        NotificationContent {
            title: pick(&payload.title, &self.defaults.title),
            body: pick(&payload.body, &self.defaults.body),
            icon: pick(&payload.icon, &self.defaults.icon),
            badge: pick(&payload.badge, &self.defaults.badge),
            tag: pick(&payload.tag, &self.defaults.tag),
            route: payload.route(),
        }
    }

    /// 处理通知点击
    ///
    /// 有窗口时只聚焦一个（优先已聚焦、其次可见的），否则打开一个新窗口。
    pub async fn handle_click(&self, content: &NotificationContent) -> Result<RouteOutcome> {
        let windows = self.host.list_windows().await?;
        let target = windows
            .iter()
            .find(|w| w.focused)
            .or_else(|| windows.iter().find(|w| w.visible))
            .or_else(|| windows.first());

        match target {
            Some(window) => {
                debug!("聚焦窗口 {} 并导航到 {}", window.id, content.route);
                self.host.focus(window.id).await?;
                self.host.navigate(window.id, &content.route).await?;
                Ok(RouteOutcome::Focused {
                    window: window.id,
                    route: content.route.clone(),
                })
            }
            None => {
                let window = self.host.open_window(&content.route).await?;
                info!("没有可用窗口，打开新窗口 {} 于 {}", window, content.route);
                Ok(RouteOutcome::Opened {
                    window,
                    route: content.route.clone(),
                })
            }
        }
    }
}
