use thiserror::Error;

/// 权限不足（insufficient privilege），服务端策略拒绝，不可重试
pub const AUTHORIZATION_DENIED_CODE: &str = "42501";

#[derive(Debug, Clone, Error)]
pub enum PrivchatSyncError {
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    // 重试预算耗尽后对订阅者暴露的终态
    #[error("Channel unavailable: {topic} (after {attempts} attempts)")]
    ChannelUnavailable { topic: String, attempts: u32 },
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),
    // 权威存储返回的错误（code 来自服务端，可能为空）
    #[error("Store error [{}]: {message}", code.as_deref().unwrap_or("-"))]
    Store {
        code: Option<String>,
        message: String,
    },
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

/// 错误分类，决定重试与回滚策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时传输错误 → 有限次数退避重试
    TransientTransport,
    /// 重试预算耗尽 → UI 显示离线/降级
    TerminalChannelUnavailable,
    /// 42501 类 → 不重试，属于配置/策略问题
    AuthorizationDenied,
    /// 持久化失败 → 触发乐观回滚
    PersistenceFailure,
    /// 载荷格式错误 → 使用默认值并记录日志
    MalformedPayload,
}

impl PrivchatSyncError {
    /// 构造权威存储错误，42501 自动归类为授权失败
    pub fn store(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some(AUTHORIZATION_DENIED_CODE) => PrivchatSyncError::AuthorizationDenied(message),
            _ => PrivchatSyncError::Store {
                code: code.map(str::to_string),
                message,
            },
        }
    }

    /// 获取错误分类
    pub fn class(&self) -> ErrorClass {
        match self {
            PrivchatSyncError::Transport(_) | PrivchatSyncError::Timeout(_) => {
                ErrorClass::TransientTransport
            }
            PrivchatSyncError::ChannelUnavailable { .. } => ErrorClass::TerminalChannelUnavailable,
            PrivchatSyncError::AuthorizationDenied(_) => ErrorClass::AuthorizationDenied,
            PrivchatSyncError::JsonError(_) | PrivchatSyncError::MalformedPayload(_) => {
                ErrorClass::MalformedPayload
            }
            _ => ErrorClass::PersistenceFailure,
        }
    }

    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientTransport
    }
}

impl From<serde_json::Error> for PrivchatSyncError {
    fn from(error: serde_json::Error) -> Self {
        PrivchatSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for PrivchatSyncError {
    fn from(error: std::io::Error) -> Self {
        PrivchatSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for PrivchatSyncError {
    fn from(error: sled::Error) -> Self {
        PrivchatSyncError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PrivchatSyncError>;
