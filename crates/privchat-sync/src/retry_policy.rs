use std::time::Duration;

use crate::config::{ChannelRetryConfig, PersistRetryConfig};
use crate::error::PrivchatSyncError;

/// 重试策略（指数退避，可选抖动）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 基础延迟
    pub base_delay: Duration,
    /// 最大延迟
    pub max_delay: Duration,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ChannelRetryConfig::default())
    }
}

impl From<&ChannelRetryConfig> for RetryPolicy {
    /// `max_attempts` 含首次打开，重试次数少一次
    fn from(config: &ChannelRetryConfig) -> Self {
        Self {
            max_retries: config.max_attempts.saturating_sub(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl From<&PersistRetryConfig> for RetryPolicy {
    fn from(config: &PersistRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 `retry_count` 次重试（从 0 开始）之前的等待时间
    ///
    /// 超过最大重试次数返回 None。
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ retry_count)
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powf(retry_count as f64);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };

        Some(Duration::from_secs_f64((capped + jitter).max(0.0)))
    }

    /// 检查是否应该重试
    pub fn should_retry(&self, retry_count: u32, error: &PrivchatSyncError) -> bool {
        retry_count < self.max_retries && error.is_retryable()
    }
}
