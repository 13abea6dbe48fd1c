//! 日志初始化

use tracing::Level;

/// 初始化 fmt 日志输出，调试模式下输出 DEBUG 级别
///
/// 宿主已经安装了全局 subscriber 时返回 false。
pub fn init_logging(debug_mode: bool) -> bool {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}
