//! 版本信息

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 上报给权威存储的客户端标识
pub fn client_tag() -> String {
    format!("privchat-sync/{}", SDK_VERSION)
}
