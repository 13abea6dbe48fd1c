//! 用户偏好设置的键空间
//!
//! 键集合是固定的枚举，值在加载时校验类型与范围。远端返回的原始
//! JSON 映射经过 [`PreferenceMap::from_raw`] 转换后，保证包含全部已知键。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{PrivchatSyncError, Result};

/// 偏好设置键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreferenceKey {
    Theme,
    FontSize,
    CompactView,
    SoundEnabled,
    SoundVolume,
    AutoTranslate,
    DesktopNotifications,
    EnterToSend,
}

impl PreferenceKey {
    pub const ALL: [PreferenceKey; 8] = [
        PreferenceKey::Theme,
        PreferenceKey::FontSize,
        PreferenceKey::CompactView,
        PreferenceKey::SoundEnabled,
        PreferenceKey::SoundVolume,
        PreferenceKey::AutoTranslate,
        PreferenceKey::DesktopNotifications,
        PreferenceKey::EnterToSend,
    ];

    /// 远端存储中的列名
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceKey::Theme => "theme",
            PreferenceKey::FontSize => "fontSize",
            PreferenceKey::CompactView => "compactView",
            PreferenceKey::SoundEnabled => "soundEnabled",
            PreferenceKey::SoundVolume => "soundVolume",
            PreferenceKey::AutoTranslate => "autoTranslate",
            PreferenceKey::DesktopNotifications => "desktopNotifications",
            PreferenceKey::EnterToSend => "enterToSend",
        }
    }

    /// 默认值表
    pub fn default_value(&self) -> PreferenceValue {
        match self {
            PreferenceKey::Theme => PreferenceValue::Theme(Theme::System),
            PreferenceKey::FontSize => PreferenceValue::FontSize(FontSize::Medium),
            PreferenceKey::CompactView => PreferenceValue::Bool(false),
            PreferenceKey::SoundEnabled => PreferenceValue::Bool(true),
            PreferenceKey::SoundVolume => PreferenceValue::Level(0.7),
            PreferenceKey::AutoTranslate => PreferenceValue::Bool(false),
            PreferenceKey::DesktopNotifications => PreferenceValue::Bool(true),
            PreferenceKey::EnterToSend => PreferenceValue::Bool(true),
        }
    }

    /// 把原始 JSON 值解析为该键的类型化值
    pub fn parse_value(&self, raw: &Value) -> Result<PreferenceValue> {
        let invalid = || {
            PrivchatSyncError::InvalidArgument(format!("{} 的取值非法: {}", self.as_str(), raw))
        };

        match self {
            PreferenceKey::Theme => {
                let s = raw.as_str().ok_or_else(invalid)?;
                Ok(PreferenceValue::Theme(s.parse().map_err(|_| invalid())?))
            }
            PreferenceKey::FontSize => {
                let s = raw.as_str().ok_or_else(invalid)?;
                Ok(PreferenceValue::FontSize(s.parse().map_err(|_| invalid())?))
            }
            PreferenceKey::SoundVolume => {
                let level = raw.as_f64().ok_or_else(invalid)?;
                PreferenceValue::level(level)
            }
            PreferenceKey::CompactView
            | PreferenceKey::SoundEnabled
            | PreferenceKey::AutoTranslate
            | PreferenceKey::DesktopNotifications
            | PreferenceKey::EnterToSend => Ok(PreferenceValue::Bool(raw.as_bool().ok_or_else(invalid)?)),
        }
    }

    /// 检查值的类型是否与键匹配
    pub fn accepts(&self, value: &PreferenceValue) -> bool {
        matches!(
            (self, value),
            (PreferenceKey::Theme, PreferenceValue::Theme(_))
                | (PreferenceKey::FontSize, PreferenceValue::FontSize(_))
                | (PreferenceKey::SoundVolume, PreferenceValue::Level(_))
                | (PreferenceKey::CompactView, PreferenceValue::Bool(_))
                | (PreferenceKey::SoundEnabled, PreferenceValue::Bool(_))
                | (PreferenceKey::AutoTranslate, PreferenceValue::Bool(_))
                | (PreferenceKey::DesktopNotifications, PreferenceValue::Bool(_))
                | (PreferenceKey::EnterToSend, PreferenceValue::Bool(_))
        )
    }
}

impl fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreferenceKey {
    type Err = PrivchatSyncError;

    fn from_str(s: &str) -> Result<Self> {
        PreferenceKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| PrivchatSyncError::NotFound(format!("未知的偏好键: {}", s)))
    }
}

/// 主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    System,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }
}

impl FromStr for Theme {
    type Err = PrivchatSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            other => Err(PrivchatSyncError::InvalidArgument(format!("未知主题: {}", other))),
        }
    }
}

/// 字号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSize {
    Small,
    Medium,
    Large,
    XLarge,
}

impl FontSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            FontSize::Small => "small",
            FontSize::Medium => "medium",
            FontSize::Large => "large",
            FontSize::XLarge => "xlarge",
        }
    }

    /// 相对根字号的缩放比例
    pub fn scale(&self) -> f32 {
        match self {
            FontSize::Small => 0.875,
            FontSize::Medium => 1.0,
            FontSize::Large => 1.125,
            FontSize::XLarge => 1.25,
        }
    }
}

impl FromStr for FontSize {
    type Err = PrivchatSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "small" => Ok(FontSize::Small),
            "medium" => Ok(FontSize::Medium),
            "large" => Ok(FontSize::Large),
            "xlarge" => Ok(FontSize::XLarge),
            other => Err(PrivchatSyncError::InvalidArgument(format!("未知字号: {}", other))),
        }
    }
}

/// 偏好设置值
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Theme(Theme),
    FontSize(FontSize),
    /// 0.0-1.0 之间的数值
    Level(f64),
}

impl PreferenceValue {
    /// 构造有界数值，超出 0.0-1.0 返回错误
    pub fn level(value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(PrivchatSyncError::InvalidArgument(format!(
                "数值必须在 0.0-1.0 之间: {}",
                value
            )));
        }
        Ok(PreferenceValue::Level(value))
    }

    pub fn to_json(&self) -> Value {
        match self {
            PreferenceValue::Bool(b) => Value::Bool(*b),
            PreferenceValue::Theme(t) => Value::String(t.as_str().to_string()),
            PreferenceValue::FontSize(f) => Value::String(f.as_str().to_string()),
            PreferenceValue::Level(v) => serde_json::json!(v),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PreferenceValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_level(&self) -> Option<f64> {
        match self {
            PreferenceValue::Level(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for PreferenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// 加载时发现的问题（不致命，仅记录）
#[derive(Debug, Clone, PartialEq)]
pub enum LoadIssue {
    UnknownKey(String),
    InvalidValue { key: PreferenceKey, raw: Value },
    Missing(PreferenceKey),
}

/// 完整的偏好设置映射
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceMap {
    values: BTreeMap<PreferenceKey, PreferenceValue>,
}

impl Default for PreferenceMap {
    fn default() -> Self {
        Self {
            values: PreferenceKey::ALL
                .iter()
                .map(|key| (*key, key.default_value()))
                .collect(),
        }
    }
}

impl PreferenceMap {
    /// 从远端原始映射加载，缺失或非法的键用默认值补齐
    pub fn from_raw(raw: &HashMap<String, Value>) -> (Self, Vec<LoadIssue>) {
        let mut map = PreferenceMap::default();
        let mut issues = Vec::new();

        for (name, raw_value) in raw {
            let key = match name.parse::<PreferenceKey>() {
                Ok(key) => key,
                Err(_) => {
                    issues.push(LoadIssue::UnknownKey(name.clone()));
                    continue;
                }
            };
            match key.parse_value(raw_value) {
                Ok(value) => {
                    map.values.insert(key, value);
                }
                Err(e) => {
                    warn!("偏好设置值非法，使用默认值: {}", e);
                    issues.push(LoadIssue::InvalidValue {
                        key,
                        raw: raw_value.clone(),
                    });
                }
            }
        }

        for key in PreferenceKey::ALL {
            if !raw.contains_key(key.as_str()) {
                issues.push(LoadIssue::Missing(key));
            }
        }

        (map, issues)
    }

    pub fn get(&self, key: PreferenceKey) -> PreferenceValue {
        self.values
            .get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    pub fn set(&mut self, key: PreferenceKey, value: PreferenceValue) -> Result<()> {
        if !key.accepts(&value) {
            return Err(PrivchatSyncError::InvalidArgument(format!(
                "{} 不接受值 {}",
                key, value
            )));
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (PreferenceKey, PreferenceValue)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_keys_filled_from_defaults() {
        let mut raw = HashMap::new();
        raw.insert("theme".to_string(), json!("dark"));
        raw.insert("soundVolume".to_string(), json!(0.25));

        let (map, issues) = PreferenceMap::from_raw(&raw);
        assert_eq!(map.get(PreferenceKey::Theme), PreferenceValue::Theme(Theme::Dark));
        assert_eq!(map.get(PreferenceKey::SoundVolume), PreferenceValue::Level(0.25));
        assert_eq!(map.iter().count(), PreferenceKey::ALL.len());
        assert!(issues.contains(&LoadIssue::Missing(PreferenceKey::FontSize)));
        assert_eq!(map.get(PreferenceKey::FontSize), PreferenceValue::FontSize(FontSize::Medium));
    }

    #[test]
    fn test_invalid_and_unknown_values_reported() {
        let mut raw = HashMap::new();
        raw.insert("soundVolume".to_string(), json!(1.5));
        raw.insert("fontSize".to_string(), json!(14));
        raw.insert("legacyFlag".to_string(), json!(true));

        let (map, issues) = PreferenceMap::from_raw(&raw);
        assert_eq!(map.get(PreferenceKey::SoundVolume), PreferenceKey::SoundVolume.default_value());
        assert!(issues.contains(&LoadIssue::UnknownKey("legacyFlag".to_string())));
        assert!(issues
            .iter()
            .any(|i| matches!(i, LoadIssue::InvalidValue { key: PreferenceKey::FontSize, .. })));
    }

    #[test]
    fn test_level_bounds() {
        assert!(PreferenceValue::level(0.0).is_ok());
        assert!(PreferenceValue::level(1.0).is_ok());
        assert!(PreferenceValue::level(-0.1).is_err());
        assert!(PreferenceValue::level(f64::NAN).is_err());
    }

    #[test]
    fn test_set_rejects_mismatched_type() {
        let mut map = PreferenceMap::default();
        assert!(map.set(PreferenceKey::Theme, PreferenceValue::Bool(true)).is_err());
        assert!(map
            .set(PreferenceKey::CompactView, PreferenceValue::Bool(true))
            .is_ok());
        assert_eq!(map.get(PreferenceKey::CompactView), PreferenceValue::Bool(true));
    }
}
