//! Environment, device and attachment record definitions

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Environment identifier, supplied by the caller
pub type EnvId = u64;

/// Operating-system process identifier
pub type Pid = u32;

/// Position of a device in the fixed pool
pub type DeviceIndex = u32;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock time with second precision.
///
/// Persisted as `YYYY-MM-DD HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(Local::now().naive_local().trunc_subsecs(0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map(Self)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A logical grouping of processes sharing device attachments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(rename = "eid")]
    pub id: EnvId,
    #[serde(rename = "uid")]
    pub owner_uid: u32,
    #[serde(rename = "username")]
    pub owner_name: String,
    #[serde(rename = "creation")]
    pub created_at: Timestamp,
    /// Processes keeping the environment alive
    #[serde(rename = "pids", default)]
    pub process_ids: Vec<Pid>,
    #[serde(default)]
    pub config: EnvironmentConfig,
}

impl Environment {
    /// Create an environment with no processes and empty configuration
    pub fn new(id: EnvId, owner_uid: u32, owner_name: impl Into<String>) -> Self {
        Self {
            id,
            owner_uid,
            owner_name: owner_name.into(),
            created_at: Timestamp::now(),
            process_ids: Vec::new(),
            config: EnvironmentConfig::default(),
        }
    }

    /// Render one query field; absent values render as an empty string
    pub fn field(&self, field: &EnvironmentField) -> String {
        match field {
            EnvironmentField::Id => self.id.to_string(),
            EnvironmentField::CreatedAt => self.created_at.to_string(),
            EnvironmentField::Name => self.config.name.clone().unwrap_or_default(),
            EnvironmentField::DeviceCount => self
                .config
                .device_count
                .map(|n| n.to_string())
                .unwrap_or_default(),
            EnvironmentField::OwnerUid => self.owner_uid.to_string(),
            EnvironmentField::OwnerName => self.owner_name.clone(),
            EnvironmentField::ProcessIds => join_ids(&self.process_ids),
            EnvironmentField::Unknown(_) => String::new(),
        }
    }
}

/// Free-form per-environment settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Requested number of attached devices
    #[serde(rename = "gpus", default, skip_serializing_if = "Option::is_none")]
    pub device_count: Option<u32>,
}

/// Configuration key addressed by `configure`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Name,
    DeviceCount,
}

/// A single configuration change: set one key or clear it, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    SetName(String),
    SetDeviceCount(u32),
    Clear(ConfigKey),
}

impl EnvironmentConfig {
    pub fn apply(&mut self, update: ConfigUpdate) {
        match update {
            ConfigUpdate::SetName(name) => self.name = Some(name),
            ConfigUpdate::SetDeviceCount(count) => self.device_count = Some(count),
            ConfigUpdate::Clear(ConfigKey::Name) => self.name = None,
            ConfigUpdate::Clear(ConfigKey::DeviceCount) => self.device_count = None,
        }
    }
}

/// Projectable environment fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentField {
    Id,
    CreatedAt,
    Name,
    DeviceCount,
    OwnerUid,
    OwnerName,
    ProcessIds,
    /// Unrecognized names project to empty columns
    Unknown(String),
}

impl EnvironmentField {
    pub const DEFAULT: [EnvironmentField; 4] = [
        EnvironmentField::Id,
        EnvironmentField::CreatedAt,
        EnvironmentField::Name,
        EnvironmentField::DeviceCount,
    ];

    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "id" | "eid" => Self::Id,
            "created_at" | "creation" => Self::CreatedAt,
            "config.name" | "name" => Self::Name,
            "config.device_count" | "config.gpus" | "gpus" => Self::DeviceCount,
            "uid" => Self::OwnerUid,
            "username" => Self::OwnerName,
            "pids" => Self::ProcessIds,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn header(&self) -> &str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => "created_at",
            Self::Name => "config.name",
            Self::DeviceCount => "config.device_count",
            Self::OwnerUid => "uid",
            Self::OwnerName => "username",
            Self::ProcessIds => "pids",
            Self::Unknown(name) => name,
        }
    }
}

/// A claim by one environment on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "eid")]
    pub env_id: EnvId,
    #[serde(rename = "attached")]
    pub attached_at: Timestamp,
}

/// One unit of the device pool; its index is its key in the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "eids", default)]
    pub attachments: BTreeMap<EnvId, Attachment>,
}

impl Device {
    pub fn is_free(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn is_attached_to(&self, env_id: EnvId) -> bool {
        self.attachments.contains_key(&env_id)
    }

    /// Render one query field; absent values render as an empty string
    pub fn field(&self, index: DeviceIndex, field: &DeviceField) -> String {
        match field {
            DeviceField::Index => index.to_string(),
            DeviceField::EnvIds => {
                let ids: Vec<EnvId> = self.attachments.keys().copied().collect();
                join_ids(&ids)
            }
            DeviceField::AttachedAt => self
                .attachments
                .values()
                .next()
                .map(|a| a.attached_at.to_string())
                .unwrap_or_default(),
            DeviceField::State => {
                let state = if self.is_free() { "free" } else { "attached" };
                state.to_string()
            }
            DeviceField::Unknown(_) => String::new(),
        }
    }
}

/// Projectable device fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceField {
    Index,
    EnvIds,
    AttachedAt,
    State,
    Unknown(String),
}

impl DeviceField {
    pub const DEFAULT: [DeviceField; 4] = [
        DeviceField::Index,
        DeviceField::State,
        DeviceField::EnvIds,
        DeviceField::AttachedAt,
    ];

    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "index" | "id" => Self::Index,
            "eids" | "envs" => Self::EnvIds,
            "attached_at" | "attached" => Self::AttachedAt,
            "state" => Self::State,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn header(&self) -> &str {
        match self {
            Self::Index => "index",
            Self::EnvIds => "eids",
            Self::AttachedAt => "attached_at",
            Self::State => "state",
            Self::Unknown(name) => name,
        }
    }
}

fn join_ids<T: ToString>(ids: &[T]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format() {
        let ts: Timestamp = "2024-03-01 09:15:42".parse().unwrap();
        assert_eq!(ts.to_string(), "2024-03-01 09:15:42");
        assert!("2024-03-01T09:15:42Z".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_timestamp_now_round_trips() {
        let now = Timestamp::now();
        let parsed: Timestamp = now.to_string().parse().unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_environment_document_shape() {
        let mut env = Environment::new(7, 1000, "alice");
        env.created_at = "2024-03-01 09:15:42".parse().unwrap();
        env.process_ids = vec![100, 200];
        env.config.device_count = Some(2);

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["eid"], 7);
        assert_eq!(value["username"], "alice");
        assert_eq!(value["creation"], "2024-03-01 09:15:42");
        assert_eq!(value["pids"], serde_json::json!([100, 200]));
        assert_eq!(value["config"], serde_json::json!({ "gpus": 2 }));
    }

    #[test]
    fn test_config_update() {
        let mut config = EnvironmentConfig::default();
        config.apply(ConfigUpdate::SetName("training".to_string()));
        config.apply(ConfigUpdate::SetDeviceCount(3));
        assert_eq!(config.name.as_deref(), Some("training"));
        assert_eq!(config.device_count, Some(3));

        config.apply(ConfigUpdate::Clear(ConfigKey::Name));
        assert_eq!(config.name, None);
        assert_eq!(config.device_count, Some(3));
    }

    #[test]
    fn test_environment_fields() {
        let mut env = Environment::new(7, 1000, "alice");
        env.process_ids = vec![100, 200];

        assert_eq!(env.field(&EnvironmentField::parse("id")), "7");
        assert_eq!(env.field(&EnvironmentField::parse("config.name")), "");
        assert_eq!(env.field(&EnvironmentField::parse("pids")), "100 200");
        assert_eq!(env.field(&EnvironmentField::parse("bogus")), "");
    }

    #[test]
    fn test_device_fields() {
        let mut device = Device::default();
        assert!(device.is_free());
        assert_eq!(device.field(2, &DeviceField::State), "free");
        assert_eq!(device.field(2, &DeviceField::AttachedAt), "");

        let attached_at: Timestamp = "2024-03-01 09:15:42".parse().unwrap();
        device.attachments.insert(
            9,
            Attachment {
                env_id: 9,
                attached_at,
            },
        );
        assert!(device.is_attached_to(9));
        assert_eq!(device.field(2, &DeviceField::Index), "2");
        assert_eq!(device.field(2, &DeviceField::EnvIds), "9");
        assert_eq!(
            device.field(2, &DeviceField::AttachedAt),
            "2024-03-01 09:15:42"
        );
    }
}
