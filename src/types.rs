use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Slot identifiers handed out at initialization, in port order.
pub const SLOT_IDS: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Port assigned to the first slot; the rest follow consecutively.
pub const BASE_PORT: u16 = 3001;

pub fn is_valid_slot_id(id: &str) -> bool {
    SLOT_IDS.contains(&id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Empty,
    Deployed,
    Error,
    Stopped,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Empty => write!(f, "empty"),
            SlotStatus::Deployed => write!(f, "deployed"),
            SlotStatus::Error => write!(f, "error"),
            SlotStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Nodejs,
    Static,
    Unset,
}

/// One slot record as stored in the slots document.
///
/// Every field is read leniently: a value of the wrong shape is treated as
/// absent instead of failing the whole document. Such values, and keys this
/// struct does not know, are kept in `extra` and written back verbatim, so
/// rewrites never drop what other writers put there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slot {
    pub status: Option<SlotStatus>,
    pub slot_type: Option<SlotType>,
    pub static_root: Option<PathBuf>,
    pub spa_mode: Option<bool>,
    pub port: Option<u16>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub last_deploy: Option<DateTime<Utc>>,
    pub deploy_count: u64,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Slot {
    /// A freshly initialized, empty slot pinned to `port`.
    pub fn empty(port: u16) -> Self {
        Self {
            status: Some(SlotStatus::Empty),
            port: Some(port),
            repository: Some(String::new()),
            branch: Some("main".into()),
            ..Self::default()
        }
    }

    /// Known fields that are set, then any `extra` key not already written.
    /// An unreadable raw value stays in place until its field is set.
    fn to_map(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        let mut out = serde_json::Map::new();
        put_field(&mut out, "status", &self.status)?;
        put_field(&mut out, "type", &self.slot_type)?;
        put_field(&mut out, "static_root", &self.static_root)?;
        put_field(&mut out, "spa_mode", &self.spa_mode)?;
        put_field(&mut out, "port", &self.port)?;
        put_field(&mut out, "repository", &self.repository)?;
        put_field(&mut out, "branch", &self.branch)?;
        if !self.environment.is_empty() || !self.extra.contains_key("environment") {
            out.insert("environment".into(), serde_json::to_value(&self.environment)?);
        }
        put_field(&mut out, "last_deploy", &self.last_deploy)?;
        if self.deploy_count != 0 || !self.extra.contains_key("deploy_count") {
            out.insert("deploy_count".into(), self.deploy_count.into());
        }
        for (key, value) in &self.extra {
            out.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(out)
    }
}

impl<'de> Deserialize<'de> for Slot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut raw = serde_json::Map::deserialize(deserializer)?;
        Ok(Slot {
            status: take_field(&mut raw, "status"),
            slot_type: take_field(&mut raw, "type"),
            static_root: take_field(&mut raw, "static_root"),
            spa_mode: take_field(&mut raw, "spa_mode"),
            port: take_field(&mut raw, "port"),
            repository: take_field(&mut raw, "repository"),
            branch: take_field(&mut raw, "branch"),
            environment: take_field(&mut raw, "environment").unwrap_or_default(),
            last_deploy: take_field(&mut raw, "last_deploy"),
            deploy_count: take_field(&mut raw, "deploy_count").unwrap_or_default(),
            extra: raw,
        })
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

/// Parse `key` out of `raw`; a value that does not parse is left behind.
fn take_field<T: DeserializeOwned>(raw: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> Option<T> {
    let value = raw.remove(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            raw.insert(key.to_string(), value);
            None
        }
    }
}

fn put_field<T: Serialize>(
    out: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
    value: &Option<T>,
) -> serde_json::Result<()> {
    if let Some(v) = value {
        out.insert(key.to_string(), serde_json::to_value(v)?);
    }
    Ok(())
}

/// The whole slots document (`slots.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlotsDocument {
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SlotsDocument {
    /// Document with every known slot empty on consecutive ports.
    pub fn initial() -> Self {
        let slots = SLOT_IDS
            .iter()
            .zip(BASE_PORT..)
            .map(|(id, port)| (id.to_string(), Slot::empty(port)))
            .collect();
        Self {
            slots,
            last_updated: Some(Utc::now()),
            extra: serde_json::Map::new(),
        }
    }

    /// Slot id that currently owns `port`, if any.
    pub fn port_owner(&self, port: u16) -> Option<&str> {
        self.slots
            .iter()
            .find(|(_, s)| s.port == Some(port))
            .map(|(id, _)| id.as_str())
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// How a slot's port is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ServeMode {
    Placeholder,
    Static {
        static_root: Option<PathBuf>,
        spa: bool,
    },
    /// Owned by the external process supervisor; no listener here.
    Unmanaged,
}

impl ServeMode {
    pub fn name(&self) -> &'static str {
        match self {
            ServeMode::Placeholder => "placeholder",
            ServeMode::Static { .. } => "static",
            ServeMode::Unmanaged => "unmanaged",
        }
    }

    pub fn is_managed(&self) -> bool {
        !matches!(self, ServeMode::Unmanaged)
    }
}

/// A listener the reconciler wants bound, or has bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerEntry {
    pub port: u16,
    pub slot: String,
    #[serde(flatten)]
    pub mode: ServeMode,
}

/// Payload of `GET /health` on every managed port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub slot: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub mode: String,
    pub timestamp: DateTime<Utc>,
}

/// Classification of one slot, as reported by `show` and `/api/slots`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotView {
    pub slot: String,
    pub port: Option<u16>,
    pub status: Option<SlotStatus>,
    pub mode: String,
}
