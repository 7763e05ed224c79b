use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Filesystem events (inotify / FSEvents / ReadDirectoryChangesW)
    Native,
    /// Periodic content comparison
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    pub mode: WatchMode,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            mode: WatchMode::Native,
            debounce_ms: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl WatchSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Lock-file protocol used for read-modify-write of the slots document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub retries: u32,
    pub delay_ms: u64,
    /// A lock file older than this is assumed abandoned and removed.
    pub stale_after_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retries: 30,
            delay_ms: 100,
            stale_after_ms: 30_000,
        }
    }
}

impl LockSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Daemon settings. Loaded from YAML; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub config_path: PathBuf,
    pub placeholder_dir: PathBuf,
    pub host: IpAddr,
    pub watch: WatchSettings,
    pub retry_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub lock: LockSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/slots.json"),
            placeholder_dir: PathBuf::from("placeholders/slots"),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            watch: WatchSettings::default(),
            retry_interval_ms: 2000,
            drain_timeout_ms: 5000,
            lock: LockSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings {}", path.display()))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
