//! Slots document persistence.
//!
//! Readers never see a partial document: every write goes to a temp file in
//! the same directory and is renamed into place. Multi-step updates hold a
//! cooperative `<file>.lock` created with `O_EXCL` semantics.

use crate::config::LockSettings;
use crate::types::{is_valid_slot_id, Slot, SlotStatus, SlotType, SlotsDocument};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize slots document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to create lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to acquire lock {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("unknown slot: {0} (expected one of a-e)")]
    UnknownSlot(String),

    #[error("port {port} is already assigned to slot {owner}")]
    PortConflict { port: u16, owner: String },

    #[error("slot {slot} is pinned to port {current}; refusing to move it to {requested}")]
    PortImmutable {
        slot: String,
        current: u16,
        requested: u16,
    },

    #[error("slot {slot} has an unreadable port value; refusing to assign {requested}")]
    UnreadablePort { slot: String, requested: u16 },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Field changes for one slot. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SlotPatch {
    pub status: Option<SlotStatus>,
    pub slot_type: Option<SlotType>,
    pub static_root: Option<PathBuf>,
    pub spa_mode: Option<bool>,
    pub port: Option<u16>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub environment: Vec<(String, String)>,
    pub last_deploy: Option<DateTime<Utc>>,
    pub inc_deploy_count: bool,
}

impl SlotPatch {
    fn apply(&self, slot: &mut Slot, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            slot.status = Some(status);
            slot.last_deploy = Some(self.last_deploy.unwrap_or(now));
        } else if let Some(ts) = self.last_deploy {
            slot.last_deploy = Some(ts);
        }
        if let Some(t) = self.slot_type {
            slot.slot_type = Some(t);
        }
        if let Some(root) = &self.static_root {
            slot.static_root = Some(root.clone());
        }
        if let Some(spa) = self.spa_mode {
            slot.spa_mode = Some(spa);
        }
        if let Some(port) = self.port {
            slot.port = Some(port);
        }
        if let Some(repo) = &self.repository {
            slot.repository = Some(repo.clone());
        }
        if let Some(branch) = &self.branch {
            slot.branch = Some(branch.clone());
        }
        for (k, v) in &self.environment {
            slot.environment.insert(k.clone(), v.clone());
        }
        if self.inc_deploy_count {
            slot.deploy_count += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock: LockSettings,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: LockSettings::default(),
        }
    }

    pub fn with_lock_settings(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        lock_path(&self.path)
    }

    pub fn load(&self) -> StoreResult<SlotsDocument> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the whole document via temp file + rename.
    pub fn write_atomic(&self, doc: &SlotsDocument) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(doc)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp_path = temp_path(&self.path);
        let result = (|| {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)
        })();
        if let Err(e) = result {
            std::fs::remove_file(&tmp_path).ok();
            return Err(write_err(e));
        }
        Ok(())
    }

    /// Run `f` while holding the document lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self.acquire_lock()?;
        f()
    }

    fn acquire_lock(&self) -> StoreResult<LockGuard> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Lock {
                path: lock_path.clone(),
                source,
            })?;
        }

        let attempts = self.lock.retries.max(1);
        for attempt in 1..=attempts {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.break_stale_lock(&lock_path) {
                        continue;
                    }
                    debug!("Lock {} busy (attempt {})", lock_path.display(), attempt);
                    std::thread::sleep(self.lock.delay());
                }
                Err(source) => {
                    return Err(StoreError::Lock {
                        path: lock_path,
                        source,
                    })
                }
            }
        }

        Err(StoreError::LockTimeout {
            path: lock_path,
            attempts,
        })
    }

    fn lock_age(path: &Path) -> Option<Duration> {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
    }

    /// Remove an abandoned lock. Returns true when the caller should retry
    /// `create_new` right away.
    ///
    /// The lock is first claimed by renaming it to a unique name, so of several
    /// contenders that all saw it stale only one gets to remove it. The claimed
    /// file's age is checked again because a fresh lock may have replaced the
    /// stale one in between; such a lock is linked back into place.
    fn break_stale_lock(&self, lock_path: &Path) -> bool {
        let stale_after = self.lock.stale_after();
        if !Self::lock_age(lock_path).is_some_and(|age| age > stale_after) {
            return false;
        }

        let claimed = stale_claim_path(lock_path);
        if let Err(e) = std::fs::rename(lock_path, &claimed) {
            // Someone else claimed or released it first.
            return e.kind() == std::io::ErrorKind::NotFound;
        }

        match Self::lock_age(&claimed) {
            Some(age) if age > stale_after => {
                warn!(
                    "Removing stale lock {} ({}s old)",
                    lock_path.display(),
                    age.as_secs()
                );
                std::fs::remove_file(&claimed).ok();
                true
            }
            _ => {
                if let Err(e) = std::fs::hard_link(&claimed, lock_path) {
                    warn!(
                        "Could not restore live lock {}: {}",
                        lock_path.display(),
                        e
                    );
                }
                std::fs::remove_file(&claimed).ok();
                false
            }
        }
    }

    /// Locked read-modify-write. Stamps `last_updated` and returns the written document.
    pub fn update<F>(&self, mutate: F) -> StoreResult<SlotsDocument>
    where
        F: FnOnce(&mut SlotsDocument) -> StoreResult<()>,
    {
        self.with_lock(|| {
            let mut doc = match self.load() {
                Ok(doc) => doc,
                Err(StoreError::Read { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    SlotsDocument::default()
                }
                Err(e) => return Err(e),
            };
            mutate(&mut doc)?;
            doc.last_updated = Some(Utc::now());
            self.write_atomic(&doc)?;
            Ok(doc)
        })
    }

    /// Apply `patch` to one slot, enforcing port uniqueness and immutability.
    pub fn patch_slot(&self, slot_id: &str, patch: &SlotPatch) -> StoreResult<Slot> {
        if !is_valid_slot_id(slot_id) {
            return Err(StoreError::UnknownSlot(slot_id.to_string()));
        }
        let doc = self.update(|doc| {
            if let Some(requested) = patch.port {
                if let Some(owner) = doc.port_owner(requested) {
                    if owner != slot_id {
                        return Err(StoreError::PortConflict {
                            port: requested,
                            owner: owner.to_string(),
                        });
                    }
                }
                if let Some(existing) = doc.slots.get(slot_id) {
                    match existing.port {
                        Some(current) if current != requested => {
                            return Err(StoreError::PortImmutable {
                                slot: slot_id.to_string(),
                                current,
                                requested,
                            });
                        }
                        None if existing.extra.contains_key("port") => {
                            return Err(StoreError::UnreadablePort {
                                slot: slot_id.to_string(),
                                requested,
                            });
                        }
                        _ => {}
                    }
                }
            }
            let slot = doc.slots.entry(slot_id.to_string()).or_default();
            patch.apply(slot, Utc::now());
            Ok(())
        })?;
        info!("Updated slot {} in {}", slot_id, self.path.display());
        Ok(doc.slots.get(slot_id).cloned().unwrap_or_default())
    }

    /// Restore a slot's placeholder state, dropping its static site settings.
    pub fn reset_slot(&self, slot_id: &str) -> StoreResult<Slot> {
        if !is_valid_slot_id(slot_id) {
            return Err(StoreError::UnknownSlot(slot_id.to_string()));
        }
        let doc = self.update(|doc| {
            let slot = doc.slots.entry(slot_id.to_string()).or_default();
            slot.status = Some(SlotStatus::Empty);
            slot.slot_type = None;
            slot.static_root = None;
            slot.spa_mode = None;
            for key in ["type", "static_root", "spa_mode"] {
                slot.extra.remove(key);
            }
            Ok(())
        })?;
        info!("Reset slot {} to placeholder", slot_id);
        Ok(doc.slots.get(slot_id).cloned().unwrap_or_default())
    }

    /// Write the initial document. Returns `false` when one already exists and
    /// `force` is not set.
    pub fn init(&self, force: bool) -> StoreResult<bool> {
        self.with_lock(|| {
            if self.path.exists() && !force {
                return Ok(false);
            }
            self.write_atomic(&SlotsDocument::initial())?;
            info!("Initialized slots document at {}", self.path.display());
            Ok(true)
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `dir/name.lock`
fn lock_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.lock", file_name(path)))
}

/// `dir/.name.<uuid>.tmp`, hidden and unique per write.
fn temp_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(".{}.{}.tmp", file_name(path), uuid::Uuid::new_v4()))
}

/// `dir/name.lock.<uuid>.stale`, unique per claim attempt.
fn stale_claim_path(lock_path: &Path) -> PathBuf {
    lock_path.with_file_name(format!("{}.{}.stale", file_name(lock_path), uuid::Uuid::new_v4()))
}
