//! Repo metadata store.
//!
//! A flat string→string map for low-volume, high-value state: the disk
//! layout version and sticky repair flags. Boolean flags are encoded as key
//! presence, not as a value, so a half-written `false` can never be read
//! back as anything other than "flag not set".
//!
//! Snapshot-only journaling: every mutation rewrites the whole file through
//! compaction. Mutation volume is a handful of writes per mount, so the full
//! rewrite is cheaper than carrying an append handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;
use vwd_journal::{EntryCodec, JournalMode, JournalStore, RetryPolicy};

use crate::{Result, StateError};

/// On-disk layout version of the enlistment.
pub const KEY_DISK_LAYOUT_VERSION: &str = "DiskLayoutVersion";
pub const KEY_DISK_LAYOUT_MINOR_VERSION: &str = "DiskLayoutMinorVersion";

/// Sticky flag: the projection must be rebuilt before the next mount.
pub const KEY_PROJECTION_INVALID: &str = "ProjectionInvalid";

/// Sticky flag: placeholder timestamps/attributes need refreshing.
pub const KEY_PLACEHOLDERS_NEED_UPDATE: &str = "PlaceholdersNeedUpdate";

/// Backing path of the live store, if any. One metadata store per process:
/// it describes the enlistment itself, and a second handle with a different
/// path would mean two subsystems disagree about which enlistment this is.
static ACTIVE: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

pub(crate) struct MetadataCodec;

impl EntryCodec for MetadataCodec {
    type Key = String;
    type Value = String;

    const STORE_NAME: &'static str = "metadata";

    fn encode_add(key: &String, value: &String) -> String {
        format!("{key}\0{value}")
    }

    fn encode_remove(key: &String) -> String {
        key.clone()
    }

    fn decode_add(payload: &str) -> Option<(String, String)> {
        let (key, value) = payload.split_once('\0')?;
        Some((key.to_string(), value.to_string()))
    }

    fn decode_remove(payload: &str) -> Option<String> {
        Some(payload.to_string())
    }
}

/// Single-value key/value store for enlistment metadata.
pub struct MetadataStore {
    journal: JournalStore<MetadataCodec>,
    values: Mutex<HashMap<String, String>>,
}

impl MetadataStore {
    /// Open the process-wide metadata store.
    ///
    /// # Panics
    ///
    /// Opening a second store while one is live is a logic bug, not an
    /// environmental condition, and panics.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_policy(path, RetryPolicy::default())
    }

    pub fn open_with_policy(path: impl AsRef<Path>, policy: RetryPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        {
            let mut active = ACTIVE.lock().unwrap();
            if let Some(existing) = active.clone() {
                drop(active);
                panic!(
                    "metadata store already open at {} (second open attempted at {})",
                    existing.display(),
                    path.display()
                );
            }
            *active = Some(path.clone());
        }

        match Self::open_inner(&path, policy) {
            Ok(store) => Ok(store),
            Err(error) => {
                // Roll back the registration so a later open can succeed.
                ACTIVE.lock().unwrap().take();
                Err(error)
            }
        }
    }

    fn open_inner(path: &Path, policy: RetryPolicy) -> Result<Self> {
        let journal = JournalStore::open_with_policy(path, JournalMode::SnapshotOnly, policy)?;
        let values = journal.load()?;
        debug!(keys = values.len(), "metadata store loaded");
        Ok(Self {
            journal,
            values: Mutex::new(values),
        })
    }

    pub fn try_get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.journal
            .compact(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        if values.remove(key).is_some() {
            self.journal
                .compact(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    /// The enlistment's (major, minor) disk layout version, if recorded.
    pub fn disk_layout_version(&self) -> Result<Option<(u32, u32)>> {
        let Some(major) = self.try_get(KEY_DISK_LAYOUT_VERSION) else {
            return Ok(None);
        };
        let major = parse_version(KEY_DISK_LAYOUT_VERSION, &major)?;
        let minor = match self.try_get(KEY_DISK_LAYOUT_MINOR_VERSION) {
            Some(raw) => parse_version(KEY_DISK_LAYOUT_MINOR_VERSION, &raw)?,
            None => 0,
        };
        Ok(Some((major, minor)))
    }

    pub fn set_disk_layout_version(&self, major: u32, minor: u32) -> Result<()> {
        self.set(KEY_DISK_LAYOUT_VERSION, &major.to_string())?;
        self.set(KEY_DISK_LAYOUT_MINOR_VERSION, &minor.to_string())
    }

    pub fn projection_invalid(&self) -> bool {
        self.try_get(KEY_PROJECTION_INVALID).is_some()
    }

    pub fn set_projection_invalid(&self, invalid: bool) -> Result<()> {
        self.set_flag(KEY_PROJECTION_INVALID, invalid)
    }

    pub fn placeholders_need_update(&self) -> bool {
        self.try_get(KEY_PLACEHOLDERS_NEED_UPDATE).is_some()
    }

    pub fn set_placeholders_need_update(&self, needed: bool) -> Result<()> {
        self.set_flag(KEY_PLACEHOLDERS_NEED_UPDATE, needed)
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        if value {
            self.set(key, "true")
        } else {
            self.remove(key)
        }
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        ACTIVE.lock().unwrap().take();
    }
}

fn parse_version(key: &str, raw: &str) -> Result<u32> {
    raw.parse().map_err(|_| StateError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}
