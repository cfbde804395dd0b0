//! Modified-path registry.
//!
//! Records paths the user has modified, which git must therefore manage
//! eagerly instead of projecting. Set semantics: presence means modified.
//! Paths are normalized to forward-slash separators; a trailing slash marks
//! a folder entry.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;
use vwd_journal::{EntryCodec, JournalMode, JournalStore, RetryPolicy};

use crate::{normalize_key, Result};

/// Seeded into every freshly created registry so consumers can always tell
/// an initialized-but-quiet registry from one that was never written.
pub const ALWAYS_MODIFIED_PATH: &str = ".gitattributes";

pub(crate) struct ModifiedPathCodec;

impl EntryCodec for ModifiedPathCodec {
    type Key = String;
    type Value = ();

    const STORE_NAME: &'static str = "modified-paths";

    fn encode_add(key: &String, _value: &()) -> String {
        key.clone()
    }

    fn encode_remove(key: &String) -> String {
        key.clone()
    }

    fn decode_add(payload: &str) -> Option<(String, ())> {
        Some((payload.to_string(), ()))
    }

    fn decode_remove(payload: &str) -> Option<String> {
        Some(payload.to_string())
    }
}

/// Durable set of paths git manages directly.
///
/// Simpler than the placeholder registry: callers never perform a full
/// read-and-rewrite under contention, so no overflow-list machinery is
/// needed; write-then-forget semantics are tolerated by all consumers.
pub struct ModifiedPathRegistry {
    journal: JournalStore<ModifiedPathCodec>,
    paths: Mutex<HashSet<String>>,
}

impl ModifiedPathRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_policy(path, RetryPolicy::default())
    }

    pub fn open_with_policy(path: impl AsRef<Path>, policy: RetryPolicy) -> Result<Self> {
        let journal =
            JournalStore::open_with_policy(path, JournalMode::DirectAppend, policy)?;
        let paths: HashSet<String> = journal.load()?.into_keys().collect();
        debug!(paths = paths.len(), "modified-path registry loaded");

        let registry = Self {
            journal,
            paths: Mutex::new(paths),
        };
        // An empty registry is indistinguishable from an uninitialized one,
        // so seed the always-modified attributes file.
        if registry.len() == 0 {
            registry.add(ALWAYS_MODIFIED_PATH, false)?;
        }
        Ok(registry)
    }

    /// Record `path` as modified. Returns whether the entry was new.
    pub fn add(&self, path: &str, is_folder: bool) -> Result<bool> {
        let key = normalize(path, is_folder);
        let mut paths = self.paths.lock().unwrap();
        if paths.contains(&key) {
            return Ok(false);
        }
        self.journal.append_add(&key, &())?;
        paths.insert(key);
        Ok(true)
    }

    /// Forget `path`. Returns whether an entry was present.
    pub fn remove(&self, path: &str, is_folder: bool) -> Result<bool> {
        let key = normalize(path, is_folder);
        let mut paths = self.paths.lock().unwrap();
        if !paths.contains(&key) {
            return Ok(false);
        }
        self.journal.append_remove(&key)?;
        paths.remove(&key);
        Ok(true)
    }

    pub fn contains(&self, path: &str, is_folder: bool) -> bool {
        self.paths
            .lock()
            .unwrap()
            .contains(&normalize(path, is_folder))
    }

    pub fn len(&self) -> usize {
        self.paths.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in normalized form.
    pub fn get_all(&self) -> Vec<String> {
        self.paths.lock().unwrap().iter().cloned().collect()
    }

    /// Compact the journal to the current live set.
    pub fn flush(&self) {
        let paths = self.paths.lock().unwrap();
        self.journal.compact(paths.iter().map(|p| (p.clone(), ())));
    }
}

/// Normalize to forward slashes, no leading slash, trailing slash iff folder.
fn normalize(path: &str, is_folder: bool) -> String {
    let mut normalized = normalize_key(path).replace('\\', "/");
    while normalized.starts_with('/') {
        normalized.remove(0);
    }
    while normalized.ends_with('/') {
        normalized.pop();
    }
    if is_folder {
        normalized.push('/');
    }
    normalized
}
