//! Placeholder registry.
//!
//! Tracks every virtual placeholder the provider has projected: files by the
//! 40-hex content hash they were materialized from, folders by whether their
//! children have been enumerated yet.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;
use vwd_journal::{EntryCodec, JournalMode, JournalStore, RetryPolicy};

use crate::{normalize_key, Result, StateError};

/// Length of a hex-encoded SHA-1 content hash.
pub const SHA1_HEX_LEN: usize = 40;

/// Marker for a folder placeholder whose children have not been enumerated.
///
/// Folder sentinels are exactly [`SHA1_HEX_LEN`] characters but contain
/// non-hex characters, so they can never collide with a real content hash.
pub const PARTIAL_FOLDER_SENTINEL: &str = "----------------PARTIAL-FOLDER----------";

/// Marker for a folder placeholder whose children have all been enumerated.
pub const EXPANDED_FOLDER_SENTINEL: &str = "---------------EXPANDED-FOLDER----------";

/// What a placeholder path points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderMarker {
    /// File placeholder, carrying the hex content hash it projects.
    File(String),
    /// Folder placeholder, children not yet enumerated.
    PartialFolder,
    /// Folder placeholder, fully enumerated.
    ExpandedFolder,
}

impl PlaceholderMarker {
    /// Build a file marker, validating the hash shape.
    pub fn file(sha: &str) -> Result<Self> {
        if sha.len() != SHA1_HEX_LEN || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StateError::InvalidSha(sha.to_string()));
        }
        Ok(Self::File(sha.to_string()))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::PartialFolder | Self::ExpandedFolder)
    }

    pub fn is_expanded_folder(&self) -> bool {
        matches!(self, Self::ExpandedFolder)
    }

    fn encode(&self) -> &str {
        match self {
            Self::File(sha) => sha,
            Self::PartialFolder => PARTIAL_FOLDER_SENTINEL,
            Self::ExpandedFolder => EXPANDED_FOLDER_SENTINEL,
        }
    }

    fn decode(marker: &str) -> Option<Self> {
        match marker {
            PARTIAL_FOLDER_SENTINEL => Some(Self::PartialFolder),
            EXPANDED_FOLDER_SENTINEL => Some(Self::ExpandedFolder),
            sha => Self::file(sha).ok(),
        }
    }
}

pub(crate) struct PlaceholderCodec;

impl EntryCodec for PlaceholderCodec {
    type Key = String;
    type Value = PlaceholderMarker;

    const STORE_NAME: &'static str = "placeholders";

    fn encode_add(key: &String, value: &PlaceholderMarker) -> String {
        format!("{key}\0{}", value.encode())
    }

    fn encode_remove(key: &String) -> String {
        key.clone()
    }

    fn decode_add(payload: &str) -> Option<(String, PlaceholderMarker)> {
        let (path, marker) = payload.split_once('\0')?;
        Some((normalize_key(path), PlaceholderMarker::decode(marker)?))
    }

    fn decode_remove(payload: &str) -> Option<String> {
        Some(normalize_key(payload))
    }
}

enum RebuildMode {
    Normal,
    Rebuilding(Vec<OverflowRecord>),
}

enum OverflowRecord {
    Add(String, PlaceholderMarker),
    Remove(String),
}

struct RegistryState {
    entries: HashMap<String, PlaceholderMarker>,
    mode: RebuildMode,
    generation: u64,
}

/// Token held by a caller while a read-all/write-all rebuild cycle is open.
///
/// Obtained from [`PlaceholderRegistry::start_rebuild`] and consumed by
/// [`PlaceholderRegistry::write_all`]; holding one means concurrent
/// mutations are being captured in the overflow list.
#[must_use = "a rebuild cycle must be finished with write_all"]
pub struct RebuildCycle {
    generation: u64,
}

/// Entry counts by kind, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceholderCounts {
    pub files: usize,
    pub partial_folders: usize,
    pub expanded_folders: usize,
}

/// Durable registry of projected placeholders.
///
/// Backed by a direct-append journal; single-entry mutations are one flushed
/// line each. A full rebuild (recomputing which paths should be placeholders)
/// uses [`start_rebuild`](Self::start_rebuild) /
/// [`write_all`](Self::write_all), which capture concurrent mutations in an
/// overflow list so live virtualization activity is never silently
/// overwritten by the rewrite.
pub struct PlaceholderRegistry {
    journal: JournalStore<PlaceholderCodec>,
    state: Mutex<RegistryState>,
}

impl PlaceholderRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_policy(path, RetryPolicy::default())
    }

    pub fn open_with_policy(path: impl AsRef<Path>, policy: RetryPolicy) -> Result<Self> {
        let journal =
            JournalStore::open_with_policy(path, JournalMode::DirectAppend, policy)?;
        let entries = journal.load()?;
        debug!(entries = entries.len(), "placeholder registry loaded");
        Ok(Self {
            journal,
            state: Mutex::new(RegistryState {
                entries,
                mode: RebuildMode::Normal,
                generation: 0,
            }),
        })
    }

    /// Record a file placeholder for `path` projecting `sha`.
    pub fn add_file(&self, path: &str, sha: &str) -> Result<()> {
        self.add(path, PlaceholderMarker::file(sha)?)
    }

    /// Record a folder placeholder for `path`.
    pub fn add_folder(&self, path: &str, expanded: bool) -> Result<()> {
        let marker = if expanded {
            PlaceholderMarker::ExpandedFolder
        } else {
            PlaceholderMarker::PartialFolder
        };
        self.add(path, marker)
    }

    /// Upsert a placeholder entry.
    pub fn add(&self, path: &str, marker: PlaceholderMarker) -> Result<()> {
        let key = normalize_key(path);
        let mut state = self.state.lock().unwrap();
        self.journal.append_add(&key, &marker)?;
        state.entries.insert(key.clone(), marker.clone());
        if let RebuildMode::Rebuilding(overflow) = &mut state.mode {
            overflow.push(OverflowRecord::Add(key, marker));
        }
        Ok(())
    }

    /// Remove the placeholder entry for `path`, if any.
    pub fn remove(&self, path: &str) -> Result<()> {
        let key = normalize_key(path);
        let mut state = self.state.lock().unwrap();
        self.journal.append_remove(&key)?;
        state.entries.remove(&key);
        if let RebuildMode::Rebuilding(overflow) = &mut state.mode {
            overflow.push(OverflowRecord::Remove(key));
        }
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .contains_key(&normalize_key(path))
    }

    pub fn get(&self, path: &str) -> Option<PlaceholderMarker> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(&normalize_key(path))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry.
    pub fn get_all_entries(&self) -> Vec<(String, PlaceholderMarker)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .map(|(path, marker)| (path.clone(), marker.clone()))
            .collect()
    }

    /// Snapshot of file placeholders only, as path → content hash.
    pub fn get_all_file_entries(&self) -> HashMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter_map(|(path, marker)| match marker {
                PlaceholderMarker::File(sha) => Some((path.clone(), sha.clone())),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of folder placeholders only, as path → is-expanded.
    pub fn get_folder_entries(&self) -> Vec<(String, bool)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter_map(|(path, marker)| match marker {
                PlaceholderMarker::PartialFolder => Some((path.clone(), false)),
                PlaceholderMarker::ExpandedFolder => Some((path.clone(), true)),
                PlaceholderMarker::File(_) => None,
            })
            .collect()
    }

    pub fn counts(&self) -> PlaceholderCounts {
        let state = self.state.lock().unwrap();
        let mut counts = PlaceholderCounts::default();
        for marker in state.entries.values() {
            match marker {
                PlaceholderMarker::File(_) => counts.files += 1,
                PlaceholderMarker::PartialFolder => counts.partial_folders += 1,
                PlaceholderMarker::ExpandedFolder => counts.expanded_folders += 1,
            }
        }
        counts
    }

    /// Begin a read-all/write-all rebuild cycle.
    ///
    /// Returns the current entries plus a [`RebuildCycle`] token. Until the
    /// token is consumed by [`write_all`](Self::write_all), every concurrent
    /// `add`/`remove` is appended to an overflow list as well as the journal.
    ///
    /// # Panics
    ///
    /// Starting a second cycle before the first is flushed is a caller bug
    /// and panics.
    pub fn start_rebuild(&self) -> (RebuildCycle, Vec<(String, PlaceholderMarker)>) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.mode, RebuildMode::Rebuilding(_)) {
            panic!("placeholder rebuild cycle already in progress");
        }
        state.mode = RebuildMode::Rebuilding(Vec::new());
        state.generation += 1;
        let snapshot = state
            .entries
            .iter()
            .map(|(path, marker)| (path.clone(), marker.clone()))
            .collect();
        (
            RebuildCycle {
                generation: state.generation,
            },
            snapshot,
        )
    }

    /// Finish a rebuild cycle by replacing the registry contents.
    ///
    /// The new snapshot is applied first, then the overflow list is replayed
    /// on top of it (removes delete, adds upsert), so anything that happened
    /// after the snapshot was taken wins. The journal is compacted to the
    /// merged state.
    ///
    /// # Panics
    ///
    /// Panics when given a token from a different registry or a stale cycle.
    pub fn write_all<I>(&self, cycle: RebuildCycle, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, PlaceholderMarker)>,
    {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            cycle.generation, state.generation,
            "rebuild cycle token does not belong to this registry"
        );
        let overflow = match std::mem::replace(&mut state.mode, RebuildMode::Normal) {
            RebuildMode::Rebuilding(overflow) => overflow,
            RebuildMode::Normal => panic!("write_all without an open rebuild cycle"),
        };

        let mut merged: HashMap<String, PlaceholderMarker> = entries
            .into_iter()
            .map(|(path, marker)| (normalize_key(&path), marker))
            .collect();
        let overflow_len = overflow.len();
        for record in overflow {
            match record {
                OverflowRecord::Add(key, marker) => {
                    merged.insert(key, marker);
                }
                OverflowRecord::Remove(key) => {
                    merged.remove(&key);
                }
            }
        }

        self.journal
            .compact(merged.iter().map(|(k, v)| (k.clone(), v.clone())));
        debug!(
            entries = merged.len(),
            overflow = overflow_len,
            "placeholder registry rewritten"
        );
        state.entries = merged;
        Ok(())
    }

    /// Compact the journal to the current live state.
    pub fn flush(&self) {
        let state = self.state.lock().unwrap();
        self.journal
            .compact(state.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}
