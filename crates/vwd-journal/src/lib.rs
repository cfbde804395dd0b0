//! # vwd-journal
//!
//! Generic append-only journaled key-value store.
//!
//! A journal is a line-oriented UTF-8 file of `A <payload>` (upsert) and
//! `D <payload>` (delete) records. Replaying the file in order and folding
//! last-writer-wins per key reconstructs the live state; compaction rewrites
//! the file down to one `A` line per live key via an atomic temp-write +
//! rename.
//!
//! Two append modes are supported, chosen at construction:
//!
//! - [`JournalMode::DirectAppend`]: a long-lived writable handle, one
//!   `write + flush` per mutation. For stores with frequent single-entry
//!   mutations (placeholders, modified paths).
//! - [`JournalMode::SnapshotOnly`]: no appends at all; every mutation goes
//!   through [`JournalStore::compact`]. For low-volume stores where a full
//!   rewrite is cheap (repo metadata).

pub mod retry;

pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{retry_bounded, retry_forever};

/// Fixed line terminator, identical on every platform so journal files stay
/// portable across hosts.
pub const LINE_TERMINATOR: &str = "\r\n";

const ADD_PREFIX: &str = "A ";
const REMOVE_PREFIX: &str = "D ";

/// Attempts for fail-fast open paths before surfacing the error.
const OPEN_ATTEMPTS: u32 = 3;

/// Errors surfaced by journal operations.
///
/// Transient I/O failures on the compaction path are retried internally and
/// never reach callers; [`JournalError::Corrupt`] requires manual repair or
/// recreation of the store, never auto-discard.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt {store} journal at line {line}: {}", .path.display())]
    Corrupt {
        store: &'static str,
        path: PathBuf,
        line: usize,
    },
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Per-store payload encoding.
///
/// The journal itself only understands opcodes and lines; everything inside a
/// payload is defined by the codec. Payloads must not contain the line
/// terminator.
pub trait EntryCodec {
    type Key: Eq + Hash + Clone;
    type Value: Clone;

    /// Store name used in corruption diagnostics.
    const STORE_NAME: &'static str;

    fn encode_add(key: &Self::Key, value: &Self::Value) -> String;
    fn encode_remove(key: &Self::Key) -> String;
    fn decode_add(payload: &str) -> Option<(Self::Key, Self::Value)>;
    fn decode_remove(payload: &str) -> Option<Self::Key>;
}

/// Append behavior of a [`JournalStore`], fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Long-lived append handle; one flushed write per mutation.
    DirectAppend,
    /// No appends; all mutation goes through `compact`.
    SnapshotOnly,
}

/// A replayed journal record, in file order.
#[derive(Debug)]
pub enum Replay<K, V> {
    Add(K, V),
    Remove(K),
}

/// Journaled key-value store parameterized over an [`EntryCodec`].
///
/// All file mutation happens under one internal mutex, so a reader observing
/// the file between compaction's temp-write and rename never sees a torn
/// store: the rename is the only visible state transition.
pub struct JournalStore<C: EntryCodec> {
    path: PathBuf,
    mode: JournalMode,
    policy: RetryPolicy,
    writer: Mutex<Option<File>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: EntryCodec> JournalStore<C> {
    /// Open (creating if absent) the journal at `path` with default retry
    /// tuning.
    pub fn open(path: impl AsRef<Path>, mode: JournalMode) -> Result<Self> {
        Self::open_with_policy(path, mode, RetryPolicy::default())
    }

    /// Open (creating if absent) the journal at `path`.
    ///
    /// The parent directory and the file are created when missing. In
    /// direct-append mode a torn final line left by a crash mid-write is
    /// truncated away before the append handle is positioned at end-of-file.
    /// Open failures are retried fail-fast (bounded) and then surfaced.
    pub fn open_with_policy(
        path: impl AsRef<Path>,
        mode: JournalMode,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create the file if it does not exist yet, regardless of mode.
        retry_bounded(policy, OPEN_ATTEMPTS, "journal create", || {
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .map(drop)
        })?;

        let writer = match mode {
            JournalMode::DirectAppend => {
                repair_tail(&path, C::STORE_NAME)?;
                let file = retry_bounded(policy, OPEN_ATTEMPTS, "journal open", || {
                    OpenOptions::new().append(true).open(&path)
                })?;
                Some(file)
            }
            JournalMode::SnapshotOnly => None,
        };

        Ok(Self {
            path,
            mode,
            policy,
            writer: Mutex::new(writer),
            _codec: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> JournalMode {
        self.mode
    }

    /// Replay the journal in file order, invoking `apply` per record.
    ///
    /// The first unparsable line fails the whole load with a
    /// [`JournalError::Corrupt`] carrying the 1-based line number. Partial
    /// recovery is deliberately not attempted: skipping a delete record would
    /// silently resurrect an entry a later line was meant to negate.
    pub fn load_with<F>(&self, mut apply: F) -> Result<()>
    where
        F: FnMut(Replay<C::Key, C::Value>),
    {
        let _guard = self.writer.lock().unwrap();
        let text = fs::read_to_string(&self.path)?;

        let mut lines: Vec<&str> = text.split(LINE_TERMINATOR).collect();
        // A well-formed file ends with the terminator, leaving one empty
        // trailing fragment after the split.
        if lines.last() == Some(&"") {
            lines.pop();
        }

        for (index, line) in lines.iter().enumerate() {
            let record = if let Some(payload) = line.strip_prefix(ADD_PREFIX) {
                C::decode_add(payload).map(|(k, v)| Replay::Add(k, v))
            } else if let Some(payload) = line.strip_prefix(REMOVE_PREFIX) {
                C::decode_remove(payload).map(Replay::Remove)
            } else {
                None
            };
            match record {
                Some(record) => apply(record),
                None => {
                    return Err(JournalError::Corrupt {
                        store: C::STORE_NAME,
                        path: self.path.clone(),
                        line: index + 1,
                    })
                }
            }
        }
        Ok(())
    }

    /// Replay the journal into its folded live state.
    pub fn load(&self) -> Result<HashMap<C::Key, C::Value>> {
        let mut map = HashMap::new();
        self.load_with(|record| match record {
            Replay::Add(key, value) => {
                map.insert(key, value);
            }
            Replay::Remove(key) => {
                map.remove(&key);
            }
        })?;
        Ok(map)
    }

    /// Number of live keys after folding the journal.
    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entry_count()? == 0)
    }

    /// Append an upsert record. Only legal in direct-append mode.
    pub fn append_add(&self, key: &C::Key, value: &C::Value) -> Result<()> {
        self.append_line(ADD_PREFIX, &C::encode_add(key, value))
    }

    /// Append a delete record. Only legal in direct-append mode.
    pub fn append_remove(&self, key: &C::Key) -> Result<()> {
        self.append_line(REMOVE_PREFIX, &C::encode_remove(key))
    }

    fn append_line(&self, prefix: &str, payload: &str) -> Result<()> {
        assert!(
            !payload.contains(LINE_TERMINATOR),
            "{} journal payload contains the line terminator",
            C::STORE_NAME
        );
        let mut guard = self.writer.lock().unwrap();
        let file = guard
            .as_mut()
            .unwrap_or_else(|| panic!("append to snapshot-only {} journal", C::STORE_NAME));

        let mut line = String::with_capacity(prefix.len() + payload.len() + LINE_TERMINATOR.len());
        line.push_str(prefix);
        line.push_str(payload);
        line.push_str(LINE_TERMINATOR);

        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrite the journal to the minimal snapshot of `live` entries.
    ///
    /// The new contents are written to a sibling temp file, flushed, and
    /// renamed over the journal. Transient failures are retried without bound
    /// (with sampled logging); if the temp file vanishes between write and
    /// rename the cycle restarts from the temp write. Snapshot lines are
    /// written in sorted order, so compacting twice with no intervening
    /// mutation yields byte-identical contents.
    ///
    /// Blocks until the replace succeeds; holds the store mutex for the whole
    /// sequence, stalling concurrent appends.
    pub fn compact<I>(&self, live: I)
    where
        I: IntoIterator<Item = (C::Key, C::Value)>,
    {
        let mut guard = self.writer.lock().unwrap();

        let mut encoded: Vec<String> = live
            .into_iter()
            .map(|(key, value)| C::encode_add(&key, &value))
            .collect();
        encoded.sort_unstable();

        let mut body = String::new();
        for payload in &encoded {
            assert!(
                !payload.contains(LINE_TERMINATOR),
                "{} journal payload contains the line terminator",
                C::STORE_NAME
            );
            body.push_str(ADD_PREFIX);
            body.push_str(payload);
            body.push_str(LINE_TERMINATOR);
        }

        let temp_path = temp_sibling(&self.path);
        retry_forever(self.policy, "journal compaction", || {
            write_file(&temp_path, body.as_bytes())?;
            if !temp_path.exists() {
                // Something deleted the temp file out from under us; restart
                // the cycle from the temp write.
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "temp journal vanished before replace",
                ));
            }
            fs::rename(&temp_path, &self.path)
        });
        debug!(
            store = C::STORE_NAME,
            entries = encoded.len(),
            "journal compacted"
        );

        // The old handle points at the replaced inode; reacquire positioned
        // at end-of-file. The process cannot continue without a writable
        // handle, so this retries without bound.
        if self.mode == JournalMode::DirectAppend {
            *guard = Some(retry_forever(self.policy, "journal reopen", || {
                OpenOptions::new().append(true).open(&self.path)
            }));
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Truncate a torn final line left by a crash mid-append.
///
/// Scans backward for the last complete line terminator; any bytes after it
/// belong to an append that never finished and are dropped before replay.
fn repair_tail(path: &Path, store: &'static str) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    if contents.is_empty() || contents.ends_with(LINE_TERMINATOR.as_bytes()) {
        return Ok(());
    }

    let keep = contents
        .windows(LINE_TERMINATOR.len())
        .rposition(|window| window == LINE_TERMINATOR.as_bytes())
        .map(|pos| pos + LINE_TERMINATOR.len())
        .unwrap_or(0);
    warn!(
        store,
        path = %path.display(),
        dropped_bytes = contents.len() - keep,
        "truncating torn journal tail"
    );
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}
