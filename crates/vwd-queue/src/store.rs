//! Persisted operation store.
//!
//! Structurally a journal keyed by operation id, but replayed in file order
//! so the queue's FIFO ordering survives a restart.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vwd_journal::{EntryCodec, JournalMode, JournalStore, Replay, RetryPolicy};

use crate::Result;

/// A queued maintenance operation.
///
/// The payload is opaque to the queue; its semantics (and the idempotence
/// that makes at-least-once redelivery safe) belong to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub payload: String,
}

impl Operation {
    /// New operation with a caller-visible fresh id.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
        }
    }

    pub fn with_id(id: Uuid, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

pub(crate) struct OperationCodec;

impl EntryCodec for OperationCodec {
    type Key = Uuid;
    type Value = String;

    const STORE_NAME: &'static str = "operations";

    fn encode_add(key: &Uuid, value: &String) -> String {
        format!("{key} {value}")
    }

    fn encode_remove(key: &Uuid) -> String {
        key.to_string()
    }

    fn decode_add(payload: &str) -> Option<(Uuid, String)> {
        let (id, payload) = payload.split_once(' ')?;
        Some((Uuid::parse_str(id).ok()?, payload.to_string()))
    }

    fn decode_remove(payload: &str) -> Option<Uuid> {
        Uuid::parse_str(payload).ok()
    }
}

/// Durable backing store of the task queue.
pub struct OperationStore {
    journal: JournalStore<OperationCodec>,
}

impl OperationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_policy(path, RetryPolicy::default())
    }

    pub fn open_with_policy(path: impl AsRef<Path>, policy: RetryPolicy) -> Result<Self> {
        let journal =
            JournalStore::open_with_policy(path, JournalMode::DirectAppend, policy)?;
        Ok(Self { journal })
    }

    /// Replay the persisted operations in enqueue order.
    ///
    /// Completed operations (delete records) are folded out; a re-enqueued
    /// id takes its newer position.
    pub fn replay(&self) -> Result<VecDeque<Operation>> {
        let mut order: Vec<Uuid> = Vec::new();
        let mut live: HashMap<Uuid, String> = HashMap::new();
        self.journal.load_with(|record| match record {
            Replay::Add(id, payload) => {
                if live.insert(id, payload).is_none() {
                    order.push(id);
                }
            }
            Replay::Remove(id) => {
                if live.remove(&id).is_some() {
                    order.retain(|queued| *queued != id);
                }
            }
        })?;

        let mut operations = VecDeque::with_capacity(order.len());
        for id in order {
            if let Some(payload) = live.remove(&id) {
                operations.push_back(Operation { id, payload });
            }
        }
        Ok(operations)
    }

    /// Persist an operation. Flushed before returning.
    pub fn append(&self, operation: &Operation) -> Result<()> {
        self.journal.append_add(&operation.id, &operation.payload)?;
        Ok(())
    }

    /// Persist completion of an operation.
    pub fn remove(&self, id: &Uuid) -> Result<()> {
        self.journal.append_remove(id)?;
        Ok(())
    }

    /// Rewrite the store down to the given remaining operations.
    pub fn compact<I>(&self, remaining: I)
    where
        I: IntoIterator<Item = Operation>,
    {
        self.journal
            .compact(remaining.into_iter().map(|op| (op.id, op.payload)));
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }
}
