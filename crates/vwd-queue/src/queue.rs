//! Background task queue.
//!
//! One dedicated worker thread per queue instance; producers are arbitrary
//! caller threads (typically virtualization callbacks). The worker only
//! processes while the provider holds the exclusion lock internally, and
//! releases it whenever the queue runs dry so external git processes are
//! never starved by an idle provider.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};
use vwd_lock::ExclusionLock;

use crate::store::{Operation, OperationStore};
use crate::{QueueError, Result};

/// Three-way outcome of a processing callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    /// Environmental failure; the same operation is retried in place after
    /// a fixed backoff.
    Retryable,
    /// Unrecoverable. The queue terminates the whole host process: running
    /// on with partially-applied virtualization state is considered unsafe.
    Fatal,
}

/// Pluggable task semantics, injected at queue construction.
pub trait TaskProcessor: Send + 'static {
    fn process(&mut self, operation: &Operation) -> TaskResult;

    /// Runs once before each batch, after the exclusion lock is acquired.
    /// Repeated until it succeeds; `Fatal` terminates the process.
    fn before_batch(&mut self) -> TaskResult {
        TaskResult::Success
    }

    /// Runs once after each batch, before the lock is released.
    fn after_batch(&mut self) {}
}

/// Worker timing knobs.
#[derive(Debug, Clone)]
pub struct QueueTuning {
    /// How long the worker sleeps waiting for a wake signal.
    pub wake_timeout: Duration,
    /// Backoff before reprocessing a retryable operation.
    pub retry_backoff: Duration,
    /// Poll interval while spinning for the exclusion lock.
    pub lock_poll: Duration,
    /// Attempts at the drain gate before aborting an idle-release.
    pub gate_attempts: u32,
    pub gate_poll: Duration,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            wake_timeout: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(1),
            lock_poll: Duration::from_millis(50),
            gate_attempts: 10,
            gate_poll: Duration::from_millis(10),
        }
    }
}

struct Shared {
    store: OperationStore,
    pending: Mutex<VecDeque<Operation>>,
    /// Producers hold the read side for the duration of an enqueue; the
    /// worker takes the write side only to check-and-release the exclusion
    /// lock, so it can never release out from under a mid-flight enqueue.
    gate: RwLock<()>,
    stop: AtomicBool,
    wake_tx: Sender<()>,
    lock: Arc<ExclusionLock>,
    tuning: QueueTuning,
}

/// Persisted FIFO of maintenance operations with a single worker thread.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Open the persisted store at `store_path`, replay outstanding
    /// operations, and spawn the worker.
    pub fn start<P>(
        store_path: impl AsRef<Path>,
        lock: Arc<ExclusionLock>,
        processor: P,
    ) -> Result<Self>
    where
        P: TaskProcessor,
    {
        Self::start_with_tuning(store_path, lock, processor, QueueTuning::default())
    }

    pub fn start_with_tuning<P>(
        store_path: impl AsRef<Path>,
        lock: Arc<ExclusionLock>,
        processor: P,
        tuning: QueueTuning,
    ) -> Result<Self>
    where
        P: TaskProcessor,
    {
        let store = OperationStore::open(store_path)?;
        let pending = store.replay()?;
        info!(replayed = pending.len(), "task queue starting");

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let replayed_any = !pending.is_empty();
        let shared = Arc::new(Shared {
            store,
            pending: Mutex::new(pending),
            gate: RwLock::new(()),
            stop: AtomicBool::new(false),
            wake_tx,
            lock,
            tuning,
        });
        if replayed_any {
            let _ = shared.wake_tx.try_send(());
        }

        let worker = thread::Builder::new()
            .name("vwd-task-queue".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || worker_loop(shared, wake_rx, processor)
            })
            .map_err(vwd_journal::JournalError::Io)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Persist and publish an operation.
    ///
    /// The operation is durable before it becomes visible to the worker; a
    /// crash in between causes a redundant replay on next start, never a
    /// loss.
    pub fn enqueue(&self, operation: Operation) -> Result<()> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let _producing = self.shared.gate.read().unwrap();
        self.shared.store.append(&operation)?;
        self.shared.pending.lock().unwrap().push_back(operation);
        // Auto-reset semantics: a full channel means the worker is already
        // signaled.
        let _ = self.shared.wake_tx.try_send(());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker and block until it exits.
    ///
    /// Cooperative: an in-flight processing callback is never interrupted;
    /// operations left in the queue stay persisted for the next run.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("task queue worker panicked");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<P: TaskProcessor>(shared: Arc<Shared>, wake_rx: Receiver<()>, mut processor: P) {
    let mut holds_lock = false;

    'main: while !shared.stop.load(Ordering::SeqCst) {
        let _ = wake_rx.recv_timeout(shared.tuning.wake_timeout);
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        if shared.pending.lock().unwrap().is_empty() {
            release_if_idle(&shared, &mut holds_lock);
            continue;
        }

        // Exclusive access before touching the working directory. The spin
        // observes the stop flag so shutdown is never blocked by an external
        // git process holding the lock.
        while !shared.lock.try_acquire_internal() {
            if shared.stop.load(Ordering::SeqCst) {
                break 'main;
            }
            thread::sleep(shared.tuning.lock_poll);
        }
        holds_lock = true;

        loop {
            match processor.before_batch() {
                TaskResult::Success => break,
                TaskResult::Retryable => {
                    warn!("pre-batch hook failed, retrying");
                    if shared.stop.load(Ordering::SeqCst) {
                        break 'main;
                    }
                    thread::sleep(shared.tuning.retry_backoff);
                }
                TaskResult::Fatal => fatal("pre-batch hook", None),
            }
        }

        // Peek, process, then dequeue on success: a crash mid-processing
        // redelivers the operation instead of losing it.
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            let Some(operation) = shared.pending.lock().unwrap().front().cloned() else {
                break;
            };
            match processor.process(&operation) {
                TaskResult::Success => {
                    shared.pending.lock().unwrap().pop_front();
                    if let Err(error) = shared.store.remove(&operation.id) {
                        // Redelivery after restart is tolerated (operations
                        // are idempotent by contract); losing one is not.
                        warn!(%error, id = %operation.id, "failed to persist operation completion");
                    }
                }
                TaskResult::Retryable => {
                    debug!(id = %operation.id, "operation failed, retrying in place");
                    thread::sleep(shared.tuning.retry_backoff);
                }
                TaskResult::Fatal => fatal("task processing", Some(&operation)),
            }
        }

        processor.after_batch();
        release_if_idle(&shared, &mut holds_lock);
    }

    debug!("task queue worker exiting; unfinished operations stay persisted");
    if holds_lock {
        shared.lock.release_internal();
    }
}

/// Release the exclusion lock if the queue is drained.
///
/// Takes the write side of the drain gate first so a producer's concurrent
/// enqueue can never race the worker into releasing the lock out from under
/// an operation about to be added. If producers keep the gate busy the
/// release attempt is silently abandoned; the next idle pass tries again.
fn release_if_idle(shared: &Shared, holds_lock: &mut bool) {
    if !*holds_lock {
        return;
    }
    for _ in 0..shared.tuning.gate_attempts.max(1) {
        if let Ok(_gate) = shared.gate.try_write() {
            let is_empty = shared.pending.lock().unwrap().is_empty();
            if is_empty {
                shared.lock.release_internal();
                *holds_lock = false;
                // Nothing outstanding and no producer can slip in under the
                // gate: shrink the persisted store to its minimal form.
                shared.store.compact(std::iter::empty());
            }
            return;
        }
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(shared.tuning.gate_poll);
    }
}

fn fatal(context: &str, operation: Option<&Operation>) -> ! {
    match operation {
        Some(operation) => error!(
            context,
            id = %operation.id,
            payload = %operation.payload,
            "unrecoverable background task error; terminating process"
        ),
        None => error!(context, "unrecoverable background task error; terminating process"),
    }
    std::process::exit(1);
}
