//! Crash-recovery behavior of the persisted queue.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vwd_lock::ExclusionLock;
use vwd_queue::{Operation, OperationStore, QueueTuning, TaskProcessor, TaskQueue, TaskResult};

fn fast_tuning() -> QueueTuning {
    QueueTuning {
        wake_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(5),
        lock_poll: Duration::from_millis(5),
        gate_attempts: 10,
        gate_poll: Duration::from_millis(1),
    }
}

struct Recorder(Arc<Mutex<Vec<Operation>>>);

impl TaskProcessor for Recorder {
    fn process(&mut self, operation: &Operation) -> TaskResult {
        self.0.lock().unwrap().push(operation.clone());
        TaskResult::Success
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// An operation persisted but never drained (the process died first) is
/// replayed exactly once by the next start.
#[test]
fn persisted_operation_is_replayed_exactly_once_after_crash() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("operations.dat");

    let op = Operation::new("create placeholder deep/nested/file.txt");
    {
        // Simulated crash: the store is written the way enqueue writes it,
        // but no worker ever drains it.
        let store = OperationStore::open(&store_path).unwrap();
        store.append(&op).unwrap();
    }

    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut queue = TaskQueue::start_with_tuning(
        &store_path,
        Arc::new(ExclusionLock::new()),
        Recorder(processed.clone()),
        fast_tuning(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        !processed.lock().unwrap().is_empty()
    }));
    queue.shutdown();

    let processed = processed.lock().unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0], op);

    let replayed = OperationStore::open(&store_path).unwrap().replay().unwrap();
    assert!(replayed.is_empty());
}

/// Replay order across a restart matches the original enqueue order, with
/// already-completed operations folded out.
#[test]
fn replay_after_restart_preserves_fifo_and_skips_completed() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("operations.dat");

    let ops: Vec<Operation> = (0..4)
        .map(|i| Operation::new(format!("update projection chunk {i}")))
        .collect();
    {
        let store = OperationStore::open(&store_path).unwrap();
        for op in &ops {
            store.append(op).unwrap();
        }
        // Chunk 0 completed before the crash.
        store.remove(&ops[0].id).unwrap();
    }

    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut queue = TaskQueue::start_with_tuning(
        &store_path,
        Arc::new(ExclusionLock::new()),
        Recorder(processed.clone()),
        fast_tuning(),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        processed.lock().unwrap().len() == 3
    }));
    queue.shutdown();

    let processed = processed.lock().unwrap();
    assert_eq!(processed.as_slice(), &ops[1..]);
}

/// While an external git process holds the exclusion lock, enqueued work
/// waits; it drains after the holder goes away.
#[test]
fn draining_waits_for_external_lock_holder() {
    use std::collections::HashMap;
    use vwd_lock::{HolderInfo, ProcessProbe};

    #[derive(Default)]
    struct FakeProbe(Mutex<HashMap<i32, String>>);

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, pid: i32) -> bool {
            self.0.lock().unwrap().contains_key(&pid)
        }
        fn command_line(&self, pid: i32) -> Option<String> {
            self.0.lock().unwrap().get(&pid).cloned()
        }
    }

    let dir = TempDir::new().unwrap();
    let probe = Arc::new(FakeProbe::default());
    probe.0.lock().unwrap().insert(123, "git checkout".to_string());

    let lock = Arc::new(ExclusionLock::with_probe(probe.clone()));
    assert_eq!(
        lock.try_acquire_external(HolderInfo {
            pid: 123,
            is_elevated: false,
            command_line: "git checkout".to_string(),
        }),
        vwd_lock::ExternalAcquireOutcome::Granted
    );

    let processed = Arc::new(Mutex::new(Vec::new()));
    let queue = TaskQueue::start_with_tuning(
        dir.path().join("operations.dat"),
        Arc::clone(&lock),
        Recorder(processed.clone()),
        fast_tuning(),
    )
    .unwrap();

    queue.enqueue(Operation::new("blocked work")).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(
        processed.lock().unwrap().is_empty(),
        "work must not run while git holds the lock"
    );

    // The git process exits; no explicit release arrives.
    probe.0.lock().unwrap().remove(&123);

    assert!(wait_until(Duration::from_secs(10), || {
        processed.lock().unwrap().len() == 1
    }));
}
