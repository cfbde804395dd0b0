//! Placeholder rebuild under concurrent mutation.
//!
//! A full read-all/write-all rebuild is not atomic with respect to live
//! virtualization activity; the overflow list is what keeps concurrent
//! adds/removes from being silently overwritten by the rewrite.

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use vwd_state::{PlaceholderMarker, PlaceholderRegistry};

const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const SHA_C: &str = "cccccccccccccccccccccccccccccccccccccccc";

#[test]
fn rebuild_preserves_concurrent_mutations() {
    let dir = TempDir::new().unwrap();
    let registry =
        Arc::new(PlaceholderRegistry::open(dir.path().join("placeholders.dat")).unwrap());

    registry.add_file("untouched.txt", SHA_A).unwrap();
    registry.add_file("victim.txt", SHA_B).unwrap();

    let (cycle, snapshot) = registry.start_rebuild();

    // Two other threads mutate while the rebuild writer holds its snapshot.
    let adder = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.add_file("concurrent-add.txt", SHA_C).unwrap())
    };
    let remover = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.remove("victim.txt").unwrap())
    };
    adder.join().unwrap();
    remover.join().unwrap();

    // The writer rebuilds from its stale snapshot, unaware of either change.
    registry.write_all(cycle, snapshot).unwrap();

    assert!(registry.contains("untouched.txt"), "pre-existing key kept");
    assert!(registry.contains("concurrent-add.txt"), "concurrent add kept");
    assert!(!registry.contains("victim.txt"), "concurrent remove kept");
    assert_eq!(registry.len(), 2);

    // On-disk state agrees after reopen.
    drop(registry);
    let reopened = PlaceholderRegistry::open(dir.path().join("placeholders.dat")).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(
        reopened.get("concurrent-add.txt"),
        Some(PlaceholderMarker::File(SHA_C.to_string()))
    );
}

#[test]
fn rebuild_can_replace_entire_projection() {
    let dir = TempDir::new().unwrap();
    let registry = PlaceholderRegistry::open(dir.path().join("placeholders.dat")).unwrap();

    registry.add_file("old-a.txt", SHA_A).unwrap();
    registry.add_file("old-b.txt", SHA_B).unwrap();
    registry.add_folder("old-dir", true).unwrap();

    let (cycle, _stale) = registry.start_rebuild();
    let fresh = vec![
        ("new.txt".to_string(), PlaceholderMarker::File(SHA_C.to_string())),
        ("new-dir".to_string(), PlaceholderMarker::PartialFolder),
    ];
    registry.write_all(cycle, fresh).unwrap();

    assert_eq!(registry.len(), 2);
    assert!(!registry.contains("old-a.txt"));
    assert!(registry.get("new-dir").unwrap().is_folder());
}
