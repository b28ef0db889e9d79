// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use crate::scratch::ScratchRoot;

fn root() -> (Arc<ScratchRoot>, tempfile::TempDir) {
    let base = tempfile::tempdir().unwrap();
    let root = Arc::new(ScratchRoot::new(base.path().to_owned(), "example.cpp", "output.s").unwrap());
    (root, base)
}

#[test]
fn allocate_creates_unique_dirs() {
    let (root, _base) = root();
    let a = root.allocate().unwrap();
    let b = root.allocate().unwrap();
    assert_ne!(a.path(), b.path());
    assert!(a.path().is_dir());
    assert_eq!(a.input_path(), a.path().join("example.cpp"));
    assert_eq!(a.output_path(), a.path().join("output.s"));
}

#[test]
fn drop_removes_dir() {
    let (root, _base) = root();
    let scratch = root.allocate().unwrap();
    let path = scratch.path().to_owned();
    assert!(path.is_dir());
    drop(scratch);
    assert!(!path.exists());
}

#[test]
fn retained_dir_survives_drop_of_scratch() {
    let (root, _base) = root();
    let scratch = root.allocate().unwrap();
    let path = scratch.path().to_owned();
    let retained = scratch.retain();
    assert!(path.is_dir());
    assert_eq!(retained.path(), path);
    drop(retained);
    assert!(!path.exists());
}

#[tokio::test]
async fn sweeper_skips_retained_and_busy() {
    let (root, base) = root();

    // A retained dir must survive the sweep; a leaked (non-tempdir) one must not.
    let retained = root.allocate().unwrap().retain();
    let leaked = base.path().join("broker-scratch-leaked");
    std::fs::create_dir(&leaked).unwrap();

    // While a compile is in flight, nothing is swept.
    {
        let _active = root.gauge().begin();
        let handle = root.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert!(leaked.is_dir());
    }

    // Once idle, the leaked dir goes and the retained one stays.
    let handle = root.spawn_sweeper(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.abort();
    assert!(!leaked.exists());
    assert!(retained.path().is_dir());
}

#[tokio::test]
async fn unrelated_dirs_are_not_swept() {
    let (root, base) = root();
    let unrelated = base.path().join("user-data");
    std::fs::create_dir(&unrelated).unwrap();
    let handle = root.spawn_sweeper(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    assert!(unrelated.is_dir());
}
