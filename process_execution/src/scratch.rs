// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tempfile::TempDir;

const SCRATCH_PREFIX: &str = "broker-scratch-";

///
/// Counts in-flight compilations. The scratch sweeper consults this gauge
/// and yields while anyone is compiling, so a directory can never be swept
/// out from under a live job.
///
#[derive(Clone)]
pub struct ActivityGauge {
    active: Arc<AtomicUsize>,
}

impl ActivityGauge {
    pub fn new() -> ActivityGauge {
        ActivityGauge {
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn begin(&self) -> ActiveCompile {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveCompile {
            active: self.active.clone(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }
}

/// Held for the duration of one compile; releases the gauge on drop.
#[must_use]
pub struct ActiveCompile {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveCompile {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

///
/// Allocates unique scratch directories under a configured root and
/// garbage-collects stale ones while the broker is idle.
///
pub struct ScratchRoot {
    base: PathBuf,
    input_filename: String,
    output_filename: String,
    retained: Arc<Mutex<HashSet<PathBuf>>>,
    gauge: ActivityGauge,
}

impl ScratchRoot {
    pub fn new(
        base: PathBuf,
        input_filename: impl Into<String>,
        output_filename: impl Into<String>,
    ) -> Result<ScratchRoot, String> {
        std::fs::create_dir_all(&base)
            .map_err(|e| format!("Failed to create scratch root {}: {e}", base.display()))?;
        Ok(ScratchRoot {
            base,
            input_filename: input_filename.into(),
            output_filename: output_filename.into(),
            retained: Arc::new(Mutex::new(HashSet::new())),
            gauge: ActivityGauge::new(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn gauge(&self) -> &ActivityGauge {
        &self.gauge
    }

    ///
    /// Allocate a fresh directory for one compile. The directory is removed
    /// when the `Scratch` is dropped unless it is retained first.
    ///
    pub fn allocate(&self) -> Result<Scratch, String> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.base)
            .map_err(|e| format!("Error making scratch dir for compilation: {e:?}"))?;
        let input_path = dir.path().join(&self.input_filename);
        let output_path = dir.path().join(&self.output_filename);
        Ok(Scratch {
            dir: Some(dir),
            input_path,
            output_path,
            retained: self.retained.clone(),
        })
    }

    ///
    /// Spawn the periodic sweeper. Directories belonging to a live
    /// `RetainedDir` handle are never deleted; anything else under the root
    /// with our prefix is presumed leaked (a crash, or a kept directory
    /// whose cache entry has since been evicted).
    ///
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let root = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !root.gauge.is_idle() {
                    debug!("Skipping scratch sweep: compilation in flight");
                    continue;
                }
                root.sweep();
            }
        })
    }

    fn sweep(&self) {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read scratch root {}: {e}", self.base.display());
                return;
            }
        };
        let retained = self.retained.lock();
        let mut swept = 0_usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(SCRATCH_PREFIX) || retained.contains(&path) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => swept += 1,
                Err(e) => warn!("Failed to sweep scratch dir {}: {e}", path.display()),
            }
        }
        if swept > 0 {
            info!("Swept {swept} stale scratch dir(s)");
        }
    }
}

///
/// A scratch directory owned by one in-flight compile.
///
#[must_use]
pub struct Scratch {
    dir: Option<TempDir>,
    input_path: PathBuf,
    output_path: PathBuf,
    retained: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Scratch {
    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap().path()
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    ///
    /// Convert into a retained handle: the directory outlives this compile
    /// (it backs a binary download) and is deleted when the handle drops,
    /// typically at cache eviction.
    ///
    pub fn retain(mut self) -> RetainedDir {
        let dir = self.dir.take().unwrap();
        let path = dir.keep();
        self.retained.lock().insert(path.clone());
        RetainedDir {
            path,
            retained: self.retained.clone(),
        }
    }
}

///
/// A scratch directory pinned beyond its compile. The sweeper skips it
/// while this handle is live.
///
#[derive(Debug)]
pub struct RetainedDir {
    path: PathBuf,
    retained: Arc<Mutex<HashSet<PathBuf>>>,
}

impl RetainedDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RetainedDir {
    fn drop(&mut self) {
        self.retained.lock().remove(&self.path);
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!(
                "Failed to remove retained scratch dir {}: {e}",
                self.path.display()
            );
        }
    }
}
