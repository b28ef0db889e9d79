// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod children;
pub mod docker;
pub mod local;
pub mod scratch;

#[cfg(test)]
mod local_tests;
#[cfg(test)]
mod scratch_tests;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

pub use crate::local::LocalRunner;
pub use crate::scratch::{ActiveCompile, ActivityGauge, RetainedDir, Scratch, ScratchRoot};

/// Appended (exactly once per stream) when a stream crosses its output cap.
pub const TRUNCATED_MARKER: &str = "\n[Truncated]";

/// Appended to stderr when the wall-clock timeout kills the process tree.
pub const TIMEOUT_MARKER: &str = "\nKilled - processing time exceeded";

///
/// A child process to be executed.
///
/// The first element of `argv` should be an absolute path to the binary to
/// execute: no PATH lookup is performed, and no shell expansion takes place.
///
#[derive(Clone, Debug)]
pub struct Process {
    pub argv: Vec<String>,
    ///
    /// The environment variables to set for the execution. No other
    /// environment variables will be set.
    ///
    pub env: BTreeMap<String, String>,
    ///
    /// The working directory. When absent, the runner's configured work
    /// directory base is used.
    ///
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    ///
    /// A per-stream cap: when either stdout or stderr crosses it, the
    /// marker is appended, the process tree is killed, and further output
    /// is discarded.
    ///
    pub max_output_bytes: usize,
    pub stdin: Option<Bytes>,
    ///
    /// An optional wrapper command: `wrapper ++ argv` is executed, so the
    /// real command becomes the wrapper's trailing arguments.
    ///
    pub wrapper: Option<Vec<String>>,
    /// For logging only.
    pub description: String,
}

impl Process {
    pub fn new(argv: Vec<String>) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
            max_output_bytes: 1024 * 1024,
            stdin: None,
            wrapper: None,
            description: String::new(),
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Process {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: PathBuf) -> Process {
        self.working_dir = Some(dir);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Process {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_output_bytes(mut self, cap: usize) -> Process {
        self.max_output_bytes = cap;
        self
    }

    pub fn stdin(mut self, stdin: Bytes) -> Process {
        self.stdin = Some(stdin);
        self
    }

    pub fn wrapper(mut self, wrapper: Vec<String>) -> Process {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Process {
        self.description = description.into();
        self
    }

    ///
    /// The argv actually spawned, with any wrapper command applied.
    ///
    pub fn effective_argv(&self) -> Vec<String> {
        match &self.wrapper {
            Some(wrapper) if !wrapper.is_empty() => wrapper
                .iter()
                .cloned()
                .chain(self.argv.iter().cloned())
                .collect(),
            _ => self.argv.clone(),
        }
    }
}

///
/// The result of running a process.
///
/// Exit code and terminating signal are kept as separate fields: exactly one
/// is populated for a process that ran to completion.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessResult {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub status: Option<i32>,
    pub signal: Option<i32>,
    ///
    /// False when a timeout fired: such results must never be memoized, as
    /// they do not reflect what the process would have produced.
    ///
    pub ok_to_cache: bool,
    pub truncated: bool,
}

impl ProcessResult {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

///
/// Failing to spawn is an infrastructure error and is the only condition
/// that does not produce a `ProcessResult` value.
///
#[derive(Debug, Eq, PartialEq)]
pub enum ProcessError {
    SpawnFailed(String),
    Unclassified(String),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::SpawnFailed(s) => write!(f, "Failed to spawn process: {s}"),
            ProcessError::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for ProcessError {
    fn from(s: String) -> Self {
        ProcessError::Unclassified(s)
    }
}

///
/// How produced binaries are executed: in a resource-limited container, or
/// directly on the host (for development and tests).
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SandboxType {
    Docker,
    None,
}
