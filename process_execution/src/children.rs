// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal;
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};

///
/// A child process running in its own PGID, with a drop implementation that
/// will kill that PGID.
///
/// Compilers fork helper processes (cc1plus, collect2, assemblers), so
/// killing only the immediate child on a timeout or an output-cap breach
/// would leak the helpers: all kill paths signal the whole group.
///
pub struct ManagedChild {
    child: Child,
    killed: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(command: &mut Command) -> Result<Self, String> {
        // Set `kill_on_drop` to encourage `tokio` to `wait` the process via its own "reaping"
        // mechanism:
        //   see https://docs.rs/tokio/1.14.0/tokio/process/struct.Command.html#method.kill_on_drop
        command.kill_on_drop(true);

        // Adjust the Command to create its own PGID as it starts, to make it safe to kill the PGID
        // later.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map(|_pgid| ()).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("Could not create new pgid: {e}"),
                    )
                })
            });
        };

        let child = command
            .spawn()
            .map_err(|e| format!("Error launching process: {e}"))?;
        Ok(Self {
            child,
            killed: AtomicBool::new(false),
        })
    }

    fn get_pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "Process had no PID.".to_owned())?;
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))?;
        Ok(pgid)
    }

    ///
    /// Kill the process's unique PGID. Idempotent: a group that has already
    /// been signalled is not signalled again.
    ///
    pub fn kill_group(&mut self) -> Result<(), String> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pgid = self.get_pgid()?;
        // The negative PGID will signal the entire process group.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal::Signal::SIGKILL)
            .map_err(|e| format!("Failed to kill child process group: {e}"))?;
        Ok(())
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Implements drop by killing the process group.
impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            let _ = self.kill_group();
        }
    }
}
