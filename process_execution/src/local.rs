// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::process::Stdio;

use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::children::ManagedChild;
use crate::{Process, ProcessError, ProcessResult, TIMEOUT_MARKER, TRUNCATED_MARKER};

#[derive(Debug, PartialEq, Eq)]
enum ChildOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

///
/// Runs child processes on this machine, enforcing output caps and
/// wall-clock timeouts.
///
#[derive(Clone, Debug)]
pub struct LocalRunner {
    work_dir_base: PathBuf,
}

impl LocalRunner {
    pub fn new(work_dir_base: PathBuf) -> LocalRunner {
        LocalRunner { work_dir_base }
    }

    ///
    /// Spawns the process and captures its outputs.
    ///
    /// All conditions other than a spawn failure produce a `ProcessResult`
    /// value: non-zero exits, terminating signals, truncation, and timeouts
    /// are results, not errors.
    ///
    pub async fn run(&self, req: Process) -> Result<ProcessResult, ProcessError> {
        let argv = req.effective_argv();
        if argv.is_empty() {
            return Err(ProcessError::SpawnFailed("empty argv".to_owned()));
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env_clear()
            .envs(&req.env)
            .current_dir(
                req.working_dir
                    .clone()
                    .unwrap_or_else(|| self.work_dir_base.clone()),
            )
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = ManagedChild::spawn(&mut command).map_err(ProcessError::SpawnFailed)?;
        debug!(
            "spawned local process as {:?} for {}",
            child.id(),
            req.description
        );

        // Feed stdin from a task so a child that never reads does not
        // deadlock the collection loop; dropping the pipe closes it.
        if let Some(stdin_bytes) = req.stdin.clone() {
            let mut stdin_pipe = child.stdin.take().unwrap();
            tokio::spawn(async move {
                let _ = stdin_pipe.write_all(&stdin_bytes).await;
            });
        }

        let stdout_stream = FramedRead::new(child.stdout.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stdout(bytes.into()))
            .fuse();
        let stderr_stream = FramedRead::new(child.stderr.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stderr(bytes.into()))
            .fuse();
        let mut output_stream = futures::stream::select(stdout_stream, stderr_stream)
            .map_err(|e| format!("Failed to consume process outputs: {e}"));

        let mut stdout = BytesMut::with_capacity(8192);
        let mut stderr = BytesMut::with_capacity(8192);
        let mut truncated = false;

        let timed_out = {
            let collection = collect_child_outputs(
                &mut stdout,
                &mut stderr,
                &mut output_stream,
                req.max_output_bytes,
                &mut truncated,
                &mut child,
            );
            match req.timeout {
                Some(req_timeout) => match timeout(req_timeout, collection).await {
                    Ok(collected) => {
                        collected.map_err(ProcessError::Unclassified)?;
                        false
                    }
                    Err(_) => true,
                },
                None => {
                    collection.await.map_err(ProcessError::Unclassified)?;
                    false
                }
            }
        };

        if timed_out {
            if let Err(e) = child.kill_group() {
                debug!("Failed to kill timed-out process group: {e}");
            }
            stderr.extend_from_slice(TIMEOUT_MARKER.as_bytes());
        }

        let exit_status = child
            .wait()
            .await
            .map_err(|e| ProcessError::Unclassified(format!("Error waiting for process: {e}")))?;

        use std::os::unix::process::ExitStatusExt;
        let (status, signal) = if timed_out {
            (None, Some(libc::SIGKILL))
        } else {
            (exit_status.code(), exit_status.signal())
        };

        Ok(ProcessResult {
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
            status,
            signal,
            ok_to_cache: !timed_out,
            truncated,
        })
    }
}

///
/// Collect the outputs of a child process, killing the whole process group
/// the first time either stream crosses `max_output_bytes`. Output arriving
/// after the cap fires is discarded, so the marker appears exactly once.
///
async fn collect_child_outputs(
    stdout: &mut BytesMut,
    stderr: &mut BytesMut,
    stream: &mut (impl Stream<Item = Result<ChildOutput, String>> + Unpin),
    max_output_bytes: usize,
    truncated: &mut bool,
    child: &mut ManagedChild,
) -> Result<(), String> {
    while let Some(child_output) = stream.next().await {
        if *truncated {
            // Drain to EOF without accumulating.
            child_output?;
            continue;
        }
        let over_cap = match child_output? {
            ChildOutput::Stdout(bytes) => append_capped(stdout, &bytes, max_output_bytes),
            ChildOutput::Stderr(bytes) => append_capped(stderr, &bytes, max_output_bytes),
        };
        if over_cap {
            *truncated = true;
            if let Err(e) = child.kill_group() {
                debug!("Failed to kill over-cap process group: {e}");
            }
        }
    }
    Ok(())
}

///
/// Append to a capped buffer. Crossing the cap truncates back to it and
/// appends the marker, so the buffer never exceeds `cap` plus the marker.
///
pub(crate) fn append_capped(buffer: &mut BytesMut, bytes: &[u8], cap: usize) -> bool {
    buffer.extend_from_slice(bytes);
    if buffer.len() > cap {
        buffer.truncate(cap);
        buffer.extend_from_slice(TRUNCATED_MARKER.as_bytes());
        true
    } else {
        false
    }
}
