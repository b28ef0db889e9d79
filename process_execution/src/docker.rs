// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_oncecell::OnceCell;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions,
};
use bollard::models::{ContainerWaitResponse, HostConfig, ResourcesUlimits};
use bollard::{errors::Error as DockerError, Docker};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::local::append_capped;
use crate::{LocalRunner, Process, ProcessResult, SandboxType};

/// Where the produced binary's directory is bind-mounted (read-only) inside
/// the container.
pub const EXEC_BASE_PATH_IN_CONTAINER: &str = "/broker-exec";

// Hard limits for executing untrusted binaries. The kernel/engine enforces
// these; the wall-clock timeout is enforced by the caller's wait.
const CPU_SHARES: i64 = 128;
const CPU_PERIOD_USEC: i64 = 100_000;
const CPU_QUOTA_USEC: i64 = 25_000;
const MAX_OPEN_FILES: i64 = 20;
const CPU_TIME_LIMIT_SECS: i64 = 3;
const MEMORY_LIMIT_BYTES: i64 = 128 * 1024 * 1024;

///
/// Process-wide Docker connection, established on first use.
///
#[derive(Clone)]
pub struct DockerOnceCell {
    cell: Arc<OnceCell<Docker>>,
}

impl DockerOnceCell {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
        }
    }

    pub async fn get(&self) -> Result<&Docker, String> {
        self.cell
            .get_or_try_init(async move {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|err| format!("Failed to connect to local Docker: {err}"))?;
                let version = docker
                    .version()
                    .await
                    .map_err(|err| format!("Failed to obtain version from local Docker: {err}"))?;
                debug!(
                    "Connected to Docker {}",
                    version.version.as_deref().unwrap_or("<unknown>")
                );
                Ok(docker)
            })
            .await
    }
}

///
/// Options for one sandboxed execution.
///
pub struct ExecutionOptions {
    pub args: Vec<String>,
    pub stdin: Option<Bytes>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

///
/// Runs produced binaries either under container-level resource limits
/// (the recommended default) or directly via the local runner
/// (`sandboxType=none`, for development and tests).
///
pub struct Sandbox {
    kind: SandboxType,
    docker: DockerOnceCell,
    image: String,
    local: LocalRunner,
}

impl Sandbox {
    pub fn new(kind: SandboxType, image: impl Into<String>, local: LocalRunner) -> Sandbox {
        Sandbox {
            kind,
            docker: DockerOnceCell::new(),
            image: image.into(),
            local,
        }
    }

    ///
    /// Execute `binary` with the given options, returning its captured
    /// output. Infrastructure failures (engine unreachable, container
    /// failed to start) are errors; everything the binary itself does is a
    /// result.
    ///
    pub async fn run(&self, binary: &Path, options: ExecutionOptions) -> Result<ProcessResult, String> {
        match self.kind {
            SandboxType::None => self.run_passthrough(binary, options).await,
            SandboxType::Docker => self.run_in_container(binary, options).await,
        }
    }

    async fn run_passthrough(
        &self,
        binary: &Path,
        options: ExecutionOptions,
    ) -> Result<ProcessResult, String> {
        let mut argv = vec![binary.display().to_string()];
        argv.extend(options.args);
        let mut process = Process::new(argv)
            .timeout(options.timeout)
            .max_output_bytes(options.max_output_bytes)
            .description("sandboxed execution (passthrough)");
        if let Some(parent) = binary.parent() {
            process = process.working_dir(parent.to_owned());
        }
        if let Some(stdin) = options.stdin {
            process = process.stdin(stdin);
        }
        self.local.run(process).await.map_err(|e| e.to_string())
    }

    async fn run_in_container(
        &self,
        binary: &Path,
        options: ExecutionOptions,
    ) -> Result<ProcessResult, String> {
        let docker = self.docker.get().await?;

        let bind_dir = binary
            .parent()
            .ok_or_else(|| format!("Binary {} has no parent directory", binary.display()))?
            .display()
            .to_string();
        let exe_name = binary
            .file_name()
            .ok_or_else(|| format!("Binary {} has no file name", binary.display()))?
            .to_string_lossy()
            .into_owned();

        let mut entrypoint = vec![format!("{EXEC_BASE_PATH_IN_CONTAINER}/{exe_name}")];
        entrypoint.extend(options.args.iter().cloned());

        let wants_stdin = options.stdin.is_some();
        let config = bollard::container::Config {
            image: Some(self.image.clone()),
            entrypoint: Some(entrypoint),
            working_dir: Some(EXEC_BASE_PATH_IN_CONTAINER.to_owned()),
            network_disabled: Some(true),
            open_stdin: Some(wants_stdin),
            attach_stdin: Some(wants_stdin),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{bind_dir}:{EXEC_BASE_PATH_IN_CONTAINER}:ro"
                )]),
                cpu_shares: Some(CPU_SHARES),
                cpu_period: Some(CPU_PERIOD_USEC),
                cpu_quota: Some(CPU_QUOTA_USEC),
                memory: Some(MEMORY_LIMIT_BYTES),
                // Swap equal to memory disables swap.
                memory_swap: Some(MEMORY_LIMIT_BYTES),
                network_mode: Some("none".to_owned()),
                ulimits: Some(vec![
                    ResourcesUlimits {
                        name: Some("nofile".to_owned()),
                        soft: Some(MAX_OPEN_FILES),
                        hard: Some(MAX_OPEN_FILES),
                    },
                    ResourcesUlimits {
                        name: Some("cpu".to_owned()),
                        soft: Some(CPU_TIME_LIMIT_SECS),
                        hard: Some(CPU_TIME_LIMIT_SECS),
                    },
                    ResourcesUlimits {
                        name: Some("rss".to_owned()),
                        soft: Some(MEMORY_LIMIT_BYTES),
                        hard: Some(MEMORY_LIMIT_BYTES),
                    },
                ]),
                // The init process ensures that child processes are properly reaped.
                init: Some(true),
                ..HostConfig::default()
            }),
            ..bollard::container::Config::default()
        };

        let create_options = CreateContainerOptions::<&str> {
            name: "",
            platform: None,
        };
        let container = docker
            .create_container::<&str, String>(Some(create_options), config)
            .await
            .map_err(|err| format!("Failed to create sandbox container: {err:?}"))?;

        let result = self
            .drive_container(docker, &container.id, options)
            .await;

        // The container is removed on success and failure alike.
        if let Err(err) = docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..RemoveContainerOptions::default()
                }),
            )
            .await
        {
            warn!(
                "Failed to remove sandbox container `{}`: {err:?}",
                container.id
            );
        }

        result
    }

    async fn drive_container(
        &self,
        docker: &Docker,
        container_id: &str,
        options: ExecutionOptions,
    ) -> Result<ProcessResult, String> {
        if let Some(stdin_bytes) = options.stdin.clone() {
            let AttachContainerResults { input, .. } = docker
                .attach_container(
                    container_id,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(true),
                        stream: Some(true),
                        ..AttachContainerOptions::default()
                    }),
                )
                .await
                .map_err(|err| {
                    format!("Failed to attach to sandbox container `{container_id}`: {err:?}")
                })?;
            let mut input = input;
            tokio::spawn(async move {
                let _ = input.write_all(&stdin_bytes).await;
                let _ = input.shutdown().await;
            });
        }

        docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|err| {
                format!("Failed to start sandbox container `{container_id}`: {err:?}")
            })?;

        let (status_code, killed) =
            match timeout(options.timeout, wait_container_exit(docker, container_id)).await {
                Ok(wait_result) => (Some(wait_result?), false),
                Err(_) => {
                    if let Err(err) = docker.kill_container::<&str>(container_id, None).await {
                        warn!("Failed to kill sandbox container `{container_id}`: {err:?}");
                    }
                    (None, true)
                }
            };

        // Reconstruct stdout/stderr from the container's log stream.
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut truncated = false;
        let mut log_stream = docker.logs::<String>(
            container_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..LogsOptions::default()
            }),
        );
        while let Some(log_msg) = log_stream.next().await {
            if truncated {
                continue;
            }
            let over_cap = match log_msg {
                Ok(LogOutput::StdOut { message }) => {
                    append_capped(&mut stdout, &message, options.max_output_bytes)
                }
                Ok(LogOutput::StdErr { message }) => {
                    append_capped(&mut stderr, &message, options.max_output_bytes)
                }
                Ok(_) => false,
                Err(err) => {
                    debug!("Error reading logs of sandbox container `{container_id}`: {err:?}");
                    false
                }
            };
            if over_cap {
                truncated = true;
            }
        }

        if killed {
            stdout.extend_from_slice(
                format!("\n### Killed after {}ms", options.timeout.as_millis()).as_bytes(),
            );
        }

        Ok(ProcessResult {
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
            status: status_code.map(|code| code as i32),
            signal: if killed { Some(libc::SIGKILL) } else { None },
            ok_to_cache: !killed,
            truncated,
        })
    }
}

async fn wait_container_exit(docker: &Docker, container_id: &str) -> Result<i64, String> {
    loop {
        match docker
            .wait_container::<&str>(container_id, None)
            .next()
            .await
        {
            Some(Ok(ContainerWaitResponse { status_code, error })) => {
                if let Some(message) = error.and_then(|e| e.message) {
                    debug!("Sandbox container `{container_id}` reported: {message}");
                }
                return Ok(status_code);
            }
            Some(Err(DockerError::DockerContainerWaitError { code, error })) => {
                debug!("Sandbox container `{container_id}` wait error: {error}");
                return Ok(code);
            }
            Some(Err(e)) => return Err(format!("Failed to wait for container exit: {e:?}")),
            None => {
                debug!("Container wait stream closed early. Reconnecting ...");
            }
        }
    }
}
