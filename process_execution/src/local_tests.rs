// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::{LocalRunner, Process, ProcessError, TIMEOUT_MARKER, TRUNCATED_MARKER};

fn owned_string_vec(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// For scripts that call external tools (`sleep`, `head`, ...): the runner
/// clears the environment, so PATH must be provided explicitly.
fn path_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env
}

fn runner() -> (LocalRunner, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    (LocalRunner::new(dir.path().to_owned()), dir)
}

#[tokio::test]
async fn stdout() {
    let (runner, _dir) = runner();
    let result = runner
        .run(Process::new(owned_string_vec(&["/bin/echo", "-n", "foo"])))
        .await
        .unwrap();

    assert_eq!(result.stdout, Bytes::from("foo"));
    assert_eq!(result.stderr, Bytes::from(""));
    assert_eq!(result.status, Some(0));
    assert_eq!(result.signal, None);
    assert!(result.ok_to_cache);
    assert!(!result.truncated);
}

#[tokio::test]
async fn stdout_and_stderr_and_exit_code() {
    let (runner, _dir) = runner();
    let result = runner
        .run(Process::new(owned_string_vec(&[
            "/bin/bash",
            "-c",
            "echo -n foo ; echo >&2 -n bar ; exit 1",
        ])))
        .await
        .unwrap();

    assert_eq!(result.stdout, Bytes::from("foo"));
    assert_eq!(result.stderr, Bytes::from("bar"));
    assert_eq!(result.status, Some(1));
    assert_eq!(result.signal, None);
}

#[tokio::test]
async fn capture_exit_signal() {
    // Launch a process that kills itself with a signal.
    let (runner, _dir) = runner();
    let result = runner
        .run(Process::new(owned_string_vec(&[
            "/bin/bash",
            "-c",
            "kill $$",
        ])))
        .await
        .unwrap();

    assert_eq!(result.status, None);
    assert_eq!(result.signal, Some(15));
}

#[tokio::test]
async fn env() {
    let (runner, _dir) = runner();
    let mut env: BTreeMap<String, String> = BTreeMap::new();
    env.insert("FOO".to_string(), "foo".to_string());
    env.insert("BAR".to_string(), "not foo".to_string());

    let result = runner
        .run(Process::new(owned_string_vec(&["/usr/bin/env"])).env(env.clone()))
        .await
        .unwrap();

    let stdout = result.stdout_str();
    let got_env: BTreeMap<String, String> = stdout
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.splitn(2, '='))
        .map(|mut parts| {
            (
                parts.next().unwrap().to_string(),
                parts.next().unwrap_or("").to_string(),
            )
        })
        .collect();

    assert_eq!(env, got_env);
}

#[tokio::test]
async fn binary_not_found() {
    let (runner, _dir) = runner();
    let err = runner
        .run(Process::new(owned_string_vec(&[
            "/bin/does-not-exist-for-sure",
        ])))
        .await
        .expect_err("Want Err");
    match err {
        ProcessError::SpawnFailed(msg) => assert!(msg.contains("Error launching process"), "{msg}"),
        other => panic!("Expected SpawnFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn stdin_is_fed_to_the_child() {
    let (runner, _dir) = runner();
    let result = runner
        .run(Process::new(owned_string_vec(&["/bin/cat"])).stdin(Bytes::from("hello stdin")))
        .await
        .unwrap();

    assert_eq!(result.stdout, Bytes::from("hello stdin"));
    assert_eq!(result.status, Some(0));
}

#[tokio::test]
async fn wrapper_prepends_command() {
    let (runner, _dir) = runner();
    let result = runner
        .run(
            Process::new(owned_string_vec(&["/bin/echo", "-n", "wrapped"]))
                .wrapper(owned_string_vec(&["/usr/bin/env", "--"])),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, Bytes::from("wrapped"));
    assert_eq!(result.status, Some(0));
}

#[tokio::test]
async fn output_cap_truncates_and_kills() {
    let (runner, _dir) = runner();
    // Emit well over the cap, then sleep: only a kill of the process group
    // lets this test finish quickly.
    let result = runner
        .run(
            Process::new(owned_string_vec(&[
                "/bin/bash",
                "-c",
                "yes loooooooooooooong | head -c 100000 ; sleep 30",
            ]))
            .env(path_env())
            .max_output_bytes(1024)
            .timeout(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(result.truncated);
    let stdout = result.stdout_str();
    assert!(stdout.ends_with(TRUNCATED_MARKER), "{stdout:?}");
    // The marker appears exactly once.
    assert_eq!(stdout.matches("[Truncated]").count(), 1);
}

#[tokio::test]
async fn timeout_kills_and_marks_uncacheable() {
    let (runner, _dir) = runner();
    let result = runner
        .run(
            Process::new(owned_string_vec(&[
                "/bin/bash",
                "-c",
                "echo -n partial >&2 ; sleep 30",
            ]))
            .env(path_env())
            .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert!(!result.ok_to_cache);
    assert_eq!(result.status, None);
    assert!(result.signal.is_some());
    let stderr = result.stderr_str();
    assert!(stderr.ends_with(TIMEOUT_MARKER), "{stderr:?}");
    assert!(stderr.starts_with("partial"), "{stderr:?}");
}

#[tokio::test]
async fn timeout_reaps_grandchildren() {
    let (runner, _dir) = runner();
    // The sleep is a grandchild: killing only the immediate bash would
    // leave the pipe open and hang output collection.
    let start = std::time::Instant::now();
    let result = runner
        .run(
            Process::new(owned_string_vec(&[
                "/bin/bash",
                "-c",
                "/bin/bash -c 'sleep 30' ; true",
            ]))
            .env(path_env())
            .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert!(!result.ok_to_cache);
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "process tree was not reaped promptly"
    );
}
