// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The compilation broker: accepts source plus a compiler id over HTTP,
//! dispatches to a local toolchain or a peer broker, post-processes the
//! assembly, optionally executes the result in a sandbox, and memoizes
//! everything under a content-addressed key.

mod asmdocs;
mod proxy;
mod server;
mod sources;


use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, info};

use compilers::registry::{Discovery, DiscoveryConfig, Registry};
use compilers::driver::{Driver, DriverConfig};
use options::{Properties, PropertySource};
use process_execution::docker::Sandbox;
use process_execution::{LocalRunner, SandboxType, ScratchRoot};

use crate::server::BrokerState;

#[derive(Debug, Parser)]
#[command(name = "broker", about = "Remote compilation broker")]
struct Args {
    /// Configuration environments, in increasing precedence.
    #[arg(long = "env")]
    envs: Vec<String>,
    /// Installation root; properties are read from `<prefix>/etc/config`.
    #[arg(long, default_value = ".")]
    prefix: PathBuf,
    #[arg(long, default_value = "c++")]
    language: String,
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value_t = 10240)]
    port: u16,
    /// Directory of static assets to serve at `/`.
    #[arg(long = "static")]
    static_dir: Option<PathBuf>,
    /// Rendered into the client options for the UI's version picker.
    #[arg(long)]
    archived_versions: Option<String>,
    #[arg(long)]
    debug: bool,
    /// Dump the merged properties (and their winning layer) at startup.
    #[arg(long)]
    debug_properties: bool,
    /// Running under the Windows Subsystem for Linux: scratch space lives
    /// on the Windows-mounted temp directory.
    #[arg(long)]
    wsl: bool,
}

async fn execute() -> Result<i32, String> {
    let args = Args::parse();
    env_logger::init_from_env(env_logger::Env::new().filter_or(
        "BROKER_LOG",
        if args.debug { "debug" } else { "info" },
    ));

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
    let platform = std::env::consts::OS;
    let parts = Properties::layer_parts(&args.envs, &args.language, platform, &hostname);
    let config_dir = args.prefix.join("etc/config");
    let props: Arc<Properties> = Arc::new(Properties::load(&config_dir, "broker", &parts)?);
    if args.debug_properties {
        println!("{}", props.dump());
    }

    let temp_root = match props.get_opt_string("tempDir") {
        Some(dir) => PathBuf::from(dir),
        None if args.wsl => PathBuf::from("/mnt/c/tmp"),
        None => std::env::temp_dir(),
    };
    let input_filename = props.get_string("inputFilename", "example.cpp");
    let scratch = Arc::new(ScratchRoot::new(
        temp_root.clone(),
        input_filename.clone(),
        props.get_string("outputFilename", "output.s"),
    )?);
    let runner = LocalRunner::new(temp_root);

    let sandbox_type = props
        .get_string("sandboxType", "docker")
        .parse::<SandboxType>()
        .map_err(|e| format!("Bad sandboxType: {e}"))?;
    let sandbox = Sandbox::new(
        sandbox_type,
        props.get_string("sandboxImage", "ubuntu:22.04"),
        runner.clone(),
    );

    let driver_config = DriverConfig {
        compile_timeout: Duration::from_millis(props.get_u64("compileTimeoutMs", 7500)?),
        max_error_output: props.get_usize("max-error-output", 5 * 1024)?,
        max_asm_size: props.get_usize("max-asm-size", 8 * 1024 * 1024)?,
        max_executable_output_size: props.get_usize("max-executable-output-size", 2 * 1024)?,
        stub_re: regex::Regex::new(&props.get_string("stubRe", r"\bint\s+main\b"))
            .map_err(|e| format!("Bad stubRe: {e}"))?,
        stub_text: props.get_string("stubText", "int main(void){return 0;}"),
        forbidden_options: props.get_list("forbiddenUserOptions").into_iter().collect(),
        input_filename,
        env: compiler_env(),
    };
    let lane_width = props.get_usize("maxConcurrentCompiles", num_cpus::get())?;
    let cache_bytes = props.get_usize("cacheMb", 200)? * 1024 * 1024;
    let driver = Arc::new(Driver::new(
        runner.clone(),
        sandbox,
        scratch.clone(),
        cache_bytes,
        lane_width,
        driver_config,
    ));

    let discovery = Arc::new(Discovery::new(
        runner,
        DiscoveryConfig {
            proxy_retries: props.get_usize("proxyRetries", 5)?,
            proxy_retry: Duration::from_millis(props.get_u64("proxyRetryMs", 500)?),
            proxy_timeout: Duration::from_millis(props.get_u64("proxyTimeout", 10_000)?),
            external_test_mode: props.get_bool("externalTestMode", false)?,
            instances_url: props.get_opt_string("instancesUrl"),
            peer_port: args.port,
            ndk_root: props.get_opt_string("androidNdk").map(PathBuf::from),
        },
    ));
    let registry = Arc::new(Registry::new());

    // The registry failing to come up at all is fatal; a partially failed
    // discovery (dead peers) is not.
    let seed = props.get_string("compilers", "");
    let getter: Arc<dyn PropertySource> = props.clone();
    let found = discovery.discover(&seed, getter.clone()).await;
    registry.publish(found)?;
    info!(
        "Discovered {} compiler(s) for {}",
        registry.snapshot().len(),
        args.language
    );

    let state = Arc::new(BrokerState::new(
        registry.clone(),
        driver,
        args.language.clone(),
        props.get_opt_string("defaultCompiler"),
        args.archived_versions.clone(),
    ));
    state.rebuild_client_options();

    // Background timers: compiler rescan and scratch sweep. Each runs in
    // its own task and so never overlaps itself.
    let rescan_secs = props.get_u64("rescanCompilerSecs", 0)?;
    if rescan_secs > 0 {
        let registry = registry.clone();
        let discovery = discovery.clone();
        let state = state.clone();
        let seed = seed.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(rescan_secs)).await;
                let found = discovery.discover(&seed, getter.clone()).await;
                match registry.publish(found) {
                    Ok(true) => state.rebuild_client_options(),
                    Ok(false) => debug!("Rescan found no changes"),
                    Err(e) => log::warn!("Rescan failed to publish: {e}"),
                }
            }
        });
    }
    let sweep_secs = props.get_u64("tempDirCleanupSecs", 600)?;
    if sweep_secs > 0 {
        let _sweeper = scratch.spawn_sweeper(Duration::from_secs(sweep_secs));
    }

    let body_limit = props.get_usize("bodyParserLimit", 1024 * 1024)?;
    let router = server::router(state, body_limit, args.static_dir.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| format!("Bad listen address: {e}"))?;
    info!(
        "Listening on http://{addr} (language: {}, environments: [{}])",
        args.language,
        args.envs.join(", ")
    );

    let server = axum_server::bind(addr).serve(router.into_make_service());
    tokio::select! {
        served = server => {
            served.map_err(|e| format!("Server failed: {e}"))?;
            Ok(0)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(0)
        }
    }
}

/// Compilers get a minimal, predictable environment rather than the
/// broker's own.
fn compiler_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_owned(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_owned()),
    );
    if let Ok(home) = std::env::var("HOME") {
        env.insert("HOME".to_owned(), home);
    }
    env
}

#[tokio::main]
async fn main() {
    match execute().await {
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Ok(exit_code) => std::process::exit(exit_code),
    }
}
