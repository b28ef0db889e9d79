// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Compiler discovery and the atomically published pool.
//!
//! The pool is built from a colon-separated seed list. Each entry is
//! either a local compiler name, an `&group` reference, a `host@port`
//! peer broker, or the `AWS` token naming the cloud-instance registry.
//! Peers and the cloud registry are consulted over HTTP with a
//! fixed-interval retry policy; a dead peer contributes an empty list
//! rather than failing discovery.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};

use options::{PrefixedSource, PropertySource};
use process_execution::{LocalRunner, Process};

use crate::{ArgumentParserKind, Capabilities, CompilerDescriptor, CompilerSet};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_OUTPUT_CAP: usize = 64 * 1024;

static HELP_OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s+(--?[a-zA-Z0-9][a-zA-Z0-9=+_\-]*)").unwrap());

///
/// The live, replace-only set of compiler descriptors. Readers see either
/// the old or the new set atomically; a rescan that produces an identical
/// set is suppressed so clients do not observe spurious churn.
///
pub struct Registry {
    snapshot: ArcSwap<Vec<Arc<CompilerDescriptor>>>,
    last_serialized: Mutex<Option<String>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            last_serialized: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> CompilerSet {
        self.snapshot.load_full()
    }

    pub fn find(&self, id: &str) -> Option<Arc<CompilerDescriptor>> {
        self.snapshot
            .load()
            .iter()
            .find(|descriptor| descriptor.id == id)
            .cloned()
    }

    ///
    /// Publish a new set: ids are deduplicated, the set is sorted by name,
    /// and the swap is skipped (returning false) when the serialized set
    /// equals the previous publication.
    ///
    pub fn publish(&self, compilers: Vec<CompilerDescriptor>) -> Result<bool, String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique: Vec<CompilerDescriptor> = Vec::with_capacity(compilers.len());
        for descriptor in compilers {
            if seen.insert(descriptor.id.clone()) {
                unique.push(descriptor);
            } else {
                warn!("Dropping duplicate compiler id `{}`", descriptor.id);
            }
        }
        unique.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let serialized = serde_json::to_string(&unique)
            .map_err(|e| format!("Failed to serialize compiler set: {e}"))?;
        let mut last = self.last_serialized.lock();
        if last.as_deref() == Some(serialized.as_str()) {
            debug!("Rescan produced an identical compiler set; not republishing");
            return Ok(false);
        }
        *last = Some(serialized);
        info!("Publishing {} compiler(s)", unique.len());
        self.snapshot
            .store(Arc::new(unique.into_iter().map(Arc::new).collect()));
        Ok(true)
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Attempts per peer fetch.
    pub proxy_retries: usize,
    /// Fixed delay between attempts.
    pub proxy_retry: Duration,
    /// Per-attempt HTTP timeout.
    pub proxy_timeout: Duration,
    /// Use public DNS names for cloud instances (test installations run
    /// outside the instances' VPC).
    pub external_test_mode: bool,
    /// Endpoint returning the cloud instance list as JSON.
    pub instances_url: Option<String>,
    /// The port peers (including cloud instances) serve their API on.
    pub peer_port: u16,
    /// Android NDK installation root, if cross toolchains should be
    /// enumerated.
    pub ndk_root: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> DiscoveryConfig {
        DiscoveryConfig {
            proxy_retries: 5,
            proxy_retry: Duration::from_millis(500),
            proxy_timeout: Duration::from_secs(10),
            external_test_mode: false,
            instances_url: None,
            peer_port: 10240,
            ndk_root: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InstanceInfo {
    private_dns_name: Option<String>,
    public_dns_name: Option<String>,
}

///
/// Builds the compiler set: seed-list resolution, peer and cloud fetches,
/// NDK toolchain scans, and descriptor initialization (version probe and
/// option scrape).
///
pub struct Discovery {
    http: reqwest::Client,
    runner: LocalRunner,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(runner: LocalRunner, config: DiscoveryConfig) -> Discovery {
        Discovery {
            http: reqwest::Client::new(),
            runner,
            config,
        }
    }

    ///
    /// Run one full discovery pass over the seed list. Descriptors that
    /// fail initialization are dropped; the caller publishes the result.
    ///
    pub async fn discover(
        &self,
        seed: &str,
        props: Arc<dyn PropertySource>,
    ) -> Vec<CompilerDescriptor> {
        let tokens = split_seed(seed);
        let mut found = self.enumerate(tokens, props).await;
        found.extend(self.ndk_compilers());

        let initialized =
            futures::future::join_all(found.into_iter().map(|d| self.initialize(d))).await;
        initialized.into_iter().flatten().collect()
    }

    fn enumerate(
        &self,
        tokens: Vec<String>,
        getter: Arc<dyn PropertySource>,
    ) -> BoxFuture<'_, Vec<CompilerDescriptor>> {
        async move {
            let mut out = Vec::new();
            for token in tokens {
                if token == "AWS" {
                    out.extend(self.cloud_compilers().await);
                } else if let Some(group) = token.strip_prefix('&') {
                    let members = getter
                        .get_raw(&format!("group.{group}.compilers"))
                        .unwrap_or_default();
                    if members.is_empty() {
                        warn!("Group `{group}` has no compilers");
                        continue;
                    }
                    let group_getter: Arc<dyn PropertySource> = Arc::new(PrefixedSource::new(
                        format!("group.{group}"),
                        getter.clone(),
                        getter.clone(),
                    ));
                    out.extend(self.enumerate(split_seed(&members), group_getter).await);
                } else if let Some((host, port)) = token.split_once('@') {
                    match port.parse::<u16>() {
                        Ok(port) => match self.fetch_peer_list(host, port).await {
                            Ok(list) => out.extend(list),
                            Err(e) => {
                                warn!("Unable to fetch compilers from {host}@{port}: {e}");
                            }
                        },
                        Err(_) => warn!("Bad peer port in seed entry `{token}`"),
                    }
                } else {
                    match local_compiler(&token, &getter) {
                        Ok(descriptor) => out.push(descriptor),
                        Err(e) => warn!("Skipping compiler `{token}`: {e}"),
                    }
                }
            }
            out
        }
        .boxed()
    }

    ///
    /// `GET http://host:port/api/compilers`, retried on a fixed interval.
    /// Fetched descriptors lose any `exe` and gain a `remote` endpoint:
    /// requests for them proxy to the peer.
    ///
    async fn fetch_peer_list(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<CompilerDescriptor>, String> {
        let url = format!("http://{host}:{port}/api/compilers");
        let strategy = FixedInterval::from_millis(self.config.proxy_retry.as_millis() as u64)
            .take(self.config.proxy_retries.max(1) - 1);
        let mut attempt = 0_usize;

        Retry::spawn(strategy, || {
            attempt += 1;
            debug!("Fetching {url} (attempt #{attempt})");
            async {
                let response = self
                    .http
                    .get(&url)
                    .timeout(self.config.proxy_timeout)
                    .send()
                    .await
                    .map_err(|e| RetryError::transient(format!("Request failed: {e}")))?;
                if !response.status().is_success() {
                    return Err(RetryError::transient(format!(
                        "Peer answered {}",
                        response.status()
                    )));
                }
                let mut list: Vec<CompilerDescriptor> = response
                    .json()
                    .await
                    .map_err(|e| RetryError::transient(format!("Bad compiler list: {e}")))?;
                for descriptor in &mut list {
                    descriptor.exe = None;
                    descriptor.remote = Some(format!("http://{host}:{port}"));
                }
                Ok(list)
            }
        })
        .await
    }

    ///
    /// Resolve the cloud-instance registry to a set of peer brokers and
    /// fetch each one's list. Everything here degrades to "no compilers":
    /// a broken registry must not take down local discovery.
    ///
    async fn cloud_compilers(&self) -> Vec<CompilerDescriptor> {
        let Some(url) = &self.config.instances_url else {
            warn!("Seed requests AWS discovery but no instances URL is configured");
            return Vec::new();
        };
        let instances: Vec<InstanceInfo> = match self.fetch_instances(url).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("Unable to fetch cloud instances from {url}: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for instance in instances {
            let dns = if self.config.external_test_mode {
                instance.public_dns_name
            } else {
                instance.private_dns_name
            };
            let Some(dns) = dns.filter(|d| !d.is_empty()) else {
                continue;
            };
            match self.fetch_peer_list(&dns, self.config.peer_port).await {
                Ok(list) => out.extend(list),
                Err(e) => warn!("Unable to fetch compilers from instance {dns}: {e}"),
            }
        }
        out
    }

    async fn fetch_instances(&self, url: &str) -> Result<Vec<InstanceInfo>, String> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.proxy_timeout)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("Instance registry answered {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("Bad instance list: {e}"))
    }

    ///
    /// Enumerate Android NDK cross toolchains: each directory under
    /// `<ndk>/toolchains` contributes the `g++`-named executable found
    /// beneath it, if any.
    ///
    fn ndk_compilers(&self) -> Vec<CompilerDescriptor> {
        let Some(root) = &self.config.ndk_root else {
            return Vec::new();
        };
        let toolchains = root.join("toolchains");
        let Ok(entries) = std::fs::read_dir(&toolchains) else {
            warn!("NDK root {} has no toolchains directory", root.display());
            return Vec::new();
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let toolchain = entry.file_name().to_string_lossy().into_owned();
            let gxx = walkdir::WalkDir::new(entry.path())
                .into_iter()
                .flatten()
                .find(|e| {
                    e.file_type().is_file()
                        && e.file_name().to_string_lossy().ends_with("g++")
                });
            if let Some(gxx) = gxx {
                out.push(CompilerDescriptor {
                    id: format!("ndk-{toolchain}"),
                    name: toolchain.clone(),
                    exe: Some(gxx.path().to_owned()),
                    remote: None,
                    compiler_type: ArgumentParserKind::GccLike,
                    options: Vec::new(),
                    version_flag: "--version".to_owned(),
                    version_re: None,
                    version: None,
                    demangler: None,
                    objdumper: None,
                    intel_asm: None,
                    opt_arg: None,
                    post_process: Vec::new(),
                    supports: Capabilities::default(),
                    supported_options: BTreeSet::new(),
                });
            }
        }
        out
    }

    ///
    /// Probe a descriptor's version and scrape its supported options.
    /// Remote descriptors were initialized by their owning broker and pass
    /// through; local descriptors that fail the probe are dropped.
    ///
    async fn initialize(&self, descriptor: CompilerDescriptor) -> Option<CompilerDescriptor> {
        if descriptor.is_remote() {
            return Some(descriptor);
        }
        let exe = descriptor.exe.clone()?;
        let mut descriptor = descriptor;

        let probe = Process::new(vec![
            exe.display().to_string(),
            descriptor.version_flag.clone(),
        ])
        .env(probe_env())
        .timeout(PROBE_TIMEOUT)
        .max_output_bytes(PROBE_OUTPUT_CAP)
        .description(format!("version probe for {}", descriptor.id));

        let result = match self.runner.run(probe).await {
            Ok(result) => result,
            Err(e) => {
                debug!("Dropping {}: version probe failed to run: {e}", descriptor.id);
                return None;
            }
        };
        if !result.success() {
            debug!(
                "Dropping {}: version probe exited with {:?}",
                descriptor.id, result.status
            );
            return None;
        }

        let text = format!("{}{}", result.stdout_str(), result.stderr_str());
        descriptor.version = match &descriptor.version_re {
            Some(pattern) => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        debug!("Dropping {}: bad versionRe: {e}", descriptor.id);
                        return None;
                    }
                };
                text.lines().find_map(|line| {
                    re.captures(line).map(|captures| {
                        captures
                            .get(1)
                            .map(|m| m.as_str())
                            .unwrap_or(line)
                            .to_owned()
                    })
                })
            }
            None => text.lines().find(|line| !line.trim().is_empty()).map(str::to_owned),
        };
        if descriptor.version.is_none() {
            debug!("Dropping {}: no version in probe output", descriptor.id);
            return None;
        }

        descriptor.supported_options = self.scrape_options(&exe, &descriptor).await;
        debug!(
            "Initialized {} ({:?}), {} scraped option(s)",
            descriptor.id,
            descriptor.version,
            descriptor.supported_options.len()
        );
        Some(descriptor)
    }

    ///
    /// Invoke the compiler with its help flag and scrape the supported
    /// option tokens. Failure leaves the set empty; the compiler is still
    /// usable.
    ///
    async fn scrape_options(
        &self,
        exe: &std::path::Path,
        descriptor: &CompilerDescriptor,
    ) -> BTreeSet<String> {
        let help_flag = match descriptor.compiler_type {
            ArgumentParserKind::ClangLike => "--help",
            ArgumentParserKind::GccLike => "--target-help",
        };
        let probe = Process::new(vec![exe.display().to_string(), help_flag.to_owned()])
            .env(probe_env())
            .timeout(PROBE_TIMEOUT)
            .max_output_bytes(PROBE_OUTPUT_CAP)
            .description(format!("option scrape for {}", descriptor.id));
        match self.runner.run(probe).await {
            Ok(result) => HELP_OPTION_RE
                .captures_iter(&format!("{}{}", result.stdout_str(), result.stderr_str()))
                .map(|captures| captures[1].to_owned())
                .collect(),
            Err(e) => {
                debug!("Option scrape for {} failed: {e}", descriptor.id);
                BTreeSet::new()
            }
        }
    }
}

fn probe_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
    env
}

fn split_seed(seed: &str) -> Vec<String> {
    seed.split(':')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

///
/// Construct a local descriptor from `compiler.<name>.*` properties, with
/// fallback to the enclosing (group or global) scope.
///
fn local_compiler(
    name: &str,
    getter: &Arc<dyn PropertySource>,
) -> Result<CompilerDescriptor, String> {
    let props = PrefixedSource::new(format!("compiler.{name}"), getter.clone(), getter.clone());

    let exe = props.get_string("exe", &format!("/usr/bin/{name}"));
    let options = shlex::split(&props.get_string("options", ""))
        .ok_or_else(|| format!("Unbalanced quoting in options for `{name}`"))?;
    let compiler_type = props
        .get_string("compilerType", "gcc_like")
        .parse::<ArgumentParserKind>()
        .map_err(|e| format!("Bad compilerType for `{name}`: {e}"))?;

    Ok(CompilerDescriptor {
        id: name.to_owned(),
        name: props.get_string("name", name),
        exe: Some(PathBuf::from(exe)),
        remote: None,
        compiler_type,
        options,
        version_flag: props.get_string("versionFlag", "--version"),
        version_re: props.get_opt_string("versionRe"),
        version: None,
        demangler: props.get_opt_string("demangler").map(PathBuf::from),
        objdumper: props.get_opt_string("objdumper").map(PathBuf::from),
        intel_asm: props.get_opt_string("intelAsm"),
        opt_arg: props.get_opt_string("optArg"),
        post_process: props
            .get_opt_string("postProcess")
            .map(|pipeline| {
                pipeline
                    .split('|')
                    .map(str::trim)
                    .filter(|stage| !stage.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        supports: Capabilities {
            binary: props.get_bool("supportsBinary", true)?,
            execute: props.get_bool("supportsExecute", true)?,
            intel_asm: props.get_bool("supportsIntelAsm", true)?,
            multiarch: props.get_bool("needsMultiarch", false)?,
            opt_record: props.get_bool("supportsOptRecord", false)?,
        },
        supported_options: BTreeSet::new(),
    })
}
