// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The compiler pool: backend descriptors, discovery, and the per-request
//! compile pipeline.

pub mod ast;
pub mod driver;
pub mod optrec;
pub mod registry;

#[cfg(test)]
mod driver_tests;
#[cfg(test)]
mod registry_tests;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use asm::AsmLine;

pub use crate::driver::{CompileError, CompileRequest, CompileResult, Driver, ExecResult};
pub use crate::registry::{Discovery, DiscoveryConfig, Registry};

static CLANG_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"clang version (\d+)\.(\d+)").unwrap());

///
/// Which command-line dialect a backend speaks. This drives option
/// scraping and a few flag spellings; it deliberately stays coarse.
///
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArgumentParserKind {
    ClangLike,
    #[default]
    GccLike,
}

///
/// What a backend is capable of, as configured (not probed).
///
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capabilities {
    pub binary: bool,
    pub execute: bool,
    pub intel_asm: bool,
    pub multiarch: bool,
    pub opt_record: bool,
}

///
/// One compiler backend: either a locally installed executable or a remote
/// peer broker. Exactly one of `exe` and `remote` is populated.
///
/// Descriptors are immutable after publication: rescans replace the whole
/// set atomically rather than mutating in place.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub exe: Option<PathBuf>,
    /// Peer endpoint, e.g. `http://peer:10240`.
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub compiler_type: ArgumentParserKind,
    /// Default options, prepended to user options.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "default_version_flag")]
    pub version_flag: String,
    #[serde(default)]
    pub version_re: Option<String>,
    /// Discovered at initialization; transient (excluded from fingerprints).
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub demangler: Option<PathBuf>,
    #[serde(default)]
    pub objdumper: Option<PathBuf>,
    /// The flag that switches this backend to Intel-syntax assembly.
    #[serde(default)]
    pub intel_asm: Option<String>,
    /// The flag that makes this backend emit optimization records.
    #[serde(default)]
    pub opt_arg: Option<String>,
    /// Post-processing pipeline: each stage is a shell-split command the
    /// assembly output is piped through.
    #[serde(default)]
    pub post_process: Vec<String>,
    #[serde(default)]
    pub supports: Capabilities,
    /// Scraped from the backend's help output; transient.
    #[serde(default)]
    pub supported_options: BTreeSet<String>,
}

fn default_version_flag() -> String {
    "--version".to_owned()
}

impl CompilerDescriptor {
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    ///
    /// Whether the AST probe is available: clang 3.3 grew a stable
    /// `-ast-dump`; anything older (or any other family) has none.
    ///
    pub fn supports_ast(&self) -> bool {
        let Some(version) = &self.version else {
            return false;
        };
        let Some(captures) = CLANG_VERSION_RE.captures(version) else {
            return false;
        };
        let major: u32 = captures[1].parse().unwrap_or(0);
        let minor: u32 = captures[2].parse().unwrap_or(0);
        (major, minor) >= (3, 3)
    }

    ///
    /// The CFG builder understands the textual output of the clang and
    /// g++ families only.
    ///
    pub fn supports_cfg(&self) -> bool {
        self.version
            .as_deref()
            .map(|v| v.contains("clang") || v.starts_with("g++"))
            .unwrap_or(false)
    }
}

impl fmt::Display for CompilerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

///
/// Backend-specific extras a client can request alongside the compile.
///
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendOptions {
    pub produce_ast: bool,
    pub produce_opt_info: bool,
}

///
/// Arguments and stdin for the sandboxed run of a produced executable.
///
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecuteParameters {
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

///
/// Split compiler diagnostics (or program output) into `{text, source?}`
/// records, tagging lines that reference the compiled translation unit
/// with their source line.
///
pub fn parse_output(raw: &str, input_filename: &str) -> Vec<AsmLine> {
    let line_ref =
        Regex::new(&format!(r"^(?:{}|<stdin>|<source>):(\d+)", regex::escape(input_filename)))
            .unwrap();
    raw.lines()
        .map(|line| {
            let source = line_ref.captures(line).map(|captures| asm::SourceRef {
                file: None,
                line: captures[1].parse().unwrap_or(0),
            });
            AsmLine {
                text: line.to_owned(),
                source,
            }
        })
        .collect()
}

///
/// The stable subset of a descriptor that participates in the request
/// fingerprint. Discovered fields (version, scraped options) are excluded:
/// they do not change what a given invocation produces, and including them
/// would needlessly invalidate the cache across rescans.
///
#[derive(Serialize)]
pub(crate) struct DescriptorFingerprint<'a> {
    id: &'a str,
    exe: &'a Option<PathBuf>,
    remote: &'a Option<String>,
    compiler_type: ArgumentParserKind,
    options: &'a [String],
    demangler: &'a Option<PathBuf>,
    objdumper: &'a Option<PathBuf>,
    intel_asm: &'a Option<String>,
    opt_arg: &'a Option<String>,
    post_process: &'a [String],
    supports: Capabilities,
}

impl<'a> From<&'a CompilerDescriptor> for DescriptorFingerprint<'a> {
    fn from(descriptor: &'a CompilerDescriptor) -> Self {
        DescriptorFingerprint {
            id: &descriptor.id,
            exe: &descriptor.exe,
            remote: &descriptor.remote,
            compiler_type: descriptor.compiler_type,
            options: &descriptor.options,
            demangler: &descriptor.demangler,
            objdumper: &descriptor.objdumper,
            intel_asm: &descriptor.intel_asm,
            opt_arg: &descriptor.opt_arg,
            post_process: &descriptor.post_process,
            supports: descriptor.supports,
        }
    }
}

/// Convenience alias used throughout the broker.
pub type CompilerSet = Arc<Vec<Arc<CompilerDescriptor>>>;

// Re-exported so downstream crates express filter types through one path.
pub use asm::Filters as CompileFilters;
