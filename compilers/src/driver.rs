// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-request compile pipeline: request screening, cache admission,
//! the bounded compile lane, argument assembly, the main compile with its
//! parallel AST probe, post-processing (objdump, pipelines, optimization
//! records, demangling, CFG extraction), sandboxed execution, and the
//! caching decision.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use asm::cfg::Cfg;
use asm::{AsmLine, Filters};
use cache::{Fingerprint, ResultCache, Weight};
use process_execution::docker::{ExecutionOptions, Sandbox};
use process_execution::{LocalRunner, Process, ProcessResult, RetainedDir, Scratch, ScratchRoot};

use crate::optrec::OptRecord;
use crate::{
    ast, optrec, parse_output, BackendOptions, CompilerDescriptor, DescriptorFingerprint,
    ExecuteParameters,
};

pub const COMPILATION_FAILED: &str = "<Compilation failed>";

/// Headers make AST dumps enormous; the probe gets its own cap.
const AST_OUTPUT_CAP: usize = 1024 * 1024 * 1024;

static INCLUDE_SCREEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*#\s*i(nclude|mport)(_next)?\s+["<](/|.*\.\.)"#).unwrap()
});

///
/// Bad requests are the client's fault and carry a diagnostic; everything
/// else is an infrastructure failure.
///
#[derive(Debug, Eq, PartialEq)]
pub enum CompileError {
    BadRequest(String),
    Internal(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::BadRequest(s) | CompileError::Internal(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for CompileError {
    fn from(s: String) -> Self {
        CompileError::Internal(s)
    }
}

///
/// One compilation request, as posted by a client. `options` is already
/// argv-split with empty tokens removed.
///
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileRequest {
    pub source: String,
    pub options: Vec<String>,
    pub backend_options: BackendOptions,
    pub filters: Filters,
    pub execute_parameters: ExecuteParameters,
}

///
/// The sandboxed run's outcome, attached to the compile result.
///
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecResult {
    pub did_execute: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<AsmLine>,
    pub stderr: Vec<AsmLine>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileResult {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub ok_to_cache: bool,
    pub asm: Vec<AsmLine>,
    pub stdout: Vec<AsmLine>,
    pub stderr: Vec<AsmLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_output: Option<Vec<OptRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ast_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfg: Option<BTreeMap<String, Cfg>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_result: Option<ExecResult>,
    /// Keeps the scratch directory backing `output_file_path` alive for as
    /// long as this result is cached.
    #[serde(skip)]
    retained: Option<Arc<RetainedDir>>,
}

impl Weight for CompileResult {
    fn weight(&self) -> usize {
        fn lines(lines: &[AsmLine]) -> usize {
            lines.iter().map(|line| line.text.len() + 16).sum()
        }
        1024 + lines(&self.asm)
            + lines(&self.stdout)
            + lines(&self.stderr)
            + self.ast_output.as_ref().map(String::len).unwrap_or(0)
            + self
                .opt_output
                .as_ref()
                .map(|records| records.len() * 128)
                .unwrap_or(0)
    }
}

#[derive(Serialize)]
struct RequestFingerprint<'a> {
    compiler: DescriptorFingerprint<'a>,
    source: &'a str,
    options: &'a [String],
    backend_options: BackendOptions,
    filters: Filters,
}

pub struct DriverConfig {
    pub compile_timeout: Duration,
    /// Cap on the main compile's captured stdout/stderr.
    pub max_error_output: usize,
    pub max_asm_size: usize,
    pub max_executable_output_size: usize,
    /// When binary mode is requested and the source does not match this,
    /// `stub_text` is appended so the link can succeed.
    pub stub_re: Regex,
    pub stub_text: String,
    pub forbidden_options: BTreeSet<String>,
    /// The scratch input file name; used to tie diagnostics and records
    /// back to user source lines.
    pub input_filename: String,
    /// Environment for compiler invocations.
    pub env: BTreeMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
        DriverConfig {
            compile_timeout: Duration::from_millis(7500),
            max_error_output: 5 * 1024,
            max_asm_size: 8 * 1024 * 1024,
            max_executable_output_size: 2 * 1024,
            stub_re: Regex::new(r"\bint\s+main\b").unwrap(),
            stub_text: "int main(void){return 0;}".to_owned(),
            forbidden_options: BTreeSet::new(),
            input_filename: "example.cpp".to_owned(),
            env,
        }
    }
}

///
/// Drives compilations for local compiler descriptors.
///
pub struct Driver {
    runner: LocalRunner,
    sandbox: Sandbox,
    scratch: Arc<ScratchRoot>,
    cache: ResultCache<CompileResult>,
    lane: Semaphore,
    config: DriverConfig,
}

impl Driver {
    pub fn new(
        runner: LocalRunner,
        sandbox: Sandbox,
        scratch: Arc<ScratchRoot>,
        cache_bytes: usize,
        lane_width: usize,
        config: DriverConfig,
    ) -> Driver {
        Driver {
            runner,
            sandbox,
            scratch,
            cache: ResultCache::new(cache_bytes),
            lane: Semaphore::new(lane_width.max(1)),
            config,
        }
    }

    ///
    /// Compile one request against one local descriptor.
    ///
    /// The request is screened, fingerprinted, and serialized through the
    /// cache's single-flight admission; the actual work happens inside the
    /// bounded compile lane.
    ///
    pub async fn compile(
        &self,
        compiler: Arc<CompilerDescriptor>,
        request: CompileRequest,
    ) -> Result<Arc<CompileResult>, CompileError> {
        self.screen_options(&request.options)?;
        screen_source(&request.source)?;

        let filters = request.filters.normalize(compiler.supports.binary);
        let source = self.apply_stub(&request.source, &filters);
        let fingerprint = Fingerprint::of_serializable(&RequestFingerprint {
            compiler: DescriptorFingerprint::from(compiler.as_ref()),
            source: &source,
            options: &request.options,
            backend_options: request.backend_options,
            filters,
        })
        .map_err(CompileError::Internal)?;

        self.cache
            .get_or_compute(fingerprint, || async {
                let _permit = self
                    .lane
                    .acquire()
                    .await
                    .map_err(|e| CompileError::Internal(format!("Compile lane closed: {e}")))?;
                let _active = self.scratch.gauge().begin();
                let result = self.perform(&compiler, &source, &request, filters).await?;
                let cacheable = result.ok_to_cache;
                Ok((result, cacheable))
            })
            .await
    }

    fn screen_options(&self, options: &[String]) -> Result<(), CompileError> {
        let offenders = options
            .iter()
            .filter(|option| self.config.forbidden_options.contains(option.as_str()))
            .join(", ");
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(CompileError::BadRequest(format!("Bad options: {offenders}")))
        }
    }

    fn apply_stub(&self, source: &str, filters: &Filters) -> String {
        if filters.binary && !self.config.stub_re.is_match(source) {
            format!("{source}\n{}", self.config.stub_text)
        } else {
            source.to_owned()
        }
    }

    async fn perform(
        &self,
        compiler: &CompilerDescriptor,
        source: &str,
        request: &CompileRequest,
        filters: Filters,
    ) -> Result<CompileResult, CompileError> {
        let exe = compiler.exe.clone().ok_or_else(|| {
            CompileError::Internal(format!("Compiler {} has no local executable", compiler.id))
        })?;
        let scratch = self.scratch.allocate().map_err(CompileError::Internal)?;
        tokio::fs::write(scratch.input_path(), source)
            .await
            .map_err(|e| CompileError::Internal(format!("Failed to write source file: {e}")))?;

        let argv = assemble_argv(compiler, &filters, &request.backend_options, &request.options, &scratch);
        let main_process =
            self.invocation(&exe, argv, &scratch, self.config.max_error_output, "compilation");

        // The AST probe is independent of the main compile, so the two run
        // in parallel.
        let (main, ast_raw) = tokio::join!(
            self.runner.run(main_process),
            self.run_ast_probe(compiler, &exe, request, &scratch)
        );
        let main = main.map_err(|e| CompileError::Internal(e.to_string()))?;

        let mut ok_to_cache = main.ok_to_cache && !main.truncated;
        let mut result = CompileResult {
            code: main.status,
            signal: main.signal,
            ok_to_cache,
            stdout: parse_output(&main.stdout_str(), &self.config.input_filename),
            stderr: parse_output(&main.stderr_str(), &self.config.input_filename),
            ..CompileResult::default()
        };

        if !main.success() {
            // A failed compile is a normal result; post-processing is
            // skipped wholesale.
            result.asm = vec![AsmLine::text(COMPILATION_FAILED)];
            return Ok(result);
        }

        let raw_asm = if let (true, Some(objdumper)) = (filters.binary, &compiler.objdumper) {
            let objdump = self.run_objdump(objdumper, &filters, &scratch).await?;
            if objdump.success() {
                objdump.stdout_str()
            } else {
                // A broken disassembly must not be memoized.
                ok_to_cache = false;
                format!("{}{}", objdump.stdout_str(), objdump.stderr_str())
            }
        } else {
            self.read_or_post_process(compiler, &scratch).await
        };

        let mut cleaned = asm::clean(&raw_asm, &filters);
        if filters.demangle && ok_to_cache {
            if let Some(demangler) = &compiler.demangler {
                cleaned = self.demangle_lines(demangler, cleaned, &scratch).await;
            }
        }

        if request.backend_options.produce_opt_info && compiler.supports.opt_record {
            result.opt_output = Some(self.collect_opt_records(compiler, &scratch).await);
        }

        if compiler.supports_cfg() {
            result.cfg = Some(asm::cfg::build(&cleaned));
        }

        if let Some(raw) = ast_raw {
            result.ast_output = Some(ast::process(&raw, &self.config.input_filename));
        }

        if filters.execute && compiler.supports.execute {
            result.exec_result = Some(
                self.execute_binary(scratch.output_path(), &request.execute_parameters)
                    .await,
            );
        }

        result.asm = cleaned;
        result.ok_to_cache = ok_to_cache;

        if filters.binary && ok_to_cache {
            // Retain the directory: the object file may be downloaded
            // later. The handle rides with the cache entry.
            result.output_file_path = Some(scratch.output_path().display().to_string());
            result.retained = Some(Arc::new(scratch.retain()));
        }

        Ok(result)
    }

    fn invocation(
        &self,
        exe: &Path,
        argv: Vec<String>,
        scratch: &Scratch,
        max_output: usize,
        description: &str,
    ) -> Process {
        let mut full_argv = vec![exe.display().to_string()];
        full_argv.extend(argv);
        Process::new(full_argv)
            .env(self.config.env.clone())
            .working_dir(scratch.path().to_owned())
            .timeout(self.config.compile_timeout)
            .max_output_bytes(max_output)
            .description(description)
    }

    async fn run_ast_probe(
        &self,
        compiler: &CompilerDescriptor,
        exe: &Path,
        request: &CompileRequest,
        scratch: &Scratch,
    ) -> Option<String> {
        if !request.backend_options.produce_ast || !compiler.supports_ast() {
            return None;
        }
        let mut argv: Vec<String> = compiler.options.clone();
        argv.extend(request.options.iter().cloned());
        argv.extend(
            ["-Xclang", "-ast-dump", "-fsyntax-only"]
                .iter()
                .map(|s| s.to_string()),
        );
        argv.push(scratch.input_path().display().to_string());
        let process = self.invocation(exe, argv, scratch, AST_OUTPUT_CAP, "ast probe");
        match self.runner.run(process).await {
            Ok(result) if result.success() => Some(result.stdout_str()),
            Ok(result) => {
                debug!("AST probe exited with {:?}", result.status);
                None
            }
            Err(e) => {
                debug!("AST probe failed to run: {e}");
                None
            }
        }
    }

    async fn run_objdump(
        &self,
        objdumper: &Path,
        filters: &Filters,
        scratch: &Scratch,
    ) -> Result<ProcessResult, CompileError> {
        let mut argv = vec![
            "-d".to_owned(),
            scratch.output_path().display().to_string(),
            "-l".to_owned(),
            "--insn-width=16".to_owned(),
        ];
        if filters.demangle {
            argv.push("-C".to_owned());
        }
        if filters.intel {
            argv.push("-M".to_owned());
            argv.push("intel".to_owned());
        }
        let process = self.invocation(objdumper, argv, scratch, self.config.max_asm_size, "objdump");
        self.runner
            .run(process)
            .await
            .map_err(|e| CompileError::Internal(e.to_string()))
    }

    ///
    /// Text-mode asm production: enforce the size cap, then either stream
    /// the output file through the configured post-process pipeline or
    /// read it directly. Failures degrade to sentinel strings.
    ///
    async fn read_or_post_process(&self, compiler: &CompilerDescriptor, scratch: &Scratch) -> String {
        let metadata = match tokio::fs::metadata(scratch.output_path()).await {
            Ok(metadata) => metadata,
            Err(_) => return "<No output file>".to_owned(),
        };
        if metadata.len() > self.config.max_asm_size as u64 {
            return format!(
                "<No output: generated assembly was too large ({} bytes)>",
                metadata.len()
            );
        }

        let bytes = match tokio::fs::read(scratch.output_path()).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return format!("<Error reading output: {e}>"),
        };

        if compiler.post_process.is_empty() {
            return String::from_utf8_lossy(&bytes).into_owned();
        }

        // The pipeline stages connect stdout to stdin under the shared
        // output cap and timeout.
        let mut data = bytes;
        for stage in &compiler.post_process {
            let Some(argv) = shlex::split(stage) else {
                return format!("<Error during post-processing: bad stage `{stage}`>");
            };
            if argv.is_empty() {
                continue;
            }
            let process = Process::new(argv)
                .env(self.config.env.clone())
                .working_dir(scratch.path().to_owned())
                .timeout(self.config.compile_timeout)
                .max_output_bytes(self.config.max_asm_size)
                .stdin(data.clone())
                .description("post-process stage");
            match self.runner.run(process).await {
                Ok(result) if result.success() => data = result.stdout,
                Ok(result) => {
                    return format!(
                        "<Error during post-processing: stage `{stage}` exited with {:?}>",
                        result.status
                    );
                }
                Err(e) => return format!("<Error during post-processing: {e}>"),
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    ///
    /// Pipe the cleaned line texts, newline-joined, through the demangler
    /// and splice the results back, preserving source annotations. Any
    /// failure keeps the mangled lines.
    ///
    async fn demangle_lines(
        &self,
        demangler: &Path,
        cleaned: Vec<AsmLine>,
        scratch: &Scratch,
    ) -> Vec<AsmLine> {
        let joined = cleaned.iter().map(|line| line.text.as_str()).join("\n");
        let process = Process::new(vec![demangler.display().to_string()])
            .env(self.config.env.clone())
            .working_dir(scratch.path().to_owned())
            .timeout(self.config.compile_timeout)
            .max_output_bytes(self.config.max_asm_size)
            .stdin(Bytes::from(joined))
            .description("demangle");
        let demangled = match self.runner.run(process).await {
            Ok(result) if result.success() => result.stdout_str(),
            Ok(result) => {
                debug!("Demangler exited with {:?}; keeping mangled names", result.status);
                return cleaned;
            }
            Err(e) => {
                debug!("Demangler failed to run: {e}");
                return cleaned;
            }
        };
        let new_texts: Vec<&str> = demangled.lines().collect();
        if new_texts.len() != cleaned.len() {
            debug!(
                "Demangler changed the line count ({} -> {}); keeping mangled names",
                cleaned.len(),
                new_texts.len()
            );
            return cleaned;
        }
        cleaned
            .into_iter()
            .zip(new_texts)
            .map(|(line, text)| AsmLine {
                text: text.to_owned(),
                source: line.source,
            })
            .collect()
    }

    ///
    /// Read and parse the `.opt.yaml` sibling of the output file, keeping
    /// records for the user's source; round-trip through the demangler
    /// when one is configured.
    ///
    async fn collect_opt_records(
        &self,
        compiler: &CompilerDescriptor,
        scratch: &Scratch,
    ) -> Vec<OptRecord> {
        let opt_path = scratch.output_path().with_extension("opt.yaml");
        let raw = match tokio::fs::read_to_string(&opt_path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No optimization records at {}: {e}", opt_path.display());
                return Vec::new();
            }
        };
        let records = optrec::parse(&raw, &self.config.input_filename);
        let Some(demangler) = &compiler.demangler else {
            return records;
        };

        let Ok(serialized) = serde_json::to_string(&records) else {
            return records;
        };
        let process = Process::new(vec![demangler.display().to_string()])
            .env(self.config.env.clone())
            .working_dir(scratch.path().to_owned())
            .timeout(self.config.compile_timeout)
            .max_output_bytes(self.config.max_asm_size)
            .stdin(Bytes::from(serialized))
            .description("demangle opt records");
        match self.runner.run(process).await {
            Ok(result) if result.success() => {
                serde_json::from_str(&result.stdout_str()).unwrap_or(records)
            }
            _ => records,
        }
    }

    async fn execute_binary(&self, binary: &Path, params: &ExecuteParameters) -> ExecResult {
        let options = ExecutionOptions {
            args: params.args.clone(),
            stdin: params.stdin.as_ref().map(|s| Bytes::from(s.clone())),
            timeout: self.config.compile_timeout,
            max_output_bytes: self.config.max_executable_output_size,
        };
        match self.sandbox.run(binary, options).await {
            Ok(run) => ExecResult {
                did_execute: true,
                code: run.status,
                signal: run.signal,
                stdout: parse_output(&run.stdout_str(), &self.config.input_filename),
                stderr: parse_output(&run.stderr_str(), &self.config.input_filename),
            },
            Err(e) => ExecResult {
                // The sandbox failing is not a compile failure: the result
                // carries the error where the program output would be.
                did_execute: false,
                code: None,
                signal: None,
                stdout: Vec::new(),
                stderr: vec![AsmLine::text(e)],
            },
        }
    }
}

fn screen_source(source: &str) -> Result<(), CompileError> {
    for (index, line) in source.lines().enumerate() {
        if INCLUDE_SCREEN_RE.is_match(line) {
            return Err(CompileError::BadRequest(format!(
                "<stdin>:{}:1: no absolute or relative includes please",
                index + 1
            )));
        }
    }
    Ok(())
}

///
/// Build the compiler argument vector. The order is load-bearing: debug
/// info and output path first, presentation flags, the compile-mode flag,
/// then descriptor defaults, user options, the input file, and finally the
/// opt-record flag.
///
pub(crate) fn assemble_argv(
    compiler: &CompilerDescriptor,
    filters: &Filters,
    backend_options: &BackendOptions,
    user_options: &[String],
    scratch: &Scratch,
) -> Vec<String> {
    let mut argv = vec![
        "-g".to_owned(),
        "-o".to_owned(),
        scratch.output_path().display().to_string(),
    ];
    if filters.intel && !filters.binary {
        if let Some(flag) = &compiler.intel_asm {
            argv.push(flag.clone());
        }
    }
    if filters.binary {
        if !filters.link {
            argv.push("-c".to_owned());
        }
    } else {
        argv.push("-S".to_owned());
    }
    argv.extend(compiler.options.iter().cloned());
    argv.extend(user_options.iter().cloned());
    argv.push(scratch.input_path().display().to_string());
    if backend_options.produce_opt_info && compiler.supports.opt_record {
        if let Some(flag) = &compiler.opt_arg {
            argv.push(flag.clone());
        }
    }
    argv
}
