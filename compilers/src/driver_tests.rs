// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use maplit::btreeset;

use asm::Filters;
use process_execution::docker::Sandbox;
use process_execution::{LocalRunner, SandboxType, ScratchRoot};

use crate::driver::{
    assemble_argv, CompileError, CompileRequest, Driver, DriverConfig, COMPILATION_FAILED,
};
use crate::{ArgumentParserKind, BackendOptions, Capabilities, CompilerDescriptor};

const CANNED_ASM: &str = r#"	.file	"example.cpp"
	.text
	.globl	f
f:
.LFB0:
	.file 1 "example.cpp"
	.loc 1 1 0
	mov eax, 42
	ret
.LFE0:
	.size	f, .-f
"#;

/// A compiler whose behavior is the given bash body. `$out` holds the
/// `-o` target and `$input` the trailing input file; `$log` records each
/// invocation.
fn fake_compiler(dir: &Path, log: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-compiler");
    std::fs::write(
        &path,
        format!(
            "#!/bin/bash\n\
             echo run >> {log}\n\
             out=\"\"\n\
             prev=\"\"\n\
             for a in \"$@\"; do\n\
             \x20 if [ \"$prev\" = \"-o\" ]; then out=\"$a\"; fi\n\
             \x20 prev=\"$a\"\n\
             done\n\
             input=\"${{@: -1}}\"\n\
             {body}\n",
            log = log.display()
        ),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn invocations(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn descriptor(exe: PathBuf) -> Arc<CompilerDescriptor> {
    Arc::new(CompilerDescriptor {
        id: "fake".to_owned(),
        name: "Fake g++".to_owned(),
        exe: Some(exe),
        remote: None,
        compiler_type: ArgumentParserKind::GccLike,
        options: Vec::new(),
        version_flag: "--version".to_owned(),
        version_re: None,
        version: Some("g++ (Fake) 13.2.0".to_owned()),
        demangler: None,
        objdumper: None,
        intel_asm: Some("-masm=intel".to_owned()),
        opt_arg: Some("-fsave-optimization-record".to_owned()),
        post_process: Vec::new(),
        supports: Capabilities {
            binary: true,
            execute: true,
            intel_asm: true,
            multiarch: false,
            opt_record: true,
        },
        supported_options: BTreeSet::new(),
    })
}

struct Harness {
    driver: Arc<Driver>,
    temp: tempfile::TempDir,
    log: PathBuf,
}

fn harness_with(config: DriverConfig, compiler_body: &str) -> (Harness, Arc<CompilerDescriptor>) {
    let temp = tempfile::tempdir().unwrap();
    let log = temp.path().join("invocations.log");
    let exe = fake_compiler(temp.path(), &log, compiler_body);
    let scratch_base = temp.path().join("scratch");
    let scratch =
        Arc::new(ScratchRoot::new(scratch_base, "example.cpp", "output.s").unwrap());
    let runner = LocalRunner::new(temp.path().to_owned());
    let sandbox = Sandbox::new(SandboxType::None, "ubuntu:22.04", runner.clone());
    let driver = Arc::new(Driver::new(
        runner,
        sandbox,
        scratch,
        16 * 1024 * 1024,
        2,
        config,
    ));
    (
        Harness { driver, temp, log },
        descriptor(exe),
    )
}

fn harness() -> (Harness, Arc<CompilerDescriptor>) {
    harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "cat > \"$out\" <<'EOF'\n\
         CANNED\n\
         EOF\n\
         echo \"example.cpp:1:10: warning: just kidding\" >&2\n",
    )
}

fn asm_emitting_harness() -> (Harness, Arc<CompilerDescriptor>) {
    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "cp \"$(dirname \"$0\")/canned.s\" \"$out\"\n\
         echo \"example.cpp:1:10: warning: just kidding\" >&2\n",
    );
    std::fs::write(harness.temp.path().join("canned.s"), CANNED_ASM).unwrap();
    (harness, compiler)
}

fn all_text_filters() -> Filters {
    Filters {
        intel: true,
        labels: true,
        directives: true,
        comment_only: true,
        ..Filters::default()
    }
}

#[tokio::test]
async fn hello_world_asm() {
    let (harness, compiler) = asm_emitting_harness();
    let result = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "int f(){return 42;}".to_owned(),
                options: vec!["-O2".to_owned()],
                filters: all_text_filters(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.code, Some(0));
    assert!(result.ok_to_cache);
    let mov = result
        .asm
        .iter()
        .find(|line| line.text.contains("mov eax, 42"))
        .expect("expected the canned mov");
    assert_eq!(mov.source.as_ref().map(|s| s.line), Some(1));
    assert!(mov.source.as_ref().unwrap().file.is_none());
    assert!(result.exec_result.is_none());

    // The diagnostic is tied back to the user's source line.
    let warning = result
        .stderr
        .iter()
        .find(|line| line.text.contains("warning"))
        .unwrap();
    assert_eq!(warning.source.as_ref().map(|s| s.line), Some(1));

    // CFG comes for free for the g++ family.
    assert!(result.cfg.as_ref().unwrap().contains_key("f"));
}

#[tokio::test]
async fn identical_requests_compile_once() {
    let (harness, compiler) = harness();
    let request = CompileRequest {
        source: "int f(){return 1;}".to_owned(),
        options: vec!["-O1".to_owned()],
        ..CompileRequest::default()
    };

    let first = harness
        .driver
        .compile(compiler.clone(), request.clone())
        .await
        .unwrap();
    let second = harness.driver.compile(compiler, request).await.unwrap();

    assert_eq!(invocations(&harness.log), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn concurrent_identical_requests_single_flight() {
    let (harness, compiler) = harness();
    let request = CompileRequest {
        source: "int g(){return 2;}".to_owned(),
        ..CompileRequest::default()
    };

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let driver = harness.driver.clone();
            let compiler = compiler.clone();
            let request = request.clone();
            tokio::spawn(async move { driver.compile(compiler, request).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(invocations(&harness.log), 1);
}

#[tokio::test]
async fn timed_out_compiles_are_not_cached() {
    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_millis(100),
            ..DriverConfig::default()
        },
        "sleep 30\n",
    );
    let request = CompileRequest {
        source: "int h(){for(;;);}".to_owned(),
        ..CompileRequest::default()
    };

    let result = harness
        .driver
        .compile(compiler.clone(), request.clone())
        .await
        .unwrap();
    assert_eq!(result.code, None);
    assert!(result.signal.is_some());
    assert!(!result.ok_to_cache);
    assert_eq!(result.asm[0].text, COMPILATION_FAILED);
    let last_stderr = result.stderr.last().unwrap();
    assert_eq!(last_stderr.text, "Killed - processing time exceeded");

    // Not cached: a second identical request spawns again.
    harness.driver.compile(compiler, request).await.unwrap();
    assert_eq!(invocations(&harness.log), 2);
}

#[tokio::test]
async fn absolute_include_is_rejected_before_spawning() {
    let (harness, compiler) = harness();
    let err = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "#include \"/etc/passwd\"\nint f(){return 0;}".to_owned(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        CompileError::BadRequest(
            "<stdin>:1:1: no absolute or relative includes please".to_owned()
        )
    );
    assert_eq!(invocations(&harness.log), 0);
}

#[tokio::test]
async fn parent_relative_include_is_rejected() {
    let (harness, compiler) = harness();
    let err = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "int x;\n  #  include <foo/../../secret>".to_owned(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::BadRequest(
            "<stdin>:2:1: no absolute or relative includes please".to_owned()
        )
    );
}

#[tokio::test]
async fn forbidden_options_enumerate_offenders() {
    let (harness, compiler) = harness_with(
        DriverConfig {
            forbidden_options: btreeset! {"-fplugin".to_owned(), "-specs".to_owned()},
            ..DriverConfig::default()
        },
        "true\n",
    );
    let err = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "int f();".to_owned(),
                options: vec!["-O2".to_owned(), "-fplugin".to_owned(), "-specs".to_owned()],
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::BadRequest("Bad options: -fplugin, -specs".to_owned())
    );
    assert_eq!(invocations(&harness.log), 0);
}

#[tokio::test]
async fn binary_link_and_execute() {
    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "printf '#!/bin/sh\\necho hi\\n' > \"$out\"\n\
         chmod +x \"$out\"\n",
    );
    let result = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "#include <cstdio>\nint main(){puts(\"hi\");}".to_owned(),
                filters: Filters {
                    execute: true,
                    ..Filters::default()
                },
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.code, Some(0));
    assert!(!result.asm.is_empty());

    let exec = result.exec_result.as_ref().unwrap();
    assert!(exec.did_execute);
    assert_eq!(exec.code, Some(0));
    assert_eq!(exec.stdout.len(), 1);
    assert_eq!(exec.stdout[0].text, "hi");
    assert!(exec.stdout[0].source.is_none());

    // The object backing a binary result is retained for download.
    let path = result.output_file_path.as_ref().unwrap();
    assert!(std::fs::metadata(path).is_ok(), "retained {path} should exist");
}

#[tokio::test]
async fn binary_mode_appends_the_stub() {
    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "cp \"$input\" \"$out\"\n",
    );
    let result = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "int f(){return 1;}".to_owned(),
                filters: Filters {
                    binary: true,
                    ..Filters::default()
                },
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

    assert!(
        result
            .asm
            .iter()
            .any(|line| line.text.contains("int main(void){return 0;}")),
        "stub should have been appended"
    );
}

#[tokio::test]
async fn post_process_pipeline_transforms_output() {
    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "printf 'mov eax, 42\\n' > \"$out\"\n",
    );
    let mut compiler = (*compiler).clone();
    compiler.post_process = vec!["tr a-z A-Z".to_owned()];

    let result = harness
        .driver
        .compile(Arc::new(compiler), CompileRequest {
            source: "int f();".to_owned(),
            ..CompileRequest::default()
        })
        .await
        .unwrap();

    assert!(
        result.asm.iter().any(|line| line.text.contains("MOV EAX, 42")),
        "{:?}",
        result.asm
    );
}

#[tokio::test]
async fn demangler_is_spliced_preserving_sources() {
    let temp = tempfile::tempdir().unwrap();
    let demangler = temp.path().join("demangle");
    std::fs::write(&demangler, "#!/bin/bash\nsed 's/_Z1fv/f()/g'\n").unwrap();
    let mut perms = std::fs::metadata(&demangler).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&demangler, perms).unwrap();

    let (harness, compiler) = harness_with(
        DriverConfig {
            compile_timeout: Duration::from_secs(10),
            ..DriverConfig::default()
        },
        "printf '_Z1fv:\\n\\tret\\n' > \"$out\"\n",
    );
    let mut compiler = (*compiler).clone();
    compiler.demangler = Some(demangler);

    let result = harness
        .driver
        .compile(Arc::new(compiler), CompileRequest {
            source: "int f();".to_owned(),
            filters: Filters {
                demangle: true,
                ..Filters::default()
            },
            ..CompileRequest::default()
        })
        .await
        .unwrap();

    assert!(
        result.asm.iter().any(|line| line.text.contains("f():")),
        "{:?}",
        result.asm
    );
}

#[test]
fn argv_assembly_order() {
    let temp = tempfile::tempdir().unwrap();
    let scratch_root =
        Arc::new(ScratchRoot::new(temp.path().to_owned(), "example.cpp", "output.s").unwrap());
    let scratch = scratch_root.allocate().unwrap();
    let out = scratch.output_path().display().to_string();
    let input = scratch.input_path().display().to_string();

    let mut compiler = (*descriptor(PathBuf::from("/usr/bin/g++"))).clone();
    compiler.options = vec!["-fno-plt".to_owned()];

    // Plain text asm.
    let argv = assemble_argv(
        &compiler,
        &Filters::default(),
        &BackendOptions::default(),
        &["-O2".to_owned()],
        &scratch,
    );
    assert_eq!(
        argv,
        vec![
            "-g".to_owned(),
            "-o".to_owned(),
            out.clone(),
            "-S".to_owned(),
            "-fno-plt".to_owned(),
            "-O2".to_owned(),
            input.clone(),
        ]
    );

    // Intel syntax applies only off the objdump path.
    let argv = assemble_argv(
        &compiler,
        &Filters {
            intel: true,
            ..Filters::default()
        },
        &BackendOptions::default(),
        &[],
        &scratch,
    );
    assert_eq!(argv[3], "-masm=intel");

    let argv = assemble_argv(
        &compiler,
        &Filters {
            intel: true,
            binary: true,
            ..Filters::default()
        },
        &BackendOptions::default(),
        &[],
        &scratch,
    );
    assert!(!argv.contains(&"-masm=intel".to_owned()));
    assert!(argv.contains(&"-c".to_owned()));

    // Linking drops `-c`; the opt-record flag lands after the input.
    let argv = assemble_argv(
        &compiler,
        &Filters {
            binary: true,
            link: true,
            ..Filters::default()
        },
        &BackendOptions {
            produce_opt_info: true,
            ..BackendOptions::default()
        },
        &[],
        &scratch,
    );
    assert!(!argv.contains(&"-c".to_owned()));
    assert!(!argv.contains(&"-S".to_owned()));
    assert_eq!(argv.last().unwrap(), "-fsave-optimization-record");
    assert_eq!(argv[argv.len() - 2], input);
}

#[tokio::test]
async fn failed_compiles_return_a_structured_result() {
    let (harness, compiler) = harness_with(
        DriverConfig::default(),
        "echo \"example.cpp:1:5: error: nope\" >&2\nexit 1\n",
    );
    let result = harness
        .driver
        .compile(
            compiler,
            CompileRequest {
                source: "int broken(".to_owned(),
                ..CompileRequest::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.code, Some(1));
    assert_eq!(result.asm.len(), 1);
    assert_eq!(result.asm[0].text, COMPILATION_FAILED);
    // Failures are valid results and may be cached; post-processing was
    // skipped (no cfg, no exec).
    assert!(result.ok_to_cache);
    assert!(result.cfg.is_none());
    assert!(result.exec_result.is_none());
}

#[test]
fn stub_regex_defaults_are_sane() {
    let config = DriverConfig::default();
    assert!(config.stub_re.is_match("int main() { return 0; }"));
    assert!(!config.stub_re.is_match("int f() { return 0; }"));
}
