// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;

use options::{Properties, PropertySource};
use process_execution::LocalRunner;

use crate::registry::{Discovery, DiscoveryConfig, Registry};
use crate::{Capabilities, CompilerDescriptor};

fn props(pairs: &[(&str, &str)]) -> Arc<dyn PropertySource> {
    let layer: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(Properties::from_layers(vec![("test".to_owned(), layer)]))
}

fn fake_compiler(dir: &Path, name: &str, version_line: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        format!(
            "#!/bin/bash\n\
             if [ \"$1\" = \"--version\" ]; then\n\
             \x20 echo \"{version_line}\"\n\
             else\n\
             \x20 echo \"  --ffast-math\"\n\
             \x20 echo \"  -mavx2\"\n\
             fi\n"
        ),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn discovery(work_dir: &Path, config: DiscoveryConfig) -> Discovery {
    Discovery::new(LocalRunner::new(work_dir.to_owned()), config)
}

fn fast_retries() -> DiscoveryConfig {
    DiscoveryConfig {
        proxy_retries: 2,
        proxy_retry: Duration::from_millis(10),
        proxy_timeout: Duration::from_millis(500),
        ..DiscoveryConfig::default()
    }
}

fn serve(router: Router) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum_server::from_tcp(listener)
            .serve(router.into_make_service())
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn local_compiler_from_properties() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_compiler(dir.path(), "mygcc", "g++ (Fake) 13.2.0");
    let discovery = discovery(dir.path(), DiscoveryConfig::default());

    let found = discovery
        .discover(
            "mygcc",
            props(&[
                ("compiler.mygcc.exe", exe.to_str().unwrap()),
                ("compiler.mygcc.name", "Fake GCC"),
                ("compiler.mygcc.options", "-O2 -fno-exceptions"),
                ("compiler.mygcc.supportsBinary", "false"),
            ]),
        )
        .await;

    assert_eq!(found.len(), 1);
    let descriptor = &found[0];
    assert_eq!(descriptor.id, "mygcc");
    assert_eq!(descriptor.name, "Fake GCC");
    assert_eq!(descriptor.version.as_deref(), Some("g++ (Fake) 13.2.0"));
    assert_eq!(descriptor.options, vec!["-O2", "-fno-exceptions"]);
    assert!(!descriptor.supports.binary);
    assert!(descriptor.supported_options.contains("--ffast-math"));
    assert!(descriptor.supported_options.contains("-mavx2"));
}

#[tokio::test]
async fn failing_probe_drops_the_descriptor_silently() {
    let dir = tempfile::tempdir().unwrap();
    let discovery = discovery(dir.path(), DiscoveryConfig::default());
    let found = discovery
        .discover(
            "ghost",
            props(&[("compiler.ghost.exe", "/bin/does-not-exist-for-sure")]),
        )
        .await;
    assert!(found.is_empty());
}

#[tokio::test]
async fn version_re_selects_the_capture() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_compiler(dir.path(), "cl", "clang version 15.0.7 (tags/x)");
    let discovery = discovery(dir.path(), DiscoveryConfig::default());
    let found = discovery
        .discover(
            "cl",
            props(&[
                ("compiler.cl.exe", exe.to_str().unwrap()),
                ("compiler.cl.versionRe", r"(clang version [0-9.]+)"),
            ]),
        )
        .await;
    assert_eq!(found[0].version.as_deref(), Some("clang version 15.0.7"));
    assert!(found[0].supports_ast());
    assert!(found[0].supports_cfg());
}

#[tokio::test]
async fn group_members_share_group_properties() {
    let dir = tempfile::tempdir().unwrap();
    let exe_a = fake_compiler(dir.path(), "gcc-a", "gcc a 1.0");
    let exe_b = fake_compiler(dir.path(), "gcc-b", "gcc b 1.0");
    let discovery = discovery(dir.path(), DiscoveryConfig::default());

    let found = discovery
        .discover(
            "&fast",
            props(&[
                ("group.fast.compilers", "gcc-a:gcc-b"),
                ("group.fast.options", "-O3"),
                ("compiler.gcc-a.exe", exe_a.to_str().unwrap()),
                ("compiler.gcc-b.exe", exe_b.to_str().unwrap()),
                // The per-compiler namespace still wins over the group.
                ("compiler.gcc-b.options", "-O0"),
            ]),
        )
        .await;

    assert_eq!(found.len(), 2);
    let by_id: BTreeMap<_, _> = found.iter().map(|d| (d.id.as_str(), d)).collect();
    assert_eq!(by_id["gcc-a"].options, vec!["-O3"]);
    assert_eq!(by_id["gcc-b"].options, vec!["-O0"]);
}

#[tokio::test]
async fn peer_fetch_marks_descriptors_remote() {
    let addr = serve(Router::new().route(
        "/api/compilers",
        get(|| async {
            axum::Json(serde_json::json!([
                {"id": "peer-gcc", "name": "gcc on peer", "exe": "/usr/bin/g++"}
            ]))
        }),
    ));
    let dir = tempfile::tempdir().unwrap();
    let discovery = discovery(dir.path(), fast_retries());

    let found = discovery
        .discover(&format!("127.0.0.1@{}", addr.port()), props(&[]))
        .await;

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "peer-gcc");
    assert_eq!(found[0].exe, None);
    assert_eq!(
        found[0].remote.as_deref(),
        Some(format!("http://127.0.0.1:{}", addr.port()).as_str())
    );
}

#[tokio::test]
async fn dead_peer_contributes_an_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let discovery = discovery(dir.path(), fast_retries());
    // Port 1 is never listening.
    let found = discovery.discover("127.0.0.1@1", props(&[])).await;
    assert!(found.is_empty());
}

#[tokio::test]
async fn cloud_registry_resolves_instances_to_peers() {
    let addr = serve(
        Router::new()
            .route(
                "/instances",
                get(|| async {
                    axum::Json(serde_json::json!([
                        {"privateDnsName": "127.0.0.1"},
                        {"privateDnsName": ""}
                    ]))
                }),
            )
            .route(
                "/api/compilers",
                get(|| async {
                    axum::Json(serde_json::json!([
                        {"id": "cloud-clang", "name": "clang in the cloud"}
                    ]))
                }),
            ),
    );
    let dir = tempfile::tempdir().unwrap();
    let discovery = discovery(
        dir.path(),
        DiscoveryConfig {
            instances_url: Some(format!("http://127.0.0.1:{}/instances", addr.port())),
            peer_port: addr.port(),
            ..fast_retries()
        },
    );

    let found = discovery.discover("AWS", props(&[])).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "cloud-clang");
    assert!(found[0].is_remote());
}

#[tokio::test]
async fn ndk_toolchains_are_enumerated() {
    let ndk = tempfile::tempdir().unwrap();
    let bin = ndk.path().join("toolchains/arm-linux-androideabi-4.9/prebuilt/linux-x86_64/bin");
    std::fs::create_dir_all(&bin).unwrap();
    fake_compiler(&bin, "arm-linux-androideabi-g++", "arm g++ 4.9");

    let dir = tempfile::tempdir().unwrap();
    let discovery = discovery(
        dir.path(),
        DiscoveryConfig {
            ndk_root: Some(ndk.path().to_owned()),
            ..DiscoveryConfig::default()
        },
    );
    let found = discovery.discover("", props(&[])).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "ndk-arm-linux-androideabi-4.9");
    assert_eq!(found[0].version.as_deref(), Some("arm g++ 4.9"));
}

fn descriptor(id: &str, name: &str) -> CompilerDescriptor {
    CompilerDescriptor {
        id: id.to_owned(),
        name: name.to_owned(),
        exe: Some(PathBuf::from("/usr/bin/true")),
        remote: None,
        compiler_type: crate::ArgumentParserKind::GccLike,
        options: Vec::new(),
        version_flag: "--version".to_owned(),
        version_re: None,
        version: Some("1.0".to_owned()),
        demangler: None,
        objdumper: None,
        intel_asm: None,
        opt_arg: None,
        post_process: Vec::new(),
        supports: Capabilities::default(),
        supported_options: std::collections::BTreeSet::new(),
    }
}

#[test]
fn publish_sorts_dedupes_and_suppresses_identical_sets() {
    let registry = Registry::new();

    let published = registry
        .publish(vec![
            descriptor("b", "zeta"),
            descriptor("a", "alpha"),
            descriptor("b", "zeta"),
        ])
        .unwrap();
    assert!(published);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].name, "alpha");
    assert_eq!(snapshot[1].name, "zeta");
    assert!(registry.find("a").is_some());
    assert!(registry.find("missing").is_none());

    // An identical rescan does not swap the snapshot.
    let republished = registry
        .publish(vec![descriptor("a", "alpha"), descriptor("b", "zeta")])
        .unwrap();
    assert!(!republished);

    // A different set does.
    let changed = registry
        .publish(vec![descriptor("a", "alpha")])
        .unwrap();
    assert!(changed);
    assert_eq!(registry.snapshot().len(), 1);
}
