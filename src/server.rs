// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The HTTP surface and the request orchestrator: route the request,
//! choose local-vs-remote, drive the compile pipeline, and shape the
//! response per the client's accepted content types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::debug;
use serde::Deserialize;

use asm::Filters;
use compilers::driver::{CompileError, CompileRequest, CompileResult, Driver};
use compilers::registry::Registry;
use compilers::{BackendOptions, CompilerDescriptor, ExecuteParameters};

use crate::{asmdocs, proxy, sources};

pub struct BrokerState {
    pub registry: Arc<Registry>,
    pub driver: Arc<Driver>,
    pub http: reqwest::Client,
    pub language: String,
    pub default_compiler: Option<String>,
    pub archived_versions: Option<String>,
    client_options: ArcSwap<serde_json::Value>,
}

impl BrokerState {
    pub fn new(
        registry: Arc<Registry>,
        driver: Arc<Driver>,
        language: String,
        default_compiler: Option<String>,
        archived_versions: Option<String>,
    ) -> BrokerState {
        BrokerState {
            registry,
            driver,
            http: reqwest::Client::new(),
            language,
            default_compiler,
            archived_versions,
            client_options: ArcSwap::from_pointee(serde_json::Value::Null),
        }
    }

    ///
    /// Rebuild the client-options snapshot. Called after every registry
    /// publication so clients read a consistent view.
    ///
    pub fn rebuild_client_options(&self) {
        let compilers = self.registry.snapshot();
        let default_compiler = self
            .default_compiler
            .clone()
            .or_else(|| compilers.first().map(|c| c.id.clone()))
            .unwrap_or_default();
        let snapshot = serde_json::json!({
            "language": self.language,
            "compilers": compilers.iter().map(|c| c.as_ref()).collect::<Vec<_>>(),
            "defaultCompiler": default_compiler,
            "archivedVersions": self.archived_versions,
        });
        self.client_options.store(Arc::new(snapshot));
    }

    fn client_options(&self) -> Arc<serde_json::Value> {
        self.client_options.load_full()
    }
}

pub fn router(
    state: Arc<BrokerState>,
    body_limit: usize,
    static_dir: Option<PathBuf>,
) -> Router {
    let mut router = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/api/compilers", get(list_compilers))
        .route("/api/compiler/:id/compile", post(compile))
        .route("/compile", post(legacy_compile))
        .route("/api/asm/:opcode", get(asm_doc))
        .route("/client-options.json", get(client_options))
        .route("/source/:handler/:action", get(sources::handle))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);
    if let Some(dir) = static_dir {
        // Static assets are served by the front-end proxy in production;
        // this exists for local development.
        router = router.fallback_service(tower_http_stand_in(dir));
    }
    router
}

// Serving a static tree without pulling in tower-http: a minimal file
// responder is all local development needs.
fn tower_http_stand_in(dir: PathBuf) -> axum::routing::MethodRouter {
    get(move |uri: axum::http::Uri| {
        let dir = dir.clone();
        async move {
            let rel = uri.path().trim_start_matches('/');
            let path = dir.join(if rel.is_empty() { "index.html" } else { rel });
            match tokio::fs::read(&path).await {
                Ok(bytes) => (StatusCode::OK, bytes).into_response(),
                Err(_) => (StatusCode::NOT_FOUND, "Not found").into_response(),
            }
        }
    })
}

async fn healthcheck() -> &'static str {
    "OK"
}

async fn client_options(State(state): State<Arc<BrokerState>>) -> Response {
    Json(state.client_options().as_ref().clone()).into_response()
}

async fn asm_doc(Path(opcode): Path<String>) -> Response {
    match asmdocs::lookup(&opcode) {
        Some(doc) => Json(serde_json::json!({
            "opcode": opcode.to_uppercase(),
            "description": doc,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown opcode").into_response(),
    }
}

///
/// `GET /api/compilers`: JSON by default, padded `id | name` columns for
/// text clients.
///
async fn list_compilers(State(state): State<Arc<BrokerState>>, headers: HeaderMap) -> Response {
    let compilers = state.registry.snapshot();
    if wants_plain_text(&headers) {
        let width = compilers.iter().map(|c| c.id.len()).max().unwrap_or(0);
        let mut out = String::new();
        for compiler in compilers.iter() {
            out.push_str(&format!("{:<width$} | {}\n", compiler.id, compiler.name));
        }
        return ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out).into_response();
    }
    Json(compilers.iter().map(|c| c.as_ref()).collect::<Vec<_>>()).into_response()
}

///
/// The JSON compile envelope. The text variant instead carries the source
/// as the whole body and its settings in query parameters.
///
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CompileEnvelope {
    source: String,
    compiler: Option<String>,
    options: EnvelopeOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EnvelopeOptions {
    user_arguments: String,
    compiler_options: BackendOptions,
    filters: Filters,
    execute_parameters: ExecuteParameters,
}

async fn compile(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(compiler) = state.registry.find(&id) else {
        return (StatusCode::NOT_FOUND, format!("Compiler {id} not found")).into_response();
    };
    if compiler.is_remote() {
        // Remote descriptors are served by their owning broker: the local
        // pipeline is not engaged at all.
        return proxy::forward(&state.http, &compiler, "POST", &original_path(&id), headers, body)
            .await;
    }
    let request = match parse_request(&headers, &params, body) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    run_and_render(&state, compiler, request, &headers).await
}

///
/// `POST /compile`: the pre-REST alias, JSON envelope only, with the
/// compiler chosen in the body (or the configured default).
///
async fn legacy_compile(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: CompileEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Bad request body: {e}")).into_response(),
    };
    let id = envelope
        .compiler
        .clone()
        .or_else(|| state.default_compiler.clone())
        .or_else(|| state.registry.snapshot().first().map(|c| c.id.clone()));
    let Some(id) = id else {
        return (StatusCode::BAD_REQUEST, "No compiler requested and none configured").into_response();
    };
    let Some(compiler) = state.registry.find(&id) else {
        return (StatusCode::NOT_FOUND, format!("Compiler {id} not found")).into_response();
    };
    if compiler.is_remote() {
        return proxy::forward(
            &state.http,
            &compiler,
            "POST",
            "/compile",
            headers.clone(),
            Bytes::copy_from_slice(&body),
        )
        .await;
    }
    let request = match request_from_envelope(envelope) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    run_and_render(&state, compiler, request, &headers).await
}

async fn run_and_render(
    state: &Arc<BrokerState>,
    compiler: Arc<CompilerDescriptor>,
    request: CompileRequest,
    headers: &HeaderMap,
) -> Response {
    let wants_binary = request.filters.binary && wants_object_bytes(headers);
    match state.driver.compile(compiler, request).await {
        Ok(result) => render_result(&result, headers, wants_binary).await,
        Err(CompileError::BadRequest(message)) => {
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(CompileError::Internal(message)) => {
            log::error!("Compilation failed internally: {message}");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

fn original_path(id: &str) -> String {
    format!("/api/compiler/{id}/compile")
}

fn parse_request(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    body: Bytes,
) -> Result<CompileRequest, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        let envelope: CompileEnvelope =
            serde_json::from_slice(&body).map_err(|e| format!("Bad request body: {e}"))?;
        return request_from_envelope(envelope);
    }

    // Text variant: the body is the source; settings come from the query.
    let source = String::from_utf8(body.to_vec()).map_err(|e| format!("Bad source text: {e}"))?;
    let options = split_arguments(params.get("options").map(String::as_str).unwrap_or(""))?;

    let mut filters = Filters {
        labels: true,
        directives: true,
        comment_only: true,
        ..Filters::default()
    };
    if let Some(exact) = params.get("filters") {
        filters = Filters::default();
        apply_filter_names(&mut filters, exact, true)?;
    }
    if let Some(added) = params.get("addFilters") {
        apply_filter_names(&mut filters, added, true)?;
    }
    if let Some(removed) = params.get("removeFilters") {
        apply_filter_names(&mut filters, removed, false)?;
    }

    Ok(CompileRequest {
        source,
        options,
        backend_options: BackendOptions::default(),
        filters,
        execute_parameters: ExecuteParameters::default(),
    })
}

fn request_from_envelope(envelope: CompileEnvelope) -> Result<CompileRequest, String> {
    Ok(CompileRequest {
        source: envelope.source,
        options: split_arguments(&envelope.options.user_arguments)?,
        backend_options: envelope.options.compiler_options,
        filters: envelope.options.filters,
        execute_parameters: envelope.options.execute_parameters,
    })
}

fn split_arguments(raw: &str) -> Result<Vec<String>, String> {
    let split =
        shlex::split(raw).ok_or_else(|| format!("Unbalanced quoting in options `{raw}`"))?;
    Ok(split.into_iter().filter(|token| !token.is_empty()).collect())
}

fn apply_filter_names(filters: &mut Filters, names: &str, value: bool) -> Result<(), String> {
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match name {
            "binary" => filters.binary = value,
            "link" => filters.link = value,
            "execute" => filters.execute = value,
            "intel" => filters.intel = value,
            "demangle" => filters.demangle = value,
            "commentOnly" => filters.comment_only = value,
            "directives" => filters.directives = value,
            "labels" => filters.labels = value,
            "optOutput" => filters.opt_output = value,
            other => return Err(format!("Unknown filter `{other}`")),
        }
    }
    Ok(())
}

fn accept_header(headers: &HeaderMap) -> &str {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn wants_plain_text(headers: &HeaderMap) -> bool {
    accept_header(headers).contains("text/plain")
}

fn wants_object_bytes(headers: &HeaderMap) -> bool {
    let accept = accept_header(headers);
    ["application/octet-stream", "x-object", "x-executable", "x-sharedlib", "binary"]
        .iter()
        .any(|kind| accept.contains(kind))
}

async fn render_result(
    result: &CompileResult,
    headers: &HeaderMap,
    wants_binary: bool,
) -> Response {
    if wants_binary {
        if let Some(path) = &result.output_file_path {
            return match tokio::fs::read(path).await {
                Ok(bytes) => (
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    bytes,
                )
                    .into_response(),
                Err(e) => {
                    debug!("Object file {path} unavailable: {e}");
                    (StatusCode::NOT_FOUND, "Object file no longer available").into_response()
                }
            };
        }
    }
    if wants_plain_text(headers) {
        return (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            render_text(result),
        )
            .into_response();
    }
    Json(result).into_response()
}

fn render_text(result: &CompileResult) -> String {
    let mut out = String::new();
    out.push_str("# Compilation provided by the compilation broker\n");
    for line in &result.asm {
        out.push_str(&line.text);
        out.push('\n');
    }
    match (result.code, result.signal) {
        (_, Some(signal)) => {
            out.push_str(&format!("# Compiler terminated by signal {signal}\n"));
        }
        (Some(code), None) if code != 0 => {
            out.push_str(&format!("# Compiler exited with result code {code}\n"));
        }
        _ => {}
    }
    if !result.stdout.is_empty() {
        out.push_str("\nStandard out:\n");
        for line in &result.stdout {
            out.push_str(&line.text);
            out.push('\n');
        }
    }
    if !result.stderr.is_empty() {
        out.push_str("\nStandard error:\n");
        for line in &result.stderr {
            out.push_str(&line.text);
            out.push('\n');
        }
    }
    out
}
