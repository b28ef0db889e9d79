// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Transparent reverse proxying for remote compiler descriptors: the
//! request reaches the peer unchanged (method, headers, body, path), and
//! the peer's response flows back unchanged. The local pipeline and cache
//! are never engaged.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use log::warn;

use compilers::CompilerDescriptor;

/// Hop-by-hop headers never travel through a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub async fn forward(
    http: &reqwest::Client,
    compiler: &CompilerDescriptor,
    method: &str,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(remote) = &compiler.remote else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Descriptor has no remote endpoint",
        )
            .into_response();
    };
    let url = format!("{}{path}", remote.trim_end_matches('/'));

    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad method").into_response(),
    };
    let mut request = http.request(method, &url).body(body.to_vec());
    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        request = request.header(name, value);
    }

    let peer_response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Proxying to {url} failed: {e}");
            return (StatusCode::BAD_GATEWAY, format!("Peer unavailable: {e}")).into_response();
        }
    };

    let status =
        StatusCode::from_u16(peer_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in peer_response.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_ref()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }
    let body = match peer_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Reading peer response from {url} failed: {e}");
            return (StatusCode::BAD_GATEWAY, format!("Peer response lost: {e}")).into_response();
        }
    };

    (status, response_headers, body).into_response()
}
