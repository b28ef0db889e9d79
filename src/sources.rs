// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The pluggable source-snippet store behind `GET /source/:handler/:action`.
//!
//! Only the built-in handler ships with the broker; site-specific handlers
//! are registered by the embedding deployment.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

const BUILTIN_SNIPPETS: &[(&str, &str, &str)] = &[
    (
        "default",
        "Simple function",
        "int square(int num) {\n    return num * num;\n}\n",
    ),
    (
        "max",
        "Max of two values",
        "int max(int a, int b) {\n    return a > b ? a : b;\n}\n",
    ),
];

pub async fn handle(Path((handler, action)): Path<(String, String)>) -> Response {
    if handler != "builtin" {
        return (StatusCode::NOT_FOUND, format!("No source handler `{handler}`")).into_response();
    }
    match action.as_str() {
        "list" => Json(
            BUILTIN_SNIPPETS
                .iter()
                .map(|(name, title, _)| serde_json::json!({"name": name, "title": title}))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        name => match BUILTIN_SNIPPETS.iter().find(|(n, _, _)| *n == name) {
            Some((_, _, text)) => Json(serde_json::json!({"file": text})).into_response(),
            None => (StatusCode::NOT_FOUND, format!("No source `{name}`")).into_response(),
        },
    }
}
