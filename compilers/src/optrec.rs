// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parser for LLVM optimization-record YAML (`-fsave-optimization-record`).
//!
//! The file is a multi-document stream where each document is tagged
//! `!Passed`, `!Missed`, or `!Analysis`.

use serde::{Deserialize, Serialize};
use serde_yaml::value::Value;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OptDebugLoc {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptRecord {
    /// "Passed", "Missed", or "Analysis" (the document tag, sans `!`).
    pub opt_type: String,
    pub pass: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_loc: Option<OptDebugLoc>,
    pub function: String,
    /// The record's `Args` flattened to one human-readable string.
    pub display_string: String,
}

///
/// Parse an opt-record stream, keeping only records whose `DebugLoc.File`
/// mentions `input_filename` (headers produce records too, and they drown
/// out the user's own code).
///
pub fn parse(raw: &str, input_filename: &str) -> Vec<OptRecord> {
    let mut records = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = match Value::deserialize(document) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Skipping unparseable opt-record document: {e}");
                continue;
            }
        };
        let Value::Tagged(tagged) = value else {
            continue;
        };
        let opt_type = tagged.tag.to_string().trim_start_matches('!').to_owned();
        let Some(record) = record_from_mapping(opt_type, &tagged.value) else {
            continue;
        };
        let in_user_source = record
            .debug_loc
            .as_ref()
            .map(|loc| loc.file.contains(input_filename))
            .unwrap_or(false);
        if in_user_source {
            records.push(record);
        }
    }
    records
}

fn record_from_mapping(opt_type: String, value: &Value) -> Option<OptRecord> {
    let mapping = value.as_mapping()?;
    let get_str = |key: &str| -> String {
        mapping
            .get(&Value::String(key.to_owned()))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    let debug_loc = mapping
        .get(&Value::String("DebugLoc".to_owned()))
        .and_then(|loc| serde_yaml::from_value::<OptDebugLoc>(loc.clone()).ok());

    let display_string = mapping
        .get(&Value::String("Args".to_owned()))
        .and_then(Value::as_sequence)
        .map(|args| {
            args.iter()
                .filter_map(display_fragment)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Some(OptRecord {
        opt_type,
        pass: get_str("Pass"),
        name: get_str("Name"),
        debug_loc,
        function: get_str("Function"),
        display_string,
    })
}

///
/// Each `Args` element is either a scalar or a single-entry mapping whose
/// value is the displayable fragment (`{Callee: foo}` renders as `foo`).
///
fn display_fragment(arg: &Value) -> Option<String> {
    match arg {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Mapping(mapping) => mapping.values().next().and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        _ => None,
    }
}
