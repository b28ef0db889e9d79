// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

///
/// Parse the `key=value` properties format.
///
/// Blank lines and `#` comment lines are skipped. Values keep any embedded
/// `=`; surrounding whitespace is trimmed from both key and value. A line
/// with no `=` at all is an error, since silently dropping it would hide
/// typos in override files.
///
pub fn parse_properties(contents: &str) -> Result<BTreeMap<String, String>, String> {
    let mut values = BTreeMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {}: no `=` in `{line}`", lineno + 1));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("line {}: empty key in `{line}`", lineno + 1));
        }
        values.insert(key.to_owned(), value.trim().to_owned());
    }
    Ok(values)
}
