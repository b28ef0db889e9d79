// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Filtering of `clang -ast-dump` output down to the user's own
//! declarations.
//!
//! The dump prints the whole translation unit, including everything pulled
//! in by headers. Clang only names a file in a source range when the file
//! *changes*, so we track the most recently named file across top-level
//! declarations and keep a subtree when that tracker points at the user's
//! source. `<invalid sloc>` ranges name no file and must not disturb the
//! tracker.

use std::sync::LazyLock;

use regex::Regex;

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" 0x[0-9a-f]+").unwrap());
static INVALID_SLOC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<?<invalid sloc>>?").unwrap());
static NAMED_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[<,]\s*([^<>,:]+):\d+:\d+").unwrap());

///
/// True when `line` opens a top-level declaration: a direct child of the
/// TranslationUnitDecl, prefixed `|-` or `` `- `` at depth zero.
///
fn is_top_level(line: &str) -> bool {
    line.starts_with("|-") || line.starts_with("`-")
}

///
/// Filter a raw AST dump: keep top-level declarations originating from the
/// user's source, drop subtrees rooted in headers or the compiler's
/// builtins, and scrub pointer addresses and invalid-sloc markers.
///
pub fn process(raw: &str, input_filename: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut current_file: Option<String> = None;
    let mut keeping = false;

    for line in raw.lines() {
        if is_top_level(line) {
            // Find the first real file named by this declaration's range,
            // if any. Ranges made of `<invalid sloc>` or `line:`/`col:`
            // references inherit the tracker.
            if let Some(named) = named_file(line) {
                current_file = Some(named);
            }
            keeping = match &current_file {
                Some(file) => {
                    file == input_filename
                        || file.ends_with(&format!("/{input_filename}"))
                        || file == "<stdin>"
                }
                // Before any file is named (builtin typedefs), drop.
                None => false,
            };
        } else if !line.starts_with(' ') && !line.starts_with('|') && !line.starts_with('`') {
            // The TranslationUnitDecl header itself.
            keeping = false;
        }

        if keeping || is_tu_header(line) {
            let scrubbed = ADDRESS_RE.replace_all(line, "");
            let scrubbed = INVALID_SLOC_RE.replace_all(&scrubbed, "");
            kept.push(scrubbed.into_owned());
        }
    }

    kept.join("\n")
}

fn is_tu_header(line: &str) -> bool {
    line.starts_with("TranslationUnitDecl")
}

fn named_file(line: &str) -> Option<String> {
    // `<stdin>` never parses as a path (the angle brackets collide with
    // the range syntax) but is the compiled source when piping.
    if line.contains("<stdin>:") {
        return Some("<stdin>".to_owned());
    }
    for captures in NAMED_FILE_RE.captures_iter(line) {
        let name = captures[1].trim();
        // `line` and `col` references reuse the current file; they are not
        // file names.
        if name == "line" || name == "col" || name.is_empty() {
            continue;
        }
        return Some(name.to_owned());
    }
    None
}
