// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::{AsmLine, Filters, SourceRef};

static LABEL_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([.A-Za-z_$@][A-Za-z0-9$_.@]*):").unwrap());
static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.[A-Za-z_]").unwrap());
static FILE_PLAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*\.file\s+"([^"]+)""#).unwrap());
static FILE_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*\.file\s+(\d+)\s+(?:"[^"]+"\s+)?"([^"]+)""#).unwrap());
static LOC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.loc\s+(\d+)\s+(\d+)").unwrap());
static GLOBAL_SYM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\.(?:globl|global|weak)\s+([.A-Za-z_$@][A-Za-z0-9$_.@]*)").unwrap()
});
static COMMENT_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[#;]|//|/\*)").unwrap());
static TRAILING_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+(?:#|//)\s.*$").unwrap());
static SYNTAX_NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\.(?:intel_syntax|att_syntax)").unwrap());
static LABEL_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.A-Za-z_$@][A-Za-z0-9$_.@]*").unwrap());
static OBJDUMP_SOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/[^\s:]+):(\d+)(?:\s.*)?$").unwrap());

#[derive(Clone, Debug, PartialEq, Eq)]
enum Kind {
    Label(String),
    Directive,
    Comment,
    Blank,
    Instruction,
    /// An objdump `-l` `/path/file.c:NN` marker: consumed for source
    /// mapping, never emitted.
    SourceMarker,
}

struct Line<'a> {
    raw: &'a str,
    kind: Kind,
    source: Option<SourceRef>,
    /// The label group this line belongs to; 0 is the file preamble.
    /// Consecutive labels alias the same group, so `f:` directly followed
    /// by `.LFB0:` shares one body.
    group: usize,
}

fn classify(raw: &str) -> Kind {
    if raw.trim().is_empty() {
        Kind::Blank
    } else if let Some(captures) = LABEL_DEF_RE.captures(raw) {
        Kind::Label(captures[1].to_owned())
    } else if OBJDUMP_SOURCE_RE.is_match(raw) {
        Kind::SourceMarker
    } else if DIRECTIVE_RE.is_match(raw) {
        Kind::Directive
    } else if COMMENT_ONLY_RE.is_match(raw) {
        Kind::Comment
    } else {
        Kind::Instruction
    }
}

///
/// Clean raw compiler assembly according to the filter set.
///
/// The cleaner is deterministic: it is a pure function of `(raw, filters)`.
///
pub fn clean(raw: &str, filters: &Filters) -> Vec<AsmLine> {
    // Pass 1: classify lines, track the debug-line file table, and assign
    // every line to a label group.
    let mut files: HashMap<u32, String> = HashMap::new();
    let mut primary_file: Option<String> = None;
    let mut current_source: Option<SourceRef> = None;
    let mut group_of_label: HashMap<String, usize> = HashMap::new();
    let mut root_labels: HashSet<String> = HashSet::new();
    let mut lines: Vec<Line> = Vec::new();
    let mut group = 0_usize;
    let mut previous_was_label = false;

    for raw_line in raw.lines() {
        let kind = classify(raw_line);
        match &kind {
            Kind::Label(name) => {
                if !previous_was_label {
                    group += 1;
                }
                group_of_label.insert(name.clone(), group);
                if !name.starts_with(".L") {
                    root_labels.insert(name.clone());
                }
                current_source = None;
            }
            Kind::Directive => {
                if let Some(captures) = FILE_NUM_RE.captures(raw_line) {
                    let index: u32 = captures[1].parse().unwrap_or(0);
                    files.insert(index, captures[2].to_owned());
                } else if let Some(captures) = FILE_PLAIN_RE.captures(raw_line) {
                    primary_file = Some(captures[1].to_owned());
                } else if let Some(captures) = LOC_RE.captures(raw_line) {
                    let file_index: u32 = captures[1].parse().unwrap_or(0);
                    let line: u32 = captures[2].parse().unwrap_or(0);
                    current_source = Some(source_ref(&files, &primary_file, file_index, line));
                } else if let Some(captures) = GLOBAL_SYM_RE.captures(raw_line) {
                    root_labels.insert(captures[1].to_owned());
                }
            }
            Kind::SourceMarker => {
                let captures = OBJDUMP_SOURCE_RE.captures(raw_line).unwrap();
                let line: u32 = captures[2].parse().unwrap_or(0);
                current_source = Some(SourceRef {
                    file: Some(captures[1].to_owned()),
                    line,
                });
            }
            _ => {}
        }
        previous_was_label = matches!(kind, Kind::Label(_));
        let source = match kind {
            Kind::Instruction => current_source.clone(),
            _ => None,
        };
        lines.push(Line {
            raw: raw_line,
            kind,
            source,
            group,
        });
    }

    // Pass 2: textual label reachability. A group's references are the
    // defined labels its instructions and directives mention; roots are
    // the preamble and the groups holding non-local or exported symbols.
    // A label line survives only if its own name is a root or is referenced
    // from a live group, so helper markers like `.LFB0:` drop away even
    // though the body they alias is kept.
    let liveness = if filters.labels {
        let mut refs: HashMap<usize, HashSet<String>> = HashMap::new();
        for line in &lines {
            if !matches!(line.kind, Kind::Instruction | Kind::Directive) {
                continue;
            }
            for token in LABEL_TOKEN_RE.find_iter(line.raw) {
                if group_of_label.contains_key(token.as_str()) {
                    refs.entry(line.group)
                        .or_default()
                        .insert(token.as_str().to_owned());
                }
            }
        }

        let mut used_groups: HashSet<usize> = HashSet::new();
        let mut used_labels: HashSet<String> = HashSet::new();
        let mut worklist: Vec<usize> = vec![0];
        for label in &root_labels {
            if let Some(&label_group) = group_of_label.get(label) {
                worklist.push(label_group);
            }
        }
        while let Some(current) = worklist.pop() {
            if !used_groups.insert(current) {
                continue;
            }
            for name in refs.get(&current).into_iter().flatten() {
                used_labels.insert(name.clone());
                worklist.push(group_of_label[name]);
            }
        }
        Some((used_groups, used_labels))
    } else {
        None
    };

    // Pass 3: emit.
    let mut out: Vec<AsmLine> = Vec::new();
    let mut skipping_group = false;
    for line in &lines {
        match &line.kind {
            Kind::Label(name) => {
                let (keep_body, keep_label) = match &liveness {
                    Some((used_groups, used_labels)) => (
                        used_groups.contains(&line.group),
                        used_groups.contains(&line.group)
                            && (root_labels.contains(name) || used_labels.contains(name)),
                    ),
                    None => (true, true),
                };
                skipping_group = !keep_body;
                if keep_label {
                    out.push(AsmLine::text(line.raw));
                }
            }
            Kind::Directive => {
                if skipping_group || filters.directives {
                    continue;
                }
                if filters.intel && SYNTAX_NOTE_RE.is_match(line.raw) {
                    // The actual syntax comes from compiler flags; the
                    // annotation would contradict the requested rendering.
                    continue;
                }
                out.push(AsmLine::text(line.raw));
            }
            Kind::Comment => {
                if !skipping_group && !filters.comment_only {
                    out.push(AsmLine::text(line.raw));
                }
            }
            Kind::Blank => {
                if !skipping_group
                    && out.last().map(|prev| !prev.text.is_empty()).unwrap_or(false)
                {
                    out.push(AsmLine::text(""));
                }
            }
            Kind::Instruction => {
                if skipping_group {
                    continue;
                }
                let text = if filters.comment_only {
                    TRAILING_COMMENT_RE.replace(line.raw, "").into_owned()
                } else {
                    line.raw.to_owned()
                };
                out.push(AsmLine {
                    text,
                    source: line.source.clone(),
                });
            }
            Kind::SourceMarker => {}
        }
    }
    while out.last().map(|line| line.text.is_empty()).unwrap_or(false) {
        out.pop();
    }
    out
}

fn source_ref(
    files: &HashMap<u32, String>,
    primary_file: &Option<String>,
    file_index: u32,
    line: u32,
) -> SourceRef {
    let path = files.get(&file_index).cloned();
    let is_primary = match (&path, primary_file) {
        (Some(path), Some(primary)) => {
            path == primary || path.ends_with(&format!("/{primary}")) || primary.ends_with(path)
        }
        // Without an unnumbered `.file`, the translation unit is
        // conventionally file 0 or 1 in the debug-line table.
        (_, None) => file_index <= 1,
        (None, _) => false,
    };
    SourceRef {
        file: if is_primary { None } else { path },
        line,
    }
}
