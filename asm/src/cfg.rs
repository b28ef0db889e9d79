// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Builds a per-function basic-block control-flow graph from cleaned
//! assembly, for the compiler families whose output we can parse
//! (clang and g++-style x86 text).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::AsmLine;

static FUNCTION_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9$_.@]*):").unwrap());
static LOCAL_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\.[A-Za-z_$@][A-Za-z0-9$_.@]*):").unwrap());
static JUMP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(jmp|j[a-z]{1,4})\s+([.A-Za-z_$@][A-Za-z0-9$_.@]*)").unwrap());
static RETURN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(ret|retq|ret\b)").unwrap());
static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.").unwrap());

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CfgNode {
    pub id: String,
    pub label: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CfgEdge {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrows: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Cfg {
    pub nodes: Vec<CfgNode>,
    pub edges: Vec<CfgEdge>,
}

enum Terminator {
    /// `jmp target`
    Unconditional(String),
    /// `jcc target`, with fall-through to the next block.
    Conditional(String),
    Return,
    FallThrough,
}

struct Block {
    id: String,
    lines: Vec<String>,
    terminator: Terminator,
}

///
/// Build a map from function name to its control-flow graph.
///
/// Functions are scoped by their symbol labels; blocks split at local
/// labels and after branches. Conditional edges are annotated "true"
/// (taken) and "false" (fall-through).
///
pub fn build(lines: &[AsmLine]) -> BTreeMap<String, Cfg> {
    let mut functions: BTreeMap<String, Cfg> = BTreeMap::new();

    let mut index = 0;
    while index < lines.len() {
        let Some(captures) = FUNCTION_LABEL_RE.captures(&lines[index].text) else {
            index += 1;
            continue;
        };
        let name = captures[1].to_owned();
        let (blocks, next_index) = scan_function(&name, lines, index + 1);
        if !blocks.is_empty() {
            functions.insert(name, to_cfg(blocks));
        }
        index = next_index;
    }

    functions
}

fn scan_function(name: &str, lines: &[AsmLine], start: usize) -> (Vec<Block>, usize) {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current_id = name.to_owned();
    let mut current_lines: Vec<String> = Vec::new();
    let mut synthetic = 0_usize;
    let mut index = start;

    let flush = |id: &mut String,
                     body: &mut Vec<String>,
                     terminator: Terminator,
                     blocks: &mut Vec<Block>| {
        if !body.is_empty() || matches!(terminator, Terminator::Return) {
            blocks.push(Block {
                id: id.clone(),
                lines: std::mem::take(body),
                terminator,
            });
        }
    };

    while index < lines.len() {
        let text = &lines[index].text;
        if FUNCTION_LABEL_RE.is_match(text) {
            break;
        }
        if let Some(captures) = LOCAL_LABEL_RE.captures(text) {
            flush(
                &mut current_id,
                &mut current_lines,
                Terminator::FallThrough,
                &mut blocks,
            );
            current_id = captures[1].to_owned();
            index += 1;
            continue;
        }
        if text.trim().is_empty() || DIRECTIVE_RE.is_match(text) {
            index += 1;
            continue;
        }

        current_lines.push(text.trim().to_owned());
        if let Some(captures) = JUMP_RE.captures(text) {
            let mnemonic = captures[1].to_owned();
            let target = captures[2].to_owned();
            let terminator = if mnemonic == "jmp" {
                Terminator::Unconditional(target)
            } else {
                Terminator::Conditional(target)
            };
            flush(&mut current_id, &mut current_lines, terminator, &mut blocks);
            synthetic += 1;
            current_id = format!("{name}@{synthetic}");
        } else if RETURN_RE.is_match(text) {
            flush(
                &mut current_id,
                &mut current_lines,
                Terminator::Return,
                &mut blocks,
            );
            synthetic += 1;
            current_id = format!("{name}@{synthetic}");
        }
        index += 1;
    }

    flush(
        &mut current_id,
        &mut current_lines,
        Terminator::FallThrough,
        &mut blocks,
    );
    (blocks, index)
}

fn to_cfg(blocks: Vec<Block>) -> Cfg {
    let mut cfg = Cfg::default();
    for (position, block) in blocks.iter().enumerate() {
        cfg.nodes.push(CfgNode {
            id: block.id.clone(),
            label: block.lines.join("\n"),
        });
        let fall_through = blocks.get(position + 1).map(|next| next.id.clone());
        match &block.terminator {
            Terminator::Unconditional(target) => {
                cfg.edges.push(CfgEdge {
                    from: block.id.clone(),
                    to: target.clone(),
                    arrows: None,
                });
            }
            Terminator::Conditional(target) => {
                cfg.edges.push(CfgEdge {
                    from: block.id.clone(),
                    to: target.clone(),
                    arrows: Some("true".to_owned()),
                });
                if let Some(next) = fall_through {
                    cfg.edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: next,
                        arrows: Some("false".to_owned()),
                    });
                }
            }
            Terminator::Return => {}
            Terminator::FallThrough => {
                if let Some(next) = fall_through {
                    cfg.edges.push(CfgEdge {
                        from: block.id.clone(),
                        to: next,
                        arrows: None,
                    });
                }
            }
        }
    }
    cfg
}
