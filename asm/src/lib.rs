// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Post-processing of textual compiler output: the assembly cleaner and the
//! control-flow-graph builder.
//!
//! Both are pure functions of their inputs: running either twice on the
//! same input yields identical output, which is what makes compile results
//! safe to memoize.

pub mod cfg;
mod filter;


use serde::{Deserialize, Serialize};

pub use crate::filter::clean;

///
/// The boolean filter flags a client can apply to a compilation.
///
/// `execute ⇒ binary ∧ link` is enforced by `normalize`; `intel` has no
/// effect when `binary` is set because the objdump path controls syntax.
///
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Filters {
    pub binary: bool,
    pub link: bool,
    pub execute: bool,
    pub intel: bool,
    pub demangle: bool,
    pub comment_only: bool,
    pub directives: bool,
    pub labels: bool,
    pub opt_output: bool,
}

impl Filters {
    ///
    /// Apply the FilterSet invariants against the chosen compiler's
    /// capabilities.
    ///
    pub fn normalize(mut self, supports_binary: bool) -> Filters {
        if self.execute {
            self.binary = true;
            self.link = true;
        }
        if self.binary && !supports_binary {
            self.binary = false;
        }
        self
    }
}

///
/// Where an output line came from in the user's source. `file` is `None`
/// for the compiled translation unit itself and names the header otherwise.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SourceRef {
    pub file: Option<String>,
    pub line: u32,
}

///
/// One line of cleaned output.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AsmLine {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
}

impl AsmLine {
    pub fn text(text: impl Into<String>) -> AsmLine {
        AsmLine {
            text: text.into(),
            source: None,
        }
    }
}
