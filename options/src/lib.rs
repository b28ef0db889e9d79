// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A layered configuration property store.
//!
//! Properties are flat `key=value` pairs merged from an ordered list of
//! layers. Later layers override earlier ones, so the merge order
//! `defaults, <env>..., <language>, <env>.<platform>..., <platform>,
//! <hostname>, local` gives `local` the last word, as expected for a
//! per-machine override file.

mod parse;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use parse::parse_properties;

///
/// A source of string-keyed property values.
///
/// Typed accessors are defined on top of `get_raw` so that every
/// implementation (the layered store, a prefixed view, a test map) gets
/// consistent parsing and error messages.
///
pub trait PropertySource: Send + Sync {
    ///
    /// Get the raw string value for `key`, if any layer defines it.
    ///
    fn get_raw(&self, key: &str) -> Option<String>;

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_owned())
    }

    fn get_opt_string(&self, key: &str) -> Option<String> {
        self.get_raw(key).filter(|v| !v.is_empty())
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.get_raw(key) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                other => Err(format!(
                    "Problem parsing property `{key}` value `{other}` as a boolean"
                )),
            },
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> Result<u64, String> {
        match self.get_raw(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e| {
                format!("Problem parsing property `{key}` value `{v}` as an integer: {e}")
            }),
        }
    }

    fn get_usize(&self, key: &str, default: usize) -> Result<usize, String> {
        self.get_u64(key, default as u64).map(|v| v as usize)
    }

    ///
    /// A whitespace-separated list value. An absent key is an empty list.
    ///
    fn get_list(&self, key: &str) -> Vec<String> {
        self.get_raw(key)
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

struct Layer {
    name: String,
    values: BTreeMap<String, String>,
}

///
/// The layered store: an ordered sequence of property layers, later layers
/// taking precedence.
///
pub struct Properties {
    layers: Vec<Layer>,
}

impl Properties {
    pub fn empty() -> Properties {
        Properties { layers: vec![] }
    }

    ///
    /// Construct from in-memory layers, lowest precedence first. Used by
    /// tests and by callers that synthesize configuration.
    ///
    pub fn from_layers(layers: Vec<(String, BTreeMap<String, String>)>) -> Properties {
        Properties {
            layers: layers
                .into_iter()
                .map(|(name, values)| Layer { name, values })
                .collect(),
        }
    }

    ///
    /// Load `<prefix>.<part>.properties` files from `config_dir` for each of
    /// the given parts, lowest precedence first. Missing files are skipped:
    /// most installations only define a few of the possible layers.
    ///
    pub fn load(config_dir: &Path, prefix: &str, parts: &[String]) -> Result<Properties, String> {
        let mut layers = Vec::new();
        for part in parts {
            let path = config_dir.join(format!("{prefix}.{part}.properties"));
            if !path.is_file() {
                log::debug!("No properties file at {}", path.display());
                continue;
            }
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read properties file {}: {e}", path.display()))?;
            let values = parse_properties(&contents)
                .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
            log::debug!("Loaded {} properties from {}", values.len(), path.display());
            layers.push(Layer {
                name: part.clone(),
                values,
            });
        }
        Ok(Properties { layers })
    }

    ///
    /// The standard merge order for a broker instance. `envs` is the
    /// `--env` list; `language` and `hostname` contribute their own layers.
    ///
    pub fn layer_parts(envs: &[String], language: &str, platform: &str, hostname: &str) -> Vec<String> {
        let mut parts = vec!["defaults".to_owned()];
        parts.extend(envs.iter().cloned());
        parts.push(language.to_owned());
        parts.extend(envs.iter().map(|env| format!("{env}.{platform}")));
        parts.push(platform.to_owned());
        parts.push(hostname.to_owned());
        parts.push("local".to_owned());
        parts
    }

    ///
    /// Render every key/value with the layer that won it. Behind the
    /// `--debug-properties` flag.
    ///
    pub fn dump(&self) -> String {
        let mut winners: BTreeMap<&str, (&str, &str)> = BTreeMap::new();
        for layer in &self.layers {
            for (k, v) in &layer.values {
                winners.insert(k, (layer.name.as_str(), v));
            }
        }
        winners
            .into_iter()
            .map(|(k, (layer, v))| format!("{k}={v} ({layer})"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl PropertySource for Properties {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.values.get(key).cloned())
    }
}

///
/// A view of an underlying source under a key prefix, falling back to an
/// outer source for keys the prefixed namespace does not define.
///
/// This is the lookup rule for `compiler.<id>.*` and `group.<g>.*`: the
/// specific namespace wins, then the enclosing scope.
///
#[derive(Clone)]
pub struct PrefixedSource {
    prefix: String,
    inner: Arc<dyn PropertySource>,
    fallback: Arc<dyn PropertySource>,
}

impl PrefixedSource {
    pub fn new(
        prefix: impl Into<String>,
        inner: Arc<dyn PropertySource>,
        fallback: Arc<dyn PropertySource>,
    ) -> PrefixedSource {
        PrefixedSource {
            prefix: prefix.into(),
            inner,
            fallback,
        }
    }
}

impl PropertySource for PrefixedSource {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.inner
            .get_raw(&format!("{}.{key}", self.prefix))
            .or_else(|| self.fallback.get_raw(key))
    }
}

impl PropertySource for BTreeMap<String, String> {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}
