//! # Configuration Module
//!
//! Layered, path-keyed configuration for mounted applications.
//!
//! ## Shape
//!
//! An [`AppConfig`] holds a `global` block (server and engine settings) and one
//! [`ConfigBlock`] per path prefix (`/`, `/blog`, `/blog/archive`, ...). During
//! dispatch the blocks along the request path are merged root-first, so the
//! deepest prefix wins on key conflict.
//!
//! ## YAML
//!
//! ```yaml
//! global:
//!   server.socket_port: 8080
//! "/":
//!   tools.sessions.on: true
//!   tools:
//!     sessions:
//!       timeout: 20      # nested maps flatten to dotted keys
//! "/blog":
//!   timeout: 30
//! ```
//!
//! ## Typed lookups
//!
//! [`Config::get_or`] coerces string values into the type of the supplied
//! default (`"true"` -> `bool`, `"30"` -> `i64`), so values that arrive as text
//! from environment variables or headers behave like native YAML scalars.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use tracing::warn;

/// One configuration block: dotted keys to JSON values.
pub type ConfigBlock = Map<String, Value>;

/// Conversion from a stored config value, with string coercion.
pub trait FromConfigValue: Sized {
    /// Convert `value`, returning `None` if it cannot represent `Self`
    fn from_config(value: &Value) -> Option<Self>;
}

impl FromConfigValue for bool {
    fn from_config(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Some(true),
                "false" | "off" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl FromConfigValue for i64 {
    fn from_config(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl FromConfigValue for u64 {
    fn from_config(value: &Value) -> Option<Self> {
        i64::from_config(value).and_then(|n| u64::try_from(n).ok())
    }
}

impl FromConfigValue for usize {
    fn from_config(value: &Value) -> Option<Self> {
        i64::from_config(value).and_then(|n| usize::try_from(n).ok())
    }
}

impl FromConfigValue for f64 {
    fn from_config(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromConfigValue for String {
    fn from_config(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl FromConfigValue for Vec<String> {
    fn from_config(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.iter().map(String::from_config).collect(),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Effective configuration for one request (or one application root).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    block: ConfigBlock,
}

impl Config {
    /// Wrap an existing block
    #[must_use]
    pub fn new(block: ConfigBlock) -> Self {
        Self { block }
    }

    /// Overlay `other` on top of this config; keys in `other` win
    pub fn merge(&mut self, other: &ConfigBlock) {
        for (key, value) in other {
            self.block.insert(key.clone(), value.clone());
        }
    }

    /// Raw value lookup
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.block.get(key)
    }

    /// Whether `key` is set at all
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.block.contains_key(key)
    }

    /// Typed lookup, `None` when unset or not coercible
    #[must_use]
    pub fn get_opt<T: FromConfigValue>(&self, key: &str) -> Option<T> {
        let value = self.block.get(key)?;
        if value.is_null() {
            return None;
        }
        let converted = T::from_config(value);
        if converted.is_none() {
            warn!(key = %key, value = %value, "Config value has unexpected type - ignoring");
        }
        converted
    }

    /// Typed lookup falling back to `default`
    #[must_use]
    pub fn get_or<T: FromConfigValue>(&self, key: &str, default: T) -> T {
        self.get_opt(key).unwrap_or(default)
    }

    /// Set a single key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.block.insert(key.into(), value.into());
    }

    /// All keys under `prefix.` with the prefix stripped
    #[must_use]
    pub fn namespace(&self, prefix: &str) -> ConfigBlock {
        let dotted = format!("{prefix}.");
        self.block
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&dotted)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Borrow the underlying block
    #[must_use]
    pub fn as_block(&self) -> &ConfigBlock {
        &self.block
    }
}

impl From<ConfigBlock> for Config {
    fn from(block: ConfigBlock) -> Self {
        Self::new(block)
    }
}

/// Normalize a config section path: leading slash, no trailing slash (except `/`).
#[must_use]
pub fn normalize_section(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Application configuration: a global block plus path-keyed blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    /// Server/engine level settings (`global:` section)
    pub global: ConfigBlock,
    /// Path prefix (`/`, `/blog`) to block
    pub paths: BTreeMap<String, ConfigBlock>,
}

impl AppConfig {
    /// Empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter for a path-keyed value
    #[must_use]
    pub fn with(mut self, path: &str, key: &str, value: impl Into<Value>) -> Self {
        self.set(path, key, value);
        self
    }

    /// Builder-style setter for a global value
    #[must_use]
    pub fn with_global(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.global.insert(key.to_string(), value.into());
        self
    }

    /// Set `key` in the block for `path`
    pub fn set(&mut self, path: &str, key: &str, value: impl Into<Value>) {
        self.paths
            .entry(normalize_section(path))
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Block configured for exactly `path`, if any
    #[must_use]
    pub fn section(&self, path: &str) -> Option<&ConfigBlock> {
        self.paths.get(path)
    }

    /// The application-root (`/`) block as a [`Config`]
    #[must_use]
    pub fn root(&self) -> Config {
        let mut config = Config::new(self.global.clone());
        if let Some(root) = self.paths.get("/") {
            config.merge(root);
        }
        config
    }

    /// Overlay another configuration; sections and keys from `other` win
    pub fn merge(&mut self, other: &AppConfig) {
        for (k, v) in &other.global {
            self.global.insert(k.clone(), v.clone());
        }
        for (path, block) in &other.paths {
            let target = self.paths.entry(path.clone()).or_default();
            for (k, v) in block {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    /// Parse a YAML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a mapping of sections to
    /// mappings, or a section name is neither `global` nor a `/`-path.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let doc: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(source).context("config is not a YAML mapping of sections")?;
        let mut config = AppConfig::new();
        for (section, raw) in doc {
            let json = serde_json::to_value(&raw)
                .with_context(|| format!("section '{section}' is not representable as JSON"))?;
            let mut block = ConfigBlock::new();
            match json {
                Value::Object(map) => {
                    for (k, v) in map {
                        flatten_into(&k, v, &mut block);
                    }
                }
                Value::Null => {}
                other => {
                    return Err(anyhow!(
                        "section '{section}' must be a mapping, found {other}"
                    ))
                }
            }
            if section == "global" {
                config.global.extend(block);
            } else if section.starts_with('/') {
                config
                    .paths
                    .entry(normalize_section(&section))
                    .or_default()
                    .extend(block);
            } else {
                return Err(anyhow!(
                    "unknown config section '{section}': expected 'global' or a path starting with '/'"
                ));
            }
        }
        Ok(config)
    }

    /// Load a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&source).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn flatten_into(prefix: &str, value: Value, out: &mut ConfigBlock) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(&format!("{prefix}.{k}"), v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other);
        }
    }
}
