//! Configuration for building schema inputs
//!
//! Loaded from (first match wins):
//! - An inline override: TOML or JSON text, or a path to a `.toml`/`.json` file
//! - A `proto-env.toml` / `.proto-env.toml` found by searching upward from the input
//! - Built-in defaults (no rules, default version)
//!
//! ## Example config file (proto-env.toml):
//! ```toml
//! version = "v1beta1"
//!
//! [build]
//! roots = ["proto", "vendor/googleapis"]
//! excludes = ["proto/internal/legacy"]
//!
//! [lint]
//! use = ["DEFAULT"]
//!
//! [breaking]
//! use = ["FILE"]
//! ```
//!
//! The `[lint]` and `[breaking]` tables are carried through untouched for
//! downstream tooling.

mod resolver;

pub use resolver::{ConfigResolver, ConfigSource};

use config_crate::{File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::context::Context;
use crate::error::{Result, SchemaError};

/// File names searched for during discovery, in order
pub const CONFIG_FILE_NAMES: &[&str] = &["proto-env.toml", ".proto-env.toml"];

/// Version marker written when none is given
pub const DEFAULT_VERSION: &str = "v1beta1";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version marker
    #[serde(default = "default_version")]
    pub version: String,

    /// Build settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Lint rule settings, passed through untouched
    #[serde(default)]
    pub lint: BTreeMap<String, serde_json::Value>,

    /// Breaking-change rule settings, passed through untouched
    #[serde(default)]
    pub breaking: BTreeMap<String, serde_json::Value>,
}

/// Which files under the input make up the schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Directories, relative to the input, that file paths are resolved against
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,

    /// Gitignore-style patterns; when non-empty only matching files are kept
    #[serde(default)]
    pub includes: Vec<String>,

    /// Gitignore-style patterns for files and directories to skip
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            build: BuildConfig::default(),
            lint: BTreeMap::new(),
            breaking: BTreeMap::new(),
        }
    }
}

/// Normalize a relative path: drop `.` segments, reject `..` and absolute paths
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            _ => return None,
        }
    }
    Some(out)
}

impl Config {
    /// Parse configuration text in the given format
    pub fn from_text(text: &str, format: FileFormat) -> Result<Self> {
        let built = config_crate::Config::builder()
            .add_source(File::from_str(text, format))
            .build()
            .map_err(|e| SchemaError::ConfigParse(e.to_string()))?;
        let config: Config = built
            .try_deserialize()
            .map_err(|e| SchemaError::ConfigParse(e.to_string()))?;
        config.validated()
    }

    /// Load configuration from a file; `.json` files are JSON, everything else TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => FileFormat::Json,
            _ => FileFormat::Toml,
        };
        let built = config_crate::Config::builder()
            .add_source(File::from(path).format(format).required(true))
            .build()
            .map_err(|e| SchemaError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        let config: Config = built
            .try_deserialize()
            .map_err(|e| SchemaError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        config.validated()
    }

    /// Check roots and excludes, normalizing them in place
    pub fn validated(mut self) -> Result<Self> {
        if self.version.trim().is_empty() {
            self.version = default_version();
        }
        if self.build.roots.is_empty() {
            self.build.roots = default_roots();
        }

        let mut roots = Vec::with_capacity(self.build.roots.len());
        for root in &self.build.roots {
            let normalized = normalize_relative(root).ok_or_else(|| {
                SchemaError::Validation(format!("root {} must be a relative path inside the input", root.display()))
            })?;
            if roots.contains(&normalized) {
                return Err(SchemaError::Validation(format!("root {} is listed more than once", root.display())));
            }
            roots.push(normalized);
        }
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(SchemaError::Validation(format!(
                        "roots {} and {} overlap",
                        display_root(a),
                        display_root(b)
                    )));
                }
            }
        }

        for exclude in &self.build.excludes {
            let plain = exclude.trim_end_matches('/');
            let has_glob = plain.contains(['*', '?', '[']);
            if has_glob {
                continue;
            }
            let normalized = normalize_relative(Path::new(plain)).ok_or_else(|| {
                SchemaError::Validation(format!("exclude {} must be a relative path", exclude))
            })?;
            if !roots.iter().any(|r| normalized.starts_with(r)) {
                return Err(SchemaError::Validation(format!("exclude {} is not contained in any root", exclude)));
            }
            if roots.contains(&normalized) {
                return Err(SchemaError::Validation(format!("exclude {} is equal to a root", exclude)));
            }
        }

        self.build.roots = roots
            .into_iter()
            .map(|r| if r.as_os_str().is_empty() { PathBuf::from(".") } else { r })
            .collect();
        Ok(self)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SchemaError::ConfigParse(e.to_string()))
    }
}

fn display_root(root: &Path) -> String {
    if root.as_os_str().is_empty() {
        ".".to_string()
    } else {
        root.display().to_string()
    }
}

/// Search upward from `start` for a config file, stopping after `stop` if given
pub fn discover(start: &Path, stop: Option<&Path>) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_FILE_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        if stop.is_some_and(|s| s == current) {
            return None;
        }
        dir = current.parent();
    }
    None
}

/// Capability that turns a resolved [`ConfigSource`] into a [`Config`]
pub trait ConfigProvider: Send + Sync {
    fn get_config(&self, ctx: &Context, source: &ConfigSource) -> Result<Config>;
}

/// Reads TOML/JSON files and inline text through the `config` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct FileConfigProvider;

impl ConfigProvider for FileConfigProvider {
    fn get_config(&self, ctx: &Context, source: &ConfigSource) -> Result<Config> {
        ctx.check()?;
        match source {
            ConfigSource::Default => Ok(Config::default()),
            ConfigSource::File { path, .. } => Config::from_file(path),
            ConfigSource::Override(text) => {
                let trimmed = text.trim();
                let as_path = Path::new(trimmed);
                let is_file_ref = matches!(
                    as_path.extension().and_then(|e| e.to_str()),
                    Some("toml") | Some("json")
                ) && !trimmed.contains('\n');
                if is_file_ref {
                    if !as_path.is_file() {
                        return Err(SchemaError::NotFound(format!("config file {}", trimmed)));
                    }
                    return Config::from_file(as_path);
                }
                let format = if trimmed.starts_with('{') {
                    FileFormat::Json
                } else {
                    FileFormat::Toml
                };
                Config::from_text(trimmed, format)
            }
        }
    }
}
