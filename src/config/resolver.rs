//! Cached, single-flight config resolution
//!
//! Concurrent callers asking for the same key share one load. The cache key is
//! the override text, the discovered file's identity (path, size, mtime), or
//! the built-in default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{discover, Config, ConfigProvider, FileConfigProvider};
use crate::context::Context;
use crate::error::{Result, SchemaError};

/// Where a config comes from, once resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigSource {
    /// Inline override text (or a path given as the override)
    Override(String),
    /// A discovered config file
    File {
        path: PathBuf,
        len: u64,
        modified: Option<SystemTime>,
    },
    /// Nothing found: built-in defaults
    Default,
}

impl ConfigSource {
    fn for_file(path: PathBuf) -> Self {
        let meta = std::fs::metadata(&path).ok();
        ConfigSource::File {
            len: meta.as_ref().map(|m| m.len()).unwrap_or_default(),
            modified: meta.and_then(|m| m.modified().ok()),
            path,
        }
    }
}

/// Failure shared between every waiter on one load
#[derive(Debug, Clone)]
enum CachedFailure {
    Parse(String),
    Validation(String),
    NotFound(String),
    Cancelled(String),
}

impl From<CachedFailure> for SchemaError {
    fn from(failure: CachedFailure) -> Self {
        match failure {
            CachedFailure::Parse(msg) => SchemaError::ConfigParse(msg),
            CachedFailure::Validation(msg) => SchemaError::Validation(msg),
            CachedFailure::NotFound(msg) => SchemaError::NotFound(msg),
            CachedFailure::Cancelled(msg) => SchemaError::Cancelled(msg),
        }
    }
}

type Slot = Arc<OnceLock<std::result::Result<Arc<Config>, CachedFailure>>>;

/// Resolves configuration, caching per source
pub struct ConfigResolver {
    provider: Arc<dyn ConfigProvider>,
    slots: Mutex<HashMap<ConfigSource, Slot>>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(Arc::new(FileConfigProvider))
    }
}

impl ConfigResolver {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Decide which source applies for a search root and optional override
    pub fn source_for(search_root: &Path, stop: Option<&Path>, config_override: Option<&str>) -> ConfigSource {
        if let Some(text) = config_override.filter(|t| !t.trim().is_empty()) {
            return ConfigSource::Override(text.to_string());
        }
        match discover(search_root, stop) {
            Some(path) => ConfigSource::for_file(path),
            None => ConfigSource::Default,
        }
    }

    /// Get the config for `search_root`, searching no higher than `stop`
    pub fn get_config(
        &self,
        ctx: &Context,
        search_root: &Path,
        stop: Option<&Path>,
        config_override: Option<&str>,
    ) -> Result<Arc<Config>> {
        ctx.check()?;
        let source = Self::source_for(search_root, stop, config_override);
        self.resolve(ctx, source)
    }

    /// Load (or join the in-flight load of) a resolved source. A caller that
    /// joined a load cancelled by someone else's context starts a fresh load
    /// under its own.
    pub fn resolve(&self, ctx: &Context, source: ConfigSource) -> Result<Arc<Config>> {
        loop {
            ctx.check()?;
            let slot = {
                let mut slots = self.slots.lock();
                Arc::clone(slots.entry(source.clone()).or_default())
            };

            let mut led = false;
            let outcome = slot.get_or_init(|| {
                led = true;
                tracing::debug!(source = ?source, "loading config");
                match self.provider.get_config(ctx, &source) {
                    Ok(config) => Ok(Arc::new(config)),
                    Err(SchemaError::Validation(msg)) => Err(CachedFailure::Validation(msg)),
                    Err(SchemaError::NotFound(msg)) => Err(CachedFailure::NotFound(msg)),
                    Err(SchemaError::Cancelled(msg)) => Err(CachedFailure::Cancelled(msg)),
                    Err(other) => Err(CachedFailure::Parse(other.to_string())),
                }
            });

            match outcome {
                Ok(config) => return Ok(Arc::clone(config)),
                Err(failure) => {
                    // Keep failures out of the cache so a fixed file is picked up next time.
                    {
                        let mut slots = self.slots.lock();
                        if slots.get(&source).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                            slots.remove(&source);
                        }
                    }
                    if matches!(failure, CachedFailure::Cancelled(_)) && !led && ctx.check().is_ok() {
                        tracing::debug!(source = ?source, "shared config load was cancelled, loading again");
                        continue;
                    }
                    return Err(failure.clone().into());
                }
            }
        }
    }

    /// Number of cached entries
    pub fn cached(&self) -> usize {
        self.slots.lock().len()
    }
}
