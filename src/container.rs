//! Process containers
//!
//! The environment and stdin a read runs against, passed in explicitly so
//! nothing below the CLI touches process-global state.

use std::collections::BTreeMap;
use std::io::Read;

use parking_lot::Mutex;

use crate::error::{Result, SchemaError};

/// Stdin stream handed to a fetcher
pub type StdinStream = Box<dyn Read + Send>;

/// Named environment lookups. An empty value means unset.
pub trait EnvContainer {
    fn env(&self, key: &str) -> String;
}

/// Access to an input stream, handed out at most once
pub trait StdinContainer {
    /// Take the stream. Returns `None` when no stream was attached or it was
    /// already taken.
    fn take_stdin(&self) -> Option<StdinStream>;

    /// Whether a stream is still available
    fn has_stdin(&self) -> bool;
}

/// Environment plus stdin, as needed by the env reader
pub trait EnvStdinContainer: EnvContainer + StdinContainer + Sync {}

impl<T: EnvContainer + StdinContainer + Sync> EnvStdinContainer for T {}

/// Sorted `KEY=VALUE` lines for every non-empty variable
pub fn environ(vars: &BTreeMap<String, String>) -> Vec<String> {
    vars.iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// The real process environment and stdin
pub struct SystemContainer {
    stdin: Mutex<bool>,
}

impl SystemContainer {
    /// Bind to the process. With `attach_stdin` false, `-` references fail.
    pub fn new(attach_stdin: bool) -> Self {
        Self {
            stdin: Mutex::new(attach_stdin),
        }
    }
}

impl EnvContainer for SystemContainer {
    fn env(&self, key: &str) -> String {
        std::env::var(key).unwrap_or_default()
    }
}

impl StdinContainer for SystemContainer {
    fn take_stdin(&self) -> Option<StdinStream> {
        let mut available = self.stdin.lock();
        if !*available {
            return None;
        }
        *available = false;
        Some(Box::new(std::io::stdin()))
    }

    fn has_stdin(&self) -> bool {
        *self.stdin.lock()
    }
}

/// In-memory container, mostly for tests and embedding
pub struct MemoryContainer {
    vars: BTreeMap<String, String>,
    stdin: Mutex<Option<StdinStream>>,
}

impl MemoryContainer {
    pub fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: vars.into_iter().collect(),
            stdin: Mutex::new(None),
        }
    }

    /// Parse `KEY=VALUE` lines. A line without `=` is rejected.
    pub fn from_environ<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vars = BTreeMap::new();
        for line in lines {
            let line = line.as_ref();
            let (key, value) = line.split_once('=').ok_or_else(|| {
                SchemaError::User(format!("environment entry has no '=': {}", line))
            })?;
            vars.insert(key.to_string(), value.to_string());
        }
        Ok(Self {
            vars,
            stdin: Mutex::new(None),
        })
    }

    /// Attach a stdin stream
    pub fn with_stdin(self, stdin: impl Read + Send + 'static) -> Self {
        *self.stdin.lock() = Some(Box::new(stdin));
        self
    }

    pub fn environ(&self) -> Vec<String> {
        environ(&self.vars)
    }
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

impl EnvContainer for MemoryContainer {
    fn env(&self, key: &str) -> String {
        self.vars.get(key).cloned().unwrap_or_default()
    }
}

impl StdinContainer for MemoryContainer {
    fn take_stdin(&self) -> Option<StdinStream> {
        self.stdin.lock().take()
    }

    fn has_stdin(&self) -> bool {
        self.stdin.lock().is_some()
    }
}
