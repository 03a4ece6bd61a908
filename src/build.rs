//! The compiler seam
//!
//! Parsing schema source into descriptors happens outside this crate. A
//! [`Builder`] receives the fetched files and returns an image plus any
//! diagnostics it found.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::Context;
use crate::error::Result;
use crate::fetch::FetchResult;
use crate::image::Image;

/// A positioned diagnostic from compiling schema source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnnotation {
    /// Root-relative path as the builder saw it, or a display path once resolved
    pub path: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    /// Short machine-readable category, e.g. `COMPILE`
    pub kind: String,
    pub message: String,
}

impl FileAnnotation {
    pub fn new(path: impl Into<String>, line: u32, column: u32, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            start_line: line,
            start_column: column,
            end_line: line,
            end_column: column,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// `path:line:column:message`, the form most editors can jump to
impl fmt::Display for FileAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<input>" } else { &self.path };
        if self.start_line == 0 {
            write!(f, "{}:{}", path, self.message)
        } else {
            write!(f, "{}:{}:{}:{}", path, self.start_line, self.start_column, self.message)
        }
    }
}

/// Options passed through to the builder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Root-relative paths the caller asked for; empty means all
    pub target_paths: Vec<String>,
    pub include_source_info: bool,
}

/// What a builder produced
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Every compiled file, imports included. Ignored when `annotations` is non-empty.
    pub image: Image,
    pub annotations: Vec<FileAnnotation>,
}

/// Compiles fetched schema source. Must check `ctx` at file granularity.
pub trait Builder: Send + Sync {
    fn build(&self, ctx: &Context, files: &FetchResult, options: &BuildOptions) -> Result<BuildOutput>;
}
