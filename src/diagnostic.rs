//! Display paths for diagnostics
//!
//! Builders report root-relative paths. Users want the path they typed (for
//! local inputs) or the path inside the remote checkout.

use std::collections::HashMap;

use crate::build::FileAnnotation;
use crate::fetch::FetchResult;

/// Maps a builder-internal path to a display path
pub trait PathResolver {
    fn resolve(&self, path: &str) -> String;
}

/// Resolver backed by a fixed path table; unknown paths map to themselves
#[derive(Debug, Clone, Default)]
pub struct MapPathResolver {
    paths: HashMap<String, String>,
}

impl MapPathResolver {
    pub fn new(paths: HashMap<String, String>) -> Self {
        Self { paths }
    }

    /// Table from each fetched file's path to its display path
    pub fn from_fetch(result: &FetchResult) -> Self {
        let paths = result
            .files
            .iter()
            .map(|f| (f.path.clone(), result.display_path(f)))
            .collect();
        Self { paths }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl PathResolver for MapPathResolver {
    fn resolve(&self, path: &str) -> String {
        self.paths
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }
}

/// Copy `annotations` with each path rewritten through `resolver`.
/// Order and positions are preserved; without a resolver paths are unchanged.
pub fn fix_annotation_paths(resolver: Option<&dyn PathResolver>, annotations: &[FileAnnotation]) -> Vec<FileAnnotation> {
    annotations
        .iter()
        .map(|annotation| match resolver {
            Some(resolver) if !annotation.path.is_empty() => FileAnnotation {
                path: resolver.resolve(&annotation.path),
                ..annotation.clone()
            },
            _ => annotation.clone(),
        })
        .collect()
}
