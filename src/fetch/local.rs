//! Walking a checkout into a file set

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use walkdir::WalkDir;

use super::{slash_path, Checkout, FetchResult, FetchedFile};
use crate::config::Config;
use crate::context::Context;
use crate::error::{Result, SchemaError};

/// Extension of schema source files
const SOURCE_EXTENSION: &str = "proto";

fn matcher(base: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(base);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| SchemaError::Validation(format!("pattern {:?}: {}", pattern, e)))?;
    }
    builder
        .build()
        .map_err(|e| SchemaError::Validation(e.to_string()))
}

/// Walk `checkout` into a [`FetchResult`] using the config's roots, includes
/// and excludes. Files come back sorted by root, then by path.
pub fn walk(ctx: &Context, checkout: &Checkout, config: &Config) -> Result<FetchResult> {
    ctx.check()?;
    let base = checkout.base.as_path();

    if base.is_file() {
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SchemaError::NotFound(base.display().to_string()))?;
        let content = std::fs::read(base)?;
        let display_root = checkout.display_root.as_deref().map(|shown| {
            Path::new(shown)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        });
        return Ok(FetchResult {
            display_root,
            files: vec![FetchedFile::new(name.clone(), name, content)],
        });
    }
    if !base.is_dir() {
        return Err(SchemaError::NotFound(base.display().to_string()));
    }

    let excludes = matcher(base, &config.build.excludes)?;
    let includes = matcher(base, &config.build.includes)?;
    let filter_includes = !config.build.includes.is_empty();

    let mut files: Vec<FetchedFile> = Vec::new();
    let mut owners: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for root in &config.build.roots {
        let root_dir = if root.as_os_str() == "." { base.to_path_buf() } else { base.join(root) };
        if !root_dir.is_dir() {
            return Err(SchemaError::NotFound(format!("root {} in {}", root.display(), base.display())));
        }

        let walker = WalkDir::new(&root_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
                !excludes
                    .matched_path_or_any_parents(rel, entry.file_type().is_dir())
                    .is_ignore()
            });

        for entry in walker {
            ctx.check()?;
            let entry = entry.map_err(|e| SchemaError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) {
                continue;
            }
            let rel_base = path.strip_prefix(base).unwrap_or(path);
            if filter_includes && !includes.matched_path_or_any_parents(rel_base, false).is_ignore() {
                continue;
            }
            let rel_root = path.strip_prefix(&root_dir).unwrap_or(path);
            let root_relative = slash_path(rel_root);
            let real_path = slash_path(rel_base);

            if let Some(previous) = owners.insert(root_relative.clone(), real_path.clone()) {
                return Err(SchemaError::Validation(format!(
                    "{} and {} both resolve to {}",
                    previous, real_path, root_relative
                )));
            }
            let content = std::fs::read(path)?;
            files.push(FetchedFile::new(root_relative, real_path, content));
        }
    }

    tracing::debug!(base = %base.display(), files = files.len(), "walked source files");
    Ok(FetchResult {
        display_root: checkout.display_root.clone(),
        files,
    })
}
