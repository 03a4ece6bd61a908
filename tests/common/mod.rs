//! Shared fixtures for integration tests
//!
//! `LineBuilder` stands in for a real compiler. It understands just enough of
//! the source format for these tests:
//!
//! ```text
//! package acme;
//! import "b.proto";
//! message Name {}
//! // error: text     (reported as a diagnostic on that line)
//! ```

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;

use prost_types::source_code_info::Location;
use prost_types::{DescriptorProto, FileDescriptorProto, SourceCodeInfo};
use proto_env::{BuildOptions, BuildOutput, Builder, Context, FetchResult, FileAnnotation, Image, ImageFile, Result};

pub struct LineBuilder;

fn compile(path: &str, text: &str, known: &HashSet<&str>, include_source_info: bool) -> (FileDescriptorProto, Vec<FileAnnotation>) {
    let mut file = FileDescriptorProto {
        name: Some(path.to_string()),
        syntax: Some("proto3".to_string()),
        ..Default::default()
    };
    let mut annotations = Vec::new();
    let mut locations = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line_no = index as u32 + 1;
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("package ") {
            file.package = Some(rest.trim_end_matches(';').trim().to_string());
        } else if let Some(rest) = trimmed.strip_prefix("import ") {
            let dep = rest.trim_end_matches(';').trim().trim_matches('"').to_string();
            if !known.contains(dep.as_str()) {
                annotations.push(FileAnnotation {
                    path: path.to_string(),
                    start_line: line_no,
                    start_column: 1,
                    end_line: line_no,
                    end_column: trimmed.len() as u32 + 1,
                    kind: "COMPILE".to_string(),
                    message: format!("import {:?} was not found", dep),
                });
            }
            file.dependency.push(dep);
        } else if let Some(rest) = trimmed.strip_prefix("message ") {
            let name = rest.split_whitespace().next().unwrap_or_default().to_string();
            locations.push(Location {
                path: vec![4, file.message_type.len() as i32],
                span: vec![index as i32, 0, trimmed.len() as i32],
                ..Default::default()
            });
            file.message_type.push(DescriptorProto {
                name: Some(name),
                ..Default::default()
            });
        } else if let Some(rest) = trimmed.strip_prefix("// error:") {
            annotations.push(FileAnnotation::new(path, line_no, 1, "COMPILE", rest.trim()));
        }
    }

    if include_source_info {
        file.source_code_info = Some(SourceCodeInfo { location: locations });
    }
    (file, annotations)
}

impl Builder for LineBuilder {
    fn build(&self, ctx: &Context, files: &FetchResult, options: &BuildOptions) -> Result<BuildOutput> {
        let known: HashSet<&str> = files.files.iter().map(|f| f.path.as_str()).collect();
        let mut image = Image::default();
        let mut annotations = Vec::new();
        for fetched in &files.files {
            ctx.check()?;
            let text = String::from_utf8_lossy(&fetched.content);
            let (descriptor, found) = compile(&fetched.path, &text, &known, options.include_source_info);
            image.file.push(ImageFile::from_descriptor(&descriptor)?);
            annotations.extend(found);
        }
        Ok(BuildOutput { image, annotations })
    }
}

/// Cancels the context once `after` files are compiled, then keeps going
/// the way a compiler that checks cancellation per file would
pub struct CancellingBuilder {
    pub after: usize,
}

impl Builder for CancellingBuilder {
    fn build(&self, ctx: &Context, files: &FetchResult, options: &BuildOptions) -> Result<BuildOutput> {
        let known: HashSet<&str> = files.files.iter().map(|f| f.path.as_str()).collect();
        let mut image = Image::default();
        for (index, fetched) in files.files.iter().enumerate() {
            if index == self.after {
                ctx.cancel();
            }
            ctx.check()?;
            let text = String::from_utf8_lossy(&fetched.content);
            let (descriptor, _) = compile(&fetched.path, &text, &known, options.include_source_info);
            image.file.push(ImageFile::from_descriptor(&descriptor)?);
        }
        Ok(BuildOutput { image, annotations: Vec::new() })
    }
}

/// Entries left under `dir`
pub fn entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

/// Write `files` (relative path, content) under `dir`
pub fn write_tree(dir: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

/// Build a gzipped tarball from (path, content) pairs
pub fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    let raw = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &raw).unwrap();
    encoder.finish().unwrap()
}

/// Commit `files` into a fresh repository at `dir`
pub fn git_repo(dir: &Path, files: &[(&str, &str)]) {
    write_tree(dir, files);
    let repo = git2::Repository::init(dir).unwrap();
    let sig = git2::Signature::new("Test", "test@example.com", &git2::Time::new(0, 0)).unwrap();
    let mut index = repo.index().unwrap();
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
}

/// Names of the files in an image, sorted
pub fn sorted_names(image: &Image) -> Vec<String> {
    let mut names: Vec<String> = image.file_names().into_iter().map(str::to_string).collect();
    names.sort();
    names
}
