//! Schema images
//!
//! An [`Image`] is an import-closed set of compiled file descriptors. On the
//! wire it is a `google.protobuf.FileDescriptorSet` (field 1, repeated files)
//! whose files may carry one private extension field:
//!
//! ```text
//! message Image          { repeated ImageFile file = 1; }
//! message ImageFile      { /* FileDescriptorProto fields */ ImageFileExtension ext = 8042; }
//! message ImageFileExtension { optional bool is_import = 1; }
//! ```
//!
//! The extension is provenance: only images produced by this crate's build
//! pipeline carry it, and only with it can imports be told apart from targets.
//! Stripping it yields a plain descriptor set for unrelated tooling.
//!
//! Only the file-level fields the image operations read are decoded. The
//! rest of each `FileDescriptorProto` is carried byte-for-byte, so images
//! survive a decode and encode unchanged. [`ImageFile::descriptor`] gives the
//! fully typed view.

pub mod codec;
pub mod graph;
pub mod wire;
pub mod writer;

pub use codec::{decode_image, encode_image};
pub use graph::ImportGraph;
pub use wire::RawField;
pub use writer::ImageWriter;

use prost::bytes::{Buf, BufMut};
use prost::encoding::{int32, message, string, DecodeContext, WireType};
use prost::{DecodeError, Message};
use prost_types::FileDescriptorProto;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, SchemaError};

/// Field number of the private extension on each file
pub const IMAGE_EXTENSION_FIELD: u32 = 8042;

/// A compiled schema image
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    #[prost(message, repeated, tag = "1")]
    pub file: Vec<ImageFile>,
}

/// One compiled file: a `FileDescriptorProto` plus the provenance extension.
///
/// Fields the image operations need are decoded; every other descriptor
/// field stays in [`ImageFile::descriptor_fields`] exactly as encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependency: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_code_info: Option<SourceCodeInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub public_dependency: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub weak_dependency: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syntax: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_extension: Option<ImageFileExtension>,
    /// Messages, enums, services, options, and anything newer
    #[serde(with = "wire::base64_fields", skip_serializing_if = "Vec::is_empty")]
    pub descriptor_fields: Vec<RawField>,
}

impl prost::Message for ImageFile {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        if let Some(v) = &self.name {
            string::encode(1, v, buf);
        }
        if let Some(v) = &self.package {
            string::encode(2, v, buf);
        }
        string::encode_repeated(3, &self.dependency, buf);
        wire::put_fields(&self.descriptor_fields, 4..9, buf);
        if let Some(v) = &self.source_code_info {
            message::encode(9, v, buf);
        }
        int32::encode_repeated(10, &self.public_dependency, buf);
        int32::encode_repeated(11, &self.weak_dependency, buf);
        if let Some(v) = &self.syntax {
            string::encode(12, v, buf);
        }
        wire::put_fields(&self.descriptor_fields, 13..IMAGE_EXTENSION_FIELD, buf);
        if let Some(v) = &self.image_extension {
            message::encode(IMAGE_EXTENSION_FIELD, v, buf);
        }
        wire::put_fields(&self.descriptor_fields, IMAGE_EXTENSION_FIELD + 1..u32::MAX, buf);
    }

    fn merge_field<B>(&mut self, tag: u32, wire_type: WireType, buf: &mut B, ctx: DecodeContext) -> std::result::Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        match tag {
            1 => string::merge(wire_type, self.name.get_or_insert_with(String::new), buf, ctx),
            2 => string::merge(wire_type, self.package.get_or_insert_with(String::new), buf, ctx),
            3 => string::merge_repeated(wire_type, &mut self.dependency, buf, ctx),
            9 => message::merge(wire_type, self.source_code_info.get_or_insert_with(SourceCodeInfo::default), buf, ctx),
            10 => int32::merge_repeated(wire_type, &mut self.public_dependency, buf, ctx),
            11 => int32::merge_repeated(wire_type, &mut self.weak_dependency, buf, ctx),
            12 => string::merge(wire_type, self.syntax.get_or_insert_with(String::new), buf, ctx),
            IMAGE_EXTENSION_FIELD => message::merge(
                wire_type,
                self.image_extension.get_or_insert_with(ImageFileExtension::default),
                buf,
                ctx,
            ),
            _ => {
                self.descriptor_fields.push(RawField::read(tag, wire_type, buf)?);
                Ok(())
            }
        }
    }

    fn encoded_len(&self) -> usize {
        self.name.as_ref().map_or(0, |v| string::encoded_len(1, v))
            + self.package.as_ref().map_or(0, |v| string::encoded_len(2, v))
            + string::encoded_len_repeated(3, &self.dependency)
            + self.source_code_info.as_ref().map_or(0, |v| message::encoded_len(9, v))
            + int32::encoded_len_repeated(10, &self.public_dependency)
            + int32::encoded_len_repeated(11, &self.weak_dependency)
            + self.syntax.as_ref().map_or(0, |v| string::encoded_len(12, v))
            + self
                .image_extension
                .as_ref()
                .map_or(0, |v| message::encoded_len(IMAGE_EXTENSION_FIELD, v))
            + self.descriptor_fields.iter().map(|f| f.bytes.len()).sum::<usize>()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Provenance stamped by the build pipeline
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageFileExtension {
    #[prost(bool, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_import: Option<bool>,
}

/// `SourceCodeInfo`
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceCodeInfo {
    #[prost(message, repeated, tag = "1")]
    pub location: Vec<SourceLocation>,
}

/// `SourceCodeInfo.Location`
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceLocation {
    #[prost(int32, repeated, tag = "1")]
    pub path: Vec<i32>,
    #[prost(int32, repeated, tag = "2")]
    pub span: Vec<i32>,
    #[prost(string, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leading_comments: Option<String>,
    #[prost(string, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_comments: Option<String>,
    #[prost(string, repeated, tag = "6")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub leading_detached_comments: Vec<String>,
}

impl ImageFile {
    /// A file with only a name and its imports set
    pub fn new(name: impl Into<String>, dependency: Vec<String>) -> Self {
        Self {
            name: Some(name.into()),
            dependency,
            ..Default::default()
        }
    }

    /// Take a compiled descriptor as-is
    pub fn from_descriptor(descriptor: &FileDescriptorProto) -> Result<Self> {
        Ok(Self::decode(descriptor.encode_to_vec().as_slice())?)
    }

    /// The full descriptor, without the provenance extension
    pub fn descriptor(&self) -> Result<FileDescriptorProto> {
        Ok(FileDescriptorProto::decode(self.encode_to_vec().as_slice())?)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Whether this file carries the provenance extension
    pub fn has_provenance(&self) -> bool {
        self.image_extension.is_some()
    }

    /// Whether provenance marks this file as an import
    pub fn is_import(&self) -> bool {
        self.image_extension
            .as_ref()
            .and_then(|e| e.is_import)
            .unwrap_or(false)
    }

    fn mark(&mut self, is_import: bool) {
        self.image_extension = Some(ImageFileExtension {
            is_import: Some(is_import),
        });
    }
}

// =============================================================================
// Validation and projection
// =============================================================================

/// A file name must be relative, normalized, and use `/` separators
fn validate_file_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("image contains a file with an empty name".to_string());
    }
    if name.starts_with('/') || name.contains('\\') {
        return Err(format!("file name {:?} must be a relative path using '/'", name));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(format!("file name {:?} is not normalized", name));
    }
    Ok(())
}

impl Image {
    pub fn new(file: Vec<ImageFile>) -> Self {
        Self { file }
    }

    /// File names in image order
    pub fn file_names(&self) -> Vec<&str> {
        self.file.iter().map(ImageFile::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ImageFile> {
        self.file.iter().find(|f| f.name() == name)
    }

    /// True when every file carries provenance from this crate's build pipeline
    pub fn has_provenance(&self) -> bool {
        !self.file.is_empty() && self.file.iter().all(ImageFile::has_provenance)
    }

    /// A target-only projection: provenance everywhere, no file marked as import.
    /// Such images may reference imports they do not contain.
    pub fn imports_excluded(&self) -> bool {
        self.has_provenance() && !self.file.iter().any(ImageFile::is_import)
    }

    /// Structural validation: names, duplicates, dependency indices, dangling imports
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.file.len());
        for file in &self.file {
            validate_file_name(file.name()).map_err(SchemaError::Validation)?;
            if !seen.insert(file.name()) {
                return Err(SchemaError::Validation(format!("duplicate file {}", file.name())));
            }
        }

        let allow_missing = self.imports_excluded();
        for file in &self.file {
            let mut deps: HashSet<&str> = HashSet::with_capacity(file.dependency.len());
            for dep in &file.dependency {
                if !deps.insert(dep.as_str()) {
                    return Err(SchemaError::Validation(format!(
                        "{} imports {} more than once",
                        file.name(),
                        dep
                    )));
                }
                if dep == file.name() {
                    return Err(SchemaError::Validation(format!("{} imports itself", file.name())));
                }
                if !allow_missing && !seen.contains(dep.as_str()) {
                    return Err(SchemaError::Validation(format!(
                        "{} imports {}, which is not in the image",
                        file.name(),
                        dep
                    )));
                }
            }
            let len = file.dependency.len() as i32;
            for index in file.public_dependency.iter().chain(&file.weak_dependency) {
                if *index < 0 || *index >= len {
                    return Err(SchemaError::Validation(format!(
                        "{} has dependency index {} out of range",
                        file.name(),
                        index
                    )));
                }
            }
        }
        Ok(())
    }

    /// Keep `targets` (and, if `include_imports`, their transitive imports),
    /// preserving image order and stamping provenance on every kept file.
    pub fn select_and_mark(&self, targets: &HashSet<String>, include_imports: bool) -> Image {
        let closure = if include_imports {
            ImportGraph::new(self).transitive_imports(targets.iter().map(String::as_str))
        } else {
            HashSet::new()
        };
        let file = self
            .file
            .iter()
            .filter_map(|f| {
                let is_target = targets.contains(f.name());
                if !is_target && !closure.contains(f.name()) {
                    return None;
                }
                let mut kept = f.clone();
                kept.mark(!is_target);
                Some(kept)
            })
            .collect();
        Image { file }
    }

    /// Keep `targets` and everything they transitively import, unchanged.
    /// Used for images without provenance, where imports cannot be marked.
    pub fn select_closed(&self, targets: &HashSet<String>) -> Image {
        let closure = ImportGraph::new(self).transitive_imports(targets.iter().map(String::as_str));
        let file = self
            .file
            .iter()
            .filter(|f| targets.contains(f.name()) || closure.contains(f.name()))
            .cloned()
            .collect();
        Image { file }
    }

    /// Names of files not marked as imports
    pub fn target_names(&self) -> HashSet<String> {
        self.file
            .iter()
            .filter(|f| !f.is_import())
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Drop source code info from every file
    pub fn strip_source_info(&mut self) {
        for file in &mut self.file {
            file.source_code_info = None;
        }
    }

    /// A plain descriptor set: the private extension removed from every file
    pub fn without_extensions(&self) -> Image {
        let mut image = self.clone();
        for file in &mut image.file {
            file.image_extension = None;
        }
        image
    }

}
