//! Writing images to output references
//!
//! Destinations are `-` (stdout), an image file, or a plain path (binary).
//! The whole image is validated and encoded before anything is written, and
//! files are replaced atomically, so a failed write leaves no partial output.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use super::{encode_image, Image};
use crate::context::Context;
use crate::error::{Result, SchemaError};
use crate::reference::{is_null_device, parse_reference, ImageFormat, Reference, StdinFormat};

/// Writes images to output references
#[derive(Debug, Clone, Default)]
pub struct ImageWriter {
    flag: Option<String>,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the flag the output value came from, for error messages
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    /// Write `image` to the destination `value`. `stdout` receives the bytes
    /// when the destination is `-`.
    pub fn write_image(
        &self,
        ctx: &Context,
        stdout: &mut dyn Write,
        value: &str,
        as_file_descriptor_set: bool,
        image: &Image,
    ) -> Result<()> {
        ctx.check()?;
        let parsed = parse_reference(value, self.flag.as_deref())?;
        let (path, format) = match parsed.reference {
            Reference::Stdin {
                format: StdinFormat::Image(format),
            } => (None, format),
            Reference::ImageFile { path, format } => (Some(path), format),
            Reference::LocalPath { path } => (Some(path), ImageFormat::BINARY),
            other => {
                return Err(SchemaError::InvalidReference(format!(
                    "{}{} is {} reference, which cannot be written to",
                    self.flag.as_deref().map(|f| format!("{}: ", f)).unwrap_or_default(),
                    value,
                    other.kind_name()
                )))
            }
        };

        image.validate()?;

        let mut output = if as_file_descriptor_set {
            image.without_extensions()
        } else {
            image.clone()
        };
        if parsed.include_source_info == Some(false) {
            output.strip_source_info();
        }
        if parsed.include_imports == Some(false) && image.has_provenance() {
            let targets = image.target_names();
            output.file.retain(|f| targets.contains(f.name()));
        }

        let bytes = encode_image(&output, format)?;
        ctx.check()?;

        match path {
            None => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Some(path) if is_null_device(&path) => {
                tracing::debug!(bytes = bytes.len(), "discarding image written to null device");
            }
            Some(path) => write_atomic(&path, &bytes)?,
        }
        tracing::debug!(output = %value, files = output.file.len(), "wrote image");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SchemaError::Io(e.error))?;
    Ok(())
}
