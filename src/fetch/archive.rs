//! Tarball extraction

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::context::Context;
use crate::error::{Result, SchemaError};
use crate::reference::ArchiveKind;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decide the archive kind: explicit option, then content type, then URL
/// extension, then the gzip magic bytes of the body
pub(crate) fn detect_kind(
    explicit: Option<ArchiveKind>,
    content_type: Option<&str>,
    url: &str,
    body: &[u8],
) -> ArchiveKind {
    if let Some(kind) = explicit {
        return kind;
    }
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("application/x-tar") => return ArchiveKind::Tar,
        Some("application/gzip") | Some("application/x-gzip") | Some("application/x-gtar") => {
            return ArchiveKind::TarGz
        }
        _ => {}
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        return ArchiveKind::TarGz;
    }
    if path.ends_with(".tar") {
        return ArchiveKind::Tar;
    }
    if body.starts_with(&GZIP_MAGIC) {
        ArchiveKind::TarGz
    } else {
        ArchiveKind::Tar
    }
}

/// Drop the first `strip` components; `None` when nothing is left or the
/// path tries to leave the destination
fn stripped(path: &Path, strip: u32) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut skipped = 0;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if skipped < strip {
                    skipped += 1;
                } else {
                    out.push(part);
                }
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Extract regular files and directories from `body` into `dest`
pub(crate) fn extract(ctx: &Context, body: &[u8], kind: ArchiveKind, dest: &Path, strip_components: u32) -> Result<usize> {
    let reader: Box<dyn Read + '_> = match kind {
        ArchiveKind::Tar => Box::new(body),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(body)),
    };
    let mut archive = Archive::new(reader);
    let mut extracted = 0;

    for entry in archive.entries()? {
        ctx.check()?;
        let mut entry = entry?;
        let header_path = entry.path()?.into_owned();
        let entry_type = entry.header().entry_type();
        if header_path.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))) {
            return Err(SchemaError::Validation(format!(
                "archive entry {} escapes the destination",
                header_path.display()
            )));
        }
        let Some(rel) = stripped(&header_path, strip_components) else {
            continue;
        };
        let target = dest.join(&rel);
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;
            extracted += 1;
        }
    }

    tracing::debug!(dest = %dest.display(), files = extracted, "extracted archive");
    Ok(extracted)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    /// Build a tarball from (path, content) pairs
    pub(crate) fn tarball(files: &[(&str, &[u8])], gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        let raw = builder.into_inner().unwrap();
        if !gzip {
            return raw;
        }
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &raw).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect_kind_precedence() {
        let gz = [0x1f, 0x8b, 0x08];
        assert_eq!(detect_kind(Some(ArchiveKind::Tar), Some("application/gzip"), "a.tgz", &gz), ArchiveKind::Tar);
        assert_eq!(detect_kind(None, Some("application/x-tar"), "a.tgz", &gz), ArchiveKind::Tar);
        assert_eq!(detect_kind(None, Some("application/octet-stream"), "a.tar.gz?x=1", b""), ArchiveKind::TarGz);
        assert_eq!(detect_kind(None, None, "https://h/download", &gz), ArchiveKind::TarGz);
        assert_eq!(detect_kind(None, None, "https://h/download", b"plain"), ArchiveKind::Tar);
    }

    #[test]
    fn test_extract_strip_components() {
        let dir = tempdir().unwrap();
        let body = tarball(&[("repo-main/proto/a.proto", b"a"), ("repo-main/README", b"r")], true);
        let count = extract(&Context::background(), &body, ArchiveKind::TarGz, dir.path(), 1).unwrap();
        assert_eq!(count, 2);
        assert_eq!(std::fs::read(dir.path().join("proto/a.proto")).unwrap(), b"a");
    }

    #[test]
    fn test_extract_cancelled() {
        let dir = tempdir().unwrap();
        let body = tarball(&[("a.proto", b"a")], false);
        let ctx = Context::background();
        ctx.cancel();
        let err = extract(&ctx, &body, ArchiveKind::Tar, dir.path(), 0).unwrap_err();
        assert!(err.is_cancelled());
    }
}
