//! Source fetching
//!
//! Every source reference is first materialized as a directory on disk (a
//! [`Checkout`]), then walked into a [`FetchResult`]. Remote checkouts live
//! in a scoped temporary directory that is removed when the checkout drops,
//! on success, error, or cancellation alike.
//!
//! Image references (image files and image stdin) skip all of this: their
//! bytes are read directly. A source tarball on stdin is extracted like an
//! http archive.

mod archive;
pub mod credentials;
mod git;
mod http;
mod local;

pub use credentials::{CredentialSource, EnvKeys};
pub use git::GitFetcher;
pub use http::HttpFetcher;
pub use local::walk;

use archive::extract;

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::checksum::Checksum;
use crate::container::StdinContainer;
use crate::context::Context;
use crate::error::{Result, SchemaError};
use crate::reference::{ImageFormat, Reference, StdinFormat};

// =============================================================================
// Fetch Result
// =============================================================================

/// One fetched file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Path relative to its config root, `/`-separated. This is the name the
    /// builder sees and the name the file gets in the image.
    pub path: String,
    /// Path relative to the fetched base, `/`-separated
    pub real_path: String,
    pub content: Vec<u8>,
    pub checksum: Checksum,
}

impl FetchedFile {
    pub fn new(path: impl Into<String>, real_path: impl Into<String>, content: Vec<u8>) -> Self {
        let checksum = Checksum::from_bytes(&content);
        Self {
            path: path.into(),
            real_path: real_path.into(),
            content,
            checksum,
        }
    }
}

/// Ordered file set rooted at one resolved base
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Prefix for display paths: the input as the user wrote it for local
    /// sources, `None` for remote checkouts
    pub display_root: Option<String>,
    pub files: Vec<FetchedFile>,
}

impl FetchResult {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&FetchedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Digest over every path and content checksum, in order
    pub fn checksum(&self) -> Checksum {
        Checksum::combine(self.files.iter().map(|f| (f.path.as_str(), &f.checksum)))
    }

    /// The path a user should see for `file`
    pub fn display_path(&self, file: &FetchedFile) -> String {
        match self.display_root.as_deref() {
            Some(root) => join_display(root, &file.real_path),
            None => file.real_path.clone(),
        }
    }

    /// Map user-supplied paths onto fetched paths. A path names a file or a
    /// directory, as a root-relative path, a base-relative path, or a display
    /// path. Unmatched paths fail with [`SchemaError::NotFound`] unless
    /// `allow_missing` is set, in which case they are dropped.
    pub fn resolve_paths(&self, requested: &[String], allow_missing: bool) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for raw in requested {
            let wanted = self.strip_display_root(raw);
            let mut matched = false;
            for file in &self.files {
                if path_matches(&file.path, &wanted) || path_matches(&file.real_path, &wanted) {
                    matched = true;
                    if seen.insert(file.path.as_str()) {
                        resolved.push(file.path.clone());
                    }
                }
            }
            if !matched {
                if allow_missing {
                    tracing::warn!(path = %raw, "requested path not found, skipping");
                } else {
                    return Err(SchemaError::NotFound(format!("{}: no schema files found", raw)));
                }
            }
        }
        Ok(resolved)
    }

    fn strip_display_root(&self, raw: &str) -> String {
        let cleaned = clean_path(raw);
        if let Some(root) = self.display_root.as_deref().map(clean_path) {
            if !root.is_empty() {
                if let Some(rest) = cleaned.strip_prefix(&format!("{}/", root)) {
                    return rest.to_string();
                }
                if cleaned == root {
                    return String::new();
                }
            }
        }
        cleaned
    }
}

/// `/`-separated, without `./` segments or trailing slashes
pub(crate) fn clean_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// `candidate` is `wanted` or lies under the directory `wanted`
pub(crate) fn path_matches(candidate: &str, wanted: &str) -> bool {
    wanted.is_empty()
        || candidate == wanted
        || candidate
            .strip_prefix(wanted)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn join_display(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    let root = root.strip_prefix("./").unwrap_or(root);
    if root.is_empty() || root == "." {
        rel.to_string()
    } else {
        format!("{}/{}", root, rel)
    }
}

/// `/`-separated form of a relative path
pub(crate) fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Checkout
// =============================================================================

/// A source materialized on disk
#[derive(Debug)]
pub struct Checkout {
    /// Directory (or single file) to walk
    pub base: PathBuf,
    /// Highest directory config discovery may reach; `None` for local inputs
    pub stop: Option<PathBuf>,
    /// See [`FetchResult::display_root`]
    pub display_root: Option<String>,
    /// Removed on drop
    guard: Option<TempDir>,
}

impl Checkout {
    /// A local file or directory
    pub fn local(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SchemaError::NotFound(path.display().to_string()));
        }
        Ok(Self {
            base: path.to_path_buf(),
            stop: None,
            display_root: Some(path.display().to_string()),
            guard: None,
        })
    }

    /// A directory inside a scoped temporary directory
    pub fn remote(guard: TempDir, base: PathBuf) -> Self {
        Self {
            stop: Some(guard.path().to_path_buf()),
            base,
            display_root: None,
            guard: Some(guard),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.guard.is_some()
    }

    /// Directory config discovery starts from
    pub fn search_root(&self) -> &Path {
        if self.base.is_file() {
            self.base.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."))
        } else {
            &self.base
        }
    }
}

/// Create a scoped temporary directory under `temp_root` (or the system default)
pub(crate) fn scoped_tempdir(prefix: &str, temp_root: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    let dir = match temp_root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}

/// Run `op`, retrying once if it fails with a transient error
pub(crate) fn retry_once<T>(ctx: &Context, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(err) if err.is_transient() => {
            ctx.check()?;
            tracing::warn!(operation = %what, error = %err, "transient failure, retrying once");
            op()
        }
        other => other,
    }
}

/// Drain stdin, checking `ctx` between chunks. Stdin can be taken once.
fn read_stdin<S: StdinContainer + ?Sized>(ctx: &Context, stdin: &S) -> Result<Vec<u8>> {
    let mut stream = stdin
        .take_stdin()
        .ok_or_else(|| SchemaError::User("stdin is not available for reading".to_string()))?;
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        ctx.check()?;
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
    Ok(bytes)
}

// =============================================================================
// Fetcher
// =============================================================================

/// Dispatches references to the source-specific fetchers
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    pub git: GitFetcher,
    pub http: HttpFetcher,
}

impl Fetcher {
    pub fn new(git: GitFetcher, http: HttpFetcher) -> Self {
        Self { git, http }
    }

    /// Materialize a source reference on disk
    pub fn checkout<S: StdinContainer + ?Sized>(
        &self,
        ctx: &Context,
        reference: &Reference,
        stdin: &S,
        credentials: &CredentialSource,
        experimental_git_archive: bool,
    ) -> Result<Checkout> {
        ctx.check()?;
        match reference {
            Reference::LocalPath { path } => Checkout::local(path),
            Reference::GitRepo { .. } => {
                self.git
                    .fetch(ctx, reference, credentials, &self.http, experimental_git_archive)
            }
            Reference::HttpArchive {
                url,
                kind,
                strip_components,
            } => self.http.fetch(ctx, url, *kind, *strip_components, credentials),
            Reference::Stdin {
                format: StdinFormat::Archive { kind, strip_components },
            } => {
                let body = read_stdin(ctx, stdin)?;
                let dir = scoped_tempdir("proto-env-stdin-", self.http.temp_root.as_deref())?;
                let count = extract(ctx, &body, *kind, dir.path(), *strip_components)?;
                tracing::info!(files = count, kind = ?kind, "extracted archive from stdin");
                let base = dir.path().to_path_buf();
                Ok(Checkout::remote(dir, base))
            }
            Reference::ImageFile { .. } | Reference::Stdin { .. } => Err(SchemaError::User(format!(
                "{} reference carries an image, not schema source",
                reference.kind_name()
            ))),
        }
    }

    /// Read the raw bytes of an image reference
    pub fn read_image_bytes<S: StdinContainer + ?Sized>(
        &self,
        ctx: &Context,
        reference: &Reference,
        stdin: &S,
    ) -> Result<(Vec<u8>, ImageFormat)> {
        ctx.check()?;
        match reference {
            Reference::ImageFile { path, format } => {
                let bytes = std::fs::read(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => SchemaError::NotFound(path.display().to_string()),
                    _ => SchemaError::Io(e),
                })?;
                Ok((bytes, *format))
            }
            Reference::Stdin {
                format: StdinFormat::Image(format),
            } => Ok((read_stdin(ctx, stdin)?, *format)),
            other => Err(SchemaError::User(format!(
                "{} reference does not carry an image",
                other.kind_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;

    fn result() -> FetchResult {
        FetchResult {
            display_root: Some("./schemas".to_string()),
            files: vec![
                FetchedFile::new("acme/a.proto", "proto/acme/a.proto", b"a".to_vec()),
                FetchedFile::new("acme/b.proto", "proto/acme/b.proto", b"b".to_vec()),
                FetchedFile::new("other/c.proto", "proto/other/c.proto", b"c".to_vec()),
            ],
        }
    }

    #[test]
    fn test_display_path() {
        let result = result();
        assert_eq!(result.display_path(&result.files[0]), "schemas/proto/acme/a.proto");
        let remote = FetchResult {
            display_root: None,
            ..result.clone()
        };
        assert_eq!(remote.display_path(&result.files[0]), "proto/acme/a.proto");
    }

    #[test]
    fn test_resolve_paths_forms() {
        let result = result();
        let by_root = result.resolve_paths(&["acme/a.proto".into()], false).unwrap();
        assert_eq!(by_root, vec!["acme/a.proto"]);
        let by_display = result.resolve_paths(&["schemas/proto/acme/b.proto".into()], false).unwrap();
        assert_eq!(by_display, vec!["acme/b.proto"]);
        let by_dir = result.resolve_paths(&["proto/acme".into()], false).unwrap();
        assert_eq!(by_dir, vec!["acme/a.proto", "acme/b.proto"]);
    }

    #[test]
    fn test_resolve_paths_missing() {
        let result = result();
        let err = result.resolve_paths(&["acme/zzz.proto".into()], false).unwrap_err();
        assert!(matches!(err, SchemaError::NotFound(_)));
        let ok = result
            .resolve_paths(&["acme/zzz.proto".into(), "other/c.proto".into()], true)
            .unwrap();
        assert_eq!(ok, vec!["other/c.proto"]);
    }

    #[test]
    fn test_retry_once() {
        let ctx = Context::background();
        let mut calls = 0;
        let out = retry_once(&ctx, "op", || {
            calls += 1;
            if calls == 1 {
                Err(SchemaError::transient("reset"))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(out, 2);

        let mut calls = 0;
        let err = retry_once(&ctx, "op", || -> Result<()> {
            calls += 1;
            Err(SchemaError::Credentials("denied".into()))
        })
        .unwrap_err();
        assert!(matches!(err, SchemaError::Credentials(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_read_stdin_once() {
        let fetcher = Fetcher::default();
        let ctx = Context::background();
        let container = MemoryContainer::default().with_stdin(&b"bytes"[..]);
        let reference = Reference::Stdin {
            format: StdinFormat::Image(ImageFormat::JSON),
        };
        let (bytes, format) = fetcher.read_image_bytes(&ctx, &reference, &container).unwrap();
        assert_eq!(bytes, b"bytes");
        assert_eq!(format, ImageFormat::JSON);
        let err = fetcher.read_image_bytes(&ctx, &reference, &container).unwrap_err();
        assert!(matches!(err, SchemaError::User(_)));
    }

    #[test]
    fn test_stdin_archive_checkout() {
        let temp_root = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(GitFetcher::default(), HttpFetcher::new().with_temp_root(temp_root.path()));
        let body = archive::tests::tarball(&[("pkg/proto/a.proto", b"syntax = \"proto3\";")], true);
        let container = MemoryContainer::default().with_stdin(std::io::Cursor::new(body));
        let reference = Reference::Stdin {
            format: StdinFormat::Archive {
                kind: crate::reference::ArchiveKind::TarGz,
                strip_components: 1,
            },
        };
        let checkout = fetcher
            .checkout(&Context::background(), &reference, &container, &CredentialSource::default(), false)
            .unwrap();
        assert!(checkout.is_remote());
        assert!(checkout.base.join("proto/a.proto").is_file());
        assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 1);
        drop(checkout);
        assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stdin_archive_bad_body_leaves_nothing() {
        let temp_root = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(GitFetcher::default(), HttpFetcher::new().with_temp_root(temp_root.path()));
        let container = MemoryContainer::default().with_stdin(&b"not a tarball at all"[..]);
        let reference = Reference::Stdin {
            format: StdinFormat::Archive {
                kind: crate::reference::ArchiveKind::TarGz,
                strip_components: 0,
            },
        };
        assert!(fetcher
            .checkout(&Context::background(), &reference, &container, &CredentialSource::default(), false)
            .is_err());
        assert_eq!(std::fs::read_dir(temp_root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_image_stdin_is_not_a_checkout() {
        let container = MemoryContainer::default().with_stdin(&b""[..]);
        let reference = Reference::Stdin {
            format: StdinFormat::Image(ImageFormat::BINARY),
        };
        let err = Fetcher::default()
            .checkout(&Context::background(), &reference, &container, &CredentialSource::default(), false)
            .unwrap_err();
        assert!(matches!(err, SchemaError::User(_)));
    }
}
