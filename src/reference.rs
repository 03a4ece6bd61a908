//! Reference parsing
//!
//! A reference names where schema bytes come from, or where an image should
//! be written:
//!
//! ```text
//! reference := "-" | target ("#" option "=" value ("," option "=" value)*)?
//! ```
//!
//! Dispatch, first match wins:
//!
//! 1. `-` is stdin (or stdout when writing): an image, or a source tarball
//!    with `format=tar|targz`
//! 2. git markers (`git://`, `ssh://`, `git+ssh://`, `file://`, scp-like
//!    `user@host:path`, a `.git` suffix, or `format=git`) give a git repository
//! 3. `http://` / `https://` without git markers give an HTTP archive
//! 4. `format=bin|json` or an image extension (`.bin`, `.json`, `.bin.gz`,
//!    `.json.gz`) give an image file
//! 5. anything else is a local path, file or directory decided at fetch time
//!
//! Options that do not apply to the resolved variant are rejected here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SchemaError};

/// Serialization of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageEncoding {
    Binary,
    Json,
}

/// Compression applied on top of an image encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Encoding plus compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub encoding: ImageEncoding,
    pub compression: Compression,
}

impl ImageFormat {
    pub const BINARY: ImageFormat = ImageFormat {
        encoding: ImageEncoding::Binary,
        compression: Compression::None,
    };

    pub const JSON: ImageFormat = ImageFormat {
        encoding: ImageEncoding::Json,
        compression: Compression::None,
    };

    pub fn gzipped(self) -> Self {
        Self {
            compression: Compression::Gzip,
            ..self
        }
    }

    /// Format implied by a file name's extension, if it is an image extension
    pub fn from_extension(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".bin.gz") {
            Some(Self::BINARY.gzipped())
        } else if lower.ends_with(".json.gz") {
            Some(Self::JSON.gzipped())
        } else if lower.ends_with(".bin") {
            Some(Self::BINARY)
        } else if lower.ends_with(".json") {
            Some(Self::JSON)
        } else {
            None
        }
    }
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self::BINARY
    }
}

/// Archive kind of an HTTP download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
}

/// What `-` carries when reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinFormat {
    /// An encoded image
    Image(ImageFormat),
    /// A tarball of schema source
    Archive { kind: ArchiveKind, strip_components: u32 },
}

/// Which revision of a git repository to check out
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GitRef {
    /// The remote's default branch
    #[default]
    Default,
    Branch(String),
    Tag(String),
    /// Any revision `git rev-parse` understands (commit, `HEAD~2`, ...)
    Rev(String),
}

/// A parsed reference. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A local file or directory
    LocalPath { path: PathBuf },
    /// `-`: stdin, or stdout when writing
    Stdin { format: StdinFormat },
    /// A precompiled image on disk
    ImageFile { path: PathBuf, format: ImageFormat },
    /// A remote (or local) git repository
    GitRepo {
        url: String,
        git_ref: GitRef,
        subdir: Option<PathBuf>,
        depth: Option<u32>,
    },
    /// A tarball served over http(s)
    HttpArchive {
        url: String,
        kind: Option<ArchiveKind>,
        strip_components: u32,
    },
}

impl Reference {
    /// Whether this reference carries a precompiled image
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Reference::ImageFile { .. }
                | Reference::Stdin {
                    format: StdinFormat::Image(_)
                }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Reference::LocalPath { .. } => "a local path",
            Reference::Stdin {
                format: StdinFormat::Image(_),
            } => "a stdin",
            Reference::Stdin {
                format: StdinFormat::Archive { .. },
            } => "a stdin archive",
            Reference::ImageFile { .. } => "an image file",
            Reference::GitRepo { .. } => "a git repository",
            Reference::HttpArchive { .. } => "an http archive",
        }
    }
}

/// A reference plus the options that apply to any variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    /// The text as the user wrote it
    pub raw: String,
    pub reference: Reference,
    /// `include_imports=` override, if given
    pub include_imports: Option<bool>,
    /// `include_source_info=` override, if given
    pub include_source_info: Option<bool>,
}

impl fmt::Display for ParsedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Parsing
// =============================================================================

const KNOWN_OPTIONS: &[&str] = &[
    "format",
    "compression",
    "include_imports",
    "include_source_info",
    "ref",
    "branch",
    "tag",
    "subdir",
    "depth",
    "strip_components",
];

fn scp_like() -> &'static Regex {
    static SCP: OnceLock<Regex> = OnceLock::new();
    SCP.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[^/]").expect("static regex is valid")
    })
}

fn scheme_of(target: &str) -> Option<&str> {
    let (scheme, _) = target.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    valid.then_some(scheme)
}

fn has_git_suffix(target: &str) -> bool {
    let path = target.split(['?', '#']).next().unwrap_or(target);
    path.trim_end_matches('/').ends_with(".git")
}

fn invalid(flag: Option<&str>, message: impl fmt::Display) -> SchemaError {
    match flag {
        Some(flag) => SchemaError::InvalidReference(format!("{}: {}", flag, message)),
        None => SchemaError::InvalidReference(message.to_string()),
    }
}

fn parse_bool(flag: Option<&str>, key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(flag, format!("option {} must be true or false, got {:?}", key, value))),
    }
}

fn parse_options(flag: Option<&str>, text: &str) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in text.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid(flag, format!("option {:?} is not of the form key=value", pair)))?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(invalid(flag, format!("option {:?} has an empty key or value", pair)));
        }
        if !KNOWN_OPTIONS.contains(&key) {
            return Err(invalid(flag, format!("unknown option {:?}", key)));
        }
        if options.insert(key.to_string(), value.to_string()).is_some() {
            return Err(invalid(flag, format!("option {:?} given more than once", key)));
        }
    }
    Ok(options)
}

/// Parse a reference string. `flag` (e.g. `--input`) prefixes error messages.
pub fn parse_reference(value: &str, flag: Option<&str>) -> Result<ParsedReference> {
    let value_trimmed = value.trim();
    if value_trimmed.is_empty() {
        return Err(invalid(flag, "reference is empty"));
    }

    let (target, mut options) = match value_trimmed.split_once('#') {
        Some((target, opts)) => (target, parse_options(flag, opts)?),
        None => (value_trimmed, BTreeMap::new()),
    };
    if target.is_empty() {
        return Err(invalid(flag, "reference has no target before '#'"));
    }

    let include_imports = options
        .remove("include_imports")
        .map(|v| parse_bool(flag, "include_imports", &v))
        .transpose()?;
    let include_source_info = options
        .remove("include_source_info")
        .map(|v| parse_bool(flag, "include_source_info", &v))
        .transpose()?;
    let format = options.remove("format");
    let compression = options
        .remove("compression")
        .map(|v| match v.as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            other => Err(invalid(flag, format!("unknown compression {:?}", other))),
        })
        .transpose()?;

    let reference = classify(flag, target, format.as_deref(), compression, &mut options)?;

    // Whatever is left was not consumed by the resolved variant.
    if let Some(key) = options.keys().next() {
        return Err(invalid(
            flag,
            format!("option {:?} is not valid for {} reference", key, reference.kind_name()),
        ));
    }

    Ok(ParsedReference {
        raw: value_trimmed.to_string(),
        reference,
        include_imports,
        include_source_info,
    })
}

fn image_format(flag: Option<&str>, format: &str, compression: Option<Compression>) -> Result<ImageFormat> {
    let base = match format {
        "bin" => ImageFormat::BINARY,
        "json" => ImageFormat::JSON,
        other => return Err(invalid(flag, format!("format {:?} is not an image format", other))),
    };
    Ok(ImageFormat {
        compression: compression.unwrap_or_default(),
        ..base
    })
}

fn archive_kind(format: &str, compression: Option<Compression>) -> Option<ArchiveKind> {
    match (format, compression) {
        ("tar", Some(Compression::Gzip)) | ("targz", _) => Some(ArchiveKind::TarGz),
        ("tar", _) => Some(ArchiveKind::Tar),
        _ => None,
    }
}

fn strip_components(flag: Option<&str>, options: &mut BTreeMap<String, String>) -> Result<u32> {
    match options.remove("strip_components") {
        Some(v) => v
            .parse::<u32>()
            .map_err(|_| invalid(flag, format!("strip_components must be a number, got {:?}", v))),
        None => Ok(0),
    }
}

fn classify(
    flag: Option<&str>,
    target: &str,
    format: Option<&str>,
    compression: Option<Compression>,
    options: &mut BTreeMap<String, String>,
) -> Result<Reference> {
    if let Some(format) = format {
        if !["dir", "git", "tar", "targz", "bin", "json"].contains(&format) {
            return Err(invalid(flag, format!("unknown format {:?}", format)));
        }
    }

    if target == "-" {
        let format = match format {
            Some(f @ ("bin" | "json")) => StdinFormat::Image(image_format(flag, f, compression)?),
            Some(f @ ("tar" | "targz")) => StdinFormat::Archive {
                kind: archive_kind(f, compression).unwrap_or(ArchiveKind::Tar),
                strip_components: strip_components(flag, options)?,
            },
            Some(other) => {
                return Err(invalid(
                    flag,
                    format!("format {:?} is not valid for stdin; use bin, json, tar, or targz", other),
                ))
            }
            None => StdinFormat::Image(ImageFormat {
                compression: compression.unwrap_or_default(),
                ..ImageFormat::BINARY
            }),
        };
        return Ok(Reference::Stdin { format });
    }

    let scheme = scheme_of(target);
    let is_http = matches!(scheme, Some("http") | Some("https"));
    let git_scheme = matches!(scheme, Some("git") | Some("ssh") | Some("git+ssh") | Some("file"));
    let git_marker = git_scheme
        || has_git_suffix(target)
        || (scheme.is_none() && scp_like().is_match(target));

    if format == Some("git") || (git_marker && format.is_none()) {
        if compression.is_some() {
            return Err(invalid(flag, "option \"compression\" is not valid for a git repository reference"));
        }
        return git_reference(flag, target, options);
    }

    if let Some(scheme) = scheme {
        if !is_http {
            return Err(invalid(flag, format!("unsupported scheme {:?}", scheme)));
        }
        let kind = match (format, compression) {
            (Some(f), _) => Some(archive_kind(f, compression).ok_or_else(|| {
                invalid(flag, format!("format {:?} is not valid for an http archive", f))
            })?),
            (None, Some(Compression::Gzip)) => Some(ArchiveKind::TarGz),
            (None, _) => None,
        };
        let strip_components = strip_components(flag, options)?;
        return Ok(Reference::HttpArchive {
            url: target.to_string(),
            kind,
            strip_components,
        });
    }

    match format {
        Some(f @ ("bin" | "json")) => Ok(Reference::ImageFile {
            path: PathBuf::from(target),
            format: image_format(flag, f, compression)?,
        }),
        Some("tar") | Some("targz") => Err(invalid(flag, "archive formats require an http(s) url or stdin")),
        _ => match ImageFormat::from_extension(target) {
            Some(detected) if format.is_none() => Ok(Reference::ImageFile {
                path: PathBuf::from(target),
                format: ImageFormat {
                    compression: compression.unwrap_or(detected.compression),
                    ..detected
                },
            }),
            _ => {
                if compression.is_some() {
                    return Err(invalid(flag, "option \"compression\" is not valid for a local path reference"));
                }
                Ok(Reference::LocalPath {
                    path: PathBuf::from(target),
                })
            }
        },
    }
}

fn git_reference(flag: Option<&str>, target: &str, options: &mut BTreeMap<String, String>) -> Result<Reference> {
    let mut refs: Vec<GitRef> = Vec::new();
    if let Some(v) = options.remove("branch") {
        refs.push(GitRef::Branch(v));
    }
    if let Some(v) = options.remove("tag") {
        refs.push(GitRef::Tag(v));
    }
    if let Some(v) = options.remove("ref") {
        refs.push(GitRef::Rev(v));
    }
    if refs.len() > 1 {
        return Err(invalid(flag, "only one of ref, branch, or tag may be given"));
    }
    let depth = match options.remove("depth") {
        Some(v) => match v.parse::<u32>() {
            Ok(d) if d > 0 && i32::try_from(d).is_ok() => Some(d),
            _ => {
                return Err(invalid(
                    flag,
                    format!("depth must be a number between 1 and {}, got {:?}", i32::MAX, v),
                ))
            }
        },
        None => None,
    };
    let subdir = match options.remove("subdir") {
        Some(v) => {
            let path = PathBuf::from(v.trim_matches('/'));
            let escapes = path
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
            if escapes {
                return Err(invalid(flag, format!("subdir {:?} must be a relative path inside the repository", v)));
            }
            Some(path)
        }
        None => None,
    };
    Ok(Reference::GitRepo {
        url: target.to_string(),
        git_ref: refs.pop().unwrap_or_default(),
        subdir,
        depth,
    })
}

/// True when `path` names the platform's discard device
pub fn is_null_device(path: &std::path::Path) -> bool {
    if cfg!(windows) {
        path.to_str().is_some_and(|p| p.eq_ignore_ascii_case("nul"))
    } else {
        path == std::path::Path::new("/dev/null")
    }
}
