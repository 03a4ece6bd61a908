//! Proto Env
//!
//! Resolves schema references into validated, in-memory schema images, and
//! writes images back out in any supported encoding.
//!
//! ## Features
//!
//! - **One Reference Grammar**: local paths, `-` for stdin, image files, git
//!   repositories, and http(s) tarballs, with per-variant option checking
//! - **Pluggable Compiler**: schema source is compiled by a caller-supplied [`Builder`]
//! - **Soft Diagnostics**: build problems come back as [`FileAnnotation`]s,
//!   with display paths, instead of errors
//! - **Cached Config**: configuration lookups are cached and single-flighted
//! - **Scoped Checkouts**: remote sources live in temporary directories that
//!   are always removed
//! - **Image Codec**: binary or JSON, optionally gzipped, with a mode that
//!   strips private extensions
//!
//! ## Architecture
//!
//! ```text
//! reference string
//!   └── reference::parse_reference
//!         ├── image file / stdin ──> image::decode_image ─────────────┐
//!         └── local / git / http ──> fetch::Fetcher::checkout         │
//!                                      └── config::ConfigResolver     │
//!                                            └── fetch::walk          │
//!                                                  └── Builder        │
//!                                                        ├── annotations -> diagnostic
//!                                                        └── image ───┴──> Env
//! ```

pub mod build;
pub mod checksum;
pub mod config;
pub mod container;
pub mod context;
pub mod diagnostic;
pub mod env;
pub mod error;
pub mod fetch;
pub mod image;
pub mod reference;

pub use build::{BuildOptions, BuildOutput, Builder, FileAnnotation};
pub use checksum::Checksum;
pub use config::{Config, ConfigProvider, ConfigResolver, ConfigSource, FileConfigProvider};
pub use container::{EnvContainer, EnvStdinContainer, MemoryContainer, StdinContainer, SystemContainer};
pub use context::Context;
pub use diagnostic::{fix_annotation_paths, MapPathResolver, PathResolver};
pub use env::{Env, EnvOutcome, EnvReader, ReadRequest};
pub use error::{Result, SchemaError};
pub use fetch::{CredentialSource, EnvKeys, FetchResult, FetchedFile, Fetcher, GitFetcher, HttpFetcher};
pub use image::{decode_image, encode_image, Image, ImageFile, ImageWriter, RawField};
pub use reference::{parse_reference, ImageFormat, ParsedReference, Reference, StdinFormat};
