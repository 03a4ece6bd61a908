//! Reading references into environments
//!
//! ```text
//! parse -> fetch -> resolve config -> filter -> build -> validate -> fix paths
//! ```
//!
//! Every stage short-circuits on error except the build: builder diagnostics
//! end the pipeline with [`EnvOutcome::Diagnostics`] instead of an error, so
//! callers can render them. Image references skip the build and are decoded.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::build::{BuildOptions, Builder, FileAnnotation};
use crate::config::{Config, ConfigResolver};
use crate::container::EnvStdinContainer;
use crate::context::Context;
use crate::diagnostic::{fix_annotation_paths, MapPathResolver, PathResolver};
use crate::error::{Result, SchemaError};
use crate::fetch::{clean_path, path_matches, walk, Checkout, CredentialSource, EnvKeys, FetchResult, Fetcher};
use crate::image::{decode_image, Image, ImportGraph};
use crate::reference::{parse_reference, ParsedReference, Reference};

/// A validated image with its configuration
#[derive(Clone)]
pub struct Env {
    pub image: Image,
    /// Maps image file names to display paths; `None` for image inputs
    pub resolver: Option<Arc<dyn PathResolver + Send + Sync>>,
    pub config: Arc<Config>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("files", &self.image.file_names())
            .field("resolver", &self.resolver.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Env {
    /// Display path for an image file name
    pub fn display_path(&self, name: &str) -> String {
        match &self.resolver {
            Some(resolver) => resolver.resolve(name),
            None => name.to_string(),
        }
    }
}

/// Result of a read that got usable bytes
#[derive(Debug)]
pub enum EnvOutcome {
    Ready(Env),
    /// The bytes did not form a valid schema. Paths are display paths.
    Diagnostics(Vec<FileAnnotation>),
}

impl EnvOutcome {
    pub fn env(self) -> Option<Env> {
        match self {
            EnvOutcome::Ready(env) => Some(env),
            EnvOutcome::Diagnostics(_) => None,
        }
    }

    pub fn annotations(&self) -> &[FileAnnotation] {
        match self {
            EnvOutcome::Ready(_) => &[],
            EnvOutcome::Diagnostics(annotations) => annotations,
        }
    }
}

/// Parameters of one read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub value: String,
    pub config_override: Option<String>,
    /// Files or directories to restrict the result to; empty means all
    pub specific_paths: Vec<String>,
    pub allow_missing_paths: bool,
    pub include_imports: bool,
    pub include_source_info: bool,
}

impl ReadRequest {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn config_override(mut self, config_override: impl Into<String>) -> Self {
        self.config_override = Some(config_override.into());
        self
    }

    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specific_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_missing_paths(mut self, allow: bool) -> Self {
        self.allow_missing_paths = allow;
        self
    }

    pub fn include_imports(mut self, include: bool) -> Self {
        self.include_imports = include;
        self
    }

    pub fn include_source_info(mut self, include: bool) -> Self {
        self.include_source_info = include;
        self
    }
}

/// Options in effect after reference overrides
struct Effective {
    include_imports: bool,
    include_source_info: bool,
}

impl Effective {
    fn new(parsed: &ParsedReference, request: &ReadRequest) -> Self {
        Self {
            include_imports: parsed.include_imports.unwrap_or(request.include_imports),
            include_source_info: parsed.include_source_info.unwrap_or(request.include_source_info),
        }
    }
}

// =============================================================================
// Env Reader
// =============================================================================

/// Turns references into [`Env`]s
pub struct EnvReader {
    configs: Arc<ConfigResolver>,
    builder: Option<Arc<dyn Builder>>,
    fetcher: Fetcher,
    keys: EnvKeys,
    flag: Option<String>,
}

impl Default for EnvReader {
    fn default() -> Self {
        Self::new(Arc::new(ConfigResolver::default()))
    }
}

impl EnvReader {
    pub fn new(configs: Arc<ConfigResolver>) -> Self {
        Self {
            configs,
            builder: None,
            fetcher: Fetcher::default(),
            keys: EnvKeys::default(),
            flag: None,
        }
    }

    /// Compiler used for source references
    pub fn with_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Environment variable names credentials are read from
    pub fn with_env_keys(mut self, keys: EnvKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Flag the reference value came from, e.g. `--input`, for error messages
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    fn prefixed(&self, message: impl fmt::Display) -> String {
        match &self.flag {
            Some(flag) => format!("{}: {}", flag, message),
            None => message.to_string(),
        }
    }

    /// Parse and check stdin availability before any fetch is dispatched
    fn parse(&self, container: &dyn EnvStdinContainer, value: &str) -> Result<ParsedReference> {
        let parsed = parse_reference(value, self.flag.as_deref())?;
        if matches!(parsed.reference, Reference::Stdin { .. }) && !container.has_stdin() {
            return Err(SchemaError::User(self.prefixed("stdin requested with \"-\" but no input stream is attached")));
        }
        tracing::debug!(reference = ?parsed.reference, "parsed reference");
        Ok(parsed)
    }

    /// Read any reference: images are decoded, sources are built
    pub fn read_env(&self, ctx: &Context, container: &dyn EnvStdinContainer, request: &ReadRequest) -> Result<EnvOutcome> {
        let parsed = self.parse(container, &request.value)?;
        if parsed.reference.is_image() {
            self.image_env(ctx, container, &parsed, request).map(EnvOutcome::Ready)
        } else {
            self.source_env(ctx, container, &parsed, request)
        }
    }

    /// Read a source reference and build it; image references are rejected
    pub fn read_source_env(
        &self,
        ctx: &Context,
        container: &dyn EnvStdinContainer,
        request: &ReadRequest,
    ) -> Result<EnvOutcome> {
        let parsed = self.parse(container, &request.value)?;
        if parsed.reference.is_image() {
            let hint = if matches!(parsed.reference, Reference::Stdin { .. }) {
                "; pass a source tarball with -#format=tar or -#format=targz"
            } else {
                ""
            };
            return Err(SchemaError::InvalidReference(self.prefixed(format!(
                "{} is {} reference, but schema source is required{}",
                parsed,
                parsed.reference.kind_name(),
                hint
            ))));
        }
        self.source_env(ctx, container, &parsed, request)
    }

    /// Read an image reference; the builder is never invoked
    pub fn read_image_env(&self, ctx: &Context, container: &dyn EnvStdinContainer, request: &ReadRequest) -> Result<Env> {
        let parsed = self.parse(container, &request.value)?;
        if !parsed.reference.is_image() {
            return Err(SchemaError::InvalidReference(self.prefixed(format!(
                "{} is {} reference, but an image is required",
                parsed,
                parsed.reference.kind_name()
            ))));
        }
        self.image_env(ctx, container, &parsed, request)
    }

    /// Display paths of the files a reference would feed the builder, or the
    /// file names of an image
    pub fn list_files(
        &self,
        ctx: &Context,
        container: &dyn EnvStdinContainer,
        value: &str,
        config_override: Option<&str>,
    ) -> Result<Vec<String>> {
        let parsed = self.parse(container, value)?;
        if parsed.reference.is_image() {
            let (bytes, format) = self.fetcher.read_image_bytes(ctx, &parsed.reference, container)?;
            let image = decode_image(&bytes, format)?;
            return Ok(image.file_names().into_iter().map(str::to_string).collect());
        }
        let (_checkout, _config, fetched) = self.fetch_source(ctx, container, &parsed, config_override)?;
        Ok(fetched.files.iter().map(|f| fetched.display_path(f)).collect())
    }

    /// Configuration for the current working directory
    pub fn get_config(&self, ctx: &Context, config_override: Option<&str>) -> Result<Arc<Config>> {
        let cwd = std::env::current_dir()?;
        self.configs.get_config(ctx, &cwd, None, config_override)
    }

    // =========================================================================
    // Sources
    // =========================================================================

    fn fetch_source(
        &self,
        ctx: &Context,
        container: &dyn EnvStdinContainer,
        parsed: &ParsedReference,
        config_override: Option<&str>,
    ) -> Result<(Checkout, Arc<Config>, FetchResult)> {
        let credentials = CredentialSource::from_env(container, &self.keys);
        let experimental = self.keys.experimental_enabled(container);
        let checkout = self
            .fetcher
            .checkout(ctx, &parsed.reference, container, &credentials, experimental)?;

        let config = if checkout.is_remote() {
            self.configs
                .get_config(ctx, checkout.search_root(), checkout.stop.as_deref(), config_override)?
        } else {
            let root = checkout.search_root();
            let absolute = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
            self.configs.get_config(ctx, &absolute, None, config_override)?
        };

        let fetched = walk(ctx, &checkout, &config)?;
        tracing::debug!(reference = %parsed, files = fetched.files.len(), checksum = %fetched.checksum(), "fetched source");
        Ok((checkout, config, fetched))
    }

    fn source_env(
        &self,
        ctx: &Context,
        container: &dyn EnvStdinContainer,
        parsed: &ParsedReference,
        request: &ReadRequest,
    ) -> Result<EnvOutcome> {
        let builder = self.builder.as_ref().ok_or_else(|| {
            SchemaError::User(self.prefixed(format!("{} needs a builder, and none is configured", parsed)))
        })?;
        let effective = Effective::new(parsed, request);
        let (checkout, config, fetched) =
            self.fetch_source(ctx, container, parsed, request.config_override.as_deref())?;

        let requested = if request.specific_paths.is_empty() {
            Vec::new()
        } else {
            let resolved = fetched.resolve_paths(&request.specific_paths, request.allow_missing_paths)?;
            if resolved.is_empty() {
                tracing::debug!(reference = %parsed, "no requested paths remain, returning empty image");
                return Ok(EnvOutcome::Ready(Env {
                    image: Image::default(),
                    resolver: Some(Arc::new(MapPathResolver::from_fetch(&fetched))),
                    config,
                }));
            }
            resolved
        };

        ctx.check()?;
        let options = BuildOptions {
            target_paths: requested.clone(),
            include_source_info: effective.include_source_info,
        };
        let output = builder.build(ctx, &fetched, &options)?;
        drop(checkout);

        let resolver: Arc<dyn PathResolver + Send + Sync> = Arc::new(MapPathResolver::from_fetch(&fetched));
        if !output.annotations.is_empty() {
            tracing::debug!(reference = %parsed, count = output.annotations.len(), "build reported diagnostics");
            let display: &dyn PathResolver = &*resolver;
            let annotations = fix_annotation_paths(Some(display), &output.annotations);
            return Ok(EnvOutcome::Diagnostics(annotations));
        }

        output.image.validate()?;
        let targets: HashSet<String> = if requested.is_empty() {
            ImportGraph::new(&output.image).entry_points().into_iter().collect()
        } else {
            requested.into_iter().collect()
        };
        if let Some(missing) = targets.iter().find(|t| output.image.get(t).is_none()) {
            return Err(SchemaError::Validation(format!("builder output is missing {}", missing)));
        }

        let mut image = output.image.select_and_mark(&targets, effective.include_imports);
        if !effective.include_source_info {
            image.strip_source_info();
        }
        image.validate()?;

        tracing::info!(reference = %parsed, files = image.file.len(), "built image");
        Ok(EnvOutcome::Ready(Env {
            image,
            resolver: Some(resolver),
            config,
        }))
    }

    // =========================================================================
    // Images
    // =========================================================================

    fn image_env(
        &self,
        ctx: &Context,
        container: &dyn EnvStdinContainer,
        parsed: &ParsedReference,
        request: &ReadRequest,
    ) -> Result<Env> {
        let effective = Effective::new(parsed, request);
        let (bytes, format) = self.fetcher.read_image_bytes(ctx, &parsed.reference, container)?;
        let image = decode_image(&bytes, format)?;
        image.validate()?;
        let config = self.get_config(ctx, request.config_override.as_deref())?;

        let image = select_from_image(image, request, &effective)?;
        image.validate()?;
        tracing::info!(reference = %parsed, files = image.file.len(), "read image");
        Ok(Env {
            image,
            resolver: None,
            config,
        })
    }
}

/// Apply explicit paths and import/source-info options to a decoded image.
/// Without provenance only explicit paths take effect.
fn select_from_image(image: Image, request: &ReadRequest, effective: &Effective) -> Result<Image> {
    let mut explicit: HashSet<String> = HashSet::new();
    for raw in &request.specific_paths {
        let wanted = clean_path(raw);
        let mut matched = false;
        for name in image.file_names() {
            if path_matches(name, &wanted) {
                matched = true;
                explicit.insert(name.to_string());
            }
        }
        if !matched {
            if request.allow_missing_paths {
                tracing::warn!(path = %raw, "requested path not in image, skipping");
            } else {
                return Err(SchemaError::NotFound(format!("{}: not in image", raw)));
            }
        }
    }
    let restricted = !request.specific_paths.is_empty();

    if image.has_provenance() {
        let targets = if restricted { explicit } else { image.target_names() };
        let mut selected = image.select_and_mark(&targets, effective.include_imports);
        if !effective.include_source_info {
            selected.strip_source_info();
        }
        return Ok(selected);
    }

    if restricted {
        Ok(image.select_closed(&explicit))
    } else {
        Ok(image)
    }
}
