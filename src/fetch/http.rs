//! HTTP archive fetcher

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use super::archive::{detect_kind, extract};
use super::{retry_once, scoped_tempdir, Checkout, CredentialSource};
use crate::context::Context;
use crate::error::{Result, SchemaError};
use crate::reference::ArchiveKind;

const CHUNK_SIZE: usize = 64 * 1024;

/// Downloads and extracts tarballs over http(s)
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    /// Parent for scoped temporary directories; the system default when unset
    pub temp_root: Option<PathBuf>,
    /// Upper bound on one request, on top of any context deadline
    pub timeout: Option<Duration>,
}

/// A downloaded body and its declared content type
pub(crate) struct Download {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

fn classify(url: &str, err: ureq::Error) -> SchemaError {
    match err {
        ureq::Error::StatusCode(status) => SchemaError::Download {
            url: url.to_string(),
            status,
        },
        ureq::Error::Io(e) => SchemaError::transient(format!("{}: {}", url, e)),
        ureq::Error::Timeout(t) => SchemaError::transient(format!("{}: timed out ({:?})", url, t)),
        ureq::Error::ConnectionFailed => SchemaError::transient(format!("{}: connection failed", url)),
        other => SchemaError::persistent(format!("{}: {}", url, other)),
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(temp_root.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn agent(&self, ctx: &Context) -> ureq::Agent {
        let timeout = match (self.timeout, ctx.remaining()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let config = ureq::Agent::config_builder().timeout_global(timeout).build();
        config.into()
    }

    /// GET `url`, retrying once on a transient failure
    pub(crate) fn download(&self, ctx: &Context, url: &str, credentials: &CredentialSource) -> Result<Download> {
        retry_once(ctx, url, || self.download_once(ctx, url, credentials))
    }

    fn download_once(&self, ctx: &Context, url: &str, credentials: &CredentialSource) -> Result<Download> {
        ctx.check()?;
        tracing::debug!(url = %url, "GET");
        let mut req = self.agent(ctx).get(url);
        if let Some(auth) = credentials.basic_auth_header() {
            req = req.header("Authorization", &auth);
        }
        let resp = req.call().map_err(|e| classify(url, e))?;

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            ctx.check()?;
            let n = reader
                .read(&mut chunk)
                .map_err(|e| SchemaError::transient(format!("{}: {}", url, e)))?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(Download { body, content_type })
    }

    /// Download `url` and extract it into a scoped temporary directory
    pub fn fetch(
        &self,
        ctx: &Context,
        url: &str,
        kind: Option<ArchiveKind>,
        strip_components: u32,
        credentials: &CredentialSource,
    ) -> Result<Checkout> {
        let download = self.download(ctx, url, credentials)?;
        let kind = detect_kind(kind, download.content_type.as_deref(), url, &download.body);
        let dir = scoped_tempdir("proto-env-http-", self.temp_root.as_deref())?;
        let count = extract(ctx, &download.body, kind, dir.path(), strip_components)?;
        tracing::info!(url = %url, files = count, kind = ?kind, "fetched archive");
        let base = dir.path().to_path_buf();
        Ok(Checkout::remote(dir, base))
    }
}
