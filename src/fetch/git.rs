//! Git repository fetcher
//!
//! Clones into a scoped temporary directory with `git2`. The default branch
//! and named branches are cloned shallow; tags and arbitrary revisions need
//! history, so they get a full clone unless `depth` says otherwise.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{CertificateCheckStatus, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks, Repository};

use super::{retry_once, scoped_tempdir, Checkout, CredentialSource, HttpFetcher};
use crate::context::Context;
use crate::error::{Result, SchemaError};
use crate::reference::{ArchiveKind, GitRef, Reference};

/// Credential callbacks beyond this count are treated as rejected credentials
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Clones git repositories
#[derive(Debug, Clone, Default)]
pub struct GitFetcher {
    /// Parent for scoped temporary directories; the system default when unset
    pub temp_root: Option<PathBuf>,
}

/// What went wrong inside libgit2 callbacks, which can only report a bare error
#[derive(Default)]
struct CallbackState {
    auth_attempts: Cell<u32>,
    no_credentials: Cell<bool>,
    host_key_rejected: Cell<bool>,
}

/// Transports that cannot serve shallow fetches
fn is_local_transport(url: &str) -> bool {
    if url.starts_with("file://") {
        return true;
    }
    !url.contains("://") && !url.contains('@') && Path::new(url).exists()
}

/// `https://github.com/<owner>/<repo>/archive/<ref>.tar.gz` for GitHub https URLs
fn github_archive_url(url: &str, git_ref: &GitRef) -> Option<String> {
    let rest = url.strip_prefix("https://github.com/")?;
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.split('/');
    let (Some(owner), Some(repo), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    let archive_ref = match git_ref {
        GitRef::Default => "HEAD".to_string(),
        GitRef::Branch(branch) => format!("refs/heads/{}", branch),
        GitRef::Tag(tag) => format!("refs/tags/{}", tag),
        GitRef::Rev(rev) => rev.clone(),
    };
    Some(format!("https://github.com/{}/{}/archive/{}.tar.gz", owner, repo, archive_ref))
}

fn descend(mut checkout: Checkout, subdir: Option<&PathBuf>, url: &str) -> Result<Checkout> {
    if let Some(subdir) = subdir {
        checkout.base = checkout.base.join(subdir);
        if !checkout.base.is_dir() {
            return Err(SchemaError::NotFound(format!("subdir {} in {}", subdir.display(), url)));
        }
    }
    Ok(checkout)
}

impl GitFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(temp_root.into());
        self
    }

    /// Fetch a [`Reference::GitRepo`]. With `experimental_archive` set, GitHub
    /// https repositories are downloaded as tarballs through `http` instead.
    pub fn fetch(
        &self,
        ctx: &Context,
        reference: &Reference,
        credentials: &CredentialSource,
        http: &HttpFetcher,
        experimental_archive: bool,
    ) -> Result<Checkout> {
        let Reference::GitRepo {
            url,
            git_ref,
            subdir,
            depth,
        } = reference
        else {
            return Err(SchemaError::User(format!("{} reference is not a git repository", reference.kind_name())));
        };
        ctx.check()?;

        if experimental_archive {
            if let Some(archive_url) = github_archive_url(url, git_ref) {
                tracing::debug!(url = %url, archive = %archive_url, "fetching git repository as archive");
                let checkout = http.fetch(ctx, &archive_url, Some(ArchiveKind::TarGz), 1, credentials)?;
                return descend(checkout, subdir.as_ref(), url);
            }
        }

        let dir = scoped_tempdir("proto-env-git-", self.temp_root.as_deref())?;
        let repo_dir = dir.path().join("repo");
        let depth = match (depth, git_ref) {
            _ if is_local_transport(url) => None,
            (Some(d), _) => Some(*d),
            (None, GitRef::Default | GitRef::Branch(_)) => Some(1),
            (None, GitRef::Tag(_) | GitRef::Rev(_)) => None,
        };

        retry_once(ctx, url, || {
            if repo_dir.exists() {
                std::fs::remove_dir_all(&repo_dir)?;
            }
            clone_once(ctx, url, git_ref, depth, credentials, &repo_dir)
        })?;
        ctx.check()?;

        tracing::info!(url = %url, git_ref = ?git_ref, depth = ?depth, "cloned git repository");
        descend(Checkout::remote(dir, repo_dir), subdir.as_ref(), url)
    }
}

fn clone_once(
    ctx: &Context,
    url: &str,
    git_ref: &GitRef,
    depth: Option<u32>,
    credentials: &CredentialSource,
    dest: &Path,
) -> Result<()> {
    let state = CallbackState::default();
    let mut callbacks = RemoteCallbacks::new();

    callbacks.credentials(|_url, username_from_url, allowed| {
        let attempts = state.auth_attempts.get() + 1;
        state.auth_attempts.set(attempts);
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("credentials rejected"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(key) = credentials.ssh_key_file.as_deref() {
                return Cred::ssh_key(
                    username_from_url.unwrap_or("git"),
                    None,
                    key,
                    credentials.ssh_key_passphrase.as_deref(),
                );
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Some((user, password)) = credentials.basic_auth() {
                return Cred::userpass_plaintext(user, password);
            }
        }
        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username_from_url.unwrap_or("git"));
        }
        state.no_credentials.set(true);
        Err(git2::Error::from_str("no credentials available"))
    });

    callbacks.certificate_check(|cert, host| {
        let Some(hostkey) = cert.as_hostkey().and_then(|h| h.hostkey()) else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        match credentials.verify_host_key(host, hostkey) {
            Ok(true) => Ok(CertificateCheckStatus::CertificateOk),
            Ok(false) => {
                state.host_key_rejected.set(true);
                Err(git2::Error::from_str("host key not found in known hosts"))
            }
            Err(e) => {
                state.host_key_rejected.set(true);
                Err(git2::Error::from_str(&e.to_string()))
            }
        }
    });

    callbacks.transfer_progress(|_progress| !ctx.is_done());

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        let depth = i32::try_from(depth)
            .map_err(|_| SchemaError::InvalidReference(format!("{}: depth {} is too large", url, depth)))?;
        fetch_options.depth(depth);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let GitRef::Branch(branch) = git_ref {
        builder.branch(branch);
    }

    let repo = builder
        .clone(url, dest)
        .map_err(|e| classify(ctx, url, &state, e))?;

    match git_ref {
        GitRef::Default | GitRef::Branch(_) => Ok(()),
        GitRef::Tag(tag) => checkout_revision(&repo, &format!("refs/tags/{}", tag), url),
        GitRef::Rev(rev) => checkout_revision(&repo, rev, url)
            .or_else(|_| checkout_revision(&repo, &format!("origin/{}", rev), url)),
    }
}

fn checkout_revision(repo: &Repository, spec: &str, url: &str) -> Result<()> {
    let not_found = |_| SchemaError::NotFound(format!("revision {} in {}", spec, url));
    let object = repo.revparse_single(spec).map_err(not_found)?;
    let commit = object.peel_to_commit().map_err(not_found)?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
        .map_err(|e| SchemaError::persistent(format!("checkout of {} failed: {}", spec, e)))?;
    repo.set_head_detached(commit.id())
        .map_err(|e| SchemaError::persistent(format!("checkout of {} failed: {}", spec, e)))?;
    Ok(())
}

fn classify(ctx: &Context, url: &str, state: &CallbackState, err: git2::Error) -> SchemaError {
    if let Err(cancelled) = ctx.check() {
        return cancelled;
    }
    if state.no_credentials.get() {
        return SchemaError::Credentials(format!("{} requires credentials that are not set", url));
    }
    if state.host_key_rejected.get() || err.code() == ErrorCode::Certificate {
        return SchemaError::Credentials(format!("{}: host verification failed: {}", url, err.message()));
    }
    if err.code() == ErrorCode::Auth || state.auth_attempts.get() > MAX_AUTH_ATTEMPTS {
        return SchemaError::Credentials(format!("{}: authentication failed: {}", url, err.message()));
    }
    if err.code() == ErrorCode::NotFound {
        return SchemaError::NotFound(format!("{}: {}", url, err.message()));
    }
    match err.class() {
        ErrorClass::Net | ErrorClass::Os => SchemaError::transient(format!("{}: {}", url, err.message())),
        _ => SchemaError::persistent(format!("{}: {}", url, err.message())),
    }
}
