//! Credentials for remote fetches
//!
//! Resolved once per fetch from named environment variables; nothing is read
//! from process-global state directly. SSH host keys are checked against
//! OpenSSH known-hosts files, hashed entries included.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hmac;

use crate::container::EnvContainer;
use crate::error::{Result, SchemaError};

/// Names of the environment variables credentials are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvKeys {
    pub https_username: String,
    pub https_password: String,
    pub ssh_key_file: String,
    pub ssh_key_passphrase: String,
    /// Known-hosts files, separated by the platform path-list separator.
    /// When unset, `~/.ssh/known_hosts` and `/etc/ssh/ssh_known_hosts`.
    pub ssh_known_hosts_files: String,
    /// Any non-empty value other than `0`/`false` enables archive downloads
    /// in place of git clones where the host supports them
    pub experimental_git_archive: String,
}

impl Default for EnvKeys {
    fn default() -> Self {
        Self {
            https_username: "PROTO_ENV_HTTPS_USERNAME".to_string(),
            https_password: "PROTO_ENV_HTTPS_PASSWORD".to_string(),
            ssh_key_file: "PROTO_ENV_SSH_KEY_FILE".to_string(),
            ssh_key_passphrase: "PROTO_ENV_SSH_KEY_PASSPHRASE".to_string(),
            ssh_known_hosts_files: "PROTO_ENV_SSH_KNOWN_HOSTS_FILES".to_string(),
            experimental_git_archive: "PROTO_ENV_EXPERIMENTAL_GIT_ARCHIVE".to_string(),
        }
    }
}

impl EnvKeys {
    pub fn experimental_enabled<E: EnvContainer + ?Sized>(&self, env: &E) -> bool {
        let value = env.env(&self.experimental_git_archive);
        !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
    }
}

/// Credential values for one fetch
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialSource {
    pub https_username: Option<String>,
    pub https_password: Option<String>,
    pub ssh_key_file: Option<PathBuf>,
    pub ssh_key_passphrase: Option<String>,
    pub ssh_known_hosts_files: Vec<PathBuf>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("https_username", &self.https_username)
            .field("https_password", &self.https_password.as_ref().map(|_| "<redacted>"))
            .field("ssh_key_file", &self.ssh_key_file)
            .field("ssh_key_passphrase", &self.ssh_key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("ssh_known_hosts_files", &self.ssh_known_hosts_files)
            .finish()
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl CredentialSource {
    pub fn from_env<E: EnvContainer + ?Sized>(env: &E, keys: &EnvKeys) -> Self {
        let known_hosts = env.env(&keys.ssh_known_hosts_files);
        let ssh_known_hosts_files = if known_hosts.is_empty() {
            default_known_hosts(env)
        } else {
            std::env::split_paths(&known_hosts)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        };
        Self {
            https_username: non_empty(env.env(&keys.https_username)),
            https_password: non_empty(env.env(&keys.https_password)),
            ssh_key_file: non_empty(env.env(&keys.ssh_key_file)).map(PathBuf::from),
            ssh_key_passphrase: non_empty(env.env(&keys.ssh_key_passphrase)),
            ssh_known_hosts_files,
        }
    }

    /// Username and password for HTTPS, when both are set
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.https_username, &self.https_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }

    /// `Authorization` header value for HTTPS basic auth
    pub fn basic_auth_header(&self) -> Option<String> {
        self.basic_auth()
            .map(|(user, password)| format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password))))
    }

    /// Check a server host key against the known-hosts files. Missing files
    /// are skipped the way OpenSSH skips them; a host found in none of them
    /// is rejected, and a key marked `@revoked` is an error.
    pub fn verify_host_key(&self, host: &str, key: &[u8]) -> Result<bool> {
        let encoded = STANDARD.encode(key);
        let mut trusted = false;
        for file in &self.ssh_known_hosts_files {
            let text = match std::fs::read_to_string(file) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(file = %file.display(), "known hosts file not found, skipping");
                    continue;
                }
                Err(e) => {
                    return Err(SchemaError::Credentials(format!(
                        "cannot read known hosts file {}: {}",
                        file.display(),
                        e
                    )))
                }
            };
            match known_hosts_match(&text, host, &encoded) {
                HostMatch::Revoked => {
                    return Err(SchemaError::Credentials(format!(
                        "host key for {} is revoked in {}",
                        host,
                        file.display()
                    )))
                }
                HostMatch::Trusted => trusted = true,
                HostMatch::Unknown => {}
            }
        }
        if !trusted {
            tracing::warn!(host = %host, files = self.ssh_known_hosts_files.len(), "host key not found in known hosts");
        }
        Ok(trusted)
    }
}

/// `~/.ssh/known_hosts`, then the system-wide file
fn default_known_hosts<E: EnvContainer + ?Sized>(env: &E) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let home = match env.env("HOME") {
        home if home.is_empty() => env.env("USERPROFILE"),
        home => home,
    };
    if !home.is_empty() {
        files.push(Path::new(&home).join(".ssh").join("known_hosts"));
    }
    if cfg!(unix) {
        files.push(PathBuf::from("/etc/ssh/ssh_known_hosts"));
    }
    files
}

enum HostMatch {
    Unknown,
    Trusted,
    Revoked,
}

/// Look `host` and `encoded_key` up in known-hosts text
fn known_hosts_match(text: &str, host: &str, encoded_key: &str) -> HostMatch {
    let mut result = HostMatch::Unknown;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().peekable();
        let marker = fields.next_if(|f| f.starts_with('@'));
        let (Some(hosts), Some(_key_type), Some(key)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if key != encoded_key || !hosts_match(hosts, host) {
            continue;
        }
        match marker {
            None => result = HostMatch::Trusted,
            Some("@revoked") => return HostMatch::Revoked,
            // @cert-authority keys sign host certificates; they are not host keys
            Some(_) => {}
        }
    }
    result
}

/// Match a comma-separated pattern list, a `!` negation, or a hashed entry
fn hosts_match(patterns: &str, host: &str) -> bool {
    if let Some(hashed) = patterns.strip_prefix("|1|") {
        return hashed_host_matches(hashed, host);
    }
    let mut matched = false;
    for pattern in patterns.split(',') {
        let (negated, pattern) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let pattern = match pattern.strip_prefix('[') {
            Some(rest) => rest.split(']').next().unwrap_or(rest),
            None => pattern,
        };
        if glob_match(pattern.as_bytes(), host.as_bytes()) {
            if negated {
                return false;
            }
            matched = true;
        }
    }
    matched
}

/// `|1|<salt>|<hash>`: HMAC-SHA1 of the host name keyed by the salt
fn hashed_host_matches(entry: &str, host: &str) -> bool {
    let Some((salt, hash)) = entry.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (STANDARD.decode(salt), STANDARD.decode(hash)) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &salt);
    hmac::verify(&key, host.as_bytes(), &hash).is_ok()
}

/// `*` and `?` wildcards, ASCII case-insensitive
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..])),
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p.eq_ignore_ascii_case(t) => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
