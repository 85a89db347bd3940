pub mod aws;
pub mod cache;
pub mod freshness;
pub mod ssh;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::vaultclient::{VaultError, WrappedToken};

pub use aws::AwsCredentialLease;
pub use cache::{SecretCache, SimpleSecret};
pub use ssh::SshCertRecord;

#[derive(thiserror::Error, Debug)]
pub enum BriefcaseError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    SshCert(#[from] crate::vaultclient::sshcert::SshCertError),
    #[error("{0}")]
    Invalid(String),
}

/// The vault token the tool is currently operating with, and when it needs
/// attention again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedAuthToken {
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "expiry")]
    pub expires_at: DateTime<Utc>,
    pub next_refresh: DateTime<Utc>,
}

impl Default for LeasedAuthToken {
    fn default() -> Self {
        Self {
            accessor: String::new(),
            renewable: false,
            token: String::new(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
            next_refresh: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// The briefcase is the tool's persistent record of everything it has already
/// done: the auth token lease, per-artifact freshness, and lease expiry for
/// AWS and SSH credentials. It also carries the per-pass secret cache, which
/// is never serialized and never survives a reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Briefcase {
    #[serde(rename = "auth", default)]
    pub auth_token_lease: LeasedAuthToken,

    #[serde(rename = "ssh", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ssh_certificates: BTreeMap<String, SshCertRecord>,
    #[serde(rename = "aws", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aws_credential_leases: BTreeMap<String, AwsCredentialLease>,

    #[serde(
        rename = "tokenscoped_templates",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub token_scoped_templates: BTreeMap<String, bool>,
    #[serde(
        rename = "static_templates",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub static_templates: BTreeMap<String, bool>,
    #[serde(
        rename = "tokenscoped_secrets",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub token_scoped_secrets: BTreeMap<String, bool>,
    #[serde(
        rename = "static_secrets",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub static_scoped_secrets: BTreeMap<String, bool>,
    #[serde(
        rename = "versioned_secrets",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub version_scoped_secrets: BTreeMap<String, i64>,
    #[serde(
        rename = "tokenscoped_composites",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub token_scoped_composites: BTreeMap<String, bool>,
    #[serde(
        rename = "static_composites",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub static_scoped_composites: BTreeMap<String, bool>,

    #[serde(skip)]
    pub cache: SecretCache,
}

impl Briefcase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a briefcase from disk. Any problem (missing file, bad JSON)
    /// yields a fresh empty briefcase, not an error: the tool can always
    /// start over from nothing.
    pub fn load(path: &Path) -> Self {
        tracing::info!(filename = %path.display(), "reading briefcase");
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(filename = %path.display(), error = %err, "could not load briefcase - starting an empty one");
                return Self::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(briefcase) => briefcase,
            Err(err) => {
                tracing::warn!(filename = %path.display(), error = %err, "could not parse briefcase - starting an empty one");
                Self::new()
            }
        }
    }

    /// Persist the briefcase: parent directories created, written 0600 to a
    /// sibling tmp file and renamed into place.
    pub fn save(&self, path: &Path) -> Result<(), BriefcaseError> {
        let bytes = serde_json::to_vec(self)?;

        tracing::info!(filename = %path.display(), "storing briefcase");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| BriefcaseError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }

        let tmp = path.with_extension("tmp");
        let io_err = |source| BriefcaseError::Io {
            path: tmp.display().to_string(),
            source,
        };
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(io_err)?;
            file.write_all(&bytes).map_err(io_err)?;
        }
        std::fs::rename(&tmp, path).map_err(|source| BriefcaseError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Used when the vault token in the briefcase is no longer the one in
    /// use. Anything that wasn't static will soon expire with the old token,
    /// so its freshness records are dropped and it will be recreated. AWS
    /// credentials (sts:AssumeRole has no revocation tied to our token) and
    /// SSH certificates (valid until their TTL, no CRL) survive, as do
    /// static and version-scoped records.
    pub fn reset(&self) -> Briefcase {
        let mut fresh = Briefcase::new();
        fresh.aws_credential_leases = self.aws_credential_leases.clone();
        fresh.ssh_certificates = self.ssh_certificates.clone();
        fresh.static_scoped_secrets = self.static_scoped_secrets.clone();
        fresh.version_scoped_secrets = self.version_scoped_secrets.clone();
        fresh.static_scoped_composites = self.static_scoped_composites.clone();
        fresh.static_templates = self.static_templates.clone();
        fresh
    }

    /// Record the token being used, establishing when it expires and when to
    /// renew it (a third of the way through its life). Tokens already within
    /// five minutes of expiry are scheduled for immediate refresh.
    pub fn enroll_auth_token(
        &mut self,
        clock: &dyn Clock,
        token: &WrappedToken,
    ) -> Result<(), BriefcaseError> {
        let token_id = token.token_id()?;
        let accessor = token.token_accessor()?;
        let ttl = token.token_ttl()?;
        let ttl_secs = ttl.as_secs() as i64;

        let now = clock.now();
        let mut lease = LeasedAuthToken {
            token: token_id.clone(),
            accessor: accessor.clone(),
            renewable: token.renewable,
            expires_at: now + Duration::seconds(ttl_secs),
            next_refresh: now + Duration::seconds(ttl_secs / 3),
        };

        if self.auth_token_lease.token != token_id {
            tracing::info!(
                accessor,
                renewable = lease.renewable,
                ttl_secs,
                next_refresh = %lease.next_refresh,
                "enrolling vault token into briefcase"
            );
        } else {
            tracing::info!(
                expires_at = %lease.expires_at,
                next_refresh = %lease.next_refresh,
                "vault token refreshed"
            );
        }

        if lease.expires_at < now + Duration::minutes(5) {
            tracing::warn!(
                expires_at = %lease.expires_at,
                "token expires in less than five minutes, setting next refresh to now"
            );
            lease.next_refresh = now;
        }

        self.auth_token_lease = lease;
        Ok(())
    }

    /// True when the periodic refresh point has arrived. A non-renewable
    /// token never refreshes; if it is past due, that is logged loudly
    /// because results become unpredictable once it expires.
    pub fn should_refresh_auth_token(&self, clock: &dyn Clock) -> bool {
        let now = clock.now();
        let expiring = now >= self.auth_token_lease.next_refresh;

        if expiring && !self.auth_token_lease.renewable {
            if now >= self.auth_token_lease.expires_at {
                tracing::error!(
                    expires_at = %self.auth_token_lease.expires_at,
                    "token has expired and is not renewable - results are unpredictable"
                );
            } else {
                tracing::error!(
                    expires_at = %self.auth_token_lease.expires_at,
                    "token is expiring but is non-renewable - unpredictable results will occur once it expires"
                );
            }
            return false;
        }

        expiring
    }

    pub fn versioned_secret(&self, path: &str) -> i64 {
        self.version_scoped_secrets.get(path).copied().unwrap_or(0)
    }

    /// Versions only move forward within a briefcase generation.
    pub fn record_versioned_secret(&mut self, path: &str, version: i64) {
        let current = self.versioned_secret(path);
        if version < current {
            tracing::warn!(
                path,
                current,
                version,
                "refusing to move versioned secret backwards"
            );
            return;
        }
        self.version_scoped_secrets.insert(path.to_string(), version);
    }
}
