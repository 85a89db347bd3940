use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{aws::force_refresh_expiry, Briefcase, BriefcaseError};
use crate::clock::Clock;
use crate::config;
use crate::vaultclient::sshcert::{self, CERT_TIME_INFINITY, SSH_CERTIFICATE};

/// Sentinel for a certificate whose `valid_before` is "never". It always
/// triggers a refresh: a never-expiring certificate is a misissued one.
pub fn never_expires() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCertRecord {
    #[serde(rename = "cfg")]
    pub config: config::SshCertificate,
    pub expiry: DateTime<Utc>,
    #[serde(rename = "refresh_expiry", skip_serializing_if = "Option::is_none")]
    pub refresh_expiry: Option<DateTime<Utc>>,
}

impl Briefcase {
    pub fn should_refresh_ssh_certificate(
        &self,
        ssh: &config::SshCertificate,
        expires_before: DateTime<Utc>,
    ) -> bool {
        let entry = match self.ssh_certificates.get(&ssh.output_path) {
            Some(entry) => entry,
            None => return true,
        };

        tracing::debug!(expiry = %entry.expiry, output_path = %ssh.output_path, "determined expiry of ssh certificate");

        let cert_expires_before =
            entry.expiry < expires_before || entry.expiry == never_expires();
        let forced_refresh = entry
            .refresh_expiry
            .map(|refresh_expiry| refresh_expiry < expires_before)
            .unwrap_or(false);

        cert_expires_before || forced_refresh
    }

    /// Track a freshly written certificate. Its expiry is whatever
    /// `valid_before` the signed certificate on disk actually carries.
    pub fn enroll_ssh_certificate(
        &mut self,
        clock: &dyn Clock,
        ssh: &config::SshCertificate,
        force_refresh_ttl_secs: u64,
    ) -> Result<(), BriefcaseError> {
        let certificate_filename = Path::new(&ssh.output_path).join(SSH_CERTIFICATE);

        tracing::debug!(filename = %certificate_filename.display(), "enrolling ssh certificate");
        let valid_before = sshcert::read_certificate_valid_before(&certificate_filename)?;

        let expiry = if valid_before == CERT_TIME_INFINITY {
            tracing::warn!(certificate = %certificate_filename.display(), "ssh certificate never expires");
            never_expires()
        } else {
            DateTime::<Utc>::from_timestamp(valid_before as i64, 0).ok_or_else(|| {
                BriefcaseError::Invalid(format!(
                    "certificate {:?} has an unrepresentable valid_before {}",
                    certificate_filename.display(),
                    valid_before
                ))
            })?
        };

        tracing::debug!(valid_before = %expiry, filename = %certificate_filename.display(), "ssh certificate validity");
        self.ssh_certificates.insert(
            ssh.output_path.clone(),
            SshCertRecord {
                config: ssh.clone(),
                expiry,
                refresh_expiry: force_refresh_expiry(clock.now(), force_refresh_ttl_secs),
            },
        );
        Ok(())
    }
}
