use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Briefcase;
use crate::clock::Clock;
use crate::config;

// STS credentials have a maximum lifetime enforced by AWS. The current expiry
// is tracked here and compared against the next sync horizon. Consumers are
// expected to tolerate credentials rotating underneath them.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentialLease {
    #[serde(rename = "config")]
    pub config: config::Aws,
    pub expiry: DateTime<Utc>,
    #[serde(rename = "refresh_expiry", skip_serializing_if = "Option::is_none")]
    pub refresh_expiry: Option<DateTime<Utc>>,
}

impl Briefcase {
    /// True when the credential for this output path is missing or will have
    /// expired by `expires_before`.
    pub fn aws_credential_expires_before(
        &self,
        aws: &config::Aws,
        expires_before: DateTime<Utc>,
    ) -> bool {
        match self.aws_credential_leases.get(&aws.output_path) {
            None => true,
            Some(entry) => entry.expiry <= expires_before,
        }
    }

    /// True when a forced-refresh deadline is set and has arrived.
    pub fn aws_credential_should_refresh_before(
        &self,
        aws: &config::Aws,
        expires_before: DateTime<Utc>,
    ) -> bool {
        self.aws_credential_leases
            .get(&aws.output_path)
            .and_then(|entry| entry.refresh_expiry)
            .map(|refresh_expiry| refresh_expiry <= expires_before)
            .unwrap_or(false)
    }

    pub fn enroll_aws_credential(
        &mut self,
        clock: &dyn Clock,
        aws: &config::Aws,
        lease_duration_secs: u64,
        force_refresh_ttl_secs: u64,
    ) {
        let now = clock.now();
        let expiry = now + Duration::seconds(lease_duration_secs as i64);
        let refresh_expiry = force_refresh_expiry(now, force_refresh_ttl_secs);

        tracing::info!(expiry = %expiry, output_path = %aws.output_path, "enrolling AWS credential");
        self.aws_credential_leases.insert(
            aws.output_path.clone(),
            AwsCredentialLease {
                config: aws.clone(),
                expiry,
                refresh_expiry,
            },
        );
    }
}

/// A forced-refresh deadline only exists when a TTL was configured.
pub(super) fn force_refresh_expiry(
    now: DateTime<Utc>,
    force_refresh_ttl_secs: u64,
) -> Option<DateTime<Utc>> {
    if force_refresh_ttl_secs == 0 {
        return None;
    }
    Some(now + Duration::seconds(force_refresh_ttl_secs as i64))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::fake::FakeClock;

    fn aws_config() -> config::Aws {
        config::Aws {
            vault_mount: "aws".to_string(),
            vault_role: "deploy".to_string(),
            profile: "default".to_string(),
            region: "us-east-1".to_string(),
            output_path: "/out/aws".to_string(),
            mode: String::new(),
        }
    }

    #[test]
    fn missing_entry_always_expires() {
        let briefcase = Briefcase::new();
        let now = Utc.with_ymd_and_hms(2021, 3, 14, 9, 0, 0).unwrap();
        assert!(briefcase.aws_credential_expires_before(&aws_config(), now));
        assert!(!briefcase.aws_credential_should_refresh_before(&aws_config(), now));
    }

    #[test]
    fn expiry_boundary_is_exact() {
        let t0 = Utc.with_ymd_and_hms(2021, 3, 14, 9, 0, 0).unwrap();
        let clock = FakeClock::at(t0);
        let mut briefcase = Briefcase::new();
        briefcase.enroll_aws_credential(&clock, &aws_config(), 3600, 0);

        assert!(!briefcase.aws_credential_expires_before(&aws_config(), t0));
        assert!(!briefcase
            .aws_credential_expires_before(&aws_config(), t0 + Duration::seconds(3599)));
        assert!(
            briefcase.aws_credential_expires_before(&aws_config(), t0 + Duration::seconds(3600))
        );
    }

    #[test]
    fn forced_refresh_deadline_applies_when_configured() {
        let t0 = Utc.with_ymd_and_hms(2021, 3, 14, 9, 0, 0).unwrap();
        let clock = FakeClock::at(t0);
        let mut briefcase = Briefcase::new();
        briefcase.enroll_aws_credential(&clock, &aws_config(), 3600, 600);

        assert!(!briefcase
            .aws_credential_should_refresh_before(&aws_config(), t0 + Duration::seconds(599)));
        assert!(briefcase
            .aws_credential_should_refresh_before(&aws_config(), t0 + Duration::seconds(600)));
        // The lease itself is still good at that point.
        assert!(!briefcase
            .aws_credential_expires_before(&aws_config(), t0 + Duration::seconds(600)));
    }
}
