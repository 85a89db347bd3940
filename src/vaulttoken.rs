use std::time::Duration;

use crate::briefcase::Briefcase;
use crate::vaultclient::{VaultApi, VaultError, WrappedToken};

/// A verified token must have at least this much life left in it.
const MIN_USABLE_TTL: Duration = Duration::from_secs(2);
/// Candidates below this get a short extension before being accepted.
const SHORT_TTL: Duration = Duration::from_secs(60);
/// The extension horizon for near-expiry candidates.
const SHORT_EXTEND_SECS: u64 = 3600;

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("no currently valid vault token available")]
    NoValidVaultTokenAvailable,
    #[error("token ttl of {0:?} is too short to be usable")]
    TtlTooShort(Duration),
    #[error("could not renew existing token to make it viable")]
    UnusableRenewal,
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Where the resolver stands. Only the resolver itself produces `Verified`;
/// everything downstream of it (the syncer, the writers) consumes a verified
/// token or nothing.
#[derive(Debug, Clone, PartialEq)]
enum TokenState {
    None,
    Candidate {
        source: &'static str,
        id: String,
    },
    Expiring {
        id: String,
        ttl: Duration,
    },
    Verified {
        token: WrappedToken,
        id: String,
        accessor: String,
    },
}

impl TokenState {
    /// For logging. Token ids are secrets; only their provenance is shown.
    fn describe(&self) -> String {
        match self {
            TokenState::None => "none".to_string(),
            TokenState::Candidate { source, id } => {
                format!("candidate from {source} ({} chars)", id.len())
            }
            TokenState::Expiring { ttl, .. } => {
                format!("expiring in {}s", ttl.as_secs())
            }
            TokenState::Verified { accessor, .. } => format!("verified accessor {accessor}"),
        }
    }
}

/// Works out which vault token to use for a pass: the briefcase's token, the
/// CLI-supplied one, or `VAULT_TOKEN`, in that order, taking the first that
/// the server confirms is alive. Candidates close to expiry are extended just
/// far enough to be used.
pub struct VaultTokenResolver<'a> {
    client: &'a dyn VaultApi,
    briefcase_candidate: Option<(String, String, bool)>,
    cli_token: String,
    cli_renewable: bool,
    state: TokenState,
}

impl<'a> VaultTokenResolver<'a> {
    pub fn new(
        client: &'a dyn VaultApi,
        briefcase: &Briefcase,
        cli_token: &str,
        cli_renewable: bool,
    ) -> Self {
        let briefcase_candidate = if briefcase.auth_token_lease.token.is_empty() {
            None
        } else {
            Some((
                briefcase.auth_token_lease.token.clone(),
                briefcase.auth_token_lease.accessor.clone(),
                briefcase.auth_token_lease.renewable,
            ))
        };

        Self {
            client,
            briefcase_candidate,
            cli_token: cli_token.to_string(),
            cli_renewable,
            state: TokenState::None,
        }
    }

    pub fn token_id(&self) -> &str {
        match &self.state {
            TokenState::Verified { id, .. } => id,
            _ => "",
        }
    }

    pub fn accessor(&self) -> &str {
        match &self.state {
            TokenState::Verified { accessor, .. } => accessor,
            _ => "",
        }
    }

    pub fn wrapped(&self) -> Option<&WrappedToken> {
        match &self.state {
            TokenState::Verified { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Adopt a token produced elsewhere (an authenticator) as verified.
    pub fn set(&mut self, token: WrappedToken) -> Result<(), TokenError> {
        let id = token.token_id()?;
        let accessor = token.token_accessor()?;
        self.state = TokenState::Verified {
            token,
            id,
            accessor,
        };
        Ok(())
    }

    /// Find a usable token among the known candidates, extending it if it is
    /// about to expire. `NoValidVaultTokenAvailable` means authentication is
    /// required.
    pub fn check_and_refresh(&mut self) -> Result<(), TokenError> {
        let token = self.determine_vault_token().map_err(|err| {
            tracing::debug!(state = %self.state.describe(), "token resolution stopped");
            err
        })?;
        self.set(token)?;
        tracing::debug!(state = %self.state.describe(), "token resolution finished");
        Ok(())
    }

    fn determine_vault_token(&mut self) -> Result<WrappedToken, TokenError> {
        if let Some((token, accessor, renewable)) = self.briefcase_candidate.clone() {
            tracing::info!(source = "briefcase", accessor, "testing if token is usable");
            self.state = TokenState::Candidate {
                source: "briefcase",
                id: token.clone(),
            };
            match self.try_token(&token) {
                Ok(secret) => {
                    tracing::debug!(source = "briefcase", "current briefcase token is usable");
                    return Ok(WrappedToken::new(secret, renewable));
                }
                Err(err) => {
                    tracing::warn!(source = "briefcase", accessor, error = %err, "current briefcase token is not usable");
                }
            }
        }

        if !self.cli_token.is_empty() {
            tracing::info!(source = "cli-arg", "testing if --vault-token is usable");
            self.state = TokenState::Candidate {
                source: "cli-arg",
                id: self.cli_token.clone(),
            };
            match self.try_token(&self.cli_token.clone()) {
                Ok(secret) => {
                    tracing::debug!(
                        source = "cli-arg",
                        renewable = self.cli_renewable,
                        "current cli token is usable"
                    );
                    return Ok(WrappedToken::new(secret, self.cli_renewable));
                }
                Err(err) => {
                    tracing::info!(source = "cli-arg", error = %err, "current cli token is not usable");
                }
            }
        }

        if let Ok(env_token) = std::env::var("VAULT_TOKEN") {
            if !env_token.is_empty() {
                tracing::info!(source = "env", "testing if VAULT_TOKEN is usable");
                self.state = TokenState::Candidate {
                    source: "env",
                    id: env_token.clone(),
                };
                match self.try_token(&env_token) {
                    Ok(secret) => {
                        tracing::debug!(source = "env", "current VAULT_TOKEN is usable");
                        return Ok(WrappedToken::new(secret, env_token_renewable()));
                    }
                    Err(err) => {
                        tracing::info!(source = "env", error = %err, "current VAULT_TOKEN is not usable");
                    }
                }
            }
        }

        tracing::debug!("no current vault token available");
        self.state = TokenState::None;
        Err(TokenError::NoValidVaultTokenAvailable)
    }

    /// Verify a candidate against the server. Tokens with less than a minute
    /// left are renewed to a usable horizon; the renewal must actually take
    /// or the candidate is rejected.
    fn try_token(&mut self, token: &str) -> Result<crate::vaultclient::VaultSecret, TokenError> {
        let secret = self.client.verify_token(token)?;
        let ttl = secret.token_ttl()?;

        tracing::debug!(ttl_secs = ttl.as_secs(), "checking token ttl");

        if ttl <= MIN_USABLE_TTL {
            return Err(TokenError::TtlTooShort(ttl));
        }

        if ttl < SHORT_TTL {
            self.state = TokenState::Expiring {
                id: token.to_string(),
                ttl,
            };
            let renewed = self.client.renew_token_as_self(token, SHORT_EXTEND_SECS)?;
            let renewed_ttl = renewed.token_ttl()?;
            if renewed_ttl <= SHORT_TTL {
                tracing::error!(
                    ttl_secs = renewed_ttl.as_secs(),
                    "renewed token was given a ttl that is too short"
                );
                return Err(TokenError::UnusableRenewal);
            }
            return Ok(renewed);
        }

        Ok(secret)
    }
}

/// Tokens from the environment are assumed renewable unless TOKEN_RENEWABLE
/// says otherwise.
fn env_token_renewable() -> bool {
    match std::env::var("TOKEN_RENEWABLE") {
        Err(_) => true,
        Ok(raw) => match raw.parse::<bool>() {
            Ok(renewable) => renewable,
            Err(_) => {
                tracing::warn!(
                    value = raw,
                    "environment variable TOKEN_RENEWABLE is not parseable as boolean - ignoring"
                );
                true
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::test_support::{ScopedEnvVar, ENV_LOCK};
    use crate::vaultclient::testing::{token_secret, FakeVaultApi};

    use chrono::{TimeZone, Utc};

    fn clock() -> FakeClock {
        FakeClock::at(Utc.with_ymd_and_hms(2021, 3, 14, 9, 0, 0).unwrap())
    }

    fn briefcase_with_token(fake: &FakeVaultApi, id: &str) -> Briefcase {
        let clock = clock();
        fake.set_lookup(id, token_secret(id, 32400, true));
        let mut briefcase = Briefcase::new();
        briefcase
            .enroll_auth_token(
                &clock,
                &WrappedToken::new(token_secret(id, 32400, true), true),
            )
            .unwrap();
        briefcase
    }

    #[test]
    fn fresh_resolver_has_no_token() {
        let fake = FakeVaultApi::new();
        let briefcase = Briefcase::new();
        let resolver = VaultTokenResolver::new(&fake, &briefcase, "", true);
        assert_eq!(resolver.token_id(), "");
        assert_eq!(resolver.accessor(), "");
        assert!(resolver.wrapped().is_none());
    }

    #[test]
    fn set_adopts_a_token_as_verified() {
        let fake = FakeVaultApi::new();
        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "", true);

        resolver
            .set(WrappedToken::new(token_secret("token-1", 3600, true), true))
            .unwrap();
        assert_eq!(resolver.token_id(), "token-1");
        assert_eq!(resolver.accessor(), "accessor:token-1");
    }

    #[test]
    fn briefcase_token_wins_when_valid() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let fake = FakeVaultApi::new();
        let briefcase = briefcase_with_token(&fake, "token-1");

        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "cli-token", true);
        resolver.check_and_refresh().unwrap();
        assert_eq!(resolver.token_id(), "token-1");
    }

    #[test]
    fn bad_briefcase_token_falls_back_to_cli() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        // The briefcase has a token enrolled, but the server used for this
        // pass no longer recognizes it.
        let enrolled = FakeVaultApi::new();
        let briefcase = briefcase_with_token(&enrolled, "token-1");

        let fake = FakeVaultApi::new();
        fake.set_lookup("cli-token", token_secret("cli-token", 32400, true));

        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "cli-token", false);
        resolver.check_and_refresh().unwrap();
        assert_eq!(resolver.token_id(), "cli-token");
        assert!(!resolver.wrapped().unwrap().renewable);
    }

    #[test]
    fn env_token_renewability_honors_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _env_token = ScopedEnvVar::set("VAULT_TOKEN", "env-token");
        let _renewable = ScopedEnvVar::set("TOKEN_RENEWABLE", "false");

        let fake = FakeVaultApi::new();
        fake.set_lookup("env-token", token_secret("env-token", 32400, true));

        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "", true);
        resolver.check_and_refresh().unwrap();
        assert_eq!(resolver.token_id(), "env-token");
        assert!(!resolver.wrapped().unwrap().renewable);
    }

    #[test]
    fn unparseable_renewable_override_defaults_to_true() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _env_token = ScopedEnvVar::set("VAULT_TOKEN", "env-token");
        let _renewable = ScopedEnvVar::set("TOKEN_RENEWABLE", "not-a-bool");

        let fake = FakeVaultApi::new();
        fake.set_lookup("env-token", token_secret("env-token", 32400, true));

        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "", true);
        resolver.check_and_refresh().unwrap();
        assert!(resolver.wrapped().unwrap().renewable);
    }

    #[test]
    fn no_candidates_reports_no_valid_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let fake = FakeVaultApi::new();
        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "", true);

        let err = resolver.check_and_refresh().unwrap_err();
        assert!(matches!(err, TokenError::NoValidVaultTokenAvailable));
    }

    #[test]
    fn short_ttl_tokens_are_extended() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let fake = FakeVaultApi::new();
        fake.set_lookup("cli-token", token_secret("cli-token", 30, true));
        fake.set_renewal("cli-token", token_secret("cli-token", 3600, true));

        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "cli-token", true);
        resolver.check_and_refresh().unwrap();

        assert_eq!(resolver.token_id(), "cli-token");
        assert_eq!(
            resolver.wrapped().unwrap().token_ttl().unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn failed_extension_rejects_the_candidate() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let fake = FakeVaultApi::new();
        fake.set_lookup("cli-token", token_secret("cli-token", 30, true));
        // Renewal "succeeds" but comes back just as short.
        fake.set_renewal("cli-token", token_secret("cli-token", 45, true));

        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "cli-token", true);
        let err = resolver.check_and_refresh().unwrap_err();
        assert!(matches!(err, TokenError::NoValidVaultTokenAvailable));
    }

    #[test]
    fn two_second_ttl_is_not_usable() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let fake = FakeVaultApi::new();
        fake.set_lookup("cli-token", token_secret("cli-token", 2, true));

        let briefcase = Briefcase::new();
        let mut resolver = VaultTokenResolver::new(&fake, &briefcase, "cli-token", true);
        let err = resolver.check_and_refresh().unwrap_err();
        assert!(matches!(err, TokenError::NoValidVaultTokenAvailable));
    }
}
