use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::briefcase::{Briefcase, BriefcaseError, SimpleSecret};
use crate::clock::{Clock, SharedClock};
use crate::config::{self, LoadedConfig, SecretLifetime};
use crate::metrics::Metrics;
use crate::output::{self, OutputError};
use crate::vaultclient::auth::{AuthError, AuthMethod};
use crate::vaultclient::sshcert::{self, SshCertError};
use crate::vaultclient::{sts, VaultApi, VaultError, WrappedToken};
use crate::vaulttoken::{TokenError, VaultTokenResolver};

/// The grace window for version-scoped secrets: a version newer than ours is
/// only adopted once it has been sitting in the vault this long, which
/// suppresses races with a writer mid-rotation.
const VERSION_GRACE_SECS: i64 = 30;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Briefcase(#[from] BriefcaseError),
    #[error(transparent)]
    SshCert(#[from] SshCertError),
    #[error("no valid vault token available and no authentication mechanism configured")]
    NoAuthConfigured,
    #[error("sync cancelled")]
    Cancelled,
    #[error("{0}")]
    Invalid(String),
}

/// Per-run knobs the syncer needs beyond the declarative config.
#[derive(Clone)]
pub struct SyncerOptions {
    pub briefcase_path: PathBuf,
    pub vault_token: String,
    pub vault_token_renewable: bool,
    pub auth: Option<AuthMethod>,
    pub sts_ttl_secs: u64,
    pub force_refresh_ttl_secs: u64,
}

/// Orchestrates one reconciliation pass: obtain a valid token, diff the
/// declared config against the briefcase, fetch and write whatever is stale,
/// persist the briefcase. The syncer owns all of its dependencies; nothing
/// here reads ambient global state.
pub struct Syncer {
    config: LoadedConfig,
    client: Arc<dyn VaultApi>,
    briefcase: Briefcase,
    metrics: Arc<Metrics>,
    clock: SharedClock,
    options: SyncerOptions,
    cancel: Arc<AtomicBool>,
}

impl Syncer {
    pub fn new(
        config: LoadedConfig,
        client: Arc<dyn VaultApi>,
        briefcase: Briefcase,
        metrics: Arc<Metrics>,
        clock: SharedClock,
        options: SyncerOptions,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            client,
            briefcase,
            metrics,
            clock,
            options,
            cancel,
        }
    }

    pub fn briefcase(&self) -> &Briefcase {
        &self.briefcase
    }

    /// One full pass. `next_sync` is the time by which the next pass is
    /// expected; anything expiring before it gets refreshed now.
    pub fn perform_sync(&mut self, next_sync: DateTime<Utc>) -> Result<(), SyncError> {
        let token = self.obtain_vault_token()?;
        let token_id = token.token_id().map_err(TokenError::from)?;

        self.client.set_token(&token_id);

        // If the token differs from the briefcase's, the briefcase is reset
        // so everything non-static gets recreated under the new token. This
        // is the only place token-scoped freshness is dropped.
        if self.briefcase.auth_token_lease.token != token_id {
            tracing::debug!("briefcase token differs from current token, resetting briefcase");
            self.metrics.briefcase_reset.inc();
            self.briefcase = self.briefcase.reset();
            if !self.config.vault.vault_token.output.is_empty() {
                output::write_vault_token(&self.metrics, &self.config.vault.vault_token, &token_id)?;
            }
            self.briefcase.enroll_auth_token(self.clock.as_ref(), &token)?;
        }

        if self.briefcase.should_refresh_auth_token(self.clock.as_ref()) {
            self.refresh_auth_token()?;
        }

        self.compare_config_to_briefcase(next_sync)?;

        self.briefcase.save(&self.options.briefcase_path)?;
        Ok(())
    }

    /// Renew the current token against the server. Permission denied means
    /// the token is terminally unusable: attempt full re-authentication and
    /// carry on under the new identity.
    fn refresh_auth_token(&mut self) -> Result<(), SyncError> {
        tracing::debug!("refreshing vault token against server");
        match self.client.refresh_token() {
            Ok(secret) => {
                self.metrics.vault_token_refreshed.inc();
                let renewable = self.briefcase.auth_token_lease.renewable;
                self.briefcase
                    .enroll_auth_token(self.clock.as_ref(), &WrappedToken::new(secret, renewable))?;
                Ok(())
            }
            Err(VaultError::PermissionDenied) => {
                tracing::warn!("token renewal was denied - attempting full re-authentication");
                let fresh = self.authenticate()?;
                let fresh_id = fresh.token_id().map_err(TokenError::from)?;
                self.client.set_token(&fresh_id);
                self.metrics.briefcase_reset.inc();
                self.briefcase = self.briefcase.reset();
                if !self.config.vault.vault_token.output.is_empty() {
                    output::write_vault_token(
                        &self.metrics,
                        &self.config.vault.vault_token,
                        &fresh_id,
                    )?;
                }
                self.briefcase.enroll_auth_token(self.clock.as_ref(), &fresh)?;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "could not refresh vault token");
                Err(err.into())
            }
        }
    }

    /// Find a token worth using: an existing one if any candidate checks out,
    /// otherwise a fresh one from the configured authentication mechanism.
    fn obtain_vault_token(&self) -> Result<WrappedToken, SyncError> {
        let client = Arc::clone(&self.client);
        tracing::info!(vault_addr = %client.address(), "obtaining vault token");

        let mut resolver = VaultTokenResolver::new(
            client.as_ref(),
            &self.briefcase,
            &self.options.vault_token,
            self.options.vault_token_renewable,
        );

        let result = match resolver.check_and_refresh() {
            Ok(()) => Ok(()),
            Err(TokenError::NoValidVaultTokenAvailable) => {
                tracing::debug!("no vault token already available, performing authentication");
                match self.authenticate() {
                    Ok(token) => {
                        let accessor = token.token_accessor().unwrap_or_default();
                        tracing::info!(accessor, "authentication successful");
                        resolver.set(token).map_err(SyncError::from)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "could not establish vault token");
                Err(err.into())
            }
        };

        if let Err(err) = result {
            self.metrics.vault_token_errors.inc();
            return Err(err);
        }

        tracing::info!(accessor = resolver.accessor(), "using valid token");
        resolver
            .wrapped()
            .cloned()
            .ok_or_else(|| SyncError::Invalid("token resolver produced no token".to_string()))
    }

    fn authenticate(&self) -> Result<WrappedToken, SyncError> {
        let auth = self.options.auth.as_ref().ok_or(SyncError::NoAuthConfigured)?;
        auth.authenticate(self.client.as_ref(), self.clock.as_ref())
            .map_err(|err| {
                tracing::error!(error = %err, "authentication failed");
                SyncError::Auth(err)
            })
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Compare everything the config declares against what the briefcase
    /// knows to be fresh, refreshing the differences.
    fn compare_config_to_briefcase(&mut self, next_sync: DateTime<Utc>) -> Result<(), SyncError> {
        let mut updates = 0usize;

        self.compare_aws(&mut updates, next_sync)?;
        self.compare_ssh_certificates(&mut updates, next_sync)?;
        self.compare_templates(&mut updates)?;
        self.compare_secrets(&mut updates)?;
        self.compare_composites(&mut updates)?;

        tracing::info!(updates, "done comparing configuration against briefcase");
        Ok(())
    }

    fn compare_aws(
        &mut self,
        updates: &mut usize,
        next_sync: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let aws_configs = self.config.vault.aws.clone();
        for aws in &aws_configs {
            self.check_cancelled()?;
            tracing::debug!(output_path = %aws.output_path, "checking AWS STS credential");

            let forced = self.briefcase.aws_credential_should_refresh_before(aws, next_sync);
            let expiring = self.briefcase.aws_credential_expires_before(aws, next_sync);
            if !forced && !expiring {
                continue;
            }
            *updates += 1;

            tracing::debug!(
                forced_refresh_before_next_heartbeat = forced,
                credential_expires_before_next_heartbeat = expiring,
                "refreshing AWS STS credential"
            );

            let (creds, lease) = sts::fetch_aws_sts_credential(
                self.client.as_ref(),
                aws,
                self.options.sts_ttl_secs,
            )?;
            output::write_aws_credentials_files(&creds, aws)?;
            self.briefcase.enroll_aws_credential(
                self.clock.as_ref(),
                aws,
                lease.secret.lease_duration,
                self.options.force_refresh_ttl_secs,
            );
        }
        Ok(())
    }

    fn compare_ssh_certificates(
        &mut self,
        updates: &mut usize,
        next_sync: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let ssh_configs = self.config.vault.ssh_certificates.clone();
        for ssh in &ssh_configs {
            self.check_cancelled()?;
            tracing::debug!(output_path = %ssh.output_path, "checking SSH certificate");

            if !self.briefcase.should_refresh_ssh_certificate(ssh, next_sync) {
                continue;
            }
            *updates += 1;
            tracing::debug!("refreshing ssh certificate");

            sshcert::create_ssh_certificate(self.client.as_ref(), ssh)?;
            self.briefcase.enroll_ssh_certificate(
                self.clock.as_ref(),
                ssh,
                self.options.force_refresh_ttl_secs,
            )?;
        }
        Ok(())
    }

    fn compare_templates(&mut self, updates: &mut usize) -> Result<(), SyncError> {
        let templates = self.config.vault.templates.clone();
        for tpl in &templates {
            self.check_cancelled()?;
            tracing::debug!(input = %tpl.input, "checking template");

            if !self.briefcase.should_refresh_template(tpl) {
                continue;
            }
            *updates += 1;
            tracing::debug!("refreshing template");

            if tpl.lifetime() == SecretLifetime::Token {
                self.cache_secrets(SecretLifetime::Token)?;
            }
            self.cache_secrets(SecretLifetime::Static)?;

            let parsed = self.config.templates.get(&tpl.input).ok_or_else(|| {
                SyncError::Invalid(format!("no ingested template for {:?}", tpl.input))
            })?;
            output::write_template(tpl, parsed, &self.briefcase.cache)?;
            self.metrics.secret_updates.inc();

            tracing::debug!("enrolling template");
            self.briefcase.enroll_template(tpl);
        }
        Ok(())
    }

    fn compare_secrets(&mut self, updates: &mut usize) -> Result<(), SyncError> {
        let secrets = self.config.vault.secrets.clone();
        for secret in &secrets {
            self.check_cancelled()?;
            tracing::debug!(key = %secret.key, path = %secret.path, "checking secret");

            match secret.lifetime() {
                SecretLifetime::Version => self.sync_versioned_secret(secret, updates)?,
                SecretLifetime::Token | SecretLifetime::Static => {
                    if !self.briefcase.should_refresh_secret(secret) {
                        continue;
                    }
                    tracing::debug!("refreshing secret");

                    if secret.lifetime() == SecretLifetime::Token {
                        self.cache_secrets(SecretLifetime::Token)?;
                    }
                    self.cache_secrets(SecretLifetime::Static)?;

                    let kv_secrets = self.active_secret_view(secret.lifetime());
                    let count = output::write_secret_fields(secret, &kv_secrets)?;
                    self.metrics.secret_updates.inc_by(count as u64);
                    *updates += count;
                    self.briefcase.enroll_secret(secret);
                }
            }
        }
        Ok(())
    }

    /// Version-lifetime secrets are re-read every pass and rewritten when the
    /// server's version moves past ours, subject to the grace window.
    fn sync_versioned_secret(
        &mut self,
        secret: &config::Secret,
        updates: &mut usize,
    ) -> Result<(), SyncError> {
        let simple_secrets = self.read_secret(secret)?;
        let first = match simple_secrets.first() {
            Some(first) => first,
            None => {
                tracing::warn!(key = %secret.key, "no fields returned for secret");
                return Ok(());
            }
        };

        let server_version = first.version.ok_or_else(|| {
            SyncError::Invalid(format!(
                "no version number associated with secret {:?} and lifetime is version",
                secret.key
            ))
        })?;
        let created_time = first.created_time.ok_or_else(|| {
            SyncError::Invalid(format!(
                "no creation time associated with secret {:?} and lifetime is version",
                secret.key
            ))
        })?;

        let briefcase_version = self.briefcase.versioned_secret(&secret.path);
        let now = self.clock.now();

        tracing::debug!(
            secret_version = server_version,
            briefcase_secret_version = briefcase_version,
            secret_timestamp = %created_time,
            now = %now,
            "comparing briefcase version of secret to current version"
        );

        let settled = created_time + Duration::seconds(VERSION_GRACE_SECS) < now;
        if briefcase_version == 0 || (briefcase_version < server_version && settled) {
            let count = output::write_secret_fields(secret, &simple_secrets)?;
            self.metrics.secret_updates.inc_by(count as u64);
            *updates += count;

            if count > 0 && !secret.touchfile.is_empty() {
                if let Err(err) = output::touch_file(&secret.touchfile) {
                    tracing::warn!(touchfile = %secret.touchfile, error = %err, "failed to touch touchfile");
                }
            }
            self.briefcase
                .record_versioned_secret(&secret.path, server_version);
        } else {
            tracing::debug!("not updating secret");
        }
        Ok(())
    }

    fn compare_composites(&mut self, updates: &mut usize) -> Result<(), SyncError> {
        let composites: Vec<config::CompositeSecretFile> =
            self.config.composites.values().cloned().collect();
        for composite in &composites {
            self.check_cancelled()?;
            tracing::debug!(filename = %composite.filename, "checking composite secret");

            if !self.briefcase.should_refresh_composite(composite) {
                continue;
            }
            *updates += 1;
            tracing::debug!("refreshing composite");

            if composite.lifetime == SecretLifetime::Token {
                self.cache_secrets(SecretLifetime::Token)?;
            }
            self.cache_secrets(SecretLifetime::Static)?;

            output::write_composite(composite, &self.briefcase.cache)?;
            self.metrics.secret_updates.inc();

            tracing::debug!("enrolling composite secret");
            self.briefcase.enroll_composite(composite);
        }
        Ok(())
    }

    /// The secrets a static or token scoped artifact gets to see: static plus
    /// version always, token only for token-scoped artifacts.
    fn active_secret_view(&self, lifetime: SecretLifetime) -> Vec<SimpleSecret> {
        let cache = &self.briefcase.cache;
        let mut kv_secrets: Vec<SimpleSecret> = Vec::new();
        kv_secrets.extend_from_slice(cache.get(SecretLifetime::Static));
        kv_secrets.extend_from_slice(cache.get(SecretLifetime::Version));
        if lifetime == SecretLifetime::Token {
            kv_secrets.extend_from_slice(cache.get(SecretLifetime::Token));
        }
        kv_secrets
    }

    /// Fetch every configured secret of the given lifetime into the cache,
    /// unless it is already populated for this pass.
    fn cache_secrets(&mut self, lifetime: SecretLifetime) -> Result<(), SyncError> {
        if self.briefcase.cache.has_cached(lifetime) {
            return Ok(());
        }

        let mut simple_secrets = Vec::new();
        let secrets = self.config.vault.secrets.clone();
        for secret in secrets.iter().filter(|s| s.lifetime() == lifetime) {
            let data = self.read_secret(secret)?;
            simple_secrets.extend(data);
        }

        self.briefcase.cache.store(lifetime, simple_secrets);
        Ok(())
    }

    /// Read one secret from the vault and expand it to one SimpleSecret per
    /// field, extracting KV v2 metadata when the secret's configuration
    /// requires it.
    fn read_secret(&self, secret: &config::Secret) -> Result<Vec<SimpleSecret>, SyncError> {
        let config_version = self.config.vault.version;

        if config_version < 2 && secret.needs_metadata() {
            tracing::error!(
                key = %secret.key,
                "metadata is needed to process this secret, but metadata is only available for config files version 2 and above"
            );
            return Err(SyncError::Invalid(format!(
                "secret {:?} requires metadata, but config version {} predates metadata support",
                secret.key, config_version
            )));
        }

        let path = if secret.path.starts_with('/') {
            secret.path.clone()
        } else {
            format!(
                "{}/{}",
                self.client
                    .service_secret_prefix(config_version)
                    .trim_end_matches('/'),
                secret.path
            )
        };

        tracing::info!(path = %path, vault_addr = %self.client.address(), "fetching secret");

        let response = if let Some(pinned) = secret.pinned_version {
            tracing::debug!(pinned_version = pinned, "fetching specific version");
            let mut params = BTreeMap::new();
            params.insert("version".to_string(), vec![pinned.to_string()]);
            self.client.read_with_data(&path, &params)?
        } else {
            self.client.read(&path)?
        };

        let response = match response {
            Some(response) => response,
            None => {
                // For migration purposes, some secrets are allowed to not
                // exist yet.
                if secret.missing_ok {
                    tracing::info!(
                        path = %path,
                        "no response reading secret (either access is denied or there is no secret). Ignoring since missingOk is set"
                    );
                    return Ok(Vec::new());
                }
                return Err(SyncError::Invalid(format!(
                    "no response returned fetching secret {path:?}"
                )));
            }
        };

        // KV v1 returns the fields directly under "data". KV v2 nests them:
        // "data" holds a "data" submap of fields and a "metadata" submap.
        // This breaks if a KV v1 secret has fields named data and metadata.
        let sub_data = response.data.get("data").and_then(Value::as_object);
        let sub_metadata = response.data.get("metadata").and_then(Value::as_object);

        let (secret_data, metadata) = if config_version >= 2 {
            match (sub_data, sub_metadata) {
                (Some(data), Some(metadata)) => (data.clone(), Some(metadata.clone())),
                _ if secret.needs_metadata() => {
                    return Err(SyncError::Invalid(format!(
                        "error getting KVv2 secret {path:?}: probably not in a KVv2 path"
                    )));
                }
                _ => (response.data.clone(), None),
            }
        } else {
            (response.data.clone(), None)
        };

        let (version, created_time) = match &metadata {
            Some(metadata) => {
                tracing::debug!("retrieved metadata");
                (
                    Some(metadata_version(metadata, &path)?),
                    Some(metadata_created_time(metadata, &path)?),
                )
            }
            None => {
                tracing::debug!("no metadata retrieved");
                (None, None)
            }
        };

        let simple_secrets = secret_data
            .into_iter()
            .map(|(field, value)| SimpleSecret {
                key: secret.key.clone(),
                field,
                value,
                version,
                created_time,
            })
            .collect();

        Ok(simple_secrets)
    }
}

/// KV v2 metadata versions arrive as JSON numbers, floats, or strings
/// depending on the server and proxy in between.
fn metadata_version(
    metadata: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<i64, SyncError> {
    let value = metadata
        .get("version")
        .ok_or_else(|| SyncError::Invalid(format!("no version metadata field for secret {path:?}")))?;

    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            SyncError::Invalid(format!(
                "could not convert version {value:?} of secret {path:?} to integer"
            ))
        })
}

fn metadata_created_time(
    metadata: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<DateTime<Utc>, SyncError> {
    let raw = metadata
        .get("created_time")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            SyncError::Invalid(format!("no created_time field for secret {path:?}"))
        })?;

    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            SyncError::Invalid(format!(
                "unable to parse created_time timestamp {raw:?} for secret {path:?}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::test_support::{ScopedEnvVar, ENV_LOCK};
    use crate::vaultclient::testing::{token_secret, FakeVaultApi};
    use crate::vaultclient::VaultSecret;

    struct Harness {
        fake: Arc<FakeVaultApi>,
        clock: Arc<FakeClock>,
        metrics: Arc<Metrics>,
        briefcase_path: PathBuf,
        _tmp: tempfile::TempDir,
        out_dir: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let fake = Arc::new(FakeVaultApi::new());
            fake.set_lookup("unit-test-token", token_secret("unit-test-token", 32400, true));
            Self {
                fake,
                clock: Arc::new(FakeClock::at(
                    Utc.with_ymd_and_hms(2021, 3, 14, 9, 0, 0).unwrap(),
                )),
                metrics: Arc::new(Metrics::new()),
                briefcase_path: tmp.path().join("briefcase.json"),
                out_dir: tmp.path().join("out"),
                _tmp: tmp,
            }
        }

        fn load_config(&self, yaml: &str) -> LoadedConfig {
            let path = self.out_dir.join("vaultsync.yaml");
            std::fs::create_dir_all(&self.out_dir).unwrap();
            std::fs::write(&path, yaml).unwrap();
            config::load(
                path.to_str().unwrap(),
                "",
                self.out_dir.to_str().unwrap(),
            )
            .unwrap()
        }

        fn syncer(&self, config: LoadedConfig, briefcase: Briefcase) -> Syncer {
            Syncer::new(
                config,
                self.fake.clone(),
                briefcase,
                self.metrics.clone(),
                self.clock.clone(),
                SyncerOptions {
                    briefcase_path: self.briefcase_path.clone(),
                    vault_token: "unit-test-token".to_string(),
                    vault_token_renewable: true,
                    auth: None,
                    sts_ttl_secs: 0,
                    force_refresh_ttl_secs: 0,
                },
                Arc::new(AtomicBool::new(false)),
            )
        }
    }

    fn kv2_response(fields: &[(&str, &str)], version: i64, created: DateTime<Utc>) -> VaultSecret {
        let mut data = serde_json::Map::new();
        for (name, value) in fields {
            data.insert(name.to_string(), Value::from(*value));
        }
        let mut outer = serde_json::Map::new();
        outer.insert("data".to_string(), Value::Object(data));
        outer.insert(
            "metadata".to_string(),
            serde_json::json!({
                "version": version,
                "created_time": created.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                "destroyed": false,
            }),
        );
        VaultSecret {
            data: outer,
            ..Default::default()
        }
    }

    #[test]
    fn empty_config_init_resets_briefcase_once() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let config = harness.load_config("version: 3\n");
        let mut syncer = harness.syncer(config, Briefcase::new());

        syncer
            .perform_sync(harness.clock.now() + Duration::hours(24))
            .unwrap();

        assert_eq!(harness.metrics.briefcase_reset.get(), 1);
        assert_eq!(harness.metrics.vault_token_written.get(), 0);
        assert_eq!(harness.metrics.secret_updates.get(), 0);

        assert_eq!(syncer.briefcase().auth_token_lease.token, "unit-test-token");
        assert!(harness.briefcase_path.exists());
    }

    #[test]
    fn second_pass_with_same_token_does_not_reset() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let config = harness.load_config("version: 3\n");
        let mut syncer = harness.syncer(config, Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        let config = harness.load_config("version: 3\n");
        let briefcase = Briefcase::load(&harness.briefcase_path);
        let mut syncer = harness.syncer(config, briefcase);
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        assert_eq!(harness.metrics.briefcase_reset.get(), 1);
    }

    #[test]
    fn pinned_version_secret_is_fetched_exactly_once() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let full_path = "/kv/data/application-config/services/path/in/vault";
        harness.fake.set_versioned_read(
            full_path,
            "3",
            kv2_response(
                &[("some-field", "some-value")],
                3,
                harness.clock.now() - Duration::hours(1),
            ),
        );

        let config = harness.load_config(concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: example\n",
            "    path: path/in/vault\n",
            "    pinnedVersion: 3\n",
            "    output: example-output\n",
            "    lifetime: static\n",
            "    mode: \"0700\"\n",
        ));
        let mut syncer = harness.syncer(config, Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        let log = harness.fake.read_with_data_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, full_path);
        assert_eq!(log[0].1.get("version").unwrap(), &vec!["3".to_string()]);
        assert!(harness.fake.read_log.lock().unwrap().is_empty());

        let output = harness.out_dir.join("example-output");
        assert!(output.exists());
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written["some-field"], "some-value");

        assert_eq!(harness.metrics.secret_updates.get(), 1);
    }

    #[test]
    fn versioned_secret_upgrades_after_grace_window() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let full_path = "/kv/data/application-config/services/exampleSecret";
        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: exampleSecret\n",
            "    path: exampleSecret\n",
            "    lifetime: version\n",
            "    mode: \"0600\"\n",
            "    fields:\n",
            "      - name: foo\n",
            "        output: foo\n",
        );

        // Pass 1 sees version 3, written long ago.
        harness.fake.set_read(
            full_path,
            kv2_response(&[("foo", "aaaa")], 3, harness.clock.now() - Duration::hours(2)),
        );
        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        let foo = harness.out_dir.join("foo");
        assert_eq!(std::fs::read_to_string(&foo).unwrap(), "aaaa");
        assert_eq!(syncer.briefcase().versioned_secret("exampleSecret"), 3);

        // Pass 2 sees version 4, created 31 seconds ago: old enough to adopt.
        harness.fake.set_read(
            full_path,
            kv2_response(
                &[("foo", "aaaa2")],
                4,
                harness.clock.now() - Duration::seconds(31),
            ),
        );
        let briefcase = Briefcase::load(&harness.briefcase_path);
        let mut syncer = harness.syncer(harness.load_config(yaml), briefcase);
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        assert_eq!(std::fs::read_to_string(&foo).unwrap(), "aaaa2");
        assert_eq!(syncer.briefcase().versioned_secret("exampleSecret"), 4);
    }

    #[test]
    fn fresh_versioned_secret_is_suppressed_inside_grace_window() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let full_path = "/kv/data/application-config/services/exampleSecret";
        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: exampleSecret\n",
            "    path: exampleSecret\n",
            "    lifetime: version\n",
            "    mode: \"0600\"\n",
            "    touchfile: secrets-updated\n",
            "    fields:\n",
            "      - name: foo\n",
            "        output: foo\n",
        );

        harness.fake.set_read(
            full_path,
            kv2_response(&[("foo", "aaaa")], 3, harness.clock.now() - Duration::hours(2)),
        );
        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        let updates_after_first_pass = harness.metrics.secret_updates.get();
        let touchfile = harness.out_dir.join("secrets-updated");
        std::fs::remove_file(&touchfile).unwrap();

        // Version 4 appears, but it is only 10 seconds old.
        harness.fake.set_read(
            full_path,
            kv2_response(
                &[("foo", "aaaa2")],
                4,
                harness.clock.now() - Duration::seconds(10),
            ),
        );
        let briefcase = Briefcase::load(&harness.briefcase_path);
        let mut syncer = harness.syncer(harness.load_config(yaml), briefcase);
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        let foo = harness.out_dir.join("foo");
        assert_eq!(std::fs::read_to_string(&foo).unwrap(), "aaaa");
        assert!(!touchfile.exists());
        assert_eq!(harness.metrics.secret_updates.get(), updates_after_first_pass);
        assert_eq!(syncer.briefcase().versioned_secret("exampleSecret"), 3);
    }

    #[test]
    fn static_secrets_are_not_refetched_once_enrolled() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let full_path = "/kv/data/application-config/services/db";
        harness.fake.set_read(
            full_path,
            kv2_response(
                &[("password", "hunter2")],
                1,
                harness.clock.now() - Duration::hours(1),
            ),
        );

        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: db\n",
            "    path: db\n",
            "    lifetime: static\n",
            "    mode: \"0600\"\n",
            "    fields:\n",
            "      - name: password\n",
            "        output: db-password\n",
        );

        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();
        assert_eq!(harness.fake.read_log.lock().unwrap().len(), 1);

        // Second pass, same token, same briefcase: nothing is stale.
        let briefcase = Briefcase::load(&harness.briefcase_path);
        let mut syncer = harness.syncer(harness.load_config(yaml), briefcase);
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();
        assert_eq!(harness.fake.read_log.lock().unwrap().len(), 1);

        assert_eq!(
            std::fs::read_to_string(harness.out_dir.join("db-password")).unwrap(),
            "hunter2"
        );
    }

    #[test]
    fn missing_secret_with_missing_ok_is_not_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: optional\n",
            "    path: optional\n",
            "    lifetime: static\n",
            "    missingOk: true\n",
            "    fields:\n",
            "      - name: value\n",
            "        output: optional-value\n",
        );

        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        assert!(!harness.out_dir.join("optional-value").exists());
        assert_eq!(harness.metrics.secret_updates.get(), 0);
    }

    #[test]
    fn missing_metadata_for_versioned_secret_fails_the_pass() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let full_path = "/kv/data/application-config/services/flat";
        // A KV v1 style response: fields directly in data, no metadata.
        let mut flat = VaultSecret::default();
        flat.data.insert("foo".to_string(), Value::from("bar"));
        harness.fake.set_read(full_path, flat);

        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: flat\n",
            "    path: flat\n",
            "    lifetime: version\n",
            "    fields:\n",
            "      - name: foo\n",
            "        output: foo\n",
        );

        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        let err = syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
    }

    #[test]
    fn token_change_rewrites_token_scoped_artifacts_only() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let static_path = "/kv/data/application-config/services/static-secret";
        let token_path = "/kv/data/application-config/services/token-secret";
        harness.fake.set_read(
            static_path,
            kv2_response(&[("s", "sv")], 1, harness.clock.now() - Duration::hours(1)),
        );
        harness.fake.set_read(
            token_path,
            kv2_response(&[("t", "tv")], 1, harness.clock.now() - Duration::hours(1)),
        );

        let yaml = concat!(
            "version: 2\n",
            "secrets:\n",
            "  - key: static-secret\n",
            "    path: static-secret\n",
            "    lifetime: static\n",
            "    fields:\n",
            "      - name: s\n",
            "        output: s-out\n",
            "  - key: token-secret\n",
            "    path: token-secret\n",
            "    lifetime: token\n",
            "    fields:\n",
            "      - name: t\n",
            "        output: t-out\n",
        );

        let mut syncer = harness.syncer(harness.load_config(yaml), Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();
        let reads_after_first = harness.fake.read_log.lock().unwrap().len();
        assert_eq!(reads_after_first, 2);

        // A new token appears; the pass resets the briefcase, so the token
        // scoped secret is refetched but the static one is not.
        harness
            .fake
            .set_lookup("second-token", token_secret("second-token", 32400, true));
        let briefcase = Briefcase::load(&harness.briefcase_path);
        let config = harness.load_config(yaml);
        let mut syncer = Syncer::new(
            config,
            harness.fake.clone(),
            briefcase,
            harness.metrics.clone(),
            harness.clock.clone(),
            SyncerOptions {
                briefcase_path: harness.briefcase_path.clone(),
                vault_token: "second-token".to_string(),
                vault_token_renewable: true,
                auth: None,
                sts_ttl_secs: 0,
                force_refresh_ttl_secs: 0,
            },
            Arc::new(AtomicBool::new(false)),
        );

        // The briefcase token is still valid server-side, so drop it from the
        // fake to force the CLI token to win.
        let mut stale = Briefcase::load(&harness.briefcase_path);
        stale.auth_token_lease.token = String::new();
        syncer.briefcase = stale;

        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        // Refreshing the token-scoped secret needs the full active view, so
        // the static cache is rebuilt too: one token read plus one static
        // read. The static artifact itself is not rewritten.
        let reads = harness.fake.read_log.lock().unwrap();
        assert_eq!(reads.len(), reads_after_first + 2);
        assert!(reads[reads_after_first..].contains(&token_path.to_string()));

        assert!(syncer
            .briefcase()
            .token_scoped_secrets
            .contains_key("token-secret"));
        assert!(syncer
            .briefcase()
            .static_scoped_secrets
            .contains_key("static-secret"));
    }

    #[test]
    fn cancelled_pass_fails_cleanly() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let yaml = concat!(
            "version: 2\n",
            "aws:\n",
            "  - vaultMountPoint: aws\n",
            "    vaultRole: deploy\n",
            "    awsProfile: default\n",
            "    awsRegion: us-east-1\n",
            "    outputPath: aws\n",
        );

        let config = harness.load_config(yaml);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut syncer = Syncer::new(
            config,
            harness.fake.clone(),
            Briefcase::new(),
            harness.metrics.clone(),
            harness.clock.clone(),
            SyncerOptions {
                briefcase_path: harness.briefcase_path.clone(),
                vault_token: "unit-test-token".to_string(),
                vault_token_renewable: true,
                auth: None,
                sts_ttl_secs: 0,
                force_refresh_ttl_secs: 0,
            },
            cancel,
        );

        let err = syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[test]
    fn renewal_refreshes_enrollment() {
        let _guard = ENV_LOCK.lock().unwrap();
        let _no_env = ScopedEnvVar::remove("VAULT_TOKEN");

        let harness = Harness::new();
        let config = harness.load_config("version: 3\n");
        let mut syncer = harness.syncer(config, Briefcase::new());
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        // Jump past next_refresh (a third of the 9 hour ttl).
        harness.clock.advance(Duration::hours(4));
        harness
            .fake
            .set_refresh(crate::vaultclient::testing::auth_secret(
                "unit-test-token",
                32400,
                true,
            ));

        let briefcase = Briefcase::load(&harness.briefcase_path);
        let config = harness.load_config("version: 3\n");
        let mut syncer = harness.syncer(config, briefcase);
        syncer
            .perform_sync(harness.clock.now() + Duration::minutes(20))
            .unwrap();

        assert_eq!(harness.metrics.vault_token_refreshed.get(), 1);
        assert_eq!(
            syncer.briefcase().auth_token_lease.next_refresh,
            harness.clock.now() + Duration::seconds(10800)
        );
    }
}
