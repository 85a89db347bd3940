pub mod auth;
pub mod ec2;
pub mod sshcert;
pub mod sts;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SECRETS_SERVICE_PATH_V1: &str = "/secret/application-config/services/";
pub const SECRETS_SERVICE_PATH_V2: &str = "/kv/data/application-config/services/";

const DEFAULT_VAULT_ADDR: &str = "https://127.0.0.1:8200";

/// The server mostly ignores this; it just needs to be comfortably long.
const RENEW_SELF_INCREMENT_SECS: u64 = 86_400;

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vault returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("permission denied by vault")]
    PermissionDenied,
    #[error("malformed vault response: {0}")]
    Response(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    fn is_transient(&self) -> bool {
        match self {
            VaultError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            VaultError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Token-issuing part of a vault response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretAuth {
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub policies: Vec<String>,
}

/// A vault API response. Secrets read from the KV store carry their payload
/// in `data`; login and renew responses carry an `auth` stanza instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultSecret {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SecretAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl VaultSecret {
    /// The token id, whether this is a login response (`auth.client_token`)
    /// or a lookup-self response (`data.id`).
    pub fn token_id(&self) -> Result<String, VaultError> {
        if let Some(auth) = &self.auth {
            if !auth.client_token.is_empty() {
                return Ok(auth.client_token.clone());
            }
        }
        match self.data.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(VaultError::Response(
                "no token id found in response".to_string(),
            )),
        }
    }

    pub fn token_accessor(&self) -> Result<String, VaultError> {
        if let Some(auth) = &self.auth {
            if !auth.accessor.is_empty() {
                return Ok(auth.accessor.clone());
            }
        }
        match self.data.get("accessor").and_then(Value::as_str) {
            Some(accessor) if !accessor.is_empty() => Ok(accessor.to_string()),
            _ => Err(VaultError::Response(
                "no token accessor found in response".to_string(),
            )),
        }
    }

    pub fn token_ttl(&self) -> Result<Duration, VaultError> {
        if let Some(auth) = &self.auth {
            if auth.lease_duration > 0 {
                return Ok(Duration::from_secs(auth.lease_duration));
            }
        }
        match self.data.get("ttl") {
            None => Ok(Duration::from_secs(0)),
            Some(value) => {
                let secs = value
                    .as_u64()
                    .or_else(|| value.as_f64().map(|f| f as u64))
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| {
                        VaultError::Response(format!("unparseable token ttl {value:?}"))
                    })?;
                Ok(Duration::from_secs(secs))
            }
        }
    }

    pub fn token_is_renewable(&self) -> bool {
        if let Some(auth) = &self.auth {
            return auth.renewable;
        }
        self.data
            .get("renewable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A vault token paired with the renewability the tool should assume for it.
/// The server's own `renewable` flag is not always what we want: tokens
/// handed in via CLI or environment carry an operator-declared value.
#[derive(Debug, Clone, PartialEq)]
pub struct WrappedToken {
    pub secret: VaultSecret,
    pub renewable: bool,
}

impl WrappedToken {
    pub fn new(secret: VaultSecret, renewable: bool) -> Self {
        Self { secret, renewable }
    }

    pub fn token_id(&self) -> Result<String, VaultError> {
        self.secret.token_id()
    }

    pub fn token_accessor(&self) -> Result<String, VaultError> {
        self.secret.token_accessor()
    }

    pub fn token_ttl(&self) -> Result<Duration, VaultError> {
        self.secret.token_ttl()
    }
}

/// Thin transport to the vault. The syncer only ever talks through this
/// trait, which keeps every network interaction mockable.
pub trait VaultApi: Send + Sync {
    fn address(&self) -> String;
    fn set_token(&self, token: &str);
    fn token(&self) -> String;

    /// lookup-self under the given token.
    fn verify_token(&self, token: &str) -> Result<VaultSecret, VaultError>;
    /// renew-self under the given token with an explicit increment.
    fn renew_token_as_self(
        &self,
        token: &str,
        increment_secs: u64,
    ) -> Result<VaultSecret, VaultError>;
    /// renew-self under the current token, with a long horizon.
    fn refresh_token(&self) -> Result<VaultSecret, VaultError>;
    fn revoke_self(&self) -> Result<(), VaultError>;

    fn read(&self, path: &str) -> Result<Option<VaultSecret>, VaultError>;
    fn read_with_data(
        &self,
        path: &str,
        params: &BTreeMap<String, Vec<String>>,
    ) -> Result<Option<VaultSecret>, VaultError>;
    fn write(&self, path: &str, data: Value) -> Result<Option<VaultSecret>, VaultError>;
    fn sign_ssh_key(
        &self,
        mount: &str,
        role: &str,
        public_key: &str,
    ) -> Result<VaultSecret, VaultError>;

    fn service_secret_prefix(&self, config_version: u32) -> String;
}

pub struct HttpVaultClient {
    http: reqwest::blocking::Client,
    address: String,
    token: Mutex<String>,
    secrets_prefix: String,
    retries: u32,
}

impl HttpVaultClient {
    pub fn new(
        secrets_prefix: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, VaultError> {
        let address = std::env::var("VAULT_ADDR")
            .ok()
            .map(|addr| addr.trim().trim_end_matches('/').to_string())
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_VAULT_ADDR.to_string());

        tracing::debug!(
            vault_client_retries = retries,
            vault_client_timeout_secs = timeout.as_secs(),
            secrets_prefix,
            "creating vault client"
        );

        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            address,
            token: Mutex::new(String::new()),
            secrets_prefix: secrets_prefix.to_string(),
            retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    /// One vault API call, with retries for transient failures. 404 maps to
    /// `None` so missing KV paths are distinguishable from errors.
    fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        token_override: Option<&str>,
    ) -> Result<Option<VaultSecret>, VaultError> {
        let mut last_err: Option<VaultError> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(250 << (attempt - 1).min(6)));
            }

            match self.execute_once(method.clone(), path, query, body, token_override) {
                Ok(secret) => return Ok(secret),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    tracing::warn!(path, attempt, error = %err, "vault request failed, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| VaultError::Response("retries exhausted".to_string())))
    }

    fn execute_once(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        token_override: Option<&str>,
    ) -> Result<Option<VaultSecret>, VaultError> {
        let mut request = self.http.request(method, self.url(path));

        if !query.is_empty() {
            request = request.query(query);
        }

        let token = match token_override {
            Some(token) => token.to_string(),
            None => self.token(),
        };
        if !token.is_empty() {
            request = request.header("X-Vault-Token", token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send()?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(VaultError::PermissionDenied);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(VaultError::Api {
                status: status.as_u16(),
                message,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let secret: VaultSecret = response.json()?;
        Ok(Some(secret))
    }
}

impl VaultApi for HttpVaultClient {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }

    fn token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    fn verify_token(&self, token: &str) -> Result<VaultSecret, VaultError> {
        tracing::debug!("verifying vault token");
        self.execute(
            reqwest::Method::GET,
            "auth/token/lookup-self",
            &[],
            None,
            Some(token),
        )?
        .ok_or_else(|| VaultError::Response("server returned neither an error nor a secret".to_string()))
    }

    fn renew_token_as_self(
        &self,
        token: &str,
        increment_secs: u64,
    ) -> Result<VaultSecret, VaultError> {
        let body = serde_json::json!({ "increment": increment_secs });
        self.execute(
            reqwest::Method::POST,
            "auth/token/renew-self",
            &[],
            Some(&body),
            Some(token),
        )?
        .ok_or_else(|| VaultError::Response("empty renewal response".to_string()))
    }

    /// Renew-self with an exponential backoff on transient failures, bounded
    /// by the requested renewal duration. Permission problems and other
    /// non-transient errors return immediately.
    fn refresh_token(&self) -> Result<VaultSecret, VaultError> {
        let body = serde_json::json!({ "increment": RENEW_SELF_INCREMENT_SECS });
        let bound = Duration::from_secs(RENEW_SELF_INCREMENT_SECS);
        let started = std::time::Instant::now();
        let mut backoff = Duration::from_millis(500);

        loop {
            let result = self.execute(
                reqwest::Method::POST,
                "auth/token/renew-self",
                &[],
                Some(&body),
                None,
            );
            match result {
                Ok(Some(secret)) => return Ok(secret),
                Ok(None) => {
                    return Err(VaultError::Response("empty renewal response".to_string()))
                }
                Err(err) if err.is_transient() && started.elapsed() + backoff < bound => {
                    tracing::warn!(error = %err, backoff_secs = backoff.as_secs(), "token renewal failed, backing off");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn revoke_self(&self) -> Result<(), VaultError> {
        self.execute(
            reqwest::Method::POST,
            "auth/token/revoke-self",
            &[],
            None,
            None,
        )?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<VaultSecret>, VaultError> {
        self.execute(reqwest::Method::GET, path, &[], None, None)
    }

    fn read_with_data(
        &self,
        path: &str,
        params: &BTreeMap<String, Vec<String>>,
    ) -> Result<Option<VaultSecret>, VaultError> {
        let query: Vec<(String, String)> = params
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.clone(), v.clone())))
            .collect();
        self.execute(reqwest::Method::GET, path, &query, None, None)
    }

    fn write(&self, path: &str, data: Value) -> Result<Option<VaultSecret>, VaultError> {
        self.execute(reqwest::Method::POST, path, &[], Some(&data), None)
    }

    fn sign_ssh_key(
        &self,
        mount: &str,
        role: &str,
        public_key: &str,
    ) -> Result<VaultSecret, VaultError> {
        let path = format!("{}/sign/{}", mount.trim_matches('/'), role);
        let body = serde_json::json!({ "public_key": public_key });
        self.write(&path, body)?.ok_or_else(|| {
            VaultError::Response(format!("no response signing key at {path:?}"))
        })
    }

    fn service_secret_prefix(&self, config_version: u32) -> String {
        if !self.secrets_prefix.is_empty() {
            return self.secrets_prefix.clone();
        }
        if config_version < 2 {
            SECRETS_SERVICE_PATH_V1.to_string()
        } else {
            SECRETS_SERVICE_PATH_V2.to_string()
        }
    }
}
