use serde_json::Value;

use super::{ec2, VaultApi, VaultError, WrappedToken};
use crate::clock::Clock;

pub const EC2_AUTH_PATH: &str = "auth/aws-ec2/login";

const IN_CLUSTER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const IN_CLUSTER_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("no authentication mechanism specified")]
    NoMechanism,
    #[error("could not read service account token file {path:?}: {source}")]
    ServiceAccountToken {
        path: String,
        source: std::io::Error,
    },
    #[error("instance metadata request failed: {0}")]
    Metadata(reqwest::Error),
    #[error("instance metadata response invalid: {0}")]
    MetadataResponse(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("login returned no token: {0}")]
    Login(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// One of the ways this tool can turn ambient identity into a vault token.
/// Invoked only when no existing token is usable.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    K8sJwt {
        service_account_token: String,
        login_path: String,
        role: String,
    },
    Ec2Ami {
        nonce: String,
    },
    Ec2Iam {
        role: String,
        backend: String,
        region: String,
    },
}

impl AuthMethod {
    pub fn authenticate(
        &self,
        client: &dyn VaultApi,
        clock: &dyn Clock,
    ) -> Result<WrappedToken, AuthError> {
        match self {
            AuthMethod::K8sJwt {
                service_account_token,
                login_path,
                role,
            } => kubernetes_auth(client, service_account_token, login_path, role),
            AuthMethod::Ec2Ami { nonce } => ec2_ami_auth(client, nonce),
            AuthMethod::Ec2Iam {
                role,
                backend,
                region,
            } => ec2_iam_auth(client, clock, role, backend, region),
        }
    }
}

fn kubernetes_auth(
    client: &dyn VaultApi,
    service_account_token: &str,
    login_path: &str,
    role: &str,
) -> Result<WrappedToken, AuthError> {
    match try_config_map_token(client) {
        Ok(token) => return Ok(token),
        Err(err) => {
            tracing::debug!(error = %err, "could not authenticate using vault-token ConfigMap - ignoring");
        }
    }

    tracing::info!(service_account_token, "reading service account token");
    let jwt = std::fs::read_to_string(service_account_token).map_err(|source| {
        AuthError::ServiceAccountToken {
            path: service_account_token.to_string(),
            source,
        }
    })?;

    tracing::info!(auth_path = login_path, k8s_role = role, "authenticating");

    let body = serde_json::json!({ "jwt": jwt.trim(), "role": role });
    let secret = client
        .write(&format!("auth/{login_path}/login"), body)?
        .ok_or_else(|| AuthError::Login(format!("empty response from auth/{login_path}/login")))?;

    let renewable = secret.token_is_renewable();
    Ok(WrappedToken::new(secret, renewable))
}

/// Developers running local clusters cannot have their services authenticate
/// with a projected JWT. Their bootstrap scripts create a ConfigMap named
/// `vault-token` in the default namespace instead; when it exists, the token
/// it stores is verified and used directly.
fn try_config_map_token(client: &dyn VaultApi) -> Result<WrappedToken, AuthError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| AuthError::Login("not running inside Kubernetes".to_string()))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

    let sa_token = std::fs::read_to_string(IN_CLUSTER_TOKEN_FILE).map_err(|source| {
        AuthError::ServiceAccountToken {
            path: IN_CLUSTER_TOKEN_FILE.to_string(),
            source,
        }
    })?;
    let ca_pem = std::fs::read(IN_CLUSTER_CA_FILE).map_err(|source| {
        AuthError::ServiceAccountToken {
            path: IN_CLUSTER_CA_FILE.to_string(),
            source,
        }
    })?;
    let ca = reqwest::Certificate::from_pem(&ca_pem).map_err(AuthError::Metadata)?;

    let http = reqwest::blocking::Client::builder()
        .add_root_certificate(ca)
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(AuthError::Metadata)?;

    let url = format!("https://{host}:{port}/api/v1/namespaces/default/configmaps/vault-token");
    let response = http
        .get(url)
        .bearer_auth(sa_token.trim())
        .send()
        .map_err(AuthError::Metadata)?;
    if !response.status().is_success() {
        return Err(AuthError::Login(format!(
            "no vault-token ConfigMap available (status {})",
            response.status()
        )));
    }

    let config_map: Value = response.json().map_err(AuthError::Metadata)?;
    let token = config_map
        .get("data")
        .and_then(|data| data.get("token"))
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::Login("vault-token ConfigMap has no token field".to_string()))?;

    tracing::info!("logging into vault with token from vault-token ConfigMap");
    let secret = client.verify_token(token)?;

    let mut renewable = secret.token_is_renewable();
    if let Some(value) = config_map
        .get("data")
        .and_then(|data| data.get("renewable"))
        .and_then(Value::as_str)
    {
        match value.parse::<bool>() {
            Ok(parsed) => renewable = parsed,
            Err(_) => {
                tracing::warn!(renewable = value, "ConfigMap renewable field is not a boolean - ignoring");
            }
        }
    }

    Ok(WrappedToken::new(secret, renewable))
}

fn ec2_ami_auth(client: &dyn VaultApi, nonce: &str) -> Result<WrappedToken, AuthError> {
    let pkcs7 = ec2::fetch_pkcs7()?;
    tracing::debug!(pkcs7_len = pkcs7.len(), "fetched PKCS7 payload");

    let ami = ec2::fetch_ami_id()?;
    tracing::debug!(ami = %ami, "found current AMI");

    let body = build_ami_login(&ami, &pkcs7, nonce);
    tracing::info!(ami = %ami, "sending EC2 AMI login request");

    let secret = client
        .write(EC2_AUTH_PATH, body)?
        .ok_or_else(|| AuthError::Login("empty response from EC2 AMI login".to_string()))?;

    Ok(WrappedToken::new(secret, true))
}

fn build_ami_login(ami: &str, pkcs7: &str, nonce: &str) -> Value {
    let mut body = serde_json::json!({ "role": ami, "pkcs7": pkcs7 });
    if !nonce.is_empty() {
        body["nonce"] = Value::from(nonce);
    }
    body
}

fn ec2_iam_auth(
    client: &dyn VaultApi,
    clock: &dyn Clock,
    role: &str,
    backend: &str,
    region: &str,
) -> Result<WrappedToken, AuthError> {
    tracing::info!("starting authentication with IAM role");
    let creds = ec2::fetch_role_credentials()?;

    tracing::info!(role, vault_auth_path = backend, "performing authentication");

    let mut login_data = ec2::get_caller_identity_login_data(&creds, region, clock)?;
    login_data.insert("role".to_string(), Value::from(role));

    let secret = client
        .write(&format!("auth/{backend}/login"), Value::Object(login_data))?
        .ok_or_else(|| AuthError::Login("empty response from credential provider".to_string()))?;

    let renewable = secret.token_is_renewable();
    Ok(WrappedToken::new(secret, renewable))
}
