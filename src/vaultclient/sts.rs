use serde_json::Value;

use super::{VaultApi, VaultError, VaultSecret, WrappedToken};
use crate::config;

/// Short-lived AWS credentials brokered by the vault via sts:AssumeRole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsStsCredential {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
}

/// Fetch STS credentials for the configured role. `sts_ttl` of zero means the
/// backend default.
pub fn fetch_aws_sts_credential(
    client: &dyn VaultApi,
    aws: &config::Aws,
    sts_ttl_secs: u64,
) -> Result<(AwsStsCredential, WrappedToken), VaultError> {
    let path = format!("{}/creds/{}", aws.vault_mount.trim_matches('/'), aws.vault_role);

    tracing::info!(path, output_path = %aws.output_path, "fetching AWS STS credentials");

    let data = if sts_ttl_secs != 0 {
        serde_json::json!({ "ttl": format!("{sts_ttl_secs}s") })
    } else {
        serde_json::json!({})
    };

    let result = client.write(&path, data)?.ok_or_else(|| {
        VaultError::Response(format!("no credentials returned from {path:?}"))
    })?;

    let credential = AwsStsCredential {
        access_key: required_string(&result, "access_key", &path)?,
        secret_key: required_string(&result, "secret_key", &path)?,
        session_token: required_string(&result, "security_token", &path)?,
    };

    Ok((credential, WrappedToken::new(result, true)))
}

fn required_string(
    secret: &VaultSecret,
    field: &str,
    path: &str,
) -> Result<String, VaultError> {
    secret
        .data
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            VaultError::Response(format!("credentials from {path:?} are missing {field:?}"))
        })
}
