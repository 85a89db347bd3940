use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::auth::AuthError;
use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

const METADATA_BASE: &str = "http://169.254.169.254";
const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";

/// Credentials handed out by the instance metadata service for the instance's
/// IAM role.
#[derive(Debug, Clone, Deserialize)]
pub struct Ec2RoleCredentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token", default)]
    pub token: String,
}

fn metadata_client() -> Result<reqwest::blocking::Client, AuthError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(AuthError::Metadata)
}

fn metadata_get(path: &str) -> Result<String, AuthError> {
    let client = metadata_client()?;
    let response = client
        .get(format!("{METADATA_BASE}{path}"))
        .send()
        .map_err(AuthError::Metadata)?;
    if !response.status().is_success() {
        return Err(AuthError::MetadataResponse(format!(
            "{} returned status {}",
            path,
            response.status()
        )));
    }
    response.text().map_err(AuthError::Metadata)
}

/// PKCS7-signed instance identity document, newline-stripped for transport.
pub fn fetch_pkcs7() -> Result<String, AuthError> {
    let raw = metadata_get("/latest/dynamic/instance-identity/pkcs7")?;
    Ok(raw.replace('\n', ""))
}

pub fn fetch_ami_id() -> Result<String, AuthError> {
    metadata_get("/latest/meta-data/ami-id")
}

/// Fetch the instance's IAM role credentials from the metadata service.
pub fn fetch_role_credentials() -> Result<Ec2RoleCredentials, AuthError> {
    let roles = metadata_get("/latest/meta-data/iam/security-credentials/")?;
    let role = roles
        .lines()
        .next()
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .ok_or_else(|| {
            AuthError::MetadataResponse("no IAM role attached to this instance".to_string())
        })?;

    let raw = metadata_get(&format!(
        "/latest/meta-data/iam/security-credentials/{role}"
    ))?;
    serde_json::from_str(&raw)
        .map_err(|err| AuthError::MetadataResponse(format!("bad credentials document: {err}")))
}

/// Build the base64-encoded `sts:GetCallerIdentity` login payload the vault's
/// AWS auth backend expects: a SigV4-signed request it can replay against STS
/// to confirm who we are.
pub fn get_caller_identity_login_data(
    creds: &Ec2RoleCredentials,
    region: &str,
    clock: &dyn Clock,
) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
    let host = if region == "us-east-1" {
        "sts.amazonaws.com".to_string()
    } else {
        format!("sts.{region}.amazonaws.com")
    };
    let url = format!("https://{host}/");

    let now = clock.now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let content_type = "application/x-www-form-urlencoded; charset=utf-8";

    // Signed headers, sorted by lowercase name.
    let mut signed: Vec<(String, String)> = vec![
        ("content-type".to_string(), content_type.to_string()),
        ("host".to_string(), host.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if !creds.token.is_empty() {
        signed.push(("x-amz-security-token".to_string(), creds.token.clone()));
    }
    signed.sort();

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_header_names = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let payload_hash = sha256_hex(STS_BODY.as_bytes());
    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_header_names}\n{payload_hash}"
    );

    let scope = format!("{date}/{region}/sts/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let mut key = hmac_sha256(
        format!("AWS4{}", creds.secret_access_key).as_bytes(),
        date.as_bytes(),
    );
    for part in [region, "sts", "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes());
    }
    let signature = hex(&hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_header_names}, Signature={signature}",
        creds.access_key_id
    );

    // The header map the vault forwards to STS. Host is reconstructed from
    // the URL on replay, so it stays out of the serialized set.
    let mut headers = serde_json::Map::new();
    headers.insert(
        "Content-Type".to_string(),
        serde_json::json!([content_type]),
    );
    headers.insert("X-Amz-Date".to_string(), serde_json::json!([amz_date]));
    if !creds.token.is_empty() {
        headers.insert(
            "X-Amz-Security-Token".to_string(),
            serde_json::json!([creds.token]),
        );
    }
    headers.insert(
        "Authorization".to_string(),
        serde_json::json!([authorization]),
    );

    let headers_json = serde_json::to_string(&headers)
        .map_err(|err| AuthError::Signing(format!("could not serialize headers: {err}")))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut login_data = serde_json::Map::new();
    login_data.insert(
        "iam_http_request_method".to_string(),
        serde_json::json!("POST"),
    );
    login_data.insert(
        "iam_request_url".to_string(),
        serde_json::json!(b64.encode(url.as_bytes())),
    );
    login_data.insert(
        "iam_request_headers".to_string(),
        serde_json::json!(b64.encode(headers_json.as_bytes())),
    );
    login_data.insert(
        "iam_request_body".to_string(),
        serde_json::json!(b64.encode(STS_BODY.as_bytes())),
    );

    Ok(login_data)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
