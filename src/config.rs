use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::template::{Template, TemplateError};

/// How long an artifact stays valid once written.
///
/// `static` artifacts survive token rotation; `token` artifacts are rewritten
/// whenever a new auth token is enrolled; `version` artifacts follow the KV v2
/// version number of their backing secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretLifetime {
    Static,
    Token,
    Version,
}

impl std::fmt::Display for SecretLifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretLifetime::Static => write!(f, "static"),
            SecretLifetime::Token => write!(f, "token"),
            SecretLifetime::Version => write!(f, "version"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultTokenFile {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateStanza {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub lifetime: Option<SecretLifetime>,
}

impl TemplateStanza {
    pub fn lifetime(&self) -> SecretLifetime {
        self.lifetime.unwrap_or(SecretLifetime::Static)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub encoding: String,
}

pub const ENCODING_NONE: &str = "none";
pub const ENCODING_BASE64: &str = "base64";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub use_key_as_prefix: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub fields: Vec<SecretField>,
    /// When set, every field of the secret is also aggregated into the
    /// composite JSON file at this path.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub lifetime: Option<SecretLifetime>,
    #[serde(default)]
    pub mode: String,
    #[serde(default, rename = "missingOk")]
    pub missing_ok: bool,
    #[serde(default, rename = "pinnedVersion")]
    pub pinned_version: Option<i64>,
    #[serde(default)]
    pub owner: Option<u32>,
    #[serde(default)]
    pub touchfile: String,
}

impl Secret {
    pub fn lifetime(&self) -> SecretLifetime {
        self.lifetime.unwrap_or(SecretLifetime::Static)
    }

    /// Whether processing this secret requires KV v2 response metadata.
    pub fn needs_metadata(&self) -> bool {
        self.lifetime() == SecretLifetime::Version || self.pinned_version.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshCertificate {
    #[serde(default, rename = "vaultMountPoint")]
    pub vault_mount: String,
    #[serde(default, rename = "vaultRole")]
    pub vault_role: String,
    #[serde(default, rename = "outputPath")]
    pub output_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aws {
    #[serde(default, rename = "vaultMountPoint")]
    pub vault_mount: String,
    #[serde(default, rename = "vaultRole")]
    pub vault_role: String,
    #[serde(default, rename = "awsProfile")]
    pub profile: String,
    #[serde(default, rename = "awsRegion")]
    pub region: String,
    #[serde(default, rename = "outputPath")]
    pub output_path: String,
    #[serde(default)]
    pub mode: String,
}

/// The declarative config file.
///
/// version < 2: KV v1 default secrets prefix, lifetimes default to static.
/// version 2: KV v2 default prefix, metadata available.
/// version >= 3: every secret and template must declare a lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default, rename = "vaultToken")]
    pub vault_token: VaultTokenFile,
    #[serde(default)]
    pub templates: Vec<TemplateStanza>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default, rename = "sshCertificates")]
    pub ssh_certificates: Vec<SshCertificate>,
    #[serde(default)]
    pub aws: Vec<Aws>,
}

/// One aggregated JSON output file, derived from every secret stanza that
/// declares the same `output`. Mode comes from the first contributor; if any
/// contributor is token-scoped the whole file is token-scoped.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSecretFile {
    pub filename: String,
    pub mode: String,
    pub lifetime: SecretLifetime,
    pub secrets: Vec<Secret>,
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub vault: VaultConfig,
    pub templates: BTreeMap<String, Template>,
    pub composites: BTreeMap<String, CompositeSecretFile>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("a config file is required")]
    MissingFile,
    #[error("trouble reading config file {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not unmarshal config file {path:?}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("{0} error(s) processing config")]
    Invalid(usize),
    #[error("failed to parse template {input:?}: {source}")]
    Template {
        input: String,
        source: TemplateError,
    },
    #[error("could not read template {input:?}: {source}")]
    TemplateRead {
        input: String,
        source: std::io::Error,
    },
}

/// Parse a file mode like "0700". An empty mode means 0400.
pub fn parse_file_mode(mode: &str) -> Result<u32, String> {
    if mode.is_empty() {
        return Ok(0o400);
    }
    u32::from_str_radix(mode, 8).map_err(|err| format!("{:?} is not an octal file mode: {}", mode, err))
}

/// Join `path` under `prefix` unless it is already absolute.
pub fn absolute_path(prefix: &str, path: &str) -> String {
    if path.is_empty() || Path::new(path).is_absolute() || prefix.is_empty() {
        return path.to_string();
    }
    Path::new(prefix).join(path).to_string_lossy().into_owned()
}

pub fn load(
    config_file: &str,
    input_prefix: &str,
    output_prefix: &str,
) -> Result<LoadedConfig, ConfigError> {
    if config_file.is_empty() {
        return Err(ConfigError::MissingFile);
    }

    let path = absolute_path(input_prefix, config_file);
    tracing::debug!(cfg = %path, "reading config file");

    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let mut config: VaultConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

    let errs = prepare(&mut config, input_prefix, output_prefix);
    if !errs.is_empty() {
        for err in &errs {
            tracing::error!(cfg = %path, "issue with config: {err}");
        }
        return Err(ConfigError::Invalid(errs.len()));
    }

    let templates = ingest_templates(&config)?;
    let composites = derive_composites(&config);

    Ok(LoadedConfig {
        vault: config,
        templates,
        composites,
    })
}

/// Templates are parsed at load so typos fail before any vault traffic.
fn ingest_templates(config: &VaultConfig) -> Result<BTreeMap<String, Template>, ConfigError> {
    let mut templates = BTreeMap::new();
    for stanza in &config.templates {
        tracing::info!(input = %stanza.input, "ingesting template");
        let source =
            std::fs::read_to_string(&stanza.input).map_err(|source| ConfigError::TemplateRead {
                input: stanza.input.clone(),
                source,
            })?;
        let template = Template::parse(&source).map_err(|source| ConfigError::Template {
            input: stanza.input.clone(),
            source,
        })?;
        templates.insert(stanza.input.clone(), template);
    }
    Ok(templates)
}

fn derive_composites(config: &VaultConfig) -> BTreeMap<String, CompositeSecretFile> {
    let mut composites: BTreeMap<String, CompositeSecretFile> = BTreeMap::new();

    for secret in &config.secrets {
        if secret.output.is_empty() {
            continue;
        }
        match composites.get_mut(&secret.output) {
            Some(file) => {
                if secret.lifetime() == SecretLifetime::Token
                    && file.lifetime == SecretLifetime::Static
                {
                    file.lifetime = SecretLifetime::Token;
                }
                file.secrets.push(secret.clone());
            }
            None => {
                composites.insert(
                    secret.output.clone(),
                    CompositeSecretFile {
                        filename: secret.output.clone(),
                        mode: secret.mode.clone(),
                        lifetime: secret.lifetime(),
                        secrets: vec![secret.clone()],
                    },
                );
            }
        }
    }

    composites
}

/// Validate the config and normalize paths. Every problem is collected so the
/// operator sees the full list at once.
fn prepare(config: &mut VaultConfig, input_prefix: &str, output_prefix: &str) -> Vec<String> {
    let mut errs = Vec::new();
    let version = config.version;

    if is_empty(config) {
        tracing::warn!("configuration file lists nothing to output");
    }

    if !config.vault_token.output.is_empty() {
        config.vault_token.output = absolute_path(output_prefix, &config.vault_token.output);
    }
    if let Err(err) = parse_file_mode(&config.vault_token.mode) {
        errs.push(format!("vaultToken - {err}"));
    }

    for tpl in &mut config.templates {
        if tpl.lifetime.is_none() && version < 3 {
            tpl.lifetime = Some(SecretLifetime::Static);
        }

        if tpl.input.is_empty() {
            errs.push("there is a template stanza missing an 'input' file".to_string());
        } else {
            tpl.input = absolute_path(input_prefix, &tpl.input);
        }

        match tpl.lifetime {
            Some(SecretLifetime::Version) => errs.push(format!(
                "template {:?} - templates do not support the version lifetime",
                tpl.input
            )),
            Some(_) => {}
            None => errs.push(format!(
                "template {:?} - template is missing a lifetime attribute",
                tpl.input
            )),
        }

        if tpl.output.is_empty() {
            tracing::warn!(template = %tpl.input, "template has no 'output' file");
        } else {
            tpl.output = absolute_path(output_prefix, &tpl.output);
        }

        if let Err(err) = parse_file_mode(&tpl.mode) {
            errs.push(format!("template {:?} - {err}", tpl.input));
        }
    }

    let mut keys: HashSet<String> = HashSet::new();

    for secret in &mut config.secrets {
        if secret.key.is_empty() {
            errs.push("there is a secret stanza missing a 'key' value".to_string());
            continue;
        }

        if secret.path.is_empty() {
            errs.push(format!(
                "secret {:?} - no vault path specified for secret",
                secret.key
            ));
            continue;
        }

        if secret.lifetime.is_none() && version < 3 {
            secret.lifetime = Some(SecretLifetime::Static);
        }
        if secret.lifetime.is_none() {
            errs.push(format!(
                "secret {:?} - secret is missing a lifetime attribute",
                secret.key
            ));
        }

        for field in &mut secret.fields {
            if field.name.is_empty() {
                errs.push(format!(
                    "secret {:?} - there is a field missing a 'name' value",
                    secret.key
                ));
            }

            field.encoding = field.encoding.to_lowercase();
            if !field.encoding.is_empty()
                && field.encoding != ENCODING_NONE
                && field.encoding != ENCODING_BASE64
            {
                errs.push(format!(
                    "secret {:?} - field {:?} - encoding must be {:?} or {:?}",
                    secret.key, field.name, ENCODING_BASE64, ENCODING_NONE
                ));
            }

            if field.output.is_empty() {
                errs.push(format!(
                    "secret {:?} - field {:?} - this field is missing an 'output'",
                    secret.key, field.name
                ));
            } else {
                field.output = absolute_path(output_prefix, &field.output);
            }
        }

        if !secret.output.is_empty() {
            secret.output = absolute_path(output_prefix, &secret.output);
        }
        if !secret.touchfile.is_empty() {
            secret.touchfile = absolute_path(output_prefix, &secret.touchfile);
        }

        if !secret.output.is_empty() && secret.lifetime == Some(SecretLifetime::Version) {
            errs.push(format!(
                "secret {:?} - output {:?} - version-lifetime secrets only support field outputs",
                secret.key, secret.output
            ));
        }

        if secret.lifetime == Some(SecretLifetime::Version) && secret.fields.is_empty() {
            errs.push(format!(
                "secret {:?} - at least one field must be specified for the version lifetime",
                secret.key
            ));
        }

        if let Err(err) = parse_file_mode(&secret.mode) {
            errs.push(format!("secret {:?} - {err}", secret.key));
        }

        if !keys.insert(secret.key.clone()) {
            errs.push(format!(
                "secret {:?} - duplicate secret key found in configuration file",
                secret.key
            ));
        }
    }

    for ssh in &mut config.ssh_certificates {
        if ssh.vault_role.is_empty() {
            errs.push("there is an SSH certificate stanza missing its 'vaultRole'".to_string());
        }
        if ssh.vault_mount.is_empty() {
            errs.push(format!(
                "vaultRole {:?} - ssh certificate stanza is missing a 'vaultMountPoint'",
                ssh.vault_role
            ));
        }
        if ssh.output_path.is_empty() {
            errs.push(format!(
                "vaultMount {:?} vaultRole {:?} - ssh certificate stanza is missing an 'outputPath'",
                ssh.vault_mount, ssh.vault_role
            ));
        } else {
            ssh.output_path = absolute_path(output_prefix, &ssh.output_path);
        }
    }

    for aws in &mut config.aws {
        if aws.vault_role.is_empty() {
            errs.push("there is an AWS stanza missing its 'vaultRole'".to_string());
        }
        if aws.vault_mount.is_empty() {
            errs.push(format!(
                "vaultRole {:?} - aws stanza is missing a vault mount point",
                aws.vault_role
            ));
        }
        if aws.profile.is_empty() {
            errs.push(format!(
                "vaultRole {:?} - aws stanza is missing an AWS profile name",
                aws.vault_role
            ));
        }
        if aws.region.is_empty() {
            errs.push(format!(
                "vaultRole {:?} - aws stanza is missing an AWS region",
                aws.vault_role
            ));
        }
        if aws.output_path.is_empty() {
            errs.push(format!(
                "vaultRole {:?} - aws stanza is missing an output path",
                aws.vault_role
            ));
        } else {
            aws.output_path = absolute_path(output_prefix, &aws.output_path);
        }
        if let Err(err) = parse_file_mode(&aws.mode) {
            errs.push(format!("aws {:?} - {err}", aws.vault_role));
        }
    }

    errs
}

pub fn is_empty(config: &VaultConfig) -> bool {
    config.vault_token.output.is_empty()
        && config.templates.is_empty()
        && config.aws.is_empty()
        && config.ssh_certificates.is_empty()
        && config.secrets.is_empty()
}
