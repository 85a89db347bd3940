use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde_json::Value;

use crate::briefcase::{SecretCache, SimpleSecret};
use crate::config::{self, CompositeSecretFile, SecretLifetime};
use crate::metrics::Metrics;
use crate::template::{self, Template, TemplateError};
use crate::vaultclient::sts::AwsStsCredential;

#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Mode(String),
    #[error("field {field:?} not found in secret with key {key:?}")]
    MissingField { field: String, key: String },
    #[error("the secret field {0:?} causes there to be a duplicate entry")]
    DuplicateField(String),
    #[error("failed to base64 decode field {field:?} for secret {key:?}: {source}")]
    Base64 {
        field: String,
        key: String,
        source: base64::DecodeError,
    },
    #[error("failed to write template {output:?}: {source}")]
    Template {
        output: String,
        source: TemplateError,
    },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Open for writing with the given mode, creating parent directories. Always
/// truncates: artifacts are rewritten whole.
fn open_with_mode(path: &Path, mode: u32) -> Result<File, OutputError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err(path))?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(mode)
        .open(path)
        .map_err(io_err(path))
}

fn configured_mode(mode: &str) -> Result<u32, OutputError> {
    config::parse_file_mode(mode).map_err(OutputError::Mode)
}

/// Write the whole body to a `.wip` sibling with the final mode, then rename
/// it into place. Consumers only ever observe complete files.
fn write_atomically(path: &Path, mode: u32, body: &[u8]) -> Result<(), OutputError> {
    let mut wip = path.as_os_str().to_os_string();
    wip.push(".wip");
    let wip = PathBuf::from(wip);

    let mut file = open_with_mode(&wip, mode)?;
    if let Err(source) = file.write_all(body) {
        drop(file);
        let _ = std::fs::remove_file(&wip);
        return Err(OutputError::Io {
            path: wip.display().to_string(),
            source,
        });
    }
    drop(file);

    std::fs::rename(&wip, path).map_err(io_err(path))
}

/// Write the vault token, single line plus newline. A missing output path is
/// not an error; the stanza is simply not configured for output.
pub fn write_vault_token(
    metrics: &Metrics,
    token_cfg: &config::VaultTokenFile,
    vault_token: &str,
) -> Result<(), OutputError> {
    if token_cfg.output.is_empty() {
        tracing::warn!("no output file specified to write vault token");
        return Ok(());
    }

    tracing::info!(output_file = %token_cfg.output, "writing vault token to file");

    let mode = configured_mode(&token_cfg.mode)?;
    let path = Path::new(&token_cfg.output);
    let mut file = open_with_mode(path, mode)?;
    writeln!(file, "{vault_token}").map_err(io_err(path))?;

    metrics.vault_token_written.inc();
    Ok(())
}

/// Write every field of a secret that declares an output file. Returns how
/// many files were written.
pub fn write_secret_fields(
    secret: &config::Secret,
    kv_secrets: &[SimpleSecret],
) -> Result<usize, OutputError> {
    let mode = configured_mode(&secret.mode)?;
    let mut count = 0;

    for field in &secret.fields {
        if field.output.is_empty() {
            continue;
        }
        if write_field(secret, kv_secrets, field, mode)? {
            count += 1;
        }
    }
    Ok(count)
}

fn write_field(
    secret: &config::Secret,
    kv_secrets: &[SimpleSecret],
    field: &config::SecretField,
    mode: u32,
) -> Result<bool, OutputError> {
    let value = find_value(kv_secrets, &secret.key, &field.name);

    let value = match value {
        Some(value) => value,
        None if secret.missing_ok => {
            tracing::warn!(
                field = %field.name,
                key = %secret.key,
                output = %field.output,
                "no secret found with key and missingOk=true, so no output will be written"
            );
            return Ok(false);
        }
        None => {
            return Err(OutputError::MissingField {
                field: field.name.clone(),
                key: secret.key.clone(),
            })
        }
    };

    let path = Path::new(&field.output);
    let mut file = open_with_mode(path, mode)?;

    tracing::info!(
        field = %field.name,
        key = %secret.key,
        output = %field.output,
        encoding = %field.encoding,
        "writing field to file"
    );

    let rendered = template::value_to_string(value);
    let bytes = if field.encoding == config::ENCODING_BASE64 {
        base64::engine::general_purpose::STANDARD
            .decode(rendered.as_bytes())
            .map_err(|source| OutputError::Base64 {
                field: field.name.clone(),
                key: secret.key.clone(),
                source,
            })?
    } else {
        rendered.into_bytes()
    };
    file.write_all(&bytes).map_err(io_err(path))?;

    if let Some(owner) = secret.owner {
        std::os::unix::fs::chown(path, Some(owner), Some(owner)).map_err(io_err(path))?;
    }

    Ok(true)
}

fn find_value<'a>(secrets: &'a [SimpleSecret], key: &str, field: &str) -> Option<&'a Value> {
    secrets
        .iter()
        .find(|s| s.key == key && s.field == field)
        .map(|s| &s.value)
}

/// Write one composite JSON file from the cached secrets. An empty
/// aggregation leaves the file empty rather than writing `{}`.
pub fn write_composite(
    composite: &CompositeSecretFile,
    cache: &SecretCache,
) -> Result<(), OutputError> {
    tracing::debug!(filename = %composite.filename, "writing composite secrets file");

    let mut kv_secrets: Vec<SimpleSecret> = Vec::new();
    kv_secrets.extend_from_slice(cache.get(SecretLifetime::Static));
    kv_secrets.extend_from_slice(cache.get(SecretLifetime::Version));
    if composite.lifetime == SecretLifetime::Token {
        kv_secrets.extend_from_slice(cache.get(SecretLifetime::Token));
    }

    let data = collect_composite_data(composite, &kv_secrets)?;

    let mode = configured_mode(&composite.mode)?;
    let path = Path::new(&composite.filename);

    let body = if data.is_empty() {
        Vec::new()
    } else {
        let mut body = serde_json::to_vec(&data)?;
        body.push(b'\n');
        body
    };
    write_atomically(path, mode, &body)
}

/// Collect `(key, field) -> value` for the composite. Keys collide fatally:
/// a composite that silently dropped one of two same-named fields would be
/// handing the consumer the wrong secret.
fn collect_composite_data(
    composite: &CompositeSecretFile,
    kv_secrets: &[SimpleSecret],
) -> Result<BTreeMap<String, Value>, OutputError> {
    let mut data: BTreeMap<String, Value> = BTreeMap::new();

    tracing::info!(filename = %composite.filename, "collecting composite secrets");

    for secret in &composite.secrets {
        for s in kv_secrets.iter().filter(|s| s.key == secret.key) {
            let entry_key = if secret.use_key_as_prefix {
                format!("{}_{}", secret.key, s.field)
            } else {
                s.field.clone()
            };
            if data.contains_key(&entry_key) {
                tracing::error!(field = %s.field, key = %entry_key, "this field causes there to be a duplicate entry");
                return Err(OutputError::DuplicateField(entry_key));
            }
            tracing::debug!(key = %entry_key, "collecting field");
            data.insert(entry_key, s.value.clone());
        }
    }

    Ok(data)
}

/// Render a template from the cached secrets. Variables are named
/// `<key>_<field>`; token-scoped secrets shadow static ones.
pub fn write_template(
    tpl: &config::TemplateStanza,
    template: &Template,
    cache: &SecretCache,
) -> Result<(), OutputError> {
    let mut vars: BTreeMap<String, Value> = BTreeMap::new();

    for s in cache.get(SecretLifetime::Static) {
        vars.insert(format!("{}_{}", s.key, s.field), s.value.clone());
    }

    if tpl.lifetime() == SecretLifetime::Token {
        for s in cache.get(SecretLifetime::Token) {
            let key = format!("{}_{}", s.key, s.field);
            if vars.contains_key(&key) {
                tracing::warn!(key = %key, "overwriting static secret key with a value from a token-scoped secret");
            }
            vars.insert(key, s.value.clone());
        }
    }

    if vars.is_empty() {
        tracing::warn!(
            output = %tpl.output,
            "no template variables found. this can happen when secrets are missing with missingOk=true, or when the lifetimes of your secrets and template don't line up"
        );
    }

    let mode = configured_mode(&tpl.mode)?;

    tracing::info!(input = %tpl.input, output = %tpl.output, "resolving template");

    let rendered = template
        .render(&vars)
        .map_err(|source| OutputError::Template {
            output: tpl.output.clone(),
            source,
        })?;

    write_atomically(Path::new(&tpl.output), mode, rendered.as_bytes())?;

    tracing::debug!(output = %tpl.output, "done executing template");
    Ok(())
}

/// Write the AWS `credentials` and `config` pair. Both are written as `.wip`
/// siblings with the final mode and renamed into place, so consumers never
/// observe a half-written file.
pub fn write_aws_credentials_files(
    creds: &AwsStsCredential,
    aws: &config::Aws,
) -> Result<(), OutputError> {
    let mode = configured_mode(&aws.mode)?;

    let out_dir = Path::new(&aws.output_path);
    let wip_config = out_dir.join("config.wip");
    let wip_credentials = out_dir.join("credentials.wip");

    if let Err(err) = write_wip_files(&wip_config, &wip_credentials, creds, aws, mode) {
        let _ = std::fs::remove_file(&wip_config);
        let _ = std::fs::remove_file(&wip_credentials);
        return Err(err);
    }

    let final_config = out_dir.join("config");
    let final_credentials = out_dir.join("credentials");

    tracing::debug!(
        config = %final_config.display(),
        credentials = %final_credentials.display(),
        "atomically renaming .wip files"
    );
    std::fs::rename(&wip_config, &final_config).map_err(io_err(&final_config))?;
    std::fs::rename(&wip_credentials, &final_credentials).map_err(io_err(&final_credentials))?;
    Ok(())
}

fn write_wip_files(
    config_filename: &Path,
    credentials_filename: &Path,
    creds: &AwsStsCredential,
    aws: &config::Aws,
    mode: u32,
) -> Result<(), OutputError> {
    tracing::debug!(
        aws_config = %config_filename.display(),
        aws_credentials = %credentials_filename.display(),
        "writing AWS files"
    );

    let profile = aws.profile.trim();

    let mut credentials_file = open_with_mode(credentials_filename, mode)?;
    write!(
        credentials_file,
        "[{profile}]\naws_access_key_id={}\naws_secret_access_key={}\naws_session_token={}\n\n",
        creds.access_key, creds.secret_key, creds.session_token
    )
    .map_err(io_err(credentials_filename))?;

    let mut config_file = open_with_mode(config_filename, mode)?;
    write!(config_file, "[{profile}]\nregion={}\n", aws.region).map_err(io_err(config_filename))?;

    Ok(())
}

/// Create the file, or bump its mtime if it already exists.
pub fn touch_file(path: &str) -> std::io::Result<()> {
    let p = Path::new(path);
    match std::fs::OpenOptions::new().append(true).open(p) {
        Ok(file) => file.set_modified(std::time::SystemTime::now()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            File::create(p).map(|_| ())
        }
        Err(err) => Err(err),
    }
}
