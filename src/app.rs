use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use crate::briefcase::Briefcase;
use crate::cli::{Cli, Command, CommonArgs};
use crate::clock::{self, Clock, SharedClock};
use crate::config::{self, ConfigError, LoadedConfig};
use crate::lock::{self, LockError};
use crate::metrics::Metrics;
use crate::syncer::{SyncError, Syncer, SyncerOptions};
use crate::vaultclient::auth::AuthMethod;
use crate::vaultclient::sshcert::{SSH_CERTIFICATE, SSH_PRIVATE_KEY, SSH_PUBLIC_KEY};
use crate::vaultclient::{HttpVaultClient, VaultApi, VaultError};

pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the sidecar looks for the shutdown trigger file.
const SHUTDOWN_FILE_CHECK_SECS: u64 = 18;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Command::Version => {
            println!("vaultsync {}", BUILD_VERSION);
            Ok(())
        }
        Command::Init { common } => {
            init_logging(common.debug);
            perform_init(&common)
        }
        Command::Sidecar { common, one_shot } => {
            init_logging(common.debug);
            if one_shot {
                perform_one_shot_sidecar(&common)
            } else {
                perform_sidecar(&common)
            }
        }
        Command::Cleanup { common, revoke } => {
            init_logging(common.debug);
            perform_cleanup(&common, revoke)
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    if debug {
        tracing::debug!("debug logging enabled");
    }
}

/// Dependencies shared by every pass of one run.
struct Runtime {
    metrics: Arc<Metrics>,
    clock: SharedClock,
    cancel: Arc<AtomicBool>,
}

impl Runtime {
    fn new(common: &CommonArgs) -> Result<Self, AppError> {
        let metrics = Arc::new(Metrics::new());
        if let Some(port) = common.metrics_port {
            Arc::clone(&metrics).serve(port)?;
        }
        Ok(Self {
            metrics,
            clock: clock::system_clock(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn briefcase_path(common: &CommonArgs) -> PathBuf {
    PathBuf::from(config::absolute_path(
        &common.output_prefix,
        &common.briefcase,
    ))
}

fn lockfile_path(common: &CommonArgs) -> PathBuf {
    let mut name = briefcase_path(common).into_os_string();
    name.push(".lck");
    PathBuf::from(name)
}

fn make_syncer(
    common: &CommonArgs,
    runtime: &Runtime,
    briefcase: Briefcase,
) -> Result<Syncer, AppError> {
    let config = config::load(
        &common.config_file,
        &common.input_prefix,
        &common.output_prefix,
    )?;
    let client = Arc::new(HttpVaultClient::new(
        &common.service_secret_prefix,
        Duration::from_secs(common.vault_client_timeout_secs),
        common.vault_client_retries,
    )?);

    Ok(Syncer::new(
        config,
        client,
        briefcase,
        Arc::clone(&runtime.metrics),
        Arc::clone(&runtime.clock),
        SyncerOptions {
            briefcase_path: briefcase_path(common),
            vault_token: common.vault_token.clone(),
            vault_token_renewable: common.vault_token_renewable,
            auth: common.auth_method(),
            sts_ttl_secs: common.sts_ttl_secs,
            force_refresh_ttl_secs: common.force_refresh_ttl_secs,
        },
        Arc::clone(&runtime.cancel),
    ))
}

fn perform_init(common: &CommonArgs) -> Result<(), AppError> {
    tracing::info!(build_version = BUILD_VERSION, "starting");
    let runtime = Runtime::new(common)?;

    let lock_handle = lock::lock_file(&lockfile_path(common))?;

    if briefcase_path(common).exists() {
        tracing::warn!(
            filename = %briefcase_path(common).display(),
            "running in init mode, but briefcase file already exists"
        );
        if matches!(common.auth_method(), Some(AuthMethod::K8sJwt { .. })) {
            tracing::warn!("running in kubernetes - performing oneshot sidecar instead of init");
            lock_handle.unlock();
            return one_shot_with_runtime(common, &runtime);
        }
    }

    let mut syncer = make_syncer(common, &runtime, Briefcase::new())?;
    let next_sync = runtime.clock.now() + ChronoDuration::hours(24);
    syncer.perform_sync(next_sync)?;

    lock_handle.unlock();
    Ok(())
}

fn perform_one_shot_sidecar(common: &CommonArgs) -> Result<(), AppError> {
    let runtime = Runtime::new(common)?;
    one_shot_with_runtime(common, &runtime)
}

fn one_shot_with_runtime(common: &CommonArgs, runtime: &Runtime) -> Result<(), AppError> {
    tracing::debug!(
        briefcase = %briefcase_path(common).display(),
        build_version = BUILD_VERSION,
        "starting oneshot"
    );

    let lock_handle = lock::lock_file(&lockfile_path(common))?;

    let briefcase = Briefcase::load(&briefcase_path(common));
    let mut syncer = make_syncer(common, runtime, briefcase)?;
    let next_sync = runtime.clock.now()
        + ChronoDuration::seconds(common.renew_interval_secs as i64 * 2);
    let result = syncer.perform_sync(next_sync);

    lock_handle.unlock();
    result.map_err(AppError::from)
}

/// One sidecar heartbeat: lock, load, sync, unlock. Failures are counted and
/// logged; the loop carries on and retries on the next tick.
fn sidecar_sync(common: &CommonArgs, runtime: &Runtime) {
    let result = (|| -> Result<(), AppError> {
        let lock_handle = lock::lock_file(&lockfile_path(common))?;
        let briefcase = Briefcase::load(&briefcase_path(common));
        let mut syncer = make_syncer(common, runtime, briefcase)?;
        let next_sync = runtime.clock.now()
            + ChronoDuration::seconds(common.renew_interval_secs as i64 * 2);
        syncer.perform_sync(next_sync)?;
        lock_handle.unlock();
        Ok(())
    })();

    if let Err(err) = result {
        runtime.metrics.sidecar_sync_errors.inc();
        tracing::error!(error = %err, "sync failed");
    }
}

enum LoopEvent {
    Shutdown,
}

fn perform_sidecar(common: &CommonArgs) -> Result<(), AppError> {
    let runtime = Runtime::new(common)?;

    tracing::info!(
        renew_interval_secs = common.renew_interval_secs,
        build_version = BUILD_VERSION,
        "starting"
    );

    let (tx, rx) = mpsc::channel::<LoopEvent>();
    spawn_signal_listener(tx, Arc::clone(&runtime.cancel))?;

    sidecar_sync(common, &runtime);

    let renew_interval = Duration::from_secs(common.renew_interval_secs.max(1));
    let check_interval = Duration::from_secs(SHUTDOWN_FILE_CHECK_SECS);
    let mut next_renew = Instant::now() + renew_interval;
    let mut next_check = Instant::now() + check_interval;

    loop {
        let now = Instant::now();
        let wait = next_renew.min(next_check).saturating_duration_since(now);

        match rx.recv_timeout(wait) {
            Ok(LoopEvent::Shutdown) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        if now >= next_renew {
            tracing::info!("heartbeat");
            sidecar_sync(common, &runtime);
            next_renew = Instant::now() + renew_interval;
        }
        if now >= next_check {
            if shutdown_triggered(&common.shutdown_trigger_file) {
                break;
            }
            next_check = Instant::now() + check_interval;
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

fn shutdown_triggered(trigger_file: &str) -> bool {
    if trigger_file.is_empty() {
        return false;
    }
    tracing::debug!(trigger_file, "performing completion check against file");
    if Path::new(trigger_file).exists() {
        tracing::info!(trigger_file, "trigger file present; exiting");
        return true;
    }
    false
}

fn spawn_signal_listener(
    tx: mpsc::Sender<LoopEvent>,
    cancel: Arc<AtomicBool>,
) -> Result<(), AppError> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::info!(signal, "received shutdown signal");
            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
            if tx.send(LoopEvent::Shutdown).is_err() {
                return;
            }
        }
    });
    Ok(())
}

/// Best-effort removal of everything this tool has declared it writes.
/// Individual failures are logged, not fatal; an unreadable config is fatal
/// because without it there is no way to know what to clean up.
fn perform_cleanup(common: &CommonArgs, revoke: bool) -> Result<(), AppError> {
    tracing::info!(
        config_file = %common.config_file,
        briefcase = %briefcase_path(common).display(),
        "performing cleanup"
    );

    let briefcase = Briefcase::load(&briefcase_path(common));

    if revoke && !briefcase.auth_token_lease.token.is_empty() {
        match HttpVaultClient::new(
            &common.service_secret_prefix,
            Duration::from_secs(common.vault_client_timeout_secs),
            common.vault_client_retries,
        ) {
            Ok(client) => {
                client.set_token(&briefcase.auth_token_lease.token);
                if let Err(err) = client.revoke_self() {
                    tracing::warn!(error = %err, "unable to revoke vault token");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "could not create vault client to revoke token");
            }
        }
    }

    if let Err(err) = std::fs::remove_file(briefcase_path(common)) {
        tracing::warn!(error = %err, "could not remove briefcase");
    }

    let config = config::load(
        &common.config_file,
        &common.input_prefix,
        &common.output_prefix,
    )
    .map_err(|err| {
        tracing::warn!(error = %err, "could not read config file - unsure what to cleanup");
        err
    })?;

    remove_declared_files(&config);

    tracing::info!("cleanup finished");
    Ok(())
}

fn remove_declared_files(config: &LoadedConfig) {
    let mut files: Vec<String> = Vec::new();

    if !config.vault.vault_token.output.is_empty() {
        files.push(config.vault.vault_token.output.clone());
    }
    for tpl in &config.vault.templates {
        if !tpl.output.is_empty() {
            files.push(tpl.output.clone());
        }
    }
    for secret in &config.vault.secrets {
        if !secret.output.is_empty() {
            files.push(secret.output.clone());
        }
        for field in &secret.fields {
            if !field.output.is_empty() {
                files.push(field.output.clone());
            }
        }
    }
    for ssh in &config.vault.ssh_certificates {
        for name in [SSH_PRIVATE_KEY, SSH_PUBLIC_KEY, SSH_CERTIFICATE] {
            files.push(
                Path::new(&ssh.output_path)
                    .join(name)
                    .display()
                    .to_string(),
            );
        }
    }
    for aws in &config.vault.aws {
        for name in ["credentials", "config"] {
            files.push(
                Path::new(&aws.output_path)
                    .join(name)
                    .display()
                    .to_string(),
            );
        }
    }

    for file in files {
        if let Err(err) = std::fs::remove_file(&file) {
            tracing::warn!(filename = %file, error = %err, "could not remove file");
        }
    }
}
