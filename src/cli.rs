use clap::{Args, Parser, Subcommand};

use crate::vaultclient::auth::AuthMethod;

#[derive(Debug, Parser)]
#[command(name = "vaultsync")]
#[command(about = "Credential synchronization sidecar for vault-managed workloads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Populate every configured output once, starting from an empty briefcase
    Init {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run forever, keeping outputs fresh until shutdown
    Sidecar {
        #[command(flatten)]
        common: CommonArgs,
        /// Perform a single pass and exit instead of looping
        #[arg(long)]
        one_shot: bool,
    },
    /// Remove the briefcase and every declared output file
    Cleanup {
        #[command(flatten)]
        common: CommonArgs,
        /// Also attempt to revoke the current vault token
        #[arg(long)]
        revoke: bool,
    },
    /// Print the build version
    Version,
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Path to the YAML configuration file
    #[arg(long = "config", default_value = "vaultsync.yaml")]
    pub config_file: String,

    /// Path to the briefcase state file
    #[arg(long, default_value = "/tmp/vaultsync/briefcase.json")]
    pub briefcase: String,

    /// Prefix applied to relative input paths (config file, template inputs)
    #[arg(long, default_value = "")]
    pub input_prefix: String,

    /// Prefix applied to relative output paths
    #[arg(long, default_value = "")]
    pub output_prefix: String,

    /// Vault token supplied externally, tried after the briefcase's own
    #[arg(long, default_value = "")]
    pub vault_token: String,

    /// Whether the supplied vault token should be treated as renewable
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub vault_token_renewable: bool,

    /// Override the KV prefix applied to relative secret paths
    #[arg(long, default_value = "")]
    pub service_secret_prefix: String,

    /// Seconds between sidecar passes
    #[arg(long, default_value_t = 540)]
    pub renew_interval_secs: u64,

    /// Exit the sidecar once this file exists
    #[arg(long, default_value = "")]
    pub shutdown_trigger_file: String,

    /// TTL requested for STS credentials, seconds (0 uses the backend default)
    #[arg(long, default_value_t = 0)]
    pub sts_ttl_secs: u64,

    /// Force AWS and SSH artifacts to refresh this many seconds after writing
    #[arg(long, default_value_t = 0)]
    pub force_refresh_ttl_secs: u64,

    /// Vault HTTP client per-request timeout, seconds
    #[arg(long, default_value_t = 30)]
    pub vault_client_timeout_secs: u64,

    /// Vault HTTP client retry count for transient failures
    #[arg(long, default_value_t = 2)]
    pub vault_client_retries: u32,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Authenticate with the Kubernetes service account JWT against this role
    #[arg(long, default_value = "")]
    pub k8s_auth_role: String,

    /// Vault path of the Kubernetes auth backend
    #[arg(long, default_value = "kubernetes")]
    pub k8s_login_path: String,

    /// Projected service account token file for Kubernetes auth
    #[arg(
        long,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub service_account_token: String,

    /// Authenticate with the EC2 PKCS7 instance identity document
    #[arg(long)]
    pub ec2_auth: bool,

    /// Reauthentication nonce for EC2 AMI auth
    #[arg(long, default_value = "")]
    pub ec2_nonce: String,

    /// Authenticate with the instance IAM role against this vault role
    #[arg(long, default_value = "")]
    pub iam_auth_role: String,

    /// Vault path of the AWS IAM auth backend
    #[arg(long, default_value = "aws")]
    pub iam_vault_auth_backend: String,
}

impl CommonArgs {
    /// The authentication mechanism selected by the flags, if any. At most
    /// one is honored; a run that needs to authenticate without one fails at
    /// that point.
    pub fn auth_method(&self) -> Option<AuthMethod> {
        if !self.k8s_auth_role.is_empty() {
            return Some(AuthMethod::K8sJwt {
                service_account_token: self.service_account_token.clone(),
                login_path: self.k8s_login_path.clone(),
                role: self.k8s_auth_role.clone(),
            });
        }
        if self.ec2_auth {
            return Some(AuthMethod::Ec2Ami {
                nonce: self.ec2_nonce.clone(),
            });
        }
        if !self.iam_auth_role.is_empty() {
            let region = std::env::var("AWS_DEFAULT_REGION")
                .ok()
                .filter(|region| !region.is_empty())
                .unwrap_or_else(|| {
                    tracing::debug!("using hardcoded us-east-1 region");
                    "us-east-1".to_string()
                });
            return Some(AuthMethod::Ec2Iam {
                role: self.iam_auth_role.clone(),
                backend: self.iam_vault_auth_backend.clone(),
                region,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn sidecar_accepts_one_shot() {
        let cli = parse(&["vaultsync", "sidecar", "--one-shot", "--config", "cfg.yaml"]);
        match cli.command {
            Command::Sidecar { common, one_shot } => {
                assert!(one_shot);
                assert_eq!(common.config_file, "cfg.yaml");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn one_shot_is_rejected_outside_sidecar() {
        assert!(Cli::try_parse_from(["vaultsync", "init", "--one-shot"]).is_err());
        assert!(Cli::try_parse_from(["vaultsync", "cleanup", "--one-shot"]).is_err());
    }

    #[test]
    fn auth_method_prefers_kubernetes() {
        let cli = parse(&[
            "vaultsync",
            "init",
            "--k8s-auth-role",
            "my-service",
            "--ec2-auth",
        ]);
        let Command::Init { common } = cli.command else {
            panic!("expected init");
        };
        assert!(matches!(
            common.auth_method(),
            Some(AuthMethod::K8sJwt { role, .. }) if role == "my-service"
        ));
    }

    #[test]
    fn no_auth_flags_means_no_mechanism() {
        let cli = parse(&["vaultsync", "init"]);
        let Command::Init { common } = cli.command else {
            panic!("expected init");
        };
        assert!(common.auth_method().is_none());
    }
}
