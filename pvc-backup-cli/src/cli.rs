use clap::{Args, Parser, Subcommand};
use pvc_backup_config::shared::AuthMode;

#[derive(Parser, Debug)]
#[command(name = "pvc-backup", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// How to reach the cluster. Unset values fall back to the `auth` section of
/// the configuration.
#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// Authentication mode: in-cluster, kubeconfig-path or pasted-kubeconfig
    #[arg(long, global = true)]
    pub auth_mode: Option<AuthMode>,

    /// Kubeconfig file used by the kubeconfig-path mode
    #[arg(long, global = true, env = "PVC_BACKUP_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Context to use instead of the kubeconfig's current-context
    #[arg(long, global = true)]
    pub context: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the contexts defined in a kubeconfig file
    Contexts,
    /// Count namespaces, pods and claims in the cluster
    Summary,
    /// List claims with their owning workload and last successful backup
    Discover {
        /// Only scan these namespaces (repeatable or comma-separated)
        #[arg(long = "namespace", short = 'n', value_delimiter = ',')]
        namespaces: Vec<String>,
    },
    /// Back up claims
    Backup(BackupArgs),
    /// Show the most recent backup attempts
    History {
        /// Number of entries to show, defaults to `history_limit`
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Back up every claim in these namespaces (repeatable or comma-separated)
    #[arg(long = "namespace", short = 'n', value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Back up a single claim given as `namespace/name` (repeatable)
    #[arg(long = "claim")]
    pub claims: Vec<String>,

    /// Back up every claim the discovery scan finds
    #[arg(long, conflicts_with_all = ["namespaces", "claims"])]
    pub all: bool,

    /// Override `batch.max_concurrency`
    #[arg(long)]
    pub max_concurrency: Option<usize>,
}
