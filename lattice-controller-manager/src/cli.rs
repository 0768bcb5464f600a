use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lattice_core::{DEFAULT_CONFIG_NAME, DEFAULT_INTERNAL_NAMESPACE, DEFAULT_NAMESPACE_PREFIX};

pub const DEFAULT_WORKERS: u16 = 4;
pub const DEFAULT_DEFINITION_CACHE: &str = "/var/lib/lattice/definitions";
pub const DEFAULT_DEPLOY_DEGRADED_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// namespace holding lattice's own resources and its config
    #[arg(short = 'n', long, global = true, default_value = DEFAULT_INTERNAL_NAMESPACE)]
    pub namespace: String,
    /// name of the Config resource to watch
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_NAME)]
    pub config_name: String,
    /// prefix of the tenant namespaces (`<prefix>-system-<id>`)
    #[arg(long, global = true, default_value = DEFAULT_NAMESPACE_PREFIX)]
    pub namespace_prefix: String,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace", global = true)]
    pub trace_logging: bool,
}

impl GlobalArgs {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// run the controllers (default)
    #[command(alias = "r")]
    Run(RunArgs),
    /// print the custom resource definitions as YAML
    Crds,
    /// print the networking provider's bootstrap resources as YAML
    Bootstrap(BootstrapArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// number of concurrent reconciliations per controller
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: u16,
    /// directory holding pre-fetched system definitions
    #[arg(long, default_value = DEFAULT_DEFINITION_CACHE)]
    pub definition_cache: PathBuf,
    /// how long a deploy may keep the system degraded before it's marked as failed
    #[arg(long, default_value_t = DEFAULT_DEPLOY_DEGRADED_TIMEOUT_SECS)]
    pub deploy_degraded_timeout_secs: u64,
    /// apply the custom resource definitions before starting
    #[arg(long)]
    pub install_crds: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            definition_cache: PathBuf::from(DEFAULT_DEFINITION_CACHE),
            deploy_degraded_timeout_secs: DEFAULT_DEPLOY_DEGRADED_TIMEOUT_SECS,
            install_crds: false,
        }
    }
}

#[derive(Debug, Args)]
pub struct BootstrapArgs {
    /// YAML file containing a Config spec
    #[arg(long)]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_optional_and_flags_are_global() {
        let cli = Cli::parse_from(["lattice-controller-manager", "--trace"]);

        assert!(cli.command.is_none());
        assert!(matches!(cli.global_args.get_log_level(), LogLevel::Trace));
        assert_eq!(cli.global_args.namespace, DEFAULT_INTERNAL_NAMESPACE);
    }

    #[test]
    fn run_args_are_parsed() {
        let cli = Cli::parse_from([
            "lattice-controller-manager",
            "run",
            "--workers",
            "8",
            "--definition-cache",
            "/tmp/definitions",
            "-n",
            "lattice-internal-dev",
        ]);

        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.workers, 8);
                assert_eq!(args.definition_cache, PathBuf::from("/tmp/definitions"));
                assert_eq!(
                    args.deploy_degraded_timeout_secs,
                    DEFAULT_DEPLOY_DEGRADED_TIMEOUT_SECS
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.global_args.namespace, "lattice-internal-dev");
    }
}
