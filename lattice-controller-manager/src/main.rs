use std::{process::exit, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use cli::{BootstrapArgs, Cli, Commands, GlobalArgs, LogLevel, RunArgs};
use config::{start_config_watcher, ConfigStore};
use controller::{
    backoff::RateLimiter,
    events::EventPublisher,
    reconciler::{
        apply_params,
        context::{ReconcilerContext, ReconcilerSettings},
    },
    shutdown::Shutdown,
    start_controllers,
};
use kube::Client;
use lattice_core::resources::crd::v1::{config::ConfigSpec, create_v1_crds, v1_crds};
use log::{info, LevelFilter};
use provider::{get_networking_provider, resolver::directory::DirectoryResolver, Providers};
use serde::Serialize;

mod cli;
mod config;
mod controller;
mod helpers;
mod provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_logger(&cli.global_args);

    match cli.command {
        Some(Commands::Crds) => print_crds(),
        Some(Commands::Bootstrap(args)) => print_bootstrap(&args).await,
        Some(Commands::Run(args)) => run(cli.global_args, args).await,
        None => run(cli.global_args, RunArgs::default()).await,
    }
}

async fn run(global_args: GlobalArgs, args: RunArgs) -> anyhow::Result<()> {
    let client = create_client().await;

    if args.install_crds {
        info!("Installing custom resource definitions...");

        create_v1_crds(&client, &apply_params()).await?;
    }

    let config_store = Arc::new(ConfigStore::new());
    let config_watcher = start_config_watcher(
        &client,
        &global_args.namespace,
        &global_args.config_name,
        config_store.clone(),
    );
    let config_watcher = tokio::spawn(config_watcher);

    info!(
        "Waiting for '{}' config in '{}' namespace...",
        global_args.config_name, global_args.namespace
    );

    config_store.wait_until_ready().await;

    let config = config_store.current().await?;
    let resolver = Arc::new(DirectoryResolver::new(args.definition_cache.clone()));
    let providers = Providers::from_config(
        &client,
        &config,
        config_store.clone(),
        &global_args.namespace,
        resolver,
    )
    .context("Couldn't set up the providers!")?;

    let shutdown = Shutdown::new();
    let context = Arc::new(ReconcilerContext {
        client: client.clone(),
        config: config_store,
        providers,
        events: EventPublisher::new(client),
        backoff: RateLimiter::default(),
        shutdown: shutdown.clone(),
        settings: ReconcilerSettings {
            namespace_prefix: global_args.namespace_prefix,
            workers: args.workers,
            deploy_degraded_timeout: Duration::from_secs(args.deploy_degraded_timeout_secs),
        },
    });

    tokio::spawn(shutdown.trigger_on_signal());

    start_controllers(context).await;
    config_watcher.abort();

    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    print_documents(&v1_crds())
}

async fn print_bootstrap(args: &BootstrapArgs) -> anyhow::Result<()> {
    let config = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("Couldn't read '{}'!", args.config.display()))?;
    let config: ConfigSpec = serde_yaml::from_str(&config).context("Couldn't parse the config!")?;
    let networking = get_networking_provider(config.networking_provider.kind())?;
    let resources = networking.bootstrap_resources(&config)?;

    if resources.is_empty() {
        info!("'{}' networking provider needs no bootstrap resources!", config.networking_provider.kind());

        return Ok(());
    }

    print_documents(&resources.config_maps)?;
    print_documents(&resources.daemon_sets)
}

fn print_documents<T: Serialize>(documents: &[T]) -> anyhow::Result<()> {
    for document in documents {
        println!("---\n{}", serde_yaml::to_string(document)?);
    }

    Ok(())
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            log::error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

fn configure_logger(global_args: &GlobalArgs) {
    let mut logger = env_logger::builder();

    logger
        .default_format()
        .format_module_path(matches!(global_args.get_log_level(), LogLevel::Trace))
        .filter_level(LevelFilter::Info);

    if let LogLevel::Verbose = global_args.get_log_level() {
        logger.filter(Some("lattice_controller_manager"), LevelFilter::Debug);
    }

    if let LogLevel::Trace = global_args.get_log_level() {
        logger.filter_level(LevelFilter::Trace);
    }

    logger.init();
}
