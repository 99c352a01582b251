//! vSphere cloud operator - renders and reconciles the vSphere CPI and CSI
//! manifests against a Kubernetes cluster

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vsphere_cloud_operator::catalog::{Component, ReleaseCatalog};
use vsphere_cloud_operator::config::{CharmConfig, ParameterSet};
use vsphere_cloud_operator::reconcile::cluster::KubeClusterApi;
use vsphere_cloud_operator::reconcile::Engine;
use vsphere_cloud_operator::relations::RelationViews;
use vsphere_cloud_operator::state::FileStateStore;
use vsphere_cloud_operator::Error;

/// vSphere cloud operator - manifest rendering and reconciliation for the
/// vSphere cloud provider and CSI storage driver
#[derive(Parser, Debug)]
#[command(name = "vsphere-cloud-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the configured releases and converge the cluster
    Reconcile(ReconcileArgs),

    /// List the release versions this binary carries and exit
    ListReleases,

    /// Delete everything the applied state records, then exit
    Cleanup(CleanupArgs),
}

/// Reconcile mode arguments
#[derive(Parser, Debug)]
struct ReconcileArgs {
    /// Path to the charm config YAML
    #[arg(short = 'c', long = "config", env = "VSPHERE_OPERATOR_CONFIG")]
    config_file: PathBuf,

    /// Path to the relation data YAML; absent means no relations joined
    #[arg(short = 'r', long = "relations", env = "VSPHERE_OPERATOR_RELATIONS")]
    relations_file: Option<PathBuf>,

    /// Directory holding per-scope applied-state files
    #[arg(
        long = "state-dir",
        env = "VSPHERE_OPERATOR_STATE_DIR",
        default_value = "/var/lib/vsphere-cloud-operator"
    )]
    state_dir: PathBuf,

    /// Reconcile only one component (provider or storage)
    #[arg(long)]
    component: Option<String>,
}

/// Cleanup mode arguments
#[derive(Parser, Debug)]
struct CleanupArgs {
    /// Directory holding per-scope applied-state files
    #[arg(
        long = "state-dir",
        env = "VSPHERE_OPERATOR_STATE_DIR",
        default_value = "/var/lib/vsphere-cloud-operator"
    )]
    state_dir: PathBuf,

    /// Clean up only one component (provider or storage)
    #[arg(long)]
    component: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Reconcile(args) => run_reconcile(args).await,
        Commands::ListReleases => run_list_releases(),
        Commands::Cleanup(args) => run_cleanup(args).await,
    }
}

fn parse_component(raw: &str) -> anyhow::Result<Component> {
    match raw {
        "provider" => Ok(Component::Provider),
        "storage" => Ok(Component::Storage),
        other => Err(anyhow::anyhow!(
            "unknown component {other:?}, expected \"provider\" or \"storage\""
        )),
    }
}

fn selected_components(raw: Option<&str>) -> anyhow::Result<Vec<Component>> {
    match raw {
        Some(raw) => Ok(vec![parse_component(raw)?]),
        None => Ok(Component::ALL.to_vec()),
    }
}

async fn build_engine(state_dir: PathBuf) -> anyhow::Result<Engine> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let cluster = Arc::new(KubeClusterApi::new(client));
    let store = Arc::new(FileStateStore::new(state_dir)?);
    Ok(Engine::new(cluster, store))
}

async fn run_reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    let config_raw = tokio::fs::read_to_string(&args.config_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", args.config_file, e))?;
    let config: CharmConfig = serde_yaml::from_str(&config_raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse charm config: {}", e))?;

    let relations = match &args.relations_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read relations file {:?}: {}", path, e))?;
            serde_yaml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Failed to parse relation data: {}", e))?
        }
        None => RelationViews::default(),
    };

    let params = match ParameterSet::resolve(&config, &relations) {
        Ok(params) => params,
        // Waiting conditions are normal while relations settle; report and
        // leave the cluster untouched.
        Err(e) if e.is_waiting() => {
            tracing::info!(status = %e, "Not ready to reconcile");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let engine = build_engine(args.state_dir).await?;
    for component in selected_components(args.component.as_deref())? {
        let outcome = engine.reconcile(component, &params).await?;
        tracing::info!(
            scope = %component,
            release = %outcome.release,
            applied = outcome.applied,
            deleted = outcome.deleted,
            unchanged = outcome.unchanged,
            "Reconcile complete"
        );
    }
    Ok(())
}

fn run_list_releases() -> anyhow::Result<()> {
    let catalog = ReleaseCatalog::default();
    for component in Component::ALL {
        let latest = catalog.latest(component);
        for version in catalog.list(component) {
            let marker = if version == latest { " (default)" } else { "" };
            println!("{}: {}{}", component.scope(), version, marker);
        }
    }
    Ok(())
}

async fn run_cleanup(args: CleanupArgs) -> anyhow::Result<()> {
    let engine = build_engine(args.state_dir).await?;
    for component in selected_components(args.component.as_deref())? {
        match engine.cleanup(component).await {
            Ok(deleted) => {
                tracing::info!(scope = %component, deleted, "Cleanup complete");
            }
            Err(Error::State { .. }) => {
                return Err(anyhow::anyhow!(
                    "applied state for {} is unreadable, refusing cleanup",
                    component.scope()
                ));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
