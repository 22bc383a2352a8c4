//! CLI command definitions for runnerctl.
//!
//! Provides commands for starting, stopping, and inspecting a runner fleet,
//! checking the runner image against the registry, and exercising a remote
//! daemon lease.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::fleet::{FleetConfig, FleetController, RUNNER_IMAGE_PATTERN};
use crate::lease::{LeaseClient, LeaseConfig};
use crate::provision::HttpProvisioningClient;
use crate::registry::{RegistryClient, REGISTRY_PASSWORD_ENV, REGISTRY_USER_ENV};
use crate::runtime::{DockerConnector, DockerRuntime, RegistryAuth, RuntimeClient};

/// Default registry API base for the runner image.
const DEFAULT_REGISTRY_URL: &str = "https://registry.runnerctl.dev/v2";

/// Default repository path of the runner image.
const DEFAULT_REPOSITORY: &str = "runnerctl/runner-agent";

/// Runner fleet controller and remote daemon lease client.
#[derive(Parser)]
#[command(name = "runnerctl")]
#[command(about = "Launch and manage build-runner containers")]
#[command(version)]
#[command(
    long_about = "runnerctl launches a fleet of runner containers on a Docker host, \
multiplexes their logs, and reaps them as they exit.\n\nExample usage:\n  \
runnerctl start --name host1 --count 2 --orgs my-org"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Launch runner containers and wait for them to finish.
    Start(StartArgs),

    /// Stop and remove the runner containers of a fleet.
    Stop(FleetSelectArgs),

    /// Report which runner containers of a fleet are active.
    Status(FleetSelectArgs),

    /// Compare the local runner image against the registry.
    CheckImage(CheckImageArgs),

    /// Provision a remote daemon lease, verify it, and release it.
    Lease(LeaseArgs),
}

/// Arguments for `runnerctl start`.
#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Base name for the fleet; containers are named `{name}_{seq}`.
    #[arg(long, env = "HOSTNAME", default_value = "runner")]
    pub name: String,

    /// Number of runner containers to launch.
    #[arg(short, long, default_value = "1")]
    pub count: usize,

    /// Runner image; defaults to the newest matching image in the local
    /// repository.
    #[arg(long, default_value = "")]
    pub image: String,

    /// API bearer token (can also be set via RUNNER_API_TOKEN).
    #[arg(long, env = "RUNNER_API_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Runner group name.
    #[arg(long, default_value = "")]
    pub group: String,

    /// Comma-separated organizations to accept work from.
    #[arg(long, default_value = "")]
    pub orgs: String,

    /// Comma-separated applications to accept work from.
    #[arg(long, default_value = "")]
    pub apps: String,

    /// Comma-separated workflows to accept work from.
    #[arg(long, default_value = "")]
    pub workflows: String,

    /// Accept work from everything the token can see.
    #[arg(long)]
    pub all: bool,

    /// Local artifact storage path, bind-mounted into the runners.
    #[arg(long, default_value = "")]
    pub store_path: String,

    /// Directory for per-container log files; default is console output.
    #[arg(long, default_value = "")]
    pub logs_path: String,

    /// Agent polling frequency in seconds (0 = agent default).
    #[arg(long, default_value = "0")]
    pub poll_frequency: u32,

    /// Enable debug output in the runner agents.
    #[arg(short, long)]
    pub debug: bool,

    /// Enable journal logging in the runner agents.
    #[arg(long)]
    pub journal: bool,

    /// Return immediately after launching instead of waiting; the
    /// containers keep running and must be stopped explicitly.
    #[arg(long)]
    pub no_wait: bool,

    /// Docker endpoint (unix:// socket or tcp:// address).
    #[arg(long)]
    pub docker_endpoint: Option<String>,
}

/// Arguments selecting an existing fleet.
#[derive(Parser, Debug)]
pub struct FleetSelectArgs {
    /// Base name of the fleet.
    #[arg(long, env = "HOSTNAME", default_value = "runner")]
    pub name: String,

    /// Docker endpoint (unix:// socket or tcp:// address).
    #[arg(long)]
    pub docker_endpoint: Option<String>,
}

/// Arguments for `runnerctl check-image`.
#[derive(Parser, Debug)]
pub struct CheckImageArgs {
    /// Registry API base URL.
    #[arg(long, default_value = DEFAULT_REGISTRY_URL)]
    pub registry_url: String,

    /// Repository path of the runner image.
    #[arg(long, default_value = DEFAULT_REPOSITORY)]
    pub repository: String,

    /// Pull the newest published image into the local repository.
    #[arg(long)]
    pub pull: bool,
}

/// Arguments for `runnerctl lease`.
#[derive(Parser, Debug)]
pub struct LeaseArgs {
    /// Provisioning service endpoint.
    #[arg(long)]
    pub service_endpoint: String,

    /// Run identifier; a fresh one is generated when omitted.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Provisioning deadline in seconds.
    #[arg(long, default_value = "300")]
    pub timeout: i64,

    /// Keep the lease for this many seconds before releasing it.
    #[arg(long, default_value = "0")]
    pub hold: u64,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::Stop(args) => stop(args).await,
        Commands::Status(args) => status(args).await,
        Commands::CheckImage(args) => check_image(args).await,
        Commands::Lease(args) => lease(args).await,
    }
}

fn fleet_config(args: &StartArgs) -> FleetConfig {
    let mut config = FleetConfig::new(args.name.as_str());
    config.count = args.count;
    config.image = args.image.clone();
    config.bearer_token = args.token.clone();
    config.group = args.group.clone();
    config.orgs = args.orgs.clone();
    config.apps = args.apps.clone();
    config.workflows = args.workflows.clone();
    config.all = args.all;
    config.store_path = args.store_path.clone();
    config.log_path = args.logs_path.clone();
    config.poll_frequency = args.poll_frequency;
    config.debug = args.debug;
    config.journal = args.journal;
    config
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let runtime: Arc<dyn RuntimeClient> =
        Arc::new(DockerRuntime::connect(args.docker_endpoint.as_deref())?);
    let no_wait = args.no_wait;
    let config = fleet_config(&args);
    let log_path = config.log_path.clone();

    let mut controller = FleetController::new(config, runtime);
    let launched = controller.start().await?;
    if launched == 0 {
        return Ok(());
    }

    if !log_path.is_empty() {
        info!(directory = %log_path, "runner output is written to log files");
    }

    if no_wait {
        info!("use the stop command with the same name to terminate the runners");
        return Ok(());
    }

    controller.wait().await?;
    Ok(())
}

async fn stop(args: FleetSelectArgs) -> anyhow::Result<()> {
    let runtime: Arc<dyn RuntimeClient> =
        Arc::new(DockerRuntime::connect(args.docker_endpoint.as_deref())?);
    let controller = FleetController::new(FleetConfig::new(args.name.as_str()), runtime);
    controller.stop().await?;
    Ok(())
}

async fn status(args: FleetSelectArgs) -> anyhow::Result<()> {
    let runtime: Arc<dyn RuntimeClient> =
        Arc::new(DockerRuntime::connect(args.docker_endpoint.as_deref())?);
    let controller = FleetController::new(FleetConfig::new(args.name.as_str()), runtime);

    let report = controller.status().await?;
    if report.is_empty() {
        info!(fleet = %args.name, "there are no runner containers");
    }
    Ok(())
}

async fn check_image(args: CheckImageArgs) -> anyhow::Result<()> {
    let registry = RegistryClient::from_env(args.registry_url.as_str(), args.repository.as_str())?;
    let remote = registry.latest_image().await?;
    info!(
        reference = %remote.reference,
        created = %remote.created,
        "newest published runner image"
    );

    let runtime = DockerRuntime::connect(None)?;
    match runtime.find_local_image(RUNNER_IMAGE_PATTERN).await? {
        Some(local) => info!(reference = %local, "local runner image"),
        None => warn!("no runner image in the local repository; pull the published one"),
    }

    if args.pull {
        info!(reference = %remote.reference, "pulling runner image");
        let auth = registry_auth_from_env();
        runtime.pull_image(&remote.reference, auth).await?;
        info!(reference = %remote.reference, "runner image pulled");
    }
    Ok(())
}

/// Registry credentials for an authenticated pull, when configured.
fn registry_auth_from_env() -> Option<RegistryAuth> {
    let username = std::env::var(REGISTRY_USER_ENV).unwrap_or_default();
    let password = std::env::var(REGISTRY_PASSWORD_ENV).unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some(RegistryAuth { username, password })
}

async fn lease(args: LeaseArgs) -> anyhow::Result<()> {
    let run_id = args
        .run_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut config = LeaseConfig::new(args.service_endpoint.as_str());
    config.provision_timeout_secs = args.timeout;

    let provisioner = Arc::new(HttpProvisioningClient::new(args.service_endpoint.as_str())?);
    let mut client = LeaseClient::new(config, run_id, provisioner, Arc::new(DockerConnector));

    let uri = match client.provision().await {
        Ok(uri) => uri,
        Err(e) => {
            // A lease may have been recorded even though verification
            // failed; release it before surfacing the error.
            client.deprovision().await;
            return Err(e.into());
        }
    };

    println!("{}", uri);

    if args.hold > 0 {
        info!(secs = args.hold, "holding daemon lease");
        tokio::time::sleep(Duration::from_secs(args.hold)).await;
    }

    client.deprovision().await;
    Ok(())
}
