//  MAIN.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Entrypoint to the `orbitmesh-job` service (the node-side agent).
//

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use error_trace::trace;
use log::{LevelFilter, debug, error, info, warn};
use orbitmesh_cfg::info::Info as _;
use orbitmesh_cfg::node::{AgentConfig, NodeConfig, parse_tags};
use orbitmesh_job::connection::{self, SessionConfig};
use orbitmesh_job::dispatch::CommandRouter;
use orbitmesh_job::handlers;
use orbitmesh_job::registry::HandlerRegistry;
use orbitmesh_job::reporter::Reporter;
use specifications::agents::{AgentInfo, Capability};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;


/***** ARGUMENTS *****/
/// Defines the arguments that may be given to the service.
#[derive(Parser)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Opts {
    /// Print debug info
    #[clap(short, long, action, help = "If given, prints additional logging information.", env = "DEBUG")]
    debug: bool,

    /// Node environment metadata store.
    #[clap(
        short,
        long,
        default_value = "/node.yml",
        help = "The path to the node environment configuration. This defines the host address, this agent's identity and its credentials.",
        env = "NODE_CONFIG_PATH"
    )]
    node_config_path: PathBuf,

    /// Overrides the host address from the config file.
    #[clap(long, help = "The address of the host's gRPC endpoint, as '<host>:<port>'.", env = "ORBITMESH_SERVER_URL")]
    server_address: Option<String>,
    /// Overrides the agent name from the config file.
    #[clap(long, help = "The name this agent registers under. Defaults to the machine's hostname.", env = "ORBITMESH_AGENT_NAME")]
    agent_name: Option<String>,
    /// Overrides the access token from the config file.
    #[clap(long, help = "A pre-issued access token for registration.", env = "ORBITMESH_ACCESS_TOKEN")]
    access_token: Option<String>,
    /// Overrides the bootstrap token from the config file.
    #[clap(long, help = "The bootstrap-token secret for first contact.", env = "ORBITMESH_BOOTSTRAP_TOKEN")]
    bootstrap_token: Option<String>,
    /// Additional tags for this agent.
    #[clap(long, help = "Comma-separated 'key:value' tags this agent carries.", env = "ORBITMESH_TAGS")]
    tags: Option<String>,
    /// Whether the shell-execution capability may be registered.
    #[clap(long, action, help = "If given, allows the shell-execution capability (when compiled in).", env = "ORBITMESH_ENABLE_SHELL_EXECUTION")]
    enable_shell_execution: bool,
}





/***** ENTRY POINT *****/
#[tokio::main]
async fn main() {
    dotenv().ok();
    let opts = Opts::parse();

    // Configure logger.
    let mut logger = env_logger::builder();
    logger.format_module_path(false);
    if opts.debug {
        logger.filter_level(LevelFilter::Debug).init();
    } else {
        logger.filter_level(LevelFilter::Info).init();
    }
    info!("Initializing orbitmesh-job v{}...", env!("CARGO_PKG_VERSION"));

    // Load the config, making sure it's an agent config; a given server address can stand in
    // for a missing file
    debug!("Loading node.yml file '{}'...", opts.node_config_path.display());
    let config: AgentConfig = match NodeConfig::from_path(&opts.node_config_path) {
        Ok(config) => match config.node.try_into_agent() {
            Ok(agent) => agent,
            Err(err) => {
                error!("{err}");
                std::process::exit(1);
            },
        },
        Err(err) if opts.server_address.is_some() => {
            debug!("No usable node.yml ({err}); running from flags/environment only");
            AgentConfig {
                server_address: match opts.server_address.as_ref().unwrap().parse() {
                    Ok(address) => address,
                    Err(err) => {
                        error!("Illegal server address: {err}");
                        std::process::exit(1);
                    },
                },
                agent_id: None,
                agent_name: None,
                access_token: None,
                bootstrap_token: None,
                group: None,
                tags: Vec::new(),
                capabilities: Vec::new(),
                enable_shell_execution: false,
            }
        },
        Err(err) => {
            error!("{}", trace!(("Failed to load NodeConfig file '{}'", opts.node_config_path.display()), err));
            std::process::exit(1);
        },
    };

    // Resolve the agent's identity (flags/environment win over the file)
    let agent_id: String = config.agent_id.clone().unwrap_or_else(|| {
        let generated: String = uuid::Uuid::new_v4().to_string();
        warn!("No agent id configured; running as generated id '{generated}' (set one to keep identity across restarts)");
        generated
    });
    let agent_name: String = opts
        .agent_name
        .or(config.agent_name.clone())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("agent-{}", &agent_id[..8.min(agent_id.len())]));

    // Build the handler registry; capabilities are the registered commands plus the
    // configured extras
    let registry: HandlerRegistry = HandlerRegistry::new();
    handlers::register_builtins(&registry);
    if opts.enable_shell_execution || config.enable_shell_execution {
        // The shell capability ships as a separate capability crate
        warn!("Shell execution was requested, but no shell capability is compiled into this build");
    }

    let mut agent: AgentInfo = AgentInfo::new(agent_id.clone(), agent_name);
    for command in registry.commands() {
        agent.capabilities.insert(command.clone(), Capability::named(command));
    }
    for capability in &config.capabilities {
        agent.capabilities.insert(capability.clone(), Capability::named(capability.clone()));
    }
    agent.group = config.group.clone();
    agent.tags = config.tags.iter().cloned().collect::<HashSet<String>>();
    if let Some(raw) = &opts.tags {
        match parse_tags(raw) {
            Ok(tags) => agent.tags.extend(tags),
            Err(err) => {
                error!("Illegal --tags value: {err}");
                std::process::exit(1);
            },
        }
    }

    // Wire the reporting path and the router
    let reporter: Arc<Reporter> = Arc::new(Reporter::new(agent_id));
    let (router, mut shutdown_rx) = CommandRouter::new(registry, reporter.clone());

    // SIGTERM flips the same shutdown signal the host's Shutdown command uses
    let (signal_tx, _) = watch::channel(false);
    let shutdown_tx: watch::Sender<bool> = signal_tx;
    let mut sigterm_shutdown: watch::Receiver<bool> = shutdown_tx.subscribe();
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut handler) => {
                handler.recv().await;
                info!("Received SIGTERM, shutting down gracefully...");
                let _ = shutdown_tx.send(true);
            },
            Err(err) => {
                error!("{}", trace!(("Failed to register SIGTERM signal handler"), err));
                warn!("Service will NOT shutdown gracefully on SIGTERM");
            },
        }
    });

    // Merge the two shutdown sources into one receiver for the connection loop
    let (merged_tx, merged_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.changed() => {},
            _ = sigterm_shutdown.changed() => {},
        }
        let _ = merged_tx.send(true);
    });

    // Run the connection loop until shutdown
    let session: SessionConfig = SessionConfig {
        server_url: config.server_address.to_url(),
        agent,
        access_token: opts.access_token.or(config.access_token),
        bootstrap_token: opts.bootstrap_token.or(config.bootstrap_token),
    };
    let code: i32 = connection::run(session, reporter, router, merged_rx).await;
    std::process::exit(code);
}
