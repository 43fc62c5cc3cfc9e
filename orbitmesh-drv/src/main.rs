//  MAIN.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Entrypoint to the `orbitmesh-drv` service (the central host).
//

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use error_trace::trace;
use log::{LevelFilter, debug, error, info, warn};
use orbitmesh_cfg::info::Info as _;
use orbitmesh_cfg::node::{HostConfig, NodeConfig};
use orbitmesh_drv::api::{self, ApiContext};
use orbitmesh_drv::deploy::DeploymentEngine;
use orbitmesh_drv::dispatch;
use orbitmesh_drv::events::{self, EventBus};
use orbitmesh_drv::handler::ReportingHandler;
use orbitmesh_drv::hub::ConnectionHub;
use orbitmesh_drv::state::HostState;
use orbitmesh_exe::engine::WorkflowEngine;
use orbitmesh_exe::executors::LogNotifier;
use orbitmesh_exe::repository::{MemInstanceRepository, MemWorkflowRepository};
use orbitmesh_exe::triggers::TriggerService;
use orbitmesh_reg::enroll::EnrollmentService;
use orbitmesh_reg::registry::NodeRegistry;
use orbitmesh_tsk::manager::{JobManager, JobManagerConfig};
use orbitmesh_tsk::repository::MemJobRepository;
use orbitmesh_tsk::router::{RoutePolicy, Router};
use specifications::reporting::ReportingServiceServer;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tonic::transport::Server;


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
        help = "The path to the node environment configuration. This defines things such as where the transport and API servers bind, the \
                heartbeat policy and the optional feature toggles.",
        env = "NODE_CONFIG_PATH"
    )]
    node_config_path: PathBuf,
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
    info!("Initializing orbitmesh-drv v{}...", env!("CARGO_PKG_VERSION"));

    // Load the config, making sure it's a host config
    debug!("Loading node.yml file '{}'...", opts.node_config_path.display());
    let node_config: NodeConfig = match NodeConfig::from_path(&opts.node_config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load NodeConfig file: {err}");
            std::process::exit(1);
        },
    };
    let host: HostConfig = match node_config.node.try_into_host() {
        Ok(host) => host,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        },
    };

    // Bring the persisted state up to the current schema
    let state: Arc<HostState> = Arc::new(HostState::new());
    let applied: usize = state.run_migrations();
    debug!("Applied {applied} schema migration(s); store is at v{}", state.schema_version().version);

    // Build the control plane, leaves first
    let registry: Arc<NodeRegistry> = Arc::new(NodeRegistry::new());
    let manager: Arc<JobManager> = Arc::new(JobManager::new(
        Arc::new(MemJobRepository::new()),
        JobManagerConfig { ack_deadline: host.ack_deadline.duration(), ..Default::default() },
    ));
    let router: Arc<Router> = Arc::new(Router::new(registry.clone(), RoutePolicy::LeastConnections));
    let (hub, hub_events) = ConnectionHub::new(registry.clone());
    let (enroll, bootstrap_secret): (EnrollmentService, String) = EnrollmentService::new();
    let enroll: Arc<EnrollmentService> = Arc::new(enroll);
    info!("Bootstrap token secret (shown once): {bootstrap_secret}");

    let engine: Arc<WorkflowEngine> = Arc::new(WorkflowEngine::new(
        Arc::new(MemWorkflowRepository::new()),
        Arc::new(MemInstanceRepository::new()),
        manager.clone(),
        Arc::new(LogNotifier),
    ));
    let triggers: Arc<TriggerService> = Arc::new(TriggerService::new(engine.clone()));
    let deploy: Arc<DeploymentEngine> = Arc::new(DeploymentEngine::new(registry.clone(), manager.clone(), &host.features.file_sync));

    // Wire the dashboard feed
    let bus: Arc<EventBus> = Arc::new(EventBus::new());
    events::spawn_forwarders(bus.clone(), &registry, &manager, &engine);

    // Launch the background machinery
    tokio::spawn(dispatch::hub_cleanup(hub_events, registry.clone(), manager.clone()));
    tokio::spawn(dispatch::dispatch_cycle(
        Arc::downgrade(&manager),
        Arc::downgrade(&router),
        Arc::downgrade(&registry),
        Arc::downgrade(&hub),
        Duration::from_millis(250),
    ));
    tokio::spawn(dispatch::timeout_cycle(Arc::downgrade(&manager), host.sweep_interval.duration()));
    if host.features.health_monitor.enabled {
        tokio::spawn(dispatch::heartbeat_cycle(
            Arc::downgrade(&registry),
            Arc::downgrade(&manager),
            Arc::downgrade(&hub),
            host.missed_heartbeat_threshold(),
            host.features.health_monitor.interval.duration(),
        ));
    }
    if deploy.is_enabled() {
        tokio::spawn(DeploymentEngine::watch_cycle(Arc::downgrade(&deploy), host.sweep_interval.duration()));
    }

    // Serve the admin API
    let api_ctx: ApiContext = ApiContext {
        registry: registry.clone(),
        manager: manager.clone(),
        engine: engine.clone(),
        triggers,
        enroll: enroll.clone(),
        hub: hub.clone(),
        state: state.clone(),
        deploy,
        bus,
        admin_password: host.admin_password(),
        started_at: Utc::now(),
    };
    debug!("HTTP server ready to serve on '{}'", host.bind_http);
    let (_, api_server) = warp::serve(api::routes(api_ctx)).bind_with_graceful_shutdown(host.bind_http, async {
        if let Ok(mut handler) = signal(SignalKind::terminate()) {
            handler.recv().await;
        }
    });
    tokio::spawn(api_server);

    // Start the node transport
    let handler: ReportingHandler =
        ReportingHandler::new(registry, manager, hub, enroll, state, host.heartbeat_interval.duration());
    debug!("gRPC server ready to serve on '{}'", host.bind_grpc);
    if let Err(err) = Server::builder()
        .add_service(ReportingServiceServer::new(handler))
        .serve_with_shutdown(host.bind_grpc, async {
            // Register a SIGTERM handler to be Docker-friendly
            let mut handler: Signal = match signal(SignalKind::terminate()) {
                Ok(handler) => handler,
                Err(err) => {
                    error!("{}", trace!(("Failed to register SIGTERM signal handler"), err));
                    warn!("Service will NOT shutdown gracefully on SIGTERM");
                    loop {
                        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                    }
                },
            };

            // Wait until we receive such a signal after which we terminate the server
            handler.recv().await;
            info!("Received SIGTERM, shutting down gracefully...");
        })
        .await
    {
        error!("Failed to start gRPC server: {err}");
        std::process::exit(1);
    }
}
