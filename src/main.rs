//! CSI Volume Controller
//!
//! Serves the controller verbs over REST against the configured backend,
//! with health and Prometheus endpoints on their own ports and the
//! storage-pool syncer running under supervision.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_volume_controller::ledger::OperationStoreRef;
use csi_volume_controller::syncer::start_storage_pool_syncer;
use csi_volume_controller::{
    ApiServer, ApiServerConfig, ControllerConfig, ControllerDeps, ControllerMetrics,
    ControllerService, DriverConfig, Error, FileOperationStore, InMemoryBackend,
    KubeOperationStore, LedgerBackend, MemoryOperationStore, NodeRegistry, OperationLedger,
    OperationStore, Result, StaticPolicyResolver, StaticTopology, TaskClient, TaskClientConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSI Volume Controller - idempotent volume and snapshot lifecycle
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Driver configuration file (YAML)
    #[arg(long, env = "DRIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger directory; selects the file-backed ledger
    #[arg(long, env = "LEDGER_DIR")]
    ledger_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    };

    info!("Starting CSI Volume Controller");
    info!("  Version: {}", csi_volume_controller::VERSION);
    info!("  Cluster: {}", config.global.cluster_id);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let metrics = Arc::new(ControllerMetrics::new()?);
    let store = open_ledger_store(&args, &config).await?;
    info!("Operation ledger: {}", store.store_name());

    // Simulated task backend; only one backend is wired today
    let backend = Arc::new(InMemoryBackend::new());
    let topology = Arc::new(StaticTopology::from_config(&config));
    let nodes = Arc::new(NodeRegistry::from_config(&config.nodes));
    let policies = Arc::new(StaticPolicyResolver::new(&config.policies));

    let deps = ControllerDeps {
        ledger: OperationLedger::new(store),
        tasks: Arc::new(TaskClient::new(backend, TaskClientConfig::from(&config.task))),
        topology: topology.clone(),
        policies,
        nodes,
        metrics: metrics.clone(),
    };
    let service = ControllerService::new(ControllerConfig::from(&config), deps);

    let syncer = if config.syncer.enabled {
        let (_, supervisor) = start_storage_pool_syncer(&config.syncer, topology, metrics.clone());
        Some(supervisor)
    } else {
        None
    };

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_service = service.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_service).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, service));

    let shutdown_server = api_server.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        shutdown_server.shutdown();
    });

    api_server.run().await?;

    if let Some(supervisor) = syncer {
        supervisor.stop();
        supervisor.join().await;
    }

    info!("Controller shutdown complete");
    Ok(())
}

async fn open_ledger_store(args: &Args, config: &DriverConfig) -> Result<OperationStoreRef> {
    if let Some(dir) = &args.ledger_dir {
        return Ok(Arc::new(FileOperationStore::open(dir).await?));
    }

    match config.ledger.backend {
        LedgerBackend::Memory => {
            warn!("In-memory ledger: in-flight operations do not survive a restart");
            Ok(Arc::new(MemoryOperationStore::new()))
        }
        LedgerBackend::File => {
            let dir = config.ledger.directory.as_ref().ok_or_else(|| {
                Error::Configuration("ledger.directory is required for the file ledger".into())
            })?;
            Ok(Arc::new(FileOperationStore::open(dir).await?))
        }
        LedgerBackend::Kubernetes if args.standalone => Err(Error::Configuration(
            "the kubernetes ledger is not available in standalone mode".into(),
        )),
        LedgerBackend::Kubernetes => {
            let client = kube::Client::try_default().await?;
            Ok(Arc::new(KubeOperationStore::new(client)))
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, service: Arc<ControllerService>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let service = service.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if service.backend_ready().await {
                                plain_response(StatusCode::OK, "ok")
                            } else {
                                plain_response(StatusCode::SERVICE_UNAVAILABLE, "backend unavailable")
                            }
                        }
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ControllerMetrics>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        return Ok::<_, std::convert::Infallible>(plain_response(
                            StatusCode::NOT_FOUND,
                            "not found",
                        ));
                    }
                    let response = match metrics.encode() {
                        Ok((content_type, buffer)) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = header::HeaderValue::from_str(&content_type) {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
