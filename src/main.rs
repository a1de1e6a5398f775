use agentkernel_fleetd::audit::AuditLog;
use agentkernel_fleetd::config::FleetConfig;
use agentkernel_fleetd::dispatch::Dispatcher;
use agentkernel_fleetd::logstream::LogStreamManager;
use agentkernel_fleetd::monitor::Monitor;
use agentkernel_fleetd::pool::{PoolConfig, PoolManager, PoolStore};
use agentkernel_fleetd::registration;
use agentkernel_fleetd::registry::{Registry, RegistryStore};
use agentkernel_fleetd::vmdriver::{ShellVMDriver, VMDriver};
use agentkernel_fleetd::ws::{CommandContext, WSHub};
use agentkernel_fleetd::ws::commands::NoopMountHelper;

use anyhow::{Context, Result};
use clap::Parser;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

/// Control-plane daemon for a warm-pool VM-backed agent-execution fleet.
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about)]
struct Cli {
    /// Path to a `fleetd.toml` configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the operator WebSocket + health bind address.
    #[arg(long)]
    bind_addr: Option<String>,

    /// Override the in-VM runner registration bind address.
    #[arg(long)]
    registration_addr: Option<String>,

    /// Override the base directory for persisted state.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

fn full_body<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .unwrap()
}

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    warm: usize,
    active: usize,
    cold: usize,
}

struct OperatorState {
    pool: Arc<PoolManager>,
    hub: Arc<WSHub>,
    logs: Arc<LogStreamManager>,
    commands: Arc<CommandContext>,
}

async fn handle_operator_request(
    mut req: Request<Incoming>,
    state: Arc<OperatorState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    if req.uri().path() == "/ws" && hyper_tungstenite::is_upgrade_request(&req) {
        return match agentkernel_fleetd::ws::try_upgrade(
            &mut req,
            state.hub.clone(),
            state.logs.clone(),
            state.commands.clone(),
        ) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed");
                Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({"error": e.to_string()}),
                ))
            }
        };
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let status = state.pool.status().await;
            json_response(
                StatusCode::OK,
                &HealthPayload {
                    status: "ok",
                    warm: status.warm,
                    active: status.active,
                    cold: status.cold,
                },
            )
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(empty_body())
            .unwrap(),
    };

    Ok(response)
}

async fn run_operator_server(addr: SocketAddr, state: Arc<OperatorState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "operator websocket + health endpoint listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_operator_request(req, state.clone()));
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                warn!(error = %err, "operator connection closed with error");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FleetConfig::from_file(path).context("loading fleetd.toml")?,
        None => FleetConfig::default(),
    };
    if let Some(addr) = cli.bind_addr {
        config.bind_addr = addr;
    }
    if let Some(addr) = cli.registration_addr {
        config.registration_addr = addr;
    }
    if let Some(dir) = cli.base_dir {
        config.base_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(?config, "starting fleetd");
    std::fs::create_dir_all(&config.base_dir).context("creating base directory")?;

    let driver: Arc<dyn VMDriver> = Arc::new(ShellVMDriver::new().context("locating VM driver binary")?);

    let pool_store = PoolStore::new(&config.base_dir);
    let pool = PoolManager::new(
        PoolConfig {
            warm_size: config.pool.warm_size,
            max_vms: config.pool.max_vms,
            master_name: config.pool.master_name.clone(),
        },
        driver.clone(),
        pool_store,
    )
    .await;

    let registry = Arc::new(Registry::new(RegistryStore::new(&config.base_dir)));
    let audit = AuditLog::new(&config.base_dir);
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        driver.clone(),
        registry.clone(),
        audit,
    ));
    let logs = Arc::new(LogStreamManager::new(driver.clone(), pool.clone()));
    let hub = WSHub::new(pool.clone(), registry.clone());
    let commands = Arc::new(CommandContext {
        pool: pool.clone(),
        dispatcher: dispatcher.clone(),
        mount: Arc::new(NoopMountHelper),
    });

    let registration_addr: SocketAddr = config
        .registration_addr
        .parse()
        .context("parsing registration_addr")?;
    let bind_addr: SocketAddr = config.bind_addr.parse().context("parsing bind_addr")?;

    let registry_for_registration = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = registration::run(registration_addr, registry_for_registration).await {
            warn!(error = %e, "registration endpoint exited");
        }
    });

    let operator_state = Arc::new(OperatorState {
        pool: pool.clone(),
        hub: hub.clone(),
        logs: logs.clone(),
        commands,
    });
    tokio::spawn(async move {
        if let Err(e) = run_operator_server(bind_addr, operator_state).await {
            warn!(error = %e, "operator endpoint exited");
        }
    });

    {
        let hub = hub.clone();
        tokio::spawn(hub.run_registry_forwarder());
    }
    {
        let hub = hub.clone();
        tokio::spawn(hub.run_snapshot_ticker());
    }
    {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run_replenish_loop().await });
    }
    {
        let monitor = Monitor::new(pool.clone(), driver.clone());
        tokio::spawn(async move { monitor.run().await });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received, stopping background tasks");
    pool.shutdown();
    logs.stop_all().await;

    Ok(())
}
