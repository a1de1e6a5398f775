//! HTTP endpoint the in-VM runner calls to register, heartbeat, and report
//! state. See spec.md §4.5. Built on the same hyper + http1 + `service_fn`
//! shape the teacher uses for its sandbox HTTP API, generalized from a
//! sandbox-CRUD surface to the fleet's registration contract.

use crate::registry::{AgentState, Registry};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn error_response(msg: impl Into<String>) -> ApiResponse<()> {
    ApiResponse {
        success: false,
        data: None,
        error: Some(msg.into()),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    agent_id: String,
    vm_name: String,
    vm_ip: String,
    project: String,
    tool: String,
    #[serde(default)]
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct DeregisterRequest {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    agent_id: String,
    state: AgentState,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

struct AppState {
    registry: Arc<Registry>,
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| json_response(StatusCode::BAD_REQUEST, &error_response("failed to read body")))?
        .to_bytes();

    serde_json::from_slice(&body_bytes)
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, &error_response(format!("invalid json: {e}"))))
}

async fn handle_register(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: RegisterRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let agent = state
        .registry
        .register(
            &body.agent_id,
            &body.vm_name,
            &body.vm_ip,
            &body.project,
            &body.tool,
            body.ports,
        )
        .await;
    json_response(StatusCode::OK, &ApiResponse::success(agent))
}

async fn handle_deregister(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: DeregisterRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.registry.deregister(&body.agent_id).await {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("deregistered")),
        Err(e) => json_response(StatusCode::NOT_FOUND, &error_response(e.to_string())),
    }
}

async fn handle_status(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: StatusRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state
        .registry
        .update_state(&body.agent_id, body.state, body.message, body.branch)
        .await
    {
        Ok(agent) => json_response(StatusCode::OK, &ApiResponse::success(agent)),
        Err(e) => json_response(StatusCode::NOT_FOUND, &error_response(e.to_string())),
    }
}

async fn handle_agents(state: Arc<AppState>) -> Response<BoxBody> {
    let agents = state.registry.agents().await;
    json_response(StatusCode::OK, &ApiResponse::success(agents))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),
        (Method::POST, ["register"]) => handle_register(req, state).await,
        (Method::POST, ["deregister"]) => handle_deregister(req, state).await,
        (Method::POST, ["status"]) => handle_status(req, state).await,
        (Method::GET, ["agents"]) => handle_agents(state).await,
        _ => json_response(StatusCode::NOT_FOUND, &error_response("not found")),
    };

    Ok(response)
}

/// Serve the registration endpoint until the process is torn down.
pub async fn run(addr: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let state = Arc::new(AppState { registry });
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "registration endpoint listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            let serve = http1::Builder::new().serve_connection(io, service);
            match tokio::time::timeout(std::time::Duration::from_secs(10), serve).await {
                Ok(Err(err)) => warn!(error = %err, "registration connection closed with error"),
                Ok(Ok(())) => {}
                Err(_) => warn!("registration connection timed out"),
            }
        });
    }
}
