//! HTTP front for the worker.
//!
//! Control and client-registration routes live under `/__worker/`. Every
//! other request is treated as a fetch intercepted from a host page and is
//! served by the active worker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{CONNECTION, HeaderName, HeaderValue, TRANSFER_ENCODING};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use reqwest::Url;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::control::{ControlReply, WireMessage};
use crate::error::{Error, Result};
use crate::lifecycle::{ClientId, LifecycleController};
use crate::request::{Destination, Request, Response};
use crate::stats::StatsSnapshot;

/// Largest request body accepted for an intercepted fetch.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Tells the caller whether a response came from the network, a partition,
/// or the degradation layer.
pub const SOURCE_HEADER: &str = "x-worker-source";

#[derive(Clone)]
struct AppState {
    controller: Arc<LifecycleController>,
    origin: Url,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active: Option<String>,
    waiting: Option<String>,
    clients: usize,
}

#[derive(Serialize)]
struct StatsResponse {
    version: Option<String>,
    stats: Option<StatsSnapshot>,
}

#[derive(Serialize)]
struct ClientResponse {
    id: ClientId,
}

async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    let controller = &state.controller;
    axum::Json(HealthResponse {
        status: if controller.active().is_some() { "ok" } else { "installing" },
        active: controller.active().map(|w| w.version().to_string()),
        waiting: controller.waiting().map(|w| w.version().to_string()),
        clients: controller.clients().len(),
    })
}

async fn api_stats(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.controller.active();
    axum::Json(StatsResponse {
        version: active.as_ref().map(|w| w.version().to_string()),
        stats: active.map(|w| w.stats()),
    })
}

/// Every outcome is a `{success, error?}` reply, including bodies that
/// are not a decodable wire message.
async fn api_control(
    State(state): State<AppState>,
    payload: std::result::Result<axum::Json<WireMessage>, JsonRejection>,
) -> axum::response::Response {
    match payload {
        Ok(axum::Json(message)) => {
            axum::Json(state.controller.post_message(message).await).into_response()
        }
        Err(rejection) => {
            log::warn!("Rejected control request: {}", rejection.body_text());
            let reply = ControlReply::failed(rejection.body_text());
            (rejection.status(), axum::Json(reply)).into_response()
        }
    }
}

async fn api_open_client(State(state): State<AppState>) -> impl IntoResponse {
    let id = state.controller.open_client();
    log::debug!("Client {id} opened");
    (StatusCode::CREATED, axum::Json(ClientResponse { id }))
}

async fn api_close_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = id.parse::<ClientId>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.controller.close_client(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            log::error!("Closing client {id} failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Resolves the request target: absolute-form targets are taken as is,
/// origin-form targets are joined onto the site origin.
fn target_url(origin: &Url, uri: &Uri) -> Result<Url> {
    let invalid = |reason: String| Error::InvalidUrl {
        url: uri.to_string(),
        reason,
    };
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).map_err(|e| invalid(e.to_string()));
    }
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    origin.join(path).map_err(|e| invalid(e.to_string()))
}

async fn to_worker_request(origin: &Url, req: axum::extract::Request) -> Result<Request> {
    let (parts, body) = req.into_parts();
    let url = target_url(origin, &parts.uri)?;
    let destination = parts
        .headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .map_or(Destination::Empty, Destination::from_header);
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::Network(format!("could not read request body: {e}")))?;

    Ok(Request::new(parts.method, url)
        .with_destination(destination)
        .with_headers(parts.headers)
        .with_body(body))
}

fn to_http_response(response: Response) -> axum::response::Response {
    let mut headers = response.headers;
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    headers.insert(
        HeaderName::from_static(SOURCE_HEADER),
        HeaderValue::from_static(response.source.as_str()),
    );

    let mut out = axum::response::Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = headers;
    out
}

fn error_response(error: &Error) -> axum::response::Response {
    let status = match error {
        Error::NoActiveWorker => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, error.to_string()).into_response()
}

async fn intercept(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> axum::response::Response {
    let request = match to_worker_request(&state.origin, req).await {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    let target = format!("{} {}", request.method, request.url);

    match state.controller.fetch(request).await {
        Ok(response) => {
            log::debug!("{target} -> {} ({})", response.status, response.source.as_str());
            to_http_response(response)
        }
        Err(e) => {
            log::warn!("{target} failed: {e}");
            error_response(&e)
        }
    }
}

/// Builds the router for a controller serving `origin`.
pub fn router(controller: Arc<LifecycleController>, origin: Url) -> Router {
    let state = AppState { controller, origin };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__worker/health", get(api_health))
        .route("/__worker/stats", get(api_stats))
        .route("/__worker/control", post(api_control))
        .route("/__worker/clients", post(api_open_client))
        .route("/__worker/clients/{id}", delete(api_close_client))
        .fallback(intercept)
        .layer(cors)
        .with_state(state)
}

/// Serves on an already bound listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_on(
    listener: TcpListener,
    controller: Arc<LifecycleController>,
    origin: Url,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(controller, origin))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Binds the configured address and serves until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address is invalid, cannot be bound, or the
/// server fails.
pub async fn serve(
    server: &ServerConfig,
    controller: Arc<LifecycleController>,
    origin: Url,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on http://{addr}, serving {origin}");

    serve_on(listener, controller, origin, shutdown).await
}
