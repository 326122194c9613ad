//! REST front end for one [`VmManager`].
//!
//! Routes:
//! - `POST /vm/start`, `/vm/stop`, `/vm/destroy`, `/vm/destroyAll`
//! - `POST /vm/snapshot`, `/vm/restore`
//! - `GET /vm/list`, `/vm/{name}`
//!
//! Errors are returned as `{"error": "..."}` with a status derived from the
//! error kind. Each request runs on its own task, so an operation that has
//! started finishes even if the client disconnects.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use chv_core::api::{
    ErrorResponse, RestoreVmRequest, SnapshotVmRequest, SnapshotVmResponse, StartVmRequest,
    VmListResponse, VmRequest,
};
use chv_core::error::{ChvError, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::manager::VmManager;

/// Serve the REST API until `shutdown` resolves, then destroy every VM.
pub async fn serve(
    manager: Arc<VmManager>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let service_manager = Arc::clone(&manager);
    let make_svc = make_service_fn(move |_conn| {
        let manager = Arc::clone(&service_manager);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&manager), req)))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| ChvError::Other(format!("failed to bind {}: {}", addr, e)))?
        .serve(make_svc);
    tracing::info!(addr = %addr, "chv server listening");

    let served = server.with_graceful_shutdown(shutdown).await;

    tracing::info!("Server stopped, destroying all VMs");
    let destroyed = manager.destroy_all().await;

    served.map_err(|e| ChvError::Other(format!("server error: {}", e)))?;
    destroyed
}

async fn handle(
    manager: Arc<VmManager>,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!(method = %method, path = %path, "Request");

    let worker = tokio::spawn(async move { route(&manager, req).await });
    let routed = match worker.await {
        Ok(routed) => routed,
        Err(e) => Err(ChvError::Other(format!("request task failed: {}", e))),
    };

    let response = match routed {
        Ok(response) => response,
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                tracing::error!(method = %method, path = %path, status = status.as_u16(), error = %e, "Request failed");
            } else {
                tracing::warn!(method = %method, path = %path, status = status.as_u16(), error = %e, "Request rejected");
            }
            error_response(status, &e.to_string())
        }
    };
    Ok(response)
}

async fn route(manager: &VmManager, req: Request<Body>) -> Result<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/vm/start") => {
            let body: StartVmRequest = read_json(req).await?;
            json_response(StatusCode::OK, &manager.start(body).await?)
        }
        (&Method::POST, "/vm/stop") => {
            let body: VmRequest = read_json(req).await?;
            json_response(StatusCode::OK, &manager.stop(&body.name).await?)
        }
        (&Method::POST, "/vm/destroy") => {
            let body: VmRequest = read_json(req).await?;
            manager.destroy(&body.name).await?;
            json_response(StatusCode::OK, &body)
        }
        (&Method::POST, "/vm/destroyAll") => {
            manager.destroy_all().await?;
            json_response(StatusCode::OK, &serde_json::json!({}))
        }
        (&Method::POST, "/vm/snapshot") => {
            let body: SnapshotVmRequest = read_json(req).await?;
            let snapshot = manager.snapshot(&body.name, body.output).await?;
            json_response(
                StatusCode::OK,
                &SnapshotVmResponse {
                    name: body.name,
                    snapshot,
                },
            )
        }
        (&Method::POST, "/vm/restore") => {
            let body: RestoreVmRequest = read_json(req).await?;
            json_response(StatusCode::OK, &manager.restore(body).await?)
        }
        (&Method::GET, "/vm/list") => {
            json_response(StatusCode::OK, &VmListResponse { vms: manager.list() })
        }
        (&Method::GET, p) if p.starts_with("/vm/") && p.len() > "/vm/".len() => {
            let name = &p["/vm/".len()..];
            json_response(StatusCode::OK, &manager.get(name)?)
        }
        (_, p) if is_known_route(p) => Ok(error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &format!("method {} not allowed on {}", method, p),
        )),
        (_, p) => Ok(error_response(
            StatusCode::NOT_FOUND,
            &format!("no route for {}", p),
        )),
    }
}

fn is_known_route(path: &str) -> bool {
    path.starts_with("/vm/")
}

/// HTTP status for an error kind.
pub fn status_for(err: &ChvError) -> StatusCode {
    match err {
        ChvError::InvalidArgument(_)
        | ChvError::InvalidSubnet(_)
        | ChvError::AddressOutOfRange { .. }
        | ChvError::Serialization(_) => StatusCode::BAD_REQUEST,
        ChvError::NotFound(_) => StatusCode::NOT_FOUND,
        ChvError::DuplicateName(_)
        | ChvError::InvalidState { .. }
        | ChvError::AddressNotAllocated(_) => StatusCode::CONFLICT,
        ChvError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ChvError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ChvError::Hypervisor(_) | ChvError::NetworkSetup(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ChvError::InvalidArgument(format!("failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ChvError::InvalidArgument(format!("invalid request body: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    let json = serde_json::to_vec(value)?;
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(json))
        .map_err(|e| ChvError::Other(format!("failed to build response: {}", e)))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let json = serde_json::to_vec(&ErrorResponse::new(message))
        .unwrap_or_else(|_| b"{\"error\":\"internal error\"}".to_vec());
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
