//! HTTP surface.
//!
//! `POST /execute` (also mounted at `/api/execute`) takes `{language, code}`
//! and answers `200 {output, error, timedOut, truncated}` for every program
//! outcome, including compile errors and timeouts. Faults map to 4xx/5xx.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::backend::ProcessRunner;
use crate::coordinator::{ExecuteRequest, JobCoordinator};
use crate::error::{ExecError, FaultClass};

/// Escaped JSON can be larger than the code it carries.
const BODY_OVERHEAD_FACTOR: usize = 4;
const BODY_OVERHEAD_BYTES: usize = 4096;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    active_jobs: usize,
}

/// Bind `addr` and serve until the task is dropped.
pub async fn serve_http<R: ProcessRunner + 'static>(
    addr: SocketAddr,
    coordinator: JobCoordinator<R>,
    max_source_bytes: usize,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    serve(listener, coordinator, max_source_bytes).await
}

/// Accept connections on an already bound listener.
pub async fn serve<R: ProcessRunner + 'static>(
    listener: TcpListener,
    coordinator: JobCoordinator<R>,
    max_source_bytes: usize,
) -> anyhow::Result<()> {
    let max_body = max_source_bytes
        .saturating_mul(BODY_OVERHEAD_FACTOR)
        .saturating_add(BODY_OVERHEAD_BYTES);

    info!(addr = %listener.local_addr()?, "HTTP server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "Accepted connection");
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let coordinator = coordinator.clone();
                async move { Ok::<_, Infallible>(route(&coordinator, max_body, req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        });
    }
}

async fn route<R: ProcessRunner + 'static>(
    coordinator: &JobCoordinator<R>,
    max_body: usize,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/execute" | "/api/execute") => execute(coordinator, max_body, req).await,
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &HealthBody {
                status: "ok",
                service: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
                active_jobs: coordinator.active_jobs(),
            },
        ),
        (_, "/execute" | "/api/execute" | "/health") => {
            error_body(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_body(StatusCode::NOT_FOUND, "not found"),
    };

    debug!(method = %method, path = %path, status = response.status().as_u16(), "Handled request");
    response
}

async fn execute<R: ProcessRunner + 'static>(
    coordinator: &JobCoordinator<R>,
    max_body: usize,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return error_body(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return error_body(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed request body");
            return error_body(StatusCode::BAD_REQUEST, "request body must be a JSON object");
        }
    };

    match coordinator.execute(request).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(e) => fault_response(&e),
    }
}

fn fault_response(err: &ExecError) -> Response<Full<Bytes>> {
    match err.class() {
        FaultClass::Client => error_body(StatusCode::BAD_REQUEST, &err.to_string()),
        FaultClass::Overload => {
            warn!(error = %err, "Rejecting job");
            error_body(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        FaultClass::Server => {
            let cause = std::error::Error::source(err).map(ToString::to_string);
            error!(error = %err, cause = ?cause, "Execution failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn error_body(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { error: message })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize response");
        b"{}".to_vec()
    });
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
