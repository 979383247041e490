use crate::error::{json_error_response, ApiErrorCode, RegistryError};
use crate::registry::{ServiceInfo, ServiceRegistry};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Serialize `value` into a 200 JSON response
fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize admin response");
            json_error_response(ApiErrorCode::InternalError, "failed to render response")
        }
    }
}

#[derive(Serialize)]
struct ServiceList<'a> {
    count: usize,
    services: &'a [ServiceInfo],
}

fn registry_error_response(err: &RegistryError) -> Response<Full<Bytes>> {
    json_error_response(ApiErrorCode::from(err), err.to_string())
}

/// Admin API server exposing the service registry to operators
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_admin_connection(stream, registry, auth_token).await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    registry: Arc<ServiceRegistry>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<ServiceRegistry>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let authorized = check_auth(&req, &auth_token);
    Ok(route(req.method(), req.uri().path(), authorized, &registry).await)
}

/// Service routes: `/services/{name}` plus an optional action segment
enum ServiceRoute<'a> {
    List,
    Show(&'a str),
    Start(&'a str),
    Stop(&'a str),
    Backlog(&'a str),
}

fn parse_service_route<'a>(method: &Method, path: &'a str) -> Option<ServiceRoute<'a>> {
    if path == "/services" {
        return (method == Method::GET).then_some(ServiceRoute::List);
    }

    let rest = path.strip_prefix("/services/")?;
    let (name, action) = match rest.split_once('/') {
        Some((name, action)) => (name, Some(action)),
        None => (rest, None),
    };
    if name.is_empty() {
        return None;
    }

    match (method, action) {
        (&Method::GET, None) => Some(ServiceRoute::Show(name)),
        (&Method::POST, Some("start")) => Some(ServiceRoute::Start(name)),
        (&Method::POST, Some("stop")) => Some(ServiceRoute::Stop(name)),
        (&Method::GET, Some("backlog")) => Some(ServiceRoute::Backlog(name)),
        _ => None,
    }
}

async fn route(
    method: &Method,
    path: &str,
    authorized: bool,
    registry: &ServiceRegistry,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    let Some(service_route) = parse_service_route(method, path) else {
        return json_error_response(ApiErrorCode::NotFound, "not found");
    };

    if !authorized {
        warn!(path, "Unauthorized admin API request");
        return json_error_response(ApiErrorCode::Unauthorized, "unauthorized");
    }

    match service_route {
        ServiceRoute::List => {
            let services = registry.list_infos().await;
            json_ok(&ServiceList {
                count: services.len(),
                services: &services,
            })
        }
        ServiceRoute::Show(name) => match registry.info(name).await {
            Ok(info) => json_ok(&info),
            Err(e) => registry_error_response(&e),
        },
        ServiceRoute::Start(name) => match registry.start(name).await {
            Ok(info) => {
                info!(service = name, status = ?info.status, "Service started via admin API");
                json_ok(&info)
            }
            Err(e) => registry_error_response(&e),
        },
        ServiceRoute::Stop(name) => match registry.stop(name).await {
            Ok(info) => {
                info!(service = name, status = ?info.status, "Service stopped via admin API");
                json_ok(&info)
            }
            Err(e) => registry_error_response(&e),
        },
        ServiceRoute::Backlog(name) => match registry.backlog(name) {
            Ok(entries) => json_ok(&entries),
            Err(e) => registry_error_response(&e),
        },
    }
}
