//! HTTP transport for the admin and traffic planes.
//!
//! Both listeners accept HTTP/1.1 and cleartext HTTP/2 on the same port and
//! serve every connection on its own task. Routing problems are answered with
//! RFC 7807 `application/problem+json` bodies carrying a `cause`.

use crate::admin::{AdminApi, AdminResponse};
use crate::engine::{MockServerEngine, TrafficRequest, TrafficResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const PROBLEM_CONTENT: &str = "application/problem+json";

/// Build a response, falling back to a bare 500 if the parts are rejected.
fn build_response(
    status: StatusCode,
    headers: impl IntoIterator<Item = (HeaderName, HeaderValue)>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(body)).unwrap_or_else(|_| {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// RFC 7807 error response.
pub fn problem(status: StatusCode, cause: &str) -> Response<Full<Bytes>> {
    build_response(
        status,
        [(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_CONTENT))],
        Bytes::from(json!({"cause": cause}).to_string()),
    )
}

/// Standard methods a plane does not serve get 405; anything else 501.
fn check_method(method: &Method, allowed: &[Method]) -> Result<(), Response<Full<Bytes>>> {
    const STANDARD: [Method; 9] = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
        Method::CONNECT,
        Method::PATCH,
        Method::TRACE,
    ];

    if allowed.contains(method) {
        Ok(())
    } else if STANDARD.contains(method) {
        Err(problem(StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED"))
    } else {
        Err(problem(StatusCode::NOT_IMPLEMENTED, "METHOD_NOT_IMPLEMENTED"))
    }
}

/// Operation part of an admin path, or `None` when outside the prefix.
pub fn admin_operation<'a>(api_path: &str, path: &'a str) -> Option<&'a str> {
    let prefix = api_path.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    Some(rest.trim_matches('/'))
}

fn has_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"))
}

/// First value of every header, names lowercase.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        flat.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    flat
}

async fn collect_body(req: Request<Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            debug!(error = %e, "Failed to read request body");
            problem(StatusCode::BAD_REQUEST, "INVALID_BODY")
        })
}

fn admin_response(response: AdminResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response
        .content_type
        .map(|ct| (CONTENT_TYPE, HeaderValue::from_static(ct)));
    build_response(status, headers, response.body)
}

fn traffic_response(response: TrafficResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response.headers.iter().filter_map(|(name, value)| {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => Some((name, value)),
            _ => {
                debug!(header = %name, "Skipping invalid response header");
                None
            }
        }
    });
    build_response(status, headers, response.body)
}

async fn handle_admin(
    req: Request<Incoming>,
    api_path: Arc<str>,
    api: Arc<AdminApi>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let Some(operation) = admin_operation(&api_path, &path).map(str::to_string) else {
        return Ok(problem(StatusCode::BAD_REQUEST, "INVALID_API"));
    };
    if let Err(response) = check_method(&method, &[Method::GET, Method::POST, Method::PUT, Method::DELETE]) {
        return Ok(response);
    }
    let json_content = has_json_content(req.headers());

    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    if matches!(method, Method::POST | Method::PUT) && !body.is_empty() && !json_content {
        return Ok(problem(StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE"));
    }

    Ok(admin_response(api.handle(&method, &operation, query.as_deref(), &body)))
}

async fn handle_traffic(
    req: Request<Incoming>,
    api_path: Option<Arc<str>>,
    engine: Arc<MockServerEngine>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    if let Some(prefix) = &api_path {
        if admin_operation(prefix, &path).is_none() {
            return Ok(problem(StatusCode::BAD_REQUEST, "INVALID_API"));
        }
    }
    if let Err(response) = check_method(
        &method,
        &[Method::POST, Method::GET, Method::PUT, Method::DELETE, Method::HEAD],
    ) {
        return Ok(response);
    }
    let headers = flatten_headers(req.headers());

    let body = match collect_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let response = engine
        .handle_traffic(TrafficRequest {
            method: method.to_string(),
            path,
            query,
            headers,
            body,
        })
        .await;

    if response.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(response.delay_ms)).await;
    }
    Ok(traffic_response(response))
}

/// Admin plane listener.
pub struct AdminServer {
    addr: SocketAddr,
    api_path: Arc<str>,
    api: Arc<AdminApi>,
}

impl AdminServer {
    pub fn new(addr: SocketAddr, api_path: &str, engine: Arc<MockServerEngine>) -> Self {
        Self {
            addr,
            api_path: Arc::from(api_path),
            api: Arc::new(AdminApi::new(engine)),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, api_path = %self.api_path, "Admin plane listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let api_path = Arc::clone(&self.api_path);
            let api = Arc::clone(&self.api);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_admin(req, Arc::clone(&api_path), Arc::clone(&api))
                });
                let builder = auto::Builder::new(TokioExecutor::new());
                if let Err(e) = builder.serve_connection(io, service).await {
                    debug!(%peer, error = %e, "Admin connection error");
                }
            });
        }
    }
}

/// Traffic plane listener.
pub struct TrafficServer {
    addr: SocketAddr,
    api_path: Option<Arc<str>>,
    engine: Arc<MockServerEngine>,
}

impl TrafficServer {
    pub fn new(addr: SocketAddr, api_path: Option<&str>, engine: Arc<MockServerEngine>) -> Self {
        Self {
            addr,
            api_path: api_path.map(Arc::from),
            engine,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Traffic plane listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Traffic accept error");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let api_path = self.api_path.clone();
            let engine = Arc::clone(&self.engine);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_traffic(req, api_path.clone(), Arc::clone(&engine))
                });
                let builder = auto::Builder::new(TokioExecutor::new());
                if let Err(e) = builder.serve_connection(io, service).await {
                    debug!(%peer, error = %e, "Traffic connection error");
                }
            });
        }
    }
}
