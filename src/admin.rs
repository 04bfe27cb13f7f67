use crate::auth::{Capability, CapabilityCheck};
use crate::error::{json_error_response, registry_error_response, AdminErrorCode};
use crate::model::{Endpoint, EntryPoint, Node};
use crate::registry::Registry;
use crate::supervisor::ReloadReport;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the registry
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

/// Fields posted by a node registering or updating itself
#[derive(Debug, Deserialize)]
pub struct NodeForm {
    #[serde(default)]
    pub key: String,
    #[serde(rename = "nodeId", alias = "node_id", alias = "domain")]
    pub node_id: String,
    pub endpoint: String,
    /// Endpoint slot to replace on update (default: 0)
    #[serde(default, deserialize_with = "deserialize_index")]
    pub index: Option<usize>,
}

/// Fields posted to add an entry point
#[derive(Debug, Deserialize)]
pub struct EntryPointForm {
    pub domain: String,
    pub path: String,
    #[serde(alias = "nodeId", alias = "node_id")]
    pub node: String,
}

// Form bodies carry every value as a string
fn deserialize_index<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(usize),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.is_empty() => Ok(None),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse a JSON or urlencoded form body
fn parse_body<T: DeserializeOwned>(content_type: Option<&str>, body: &[u8]) -> Result<T, String> {
    let is_json = match content_type {
        Some(ct) => ct.starts_with("application/json"),
        None => body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{'),
    };

    if is_json {
        return serde_json::from_slice(body).map_err(|e| format!("Invalid JSON: {}", e));
    }

    let fields: serde_json::Map<String, serde_json::Value> = url::form_urlencoded::parse(body)
        .into_owned()
        .map(|(name, value)| (name, serde_json::Value::String(value)))
        .collect();
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|e| format!("Invalid form: {}", e))
}

fn bearer_token(req: &Request<hyper::body::Incoming>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).trim().to_string())
}

fn mutation_response(status: StatusCode, report: ReloadReport) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "success": true,
        "reload_output": report.output,
    });
    json_response(status, body.to_string())
}

/// Everything a request handler needs
#[derive(Clone)]
pub struct AdminContext {
    pub registry: Arc<Registry>,
    pub auth: Arc<dyn CapabilityCheck>,
}

impl AdminContext {
    pub fn new(registry: Arc<Registry>, auth: Arc<dyn CapabilityCheck>) -> Self {
        Self { registry, auth }
    }

    async fn authorize(&self, token: Option<&str>, capability: Capability, path: &str) -> Option<Response<Full<Bytes>>> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            warn!(path, "Unauthenticated admin API request");
            return Some(json_error_response(AdminErrorCode::Unauthorized, "missing token"));
        };
        if self.auth.has_capability(token, capability).await {
            None
        } else {
            warn!(path, capability = capability.group(), "Admin API request lacks capability");
            Some(json_error_response(
                AdminErrorCode::Forbidden,
                format!("token lacks capability {}", capability.group()),
            ))
        }
    }

    /// Dispatch a request with an already collected body
    pub async fn route(
        &self,
        method: &Method,
        path: &str,
        token: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        match (method, path) {
            // Health check for the admin API itself (no auth required)
            (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

            (&Method::GET, "/version") => {
                let version_info = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                json_response(StatusCode::OK, version_info.to_string())
            }

            (&Method::GET, "/nodes") => {
                if let Some(denied) = self.authorize(token, Capability::Read, path).await {
                    return denied;
                }
                let nodes = self.registry.nodes().await;
                let body = serde_json::json!({
                    "count": nodes.len(),
                    "nodes": nodes,
                });
                json_response(StatusCode::OK, body.to_string())
            }

            (&Method::GET, "/entrypoints") => {
                if let Some(denied) = self.authorize(token, Capability::Read, path).await {
                    return denied;
                }
                let entry_points = self.registry.entry_points().await;
                let body = serde_json::json!({
                    "count": entry_points.len(),
                    "entry_points": entry_points,
                    "read_only": self.registry.is_degraded(),
                });
                json_response(StatusCode::OK, body.to_string())
            }

            (&Method::POST, "/add") => {
                if let Some(denied) = self.authorize(token, Capability::Write, path).await {
                    return denied;
                }
                let form: NodeForm = match parse_body(content_type, body) {
                    Ok(form) => form,
                    Err(e) => return json_error_response(AdminErrorCode::BadRequest, e),
                };
                let node = Node::new(form.key, form.node_id, form.endpoint);
                let node_id = node.node_id.clone();
                match self.registry.add_node(node).await {
                    Ok(report) => {
                        info!(node_id = %node_id, "Node added via admin API");
                        mutation_response(StatusCode::CREATED, report)
                    }
                    Err(e) => registry_error_response(&e),
                }
            }

            (&Method::POST, "/update") => {
                if let Some(denied) = self.authorize(token, Capability::Write, path).await {
                    return denied;
                }
                let form: NodeForm = match parse_body(content_type, body) {
                    Ok(form) => form,
                    Err(e) => return json_error_response(AdminErrorCode::BadRequest, e),
                };
                let index = form.index.unwrap_or(0);
                match self
                    .registry
                    .update_node_endpoint_at(&form.node_id, index, Endpoint::new(form.endpoint))
                    .await
                {
                    Ok(report) => {
                        info!(node_id = %form.node_id, index, "Node endpoint updated via admin API");
                        mutation_response(StatusCode::OK, report)
                    }
                    Err(e) => registry_error_response(&e),
                }
            }

            (&Method::POST, "/entrypoint/add") => {
                if let Some(denied) = self.authorize(token, Capability::Write, path).await {
                    return denied;
                }
                let form: EntryPointForm = match parse_body(content_type, body) {
                    Ok(form) => form,
                    Err(e) => return json_error_response(AdminErrorCode::BadRequest, e),
                };
                let entry_point = EntryPoint::new(form.domain, form.path, form.node);
                match self.registry.add_entry_point(entry_point).await {
                    Ok(report) => mutation_response(StatusCode::CREATED, report),
                    Err(e) => registry_error_response(&e),
                }
            }

            // Node self-check: does the registry still forward to me?
            (&Method::POST, "/valid") => {
                if let Some(denied) = self.authorize(token, Capability::Read, path).await {
                    return denied;
                }
                let form: NodeForm = match parse_body(content_type, body) {
                    Ok(form) => form,
                    Err(e) => return json_error_response(AdminErrorCode::BadRequest, e),
                };
                let activity = self
                    .registry
                    .check_node_active(&form.node_id, &form.endpoint)
                    .await;
                match serde_json::to_string(&activity) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => json_error_response(AdminErrorCode::BadRequest, e.to_string()),
                }
            }

            _ => json_error_response(AdminErrorCode::NotFound, "not found"),
        }
    }
}

/// Admin API server used by the admin UI and by nodes
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: AdminContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, context: AdminContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = self.context.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, context).await {
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

async fn serve_admin_connection<S>(stream: S, _addr: SocketAddr, context: AdminContext) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = context.clone();
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    context: AdminContext,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let token = bearer_token(&req);
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    debug!(%method, %path, "Admin API request");

    let body = req.collect().await?.to_bytes();
    Ok(context
        .route(&method, &path, token.as_deref(), content_type.as_deref(), &body)
        .await)
}
