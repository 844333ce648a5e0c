//! HTTP forward proxy: CONNECT tunneling plus absolute-URI forwarding.

use crate::HostFilter;
use crate::normalize_host;
use crate::responses::blocked_response;
use crate::responses::text_response;
use crate::split_authority;
use anyhow::Result;
use anyhow::anyhow;
use hyper::Body;
use hyper::Client;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::Server;
use hyper::StatusCode;
use hyper::Uri;
use hyper::header::HOST;
use hyper::service::make_service_fn;
use hyper::service::service_fn;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// A running HTTP proxy bound to an ephemeral localhost port.
///
/// The accept loop runs on a spawned task; dropping the handle leaves the
/// task running until the runtime shuts down, so callers that want a clean
/// teardown must call [`HttpProxy::close`].
pub struct HttpProxy {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HttpProxy {
    pub async fn start(filter: Arc<dyn HostFilter>) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let client = Client::new();
        let make_svc = make_service_fn(move |_conn: &hyper::server::conn::AddrStream| {
            let filter = filter.clone();
            let client = client.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, filter.clone(), client.clone())
                }))
            }
        });
        let server = Server::try_bind(&addr)
            .map_err(|err| anyhow!("bind HTTP proxy: {err}"))?
            .serve(make_svc);
        let port = server.local_addr().port();
        info!(port, "HTTP proxy listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                warn!(error = %err, "HTTP proxy terminated");
            }
        });

        Ok(Self {
            port,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for the server task to exit.
    /// Errors from an already-stopped server are swallowed.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

async fn handle_request(
    req: Request<Body>,
    filter: Arc<dyn HostFilter>,
    client: Client<hyper::client::HttpConnector>,
) -> Result<Response<Body>, Infallible> {
    let response = if req.method() == Method::CONNECT {
        handle_connect(req, filter).await
    } else {
        handle_forward(req, filter, client).await
    };
    Ok(response)
}

async fn handle_connect(req: Request<Body>, filter: Arc<dyn HostFilter>) -> Response<Body> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => return text_response(StatusCode::BAD_REQUEST, "missing authority"),
    };
    let (raw_host, port) = split_authority(&authority, 443);
    let host = normalize_host(&raw_host);
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "invalid host");
    }

    if !filter.allow(&host, port).await {
        warn!(host = %host, port, "CONNECT blocked");
        return blocked_response();
    }
    debug!(host = %host, port, "CONNECT allowed");

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(mut upgraded) => match TcpStream::connect(&authority).await {
                Ok(mut upstream) => {
                    if let Err(err) = copy_bidirectional(&mut upgraded, &mut upstream).await {
                        debug!(error = %err, "tunnel closed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, host = %host, "failed to connect to upstream");
                }
            },
            Err(err) => warn!(error = %err, "CONNECT upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn handle_forward(
    req: Request<Body>,
    filter: Arc<dyn HostFilter>,
    client: Client<hyper::client::HttpConnector>,
) -> Response<Body> {
    let authority = match req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        }) {
        Some(authority) => authority,
        None => return text_response(StatusCode::BAD_REQUEST, "missing host"),
    };
    let (raw_host, port) = split_authority(&authority, 80);
    let host = normalize_host(&raw_host);
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "invalid host");
    }

    if !filter.allow(&host, port).await {
        warn!(host = %host, port, method = %req.method(), "request blocked");
        return blocked_response();
    }
    debug!(host = %host, port, method = %req.method(), "request allowed");

    let (parts, body) = req.into_parts();
    let uri = match build_forward_uri(&authority, &parts.uri) {
        Ok(uri) => uri,
        Err(err) => {
            warn!(error = %err, "failed to build upstream uri");
            return text_response(StatusCode::BAD_REQUEST, "invalid uri");
        }
    };

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(parts.version);
    let hop_headers = hop_by_hop_headers();
    for (name, value) in parts.headers.iter() {
        if hop_headers.contains(name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    let forwarded = match builder.body(body) {
        Ok(req) => req,
        Err(err) => {
            warn!(error = %err, "failed to build forwarded request");
            return text_response(StatusCode::BAD_GATEWAY, "invalid request");
        }
    };

    match client.request(forwarded).await {
        Ok(resp) => filter_response(resp),
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            text_response(StatusCode::BAD_GATEWAY, "upstream failure")
        }
    }
}

fn build_forward_uri(authority: &str, uri: &Uri) -> Result<Uri> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let target = format!("http://{authority}{path}");
    Ok(target.parse()?)
}

fn filter_response(resp: Response<Body>) -> Response<Body> {
    let mut builder = Response::builder().status(resp.status());
    let hop_headers = hop_by_hop_headers();
    for (name, value) in resp.headers().iter() {
        if hop_headers.contains(name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(resp.into_body())
        .unwrap_or_else(|_| Response::new(Body::from("proxy error")))
}

fn hop_by_hop_headers() -> HashSet<&'static str> {
    [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ]
    .into_iter()
    .collect()
}
