//! HTTP server.
//!
//! One listener fronts everything: CONNECT exchanges are sniffed off the
//! raw socket and answered by the bridge before any HTTP parsing,
//! absolute-form requests go to the reverse proxy, `/mod/` serves the
//! module cache, and `/debug/` exposes the published counters.

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::metrics::Registry;
use crate::module::{ArtifactCache, ModuleCache};
use crate::revproxy::connect::{
    sniff_connect, write_simple_response, ConnectBridge, Rewind, Sniffed,
};
use crate::revproxy::{full_body, text_response, BoxBody, ProxyServer};
use crate::types::Result;

/// Shared server state.
pub struct AppState {
    pub listen: SocketAddr,
    pub registry: Arc<Registry>,
    /// Module cache behind `/mod/`, when enabled.
    pub module: Option<Arc<ModuleCache>>,
    /// Upstream module proxy faulted into the cache on miss.
    pub module_upstream: Option<String>,
    pub proxy: Option<Arc<ProxyServer>>,
    pub bridge: Option<Arc<ConnectBridge>>,
    pub client: reqwest::Client,
}

pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.listen).await?;
    info!(addr = %state.listen, "HTTP server listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut stream = stream;

            // CONNECT exchanges are answered on the raw socket: the status
            // line must reach the client byte for byte, with no headers,
            // before the connection turns into a TLS transport.
            let buffered = match sniff_connect(&mut stream).await {
                Ok(Sniffed::Connect { head, leftover }) => {
                    match &state.bridge {
                        Some(bridge) => bridge.handle_connection(head, leftover, stream).await,
                        None => {
                            let _ = write_simple_response(
                                &mut stream,
                                &head.proto,
                                405,
                                "Method Not Allowed",
                                "Method Not Allowed",
                            )
                            .await;
                        }
                    }
                    return;
                }
                Ok(Sniffed::Other { buffered }) => buffered,
                Err(e) => {
                    debug!(%addr, error = %e, "request sniff failed");
                    return;
                }
            };

            let io = TokioIo::new(Rewind::new(buffered, stream));
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move {
                    Ok::<_, std::convert::Infallible>(handle_request(state, addr, req).await)
                }
            });
            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .serve_connection(io, service)
                .await
            {
                debug!(%addr, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_request(
    state: Arc<AppState>,
    _addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    // An absolute-form request URI is a plain HTTP proxy request.
    if req.uri().host().is_some() {
        return match &state.proxy {
            Some(proxy) => Arc::clone(proxy).handle(req).await,
            None => text_response(StatusCode::BAD_GATEWAY, "proxying not enabled"),
        };
    }

    let path = req.uri().path().to_string();
    match (req.method().clone(), path.as_str()) {
        (Method::GET, "/healthz") | (Method::GET, "/health") => {
            text_response(StatusCode::OK, "ok")
        }
        (Method::GET, "/debug/vars") => debug_vars(&state),
        (Method::GET, p) if p.starts_with("/mod/") => {
            let name = p.trim_start_matches("/mod/").to_string();
            serve_module(state, &name).await
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn debug_vars(state: &AppState) -> Response<BoxBody> {
    match serde_json::to_string_pretty(&state.registry.snapshot()) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(full_body(body))
            .unwrap_or_else(|_| {
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
            }),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics serialization failed"),
    }
}

/// Serve a module artifact from the cache, faulting it in from the upstream
/// module proxy on a full miss.
async fn serve_module(state: Arc<AppState>, name: &str) -> Response<BoxBody> {
    let Some(module) = &state.module else {
        return text_response(StatusCode::NOT_FOUND, "module proxy not enabled");
    };
    if name.is_empty() {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }

    match module.get(name).await {
        Ok(Some(file)) => return file_response(file),
        Ok(None) => {}
        Err(e) => {
            warn!(name, error = %e, "module cache read failed");
            return text_response(StatusCode::BAD_GATEWAY, "module cache read failed");
        }
    }

    let Some(upstream) = &state.module_upstream else {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    };
    let url = format!("{}/{}", upstream.trim_end_matches('/'), name);
    let rsp = match state.client.get(&url).send().await {
        Ok(rsp) => rsp,
        Err(e) => {
            warn!(%url, error = %e, "upstream module fetch failed");
            return text_response(StatusCode::BAD_GATEWAY, "upstream module fetch failed");
        }
    };
    if rsp.status() == StatusCode::NOT_FOUND || rsp.status() == StatusCode::GONE {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }
    if !rsp.status().is_success() {
        return text_response(StatusCode::BAD_GATEWAY, "upstream module fetch failed");
    }
    let body = match rsp.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(%url, error = %e, "upstream module body read failed");
            return text_response(StatusCode::BAD_GATEWAY, "upstream module fetch failed");
        }
    };

    let mut cursor = std::io::Cursor::new(body.clone());
    if let Err(e) = module.put(name, &mut cursor).await {
        warn!(name, error = %e, "module cache write failed");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(full_body(body))
        .unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
        })
}

fn file_response(file: tokio::fs::File) -> Response<BoxBody> {
    let stream = tokio_util::io::ReaderStream::new(file)
        .map(|chunk| chunk.map(|b: Bytes| Frame::data(b)));
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(StreamBody::new(stream).boxed_unsync())
        .unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
        })
}
