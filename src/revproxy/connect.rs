//! Minimal HTTP CONNECT bridge.
//!
//! CONNECT exchanges are answered directly on the raw client connection:
//! the accept loop sniffs the request head before any HTTP machinery sees
//! it, and a valid CONNECT for a configured target is acknowledged with the
//! bare status line `<proto> 200 OK\r\n\r\n` — no headers — after which the
//! connection carries raw TLS bytes.
//!
//! The bridge is a synthetic listener: accepted connections are queued for
//! an internal TLS-terminating server that runs the proxy handler. No real
//! socket is involved; a connection handed to the server side is released
//! when that side finishes with it, signalled through a per-connection done
//! channel. CONNECTs for hosts outside the configured set are tunneled
//! directly to their targets when forwarding is enabled, and refused
//! otherwise.

use bytes::Bytes;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::{host_matches_target, strip_port, text_response, ProxyServer};
use crate::metrics::Counter;
use crate::types::{Error, Result};

/// Head reads are bounded; anything larger goes to the HTTP server, which
/// has its own limits.
const MAX_HEAD: usize = 8 * 1024;

#[derive(Debug, Default, Serialize)]
pub struct BridgeMetrics {
    /// CONNECTs accepted and handed to the internal TLS server.
    pub conn_accepted: Counter,
    /// CONNECTs for unlisted hosts tunneled straight through.
    pub conn_forwarded: Counter,
    /// CONNECTs refused outright.
    pub conn_rejected: Counter,
}

/// A raw client connection the bridge can hand off.
pub trait ClientIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientIo for T {}

/// A hijacked client connection waiting for the internal server.
pub struct BridgeConn {
    pub io: Box<dyn ClientIo>,
    pub done: Arc<Notify>,
}

/// The request line of a sniffed CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The `host:port` the client asked for.
    pub target: String,
    /// The protocol version, echoed in the response line.
    pub proto: String,
}

/// Outcome of sniffing a fresh client connection.
pub enum Sniffed {
    /// A well-formed CONNECT head, plus any bytes read beyond it.
    Connect { head: ConnectRequest, leftover: Bytes },
    /// Anything else; the buffered bytes must be replayed to the HTTP
    /// server through [`Rewind`].
    Other { buffered: Bytes },
}

/// Read just enough of a new connection to decide whether it is a CONNECT
/// exchange. Non-CONNECT traffic is never consumed past what was buffered.
pub async fn sniff_connect<C>(conn: &mut C) -> std::io::Result<Sniffed>
where
    C: AsyncRead + Unpin,
{
    const PREFIX: &[u8] = b"CONNECT ";
    let mut buf = Vec::with_capacity(512);
    loop {
        // Bail out as soon as the method can no longer be CONNECT.
        let probe = buf.len().min(PREFIX.len());
        if buf[..probe] != PREFIX[..probe] {
            return Ok(Sniffed::Other { buffered: buf.into() });
        }
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let line = buf[..end].split(|&b| b == b'\r').next().unwrap_or(&buf[..end]);
            let Some(head) = parse_connect_line(line) else {
                return Ok(Sniffed::Other { buffered: buf.into() });
            };
            let leftover = Bytes::copy_from_slice(&buf[end + 4..]);
            return Ok(Sniffed::Connect { head, leftover });
        }
        if buf.len() > MAX_HEAD {
            return Ok(Sniffed::Other { buffered: buf.into() });
        }
        let mut chunk = [0u8; 1024];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Sniffed::Other { buffered: buf.into() });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_connect_line(line: &[u8]) -> Option<ConnectRequest> {
    let line = std::str::from_utf8(line).ok()?;
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some("CONNECT"), Some(target), Some(proto), None) => Some(ConnectRequest {
            target: target.to_string(),
            proto: proto.to_string(),
        }),
        _ => None,
    }
}

/// Replays bytes consumed while sniffing before reading from the real
/// stream. Writes pass straight through.
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if !me.prefix.is_empty() {
            let n = me.prefix.len().min(buf.remaining());
            buf.put_slice(&me.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Write a minimal error response for a CONNECT exchange handled on the
/// raw connection.
pub async fn write_simple_response<C>(
    conn: &mut C,
    proto: &str,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    C: AsyncWrite + Unpin,
{
    let rsp = format!(
        "{proto} {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    conn.write_all(rsp.as_bytes()).await?;
    conn.flush().await
}

/// The acknowledgment is the bare status line; from here on the connection
/// carries raw bytes.
async fn write_raw_ok<C>(conn: &mut C, proto: &str) -> std::io::Result<()>
where
    C: AsyncWrite + Unpin,
{
    conn.write_all(format!("{proto} 200 OK\r\n\r\n").as_bytes()).await?;
    conn.flush().await
}

/// Accepts CONNECT exchanges for the configured targets and queues the
/// hijacked connections for [`serve_bridge`].
pub struct ConnectBridge {
    addrs: Vec<String>,
    queue: mpsc::Sender<BridgeConn>,
    forward_connect: bool,
    metrics: Arc<BridgeMetrics>,
}

impl ConnectBridge {
    pub fn new(addrs: Vec<String>, forward_connect: bool) -> (Self, mpsc::Receiver<BridgeConn>) {
        let (queue, rx) = mpsc::channel(1);
        (
            Self {
                addrs,
                queue,
                forward_connect,
                metrics: Arc::new(BridgeMetrics::default()),
            },
            rx,
        )
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Handle one sniffed CONNECT exchange on its raw connection. For a
    /// configured target the client receives the literal
    /// `<proto> 200 OK\r\n\r\n` and the connection is queued until the
    /// serving side closes it.
    pub async fn handle_connection<C>(&self, head: ConnectRequest, leftover: Bytes, mut conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // A CONNECT target is an authority; anything carrying a path is
        // not ours to answer.
        if head.target.contains('/') {
            self.metrics.conn_rejected.incr();
            let _ = write_simple_response(&mut conn, &head.proto, 404, "Not Found", "Not Found").await;
            return;
        }

        let host = strip_port(&head.target).to_string();
        if host_matches_target(&host, &self.addrs) {
            self.metrics.conn_accepted.incr();
            if let Err(e) = write_raw_ok(&mut conn, &head.proto).await {
                debug!(target = head.target, error = %e, "CONNECT response write failed");
                return;
            }
            let done = Arc::new(Notify::new());
            let bridged = BridgeConn {
                io: Box::new(Rewind::new(leftover, conn)),
                done: Arc::clone(&done),
            };
            if self.queue.send(bridged).await.is_err() {
                return;
            }
            // Hold the connection until the serving side closes it.
            done.notified().await;
            return;
        }

        if self.forward_connect {
            self.metrics.conn_forwarded.incr();
            let dial = if head.target == host {
                format!("{}:443", head.target)
            } else {
                head.target.clone()
            };
            let mut server = match TcpStream::connect(&dial).await {
                Ok(server) => server,
                Err(e) => {
                    warn!(target = dial, error = %e, "tunnel dial failed");
                    let _ = write_simple_response(&mut conn, &head.proto, 502, "Bad Gateway", "tunnel dial failed").await;
                    return;
                }
            };
            if write_raw_ok(&mut conn, &head.proto).await.is_err() {
                return;
            }
            let mut client = Rewind::new(leftover, conn);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await {
                debug!(target = dial, error = %e, "tunnel closed with error");
            }
            return;
        }

        self.metrics.conn_rejected.incr();
        let _ = write_simple_response(
            &mut conn,
            &head.proto,
            403,
            "Forbidden",
            &format!("target address {:?} not recognized", head.target),
        )
        .await;
    }
}

/// Serve bridged connections: terminate TLS and run the proxy handler over
/// each, closing the per-connection done signal when finished. The bridged
/// transport has no hijack facility of its own, so a CONNECT arriving over
/// it is answered with 501.
pub async fn serve_bridge(
    mut queue: mpsc::Receiver<BridgeConn>,
    acceptor: TlsAcceptor,
    proxy: Arc<ProxyServer>,
) {
    while let Some(conn) = queue.recv().await {
        let acceptor = acceptor.clone();
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let BridgeConn { io, done } = conn;
            match acceptor.accept(io).await {
                Ok(tls) => {
                    let service = service_fn(move |req| {
                        let proxy = Arc::clone(&proxy);
                        async move {
                            if req.method() == Method::CONNECT {
                                return Ok::<_, std::convert::Infallible>(text_response(
                                    StatusCode::NOT_IMPLEMENTED,
                                    "connection cannot be hijacked",
                                ));
                            }
                            Ok(proxy.handle(req).await)
                        }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await
                    {
                        debug!(error = %e, "bridged connection ended with error");
                    }
                }
                Err(e) => warn!(error = %e, "TLS accept on bridged connection failed"),
            }
            done.notify_one();
        });
    }
}

/// Load a PEM certificate chain and private key into a TLS acceptor for the
/// internal server.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    use std::io::BufReader;

    let mut cert_reader = BufReader::new(
        std::fs::File::open(cert_path).map_err(|e| Error::file("open cert", cert_path, e))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::file("parse cert", cert_path, e))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(
        std::fs::File::open(key_path).map_err(|e| Error::file("open key", key_path, e))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::file("parse key", key_path, e))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_path.display())))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS configuration: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
