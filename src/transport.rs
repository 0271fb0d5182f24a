//! Instrumented HTTP/1.1 transport.
//!
//! Every call to [`TimedTransport::round_trip`] opens a fresh connection and
//! returns the response together with the [`PhaseTimings`] recorded for that
//! request. The transport itself keeps no timing state, so a single instance
//! can serve any number of requests.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HOST, HeaderValue};
use http::{Request, Response, Uri};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which part of a request a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dial,
    RoundTrip,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Dial => "dial",
            Phase::RoundTrip => "round_trip",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures raised by the dialer, the TLS layer or the HTTP exchange.
///
/// The underlying error is passed through untouched as the `source`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request target {target}: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("tls handshake with {host} failed: {source}")]
    TlsHandshake {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("tls handshake with {host} timed out after {timeout:?}")]
    TlsHandshakeTimeout { host: String, timeout: Duration },

    #[error("http exchange with {authority} failed: {source}")]
    Http {
        authority: String,
        #[source]
        source: hyper::Error,
    },
}

impl TransportError {
    pub fn phase(&self) -> Phase {
        match self {
            TransportError::Resolve { .. }
            | TransportError::Connect { .. }
            | TransportError::ConnectTimeout { .. } => Phase::Dial,
            TransportError::InvalidTarget { .. }
            | TransportError::TlsHandshake { .. }
            | TransportError::TlsHandshakeTimeout { .. }
            | TransportError::Http { .. } => Phase::RoundTrip,
        }
    }
}

/// Source of instants for phase timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Timestamps recorded for one request.
///
/// The dial instants are `None` when the request went out without opening a
/// connection of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimings {
    pub request_start: Instant,
    pub dial_start: Option<Instant>,
    pub dial_end: Option<Instant>,
    pub request_end: Instant,
}

impl PhaseTimings {
    /// Request start to response headers.
    pub fn total(&self) -> Duration {
        self.request_end.saturating_duration_since(self.request_start)
    }

    /// Time spent dialing, zero if no dial happened.
    pub fn connection(&self) -> Duration {
        match (self.dial_start, self.dial_end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn processing(&self) -> Duration {
        self.total().saturating_sub(self.connection())
    }
}

/// Opens the byte stream a request is sent over.
pub trait Dial: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to `address` in `host:port` form.
    fn dial(&self, address: &str) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// TCP dialer with a connect timeout and keep-alive interval.
///
/// Name resolution counts as part of the dial and shares its timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl TcpDialer {
    async fn connect_any(address: &str) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await
            .map_err(|source| TransportError::Resolve {
                address: address.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(TransportError::Resolve {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(TransportError::Connect {
            address: address.to_string(),
            source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
        })
    }
}

impl Dial for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, address: &str) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.connect_timeout, Self::connect_any(address))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                address: address.to_string(),
                timeout: self.connect_timeout,
            })??;

        let keepalive = TcpKeepalive::new().with_time(self.keep_alive);
        SockRef::from(&stream)
            .set_tcp_keepalive(&keepalive)
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|source| TransportError::Connect {
                address: address.to_string(),
                source,
            })?;

        Ok(stream)
    }
}

/// A dialed connection and the instants taken around the dial call.
#[derive(Debug)]
pub struct Dialed<T> {
    pub conn: T,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug)]
pub struct TimedResponse {
    pub response: Response<Incoming>,
    pub timings: PhaseTimings,
}

#[derive(Debug, Clone)]
struct RequestTarget {
    https: bool,
    host: String,
    port: u16,
    authority: String,
}

impl RequestTarget {
    fn parse(uri: &Uri) -> Result<Self, TransportError> {
        let invalid = |reason| TransportError::InvalidTarget {
            target: uri.to_string(),
            reason,
        };

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.to_string());

        Ok(Self {
            https,
            host: host.to_string(),
            port,
            authority,
        })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, as TLS expects it.
    fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

pub struct TimedTransport<D = TcpDialer, C = SystemClock> {
    dialer: D,
    clock: C,
    tls: TlsConnector,
    tls_handshake_timeout: Duration,
}

impl TimedTransport {
    pub fn new(dialer: TcpDialer, tls_handshake_timeout: Duration) -> Result<Self, rustls::Error> {
        Self::with_parts(dialer, SystemClock, tls_handshake_timeout)
    }
}

impl<D: Dial, C: Clock> TimedTransport<D, C> {
    pub fn with_parts(dialer: D, clock: C, tls_handshake_timeout: Duration) -> Result<Self, rustls::Error> {
        Ok(Self {
            dialer,
            clock,
            tls: tls_connector()?,
            tls_handshake_timeout,
        })
    }

    /// Open a connection through the underlying dialer, reading the clock
    /// immediately before and after.
    pub async fn dial(&self, address: &str) -> Result<Dialed<D::Conn>, TransportError> {
        let started = self.clock.now();
        let conn = self.dialer.dial(address).await?;
        let finished = self.clock.now();
        Ok(Dialed { conn, started, finished })
    }

    /// Send `request` over a new connection. The request URI must be
    /// absolute; it is rewritten to origin form before it goes out.
    ///
    /// The request end instant is taken once the response head has arrived.
    /// The body is left unread for the caller.
    pub async fn round_trip(&self, request: Request<Empty<Bytes>>) -> Result<TimedResponse, TransportError> {
        let request_start = self.clock.now();
        let target = RequestTarget::parse(request.uri())?;
        let request = into_origin_form(request, &target)?;

        let dialed = self.dial(&target.address()).await?;
        debug!("dialed {} in {:?}", target.address(), dialed.finished.saturating_duration_since(dialed.started));

        let response = if target.https {
            let tls = self.handshake(&target, dialed.conn).await?;
            exchange(tls, request, &target.authority).await?
        } else {
            exchange(dialed.conn, request, &target.authority).await?
        };
        let request_end = self.clock.now();

        Ok(TimedResponse {
            response,
            timings: PhaseTimings {
                request_start,
                dial_start: Some(dialed.started),
                dial_end: Some(dialed.finished),
                request_end,
            },
        })
    }

    async fn handshake(
        &self,
        target: &RequestTarget,
        conn: D::Conn,
    ) -> Result<TlsStream<D::Conn>, TransportError> {
        let name = ServerName::try_from(target.server_name().to_string()).map_err(|e| {
            TransportError::TlsHandshake {
                host: target.host.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            }
        })?;

        timeout(self.tls_handshake_timeout, self.tls.connect(name, conn))
            .await
            .map_err(|_| TransportError::TlsHandshakeTimeout {
                host: target.host.clone(),
                timeout: self.tls_handshake_timeout,
            })?
            .map_err(|source| TransportError::TlsHandshake {
                host: target.host.clone(),
                source,
            })
    }
}

fn tls_connector() -> Result<TlsConnector, rustls::Error> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

fn into_origin_form(
    mut request: Request<Empty<Bytes>>,
    target: &RequestTarget,
) -> Result<Request<Empty<Bytes>>, TransportError> {
    let invalid = |reason| TransportError::InvalidTarget {
        target: request.uri().to_string(),
        reason,
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let origin: Uri = path.parse().map_err(|_| invalid("unparseable path"))?;
    let host = HeaderValue::from_str(&target.authority).map_err(|_| invalid("bad host"))?;

    *request.uri_mut() = origin;
    request.headers_mut().entry(HOST).or_insert(host);
    Ok(request)
}

async fn exchange<S>(
    io: S,
    request: Request<Empty<Bytes>>,
    authority: &str,
) -> Result<Response<Incoming>, TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let http_err = |source| TransportError::Http {
        authority: authority.to_string(),
        source,
    };

    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await.map_err(http_err)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("connection closed with error: {}", e);
        }
    });

    sender.send_request(request).await.map_err(http_err)
}
