//! Network server
//!
//! Terminates TLS with mutual authentication, parses HTTP under size and
//! time bounds, routes requests through the auth/rate-limit gates and
//! dispatches to handlers. Each accepted connection runs as its own tokio
//! task and is unconditionally closed on every exit path.
//!
//! Shared mutable state (the rate-limit table and the bound-port and
//! fingerprint fields) lives behind a single mutex owned by the server;
//! the pending pairing session is serialized inside [`PairingService`].

pub mod http;
mod router;
mod tls;

pub use tls::client_connector;

use self::http::{Request, RequestLimits, Response};
use self::router::Router;
use crate::audit::{AuditEvent, AuditSink};
use crate::discovery::{self, DiscoveryHandle};
use crate::identity::IdentityStore;
use crate::pairing::{PairingPayload, PairingService};
use crate::provider::DataProvider;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::{ProtocolError, Result};
use openssl::ssl::{Ssl, SslAcceptor};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, error, info, warn};

/// Default wall-clock budget for receiving one complete request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the listener to reach ready state
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the TLS listener to
    pub bind_addr: SocketAddr,
    /// Host written into pairing payloads
    pub advertised_host: String,
    /// Human-facing server name, reported by the status route
    pub device_name: String,
    /// Header/body size ceilings
    pub limits: RequestLimits,
    /// Wall-clock budget for receiving one request
    pub request_timeout: Duration,
    /// How long `start()` waits for listener readiness
    pub start_timeout: Duration,
    /// Per-token rate-limit settings
    pub rate_limit: RateLimitConfig,
    /// Whether to advertise over mDNS
    pub enable_discovery: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8471".parse().unwrap(),
            advertised_host: "localhost".to_string(),
            device_name: "VitaLink Server".to_string(),
            limits: RequestLimits::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
            rate_limit: RateLimitConfig::default(),
            enable_discovery: true,
        }
    }
}

/// Shared mutable server state, guarded by one mutex
pub(crate) struct ServerState {
    pub rate: RateLimiter,
    pub bound_port: Option<u16>,
    pub fingerprint: Option<String>,
}

/// The VitaLink network server
pub struct NetworkServer {
    config: ServerConfig,
    identity_store: Arc<IdentityStore>,
    pairing: Arc<PairingService>,
    audit: Arc<dyn AuditSink>,
    router: Arc<Router>,
    state: Arc<Mutex<ServerState>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    discovery: Mutex<Option<DiscoveryHandle>>,
}

impl NetworkServer {
    /// Assemble a server from its collaborators
    pub fn new(
        config: ServerConfig,
        identity_store: Arc<IdentityStore>,
        pairing: Arc<PairingService>,
        provider: Arc<dyn DataProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ServerState {
            rate: RateLimiter::new(config.rate_limit.clone()),
            bound_port: None,
            fingerprint: None,
        }));

        let router = Arc::new(Router::new(
            pairing.clone(),
            provider,
            audit.clone(),
            state.clone(),
            config.device_name.clone(),
        ));

        Self {
            config,
            identity_store,
            pairing,
            audit,
            router,
            state,
            accept_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
            discovery: Mutex::new(None),
        }
    }

    /// Start listening; idempotent
    ///
    /// Returns the bound port. Obtains the TLS identity (creating it on
    /// first start), binds the listener, waits for the accept loop to reach
    /// ready state bounded by `start_timeout`, records port and fingerprint,
    /// and advertises the service for local-network discovery.
    pub async fn start(&self) -> Result<u16> {
        let mut task_guard = self.accept_task.lock().await;

        if let Some(task) = task_guard.as_ref() {
            if !task.is_finished() {
                if let Some(port) = self.state.lock().await.bound_port {
                    debug!("Server already running on port {}", port);
                    return Ok(port);
                }
            }
            task_guard.take();
        }

        let identity = self.identity_store.load_or_create().await?;
        let acceptor = Arc::new(tls::server_acceptor(&identity)?);

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let port = listener.local_addr()?.port();

        let (ready_tx, ready_rx) = oneshot::channel();
        let router = self.router.clone();
        let limits = self.config.limits;
        let request_timeout = self.config.request_timeout;

        let task = tokio::spawn(async move {
            accept_loop(listener, acceptor, router, limits, request_timeout, ready_tx).await;
        });

        match timeout(self.config.start_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                task.abort();
                return Err(ProtocolError::StartTimeout);
            }
        }

        {
            let mut state = self.state.lock().await;
            state.bound_port = Some(port);
            state.fingerprint = Some(identity.fingerprint.clone());
        }

        if self.config.enable_discovery {
            match discovery::advertise(&self.config.device_name, port, &identity.fingerprint) {
                Ok(handle) => {
                    *self.discovery.lock().await = Some(handle);
                }
                // Discovery is advisory; the pairing payload carries the
                // authoritative host and port
                Err(e) => warn!("mDNS advertisement failed: {}", e),
            }
        }

        self.spawn_rate_sweeper().await;

        *task_guard = Some(task);
        info!(
            "Server listening on port {} (fingerprint {})",
            port, identity.fingerprint
        );

        Ok(port)
    }

    /// Stop listening and withdraw the mDNS advertisement
    pub async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
        if let Some(handle) = self.discovery.lock().await.take() {
            handle.shutdown();
        }

        let mut state = self.state.lock().await;
        state.bound_port = None;
        drop(state);

        info!("Server stopped");
    }

    /// Begin a pairing session against the running listener
    ///
    /// Bundles the advertised host, bound port and certificate fingerprint
    /// into the out-of-band payload.
    pub async fn begin_pairing(&self) -> Result<PairingPayload> {
        let (port, fingerprint) = {
            let state = self.state.lock().await;
            (state.bound_port, state.fingerprint.clone())
        };

        let port = port.ok_or(ProtocolError::NotRunning)?;
        let fingerprint = fingerprint.ok_or(ProtocolError::NotRunning)?;

        let payload = self
            .pairing
            .begin_pairing(&self.config.advertised_host, port, &fingerprint)
            .await?;

        self.audit.record(AuditEvent::PairingStarted {
            expires_at: payload.expires_at,
        });

        Ok(payload)
    }

    /// Revoke every paired device and record the audit event
    pub async fn revoke_all(&self) -> Result<usize> {
        let count = self.pairing.revoke_all().await?;
        self.audit.record(AuditEvent::TokensRevoked { count });
        Ok(count)
    }

    /// Port the listener is bound to, if running
    pub async fn bound_port(&self) -> Option<u16> {
        self.state.lock().await.bound_port
    }

    /// Fingerprint of the active TLS identity, if running
    pub async fn fingerprint(&self) -> Option<String> {
        self.state.lock().await.fingerprint.clone()
    }

    /// Periodically drop rate windows for tokens that went quiet
    async fn spawn_rate_sweeper(&self) {
        let state = self.state.clone();
        let interval = self.config.rate_limit.window;

        let mut sweep_guard = self.sweep_task.lock().await;
        if sweep_guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        *sweep_guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut state = state.lock().await;
                state.rate.sweep(std::time::Instant::now());
            }
        }));
    }
}

/// Accept connections until aborted, backing off on repeated errors
async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    router: Arc<Router>,
    limits: RequestLimits,
    request_timeout: Duration,
    ready_tx: oneshot::Sender<()>,
) {
    let _ = ready_tx.send(());
    let mut consecutive_errors = 0u32;

    loop {
        match listener.accept().await {
            Ok((tcp, remote_addr)) => {
                consecutive_errors = 0;
                let acceptor = acceptor.clone();
                let router = router.clone();

                tokio::spawn(async move {
                    handle_connection(tcp, remote_addr, acceptor, router, limits, request_timeout)
                        .await;
                });
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let backoff = std::cmp::min(consecutive_errors as u64 * 100, 5_000);
                error!(
                    "Accept failed ({} consecutive), backing off {}ms: {}",
                    consecutive_errors, backoff, e
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
    }
}

/// Serve one connection: TLS handshake, one request, one response, close
///
/// Every exit path ends with the stream dropped, which closes the
/// connection. Errors here never propagate to other connections.
async fn handle_connection(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Arc<SslAcceptor>,
    router: Arc<Router>,
    limits: RequestLimits,
    request_timeout: Duration,
) {
    debug!("Connection from {}", remote_addr);

    let ssl = match Ssl::new(acceptor.context()) {
        Ok(ssl) => ssl,
        Err(e) => {
            warn!("SSL setup failed for {}: {}", remote_addr, e);
            return;
        }
    };
    let mut stream = match SslStream::new(ssl, tcp) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SSL stream setup failed for {}: {}", remote_addr, e);
            return;
        }
    };

    match timeout(request_timeout, Pin::new(&mut stream).accept()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("TLS handshake failed from {}: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake timeout from {}", remote_addr);
            return;
        }
    }

    let response = match read_request(&mut stream, limits, request_timeout).await {
        Ok(request) => router.dispatch(&request, remote_addr).await,
        Err(e) => {
            debug!("Rejecting request from {}: {}", remote_addr, e);
            Response::from_protocol_error(&e)
        }
    };

    if let Err(e) = write_response(&mut stream, &response).await {
        debug!("Failed writing response to {}: {}", remote_addr, e);
    }

    let _ = stream.shutdown().await;
    debug!("Connection from {} closed", remote_addr);
}

/// Read one complete request within the wall-clock budget
async fn read_request<S>(stream: &mut S, limits: RequestLimits, budget: Duration) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + budget;
    let mut reader = http::RequestReader::new(limits);
    let mut chunk = [0u8; 4096];

    loop {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| ProtocolError::RequestTimeout)?;
        let n = read?;

        if n == 0 {
            return Err(ProtocolError::MalformedRequest(
                "connection closed before request completed".into(),
            ));
        }

        if let Some(request) = reader.feed(&chunk[..n])? {
            return Ok(request);
        }
    }
}

async fn write_response<S>(stream: &mut S, response: &Response) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
