//! Connection lifecycle and the single-flight command dispatcher.
//!
//! One background task owns the socket and its receive buffer. User calls
//! enqueue commands on a bounded channel; the dispatcher writes each frame,
//! reads exactly one response frame, and answers the waiter. Because
//! dispatch is strictly serialized, responses correlate to waiters in FIFO
//! order; every waiter still carries a request id so the matching could be
//! relaxed later without changing the submission API.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::create_tls_connector;
use linekv_protocol::{Arg, Decoder, Encoder, STATUS_OK};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;

/// Dial timeout for new sockets.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause between reconnect attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Interval between keep-alive pings.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on queued commands per connection.
pub const SUBMISSION_QUEUE_CAPACITY: usize = 64;

const READ_BUFFER_SIZE: usize = 100 * 1024;

/// TLS settings for a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Extra PEM-encoded CA certificates appended to the webpki roots.
    pub ca_bundle: Option<Vec<u8>>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_bundle(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_bundle = Some(pem.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Token sent as `auth` after every dial, including redials.
    pub auth_token: Option<String>,
    /// TLS settings; `None` means plain TCP.
    pub tls: Option<TlsConfig>,
    /// Compress request frames with gzip+base64.
    pub compression: bool,
    /// Default per-command timeout in milliseconds; 0 means no timeout.
    pub default_timeout_ms: u32,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth_token: None,
            tls: None,
            compression: false,
            default_timeout_ms: 0,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_default_timeout_ms(mut self, ms: u32) -> Self {
        self.default_timeout_ms = ms;
        self
    }
}

#[derive(Debug, Default)]
struct Flags {
    connected: bool,
    retrying: bool,
    closed: bool,
}

// The three lifecycle flags share one lock so transitions are atomic.
#[derive(Debug)]
struct Shared {
    flags: Mutex<Flags>,
}

impl Shared {
    fn new_connected() -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(Flags {
                connected: true,
                retrying: false,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().expect("state mutex poisoned")
    }

    fn is_ready(&self) -> bool {
        let f = self.lock();
        f.connected && !f.retrying && !f.closed
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn set_disconnected(&self) {
        self.lock().connected = false;
    }

    fn set_retrying(&self) {
        let mut f = self.lock();
        f.connected = false;
        f.retrying = true;
    }

    fn set_connected(&self) {
        let mut f = self.lock();
        f.connected = true;
        f.retrying = false;
    }

    fn set_closed(&self) -> bool {
        let mut f = self.lock();
        if f.closed {
            return false;
        }
        f.closed = true;
        f.connected = false;
        f.retrying = false;
        true
    }
}

struct Command {
    id: u64,
    args: Vec<Arg>,
    timeout_ms: u32,
    reply: oneshot::Sender<(u64, Result<Vec<String>, ClientError>)>,
}

/// A connection to a LineKV server.
///
/// Created by [`Connection::connect`]; on construction failure no
/// connection exists and no reconnect task is started. Once live, I/O
/// failures put the connection into a retry loop that redials every
/// [`RECONNECT_BACKOFF`] until it succeeds or [`close`](Connection::close)
/// is called.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    reset: Arc<Notify>,
    next_id: AtomicU64,
    local_addr: SocketAddr,
}

impl Connection {
    /// Dials the configured endpoint, authenticates when a token is set,
    /// and spawns the dispatcher task.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let stream = dial(&config).await?;
        let local_addr = stream.local_addr()?;
        let mut wire = Wire::new(stream);
        if let Some(token) = config.auth_token.as_deref() {
            login(&mut wire, &config, token).await?;
        }
        if crate::debug_enabled() {
            tracing::debug!(
                "connected to {}:{} from {}",
                config.host,
                config.port,
                local_addr
            );
        }

        let shared = Shared::new_connected();
        let (tx, rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let reset = Arc::new(Notify::new());

        let dispatcher = Dispatcher {
            config: config.clone(),
            shared: shared.clone(),
            rx,
            closed: closed_rx.clone(),
            reset: reset.clone(),
            wire: Some(wire),
            stale_replies: 0,
        };
        tokio::spawn(dispatcher.run());

        Ok(Self {
            config,
            tx,
            shared,
            closed_tx,
            closed_rx,
            reset,
            next_id: AtomicU64::new(1),
            local_addr,
        })
    }

    /// Submits one command and waits for its response frame.
    ///
    /// `timeout_ms` overrides the connection default; `Some(0)` disables
    /// the timeout for this command. Submission is refused while the
    /// connection is closed or redialing.
    pub async fn request(
        &self,
        args: Vec<Arg>,
        timeout_ms: Option<u32>,
    ) -> Result<Vec<String>, ClientError> {
        if !self.shared.is_ready() {
            return Err(ClientError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command {
                id,
                args,
                timeout_ms,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        let (reply_id, result) = reply_rx.await.map_err(|_| ClientError::ConnectionClosed)?;
        debug_assert_eq!(reply_id, id);
        result
    }

    /// Closes the connection: refuses new submissions, stops any redial
    /// loop, and tears down the socket. Idempotent.
    pub fn close(&self) {
        if !self.shared.set_closed() {
            return;
        }
        let _ = self.closed_tx.send(true);
    }

    /// Returns whether commands are currently accepted.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Returns whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Local address of the socket the connection was established on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configuration this connection was built from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Drops the current socket and redials, as if an I/O error occurred.
    /// Used when the server reports a connection fault in-band.
    pub(crate) fn reset(&self) {
        self.shared.set_disconnected();
        self.reset.notify_one();
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

// Socket plus its exclusively-owned receive state.
struct Wire {
    stream: ClientStream,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl Wire {
    fn new(stream: ClientStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<String>, ClientError> {
        loop {
            if let Some(parts) = self.decoder.decode_frame()? {
                return Ok(parts);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

async fn dial(config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
    if let Some(tls) = &config.tls {
        // The hostname goes to the connector unresolved so SNI and
        // certificate validation see it.
        let (connector, server_name) =
            create_tls_connector(tls.ca_bundle.as_deref(), &config.host)?;
        let tcp = connect_tcp((config.host.as_str(), config.port)).await?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        Ok(ClientStream::Tls { stream })
    } else {
        let addr = resolve(&config.host, config.port).await?;
        let tcp = connect_tcp(addr).await?;
        Ok(ClientStream::Plain { stream: tcp })
    }
}

async fn connect_tcp<A: tokio::net::ToSocketAddrs>(addr: A) -> Result<TcpStream, ClientError> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timeout",
            ))
        })??;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

// Plain mode pre-resolves to a single address, first answer wins.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ClientError::InvalidHost(host.to_string()))
}

// Auth handshake issued directly on the socket, before (or between)
// dispatcher ownership.
async fn login(wire: &mut Wire, config: &ConnectionConfig, token: &str) -> Result<(), ClientError> {
    let args = [Arg::from("auth"), Arg::from(token)];
    let frame = Encoder::encode(&args, config.compression)?;
    wire.stream.write_all(&frame).await?;
    let parts = wire.read_frame().await?;
    let accepted = parts.first().map(String::as_str) == Some(STATUS_OK)
        && parts.get(1).map(String::as_str).unwrap_or("1") == "1";
    if accepted {
        Ok(())
    } else {
        Err(ClientError::AuthFailed)
    }
}

enum ReadOutcome {
    Frame(Vec<String>),
    TimedOut,
    Closed,
    Failed(ClientError),
}

struct Dispatcher {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Command>,
    closed: watch::Receiver<bool>,
    reset: Arc<Notify>,
    wire: Option<Wire>,
    // Responses abandoned by timed-out commands, still owed by the server.
    stale_replies: usize,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            enum Event {
                Closed,
                Reset,
                Cmd(Option<Command>),
            }
            // wait_for observes the current value, so a close signal
            // consumed by an earlier select is not lost.
            let event = tokio::select! {
                _ = self.closed.wait_for(|closed| *closed) => Event::Closed,
                _ = self.reset.notified() => Event::Reset,
                cmd = self.rx.recv() => Event::Cmd(cmd),
            };
            let cmd = match event {
                Event::Closed => break,
                Event::Reset => {
                    tracing::warn!(
                        "server reported a connection fault, redialing {}:{}",
                        self.config.host,
                        self.config.port
                    );
                    self.drop_wire().await;
                    if !self.reconnect().await {
                        break;
                    }
                    continue;
                }
                Event::Cmd(Some(cmd)) => cmd,
                Event::Cmd(None) => break,
            };
            self.handle(cmd).await;
            if self.wire.is_none() && !self.reconnect().await {
                break;
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        if crate::debug_enabled() {
            tracing::debug!(
                "dispatch id={} timeout={}ms args={:?}",
                cmd.id,
                cmd.timeout_ms,
                cmd.args
            );
        }
        let frame = match Encoder::encode(&cmd.args, self.config.compression) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = cmd.reply.send((cmd.id, Err(e.into())));
                return;
            }
        };
        match self.wire.as_mut() {
            Some(wire) => {
                if let Err(e) = wire.stream.write_all(&frame).await {
                    let _ = cmd.reply.send((cmd.id, Err(e.into())));
                    self.drop_wire().await;
                    return;
                }
            }
            None => {
                let _ = cmd.reply.send((cmd.id, Err(ClientError::ConnectionClosed)));
                return;
            }
        }

        // This command's response sits behind any replies abandoned by
        // earlier timeouts; drain those first so a late frame can never
        // reach the wrong waiter.
        let deadline = (cmd.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(cmd.timeout_ms as u64));
        let mut pending = self.stale_replies + 1;
        loop {
            let outcome = {
                let wire = match self.wire.as_mut() {
                    Some(wire) => wire,
                    None => {
                        let _ = cmd.reply.send((cmd.id, Err(ClientError::ConnectionClosed)));
                        return;
                    }
                };
                let closed = &mut self.closed;
                match deadline {
                    Some(at) => tokio::select! {
                        _ = closed.wait_for(|closed| *closed) => ReadOutcome::Closed,
                        read = tokio::time::timeout_at(at, wire.read_frame()) => match read {
                            Ok(Ok(parts)) => ReadOutcome::Frame(parts),
                            Ok(Err(e)) => ReadOutcome::Failed(e),
                            Err(_) => ReadOutcome::TimedOut,
                        },
                    },
                    None => tokio::select! {
                        _ = closed.wait_for(|closed| *closed) => ReadOutcome::Closed,
                        read = wire.read_frame() => match read {
                            Ok(parts) => ReadOutcome::Frame(parts),
                            Err(e) => ReadOutcome::Failed(e),
                        },
                    },
                }
            };
            match outcome {
                ReadOutcome::Frame(parts) => {
                    pending -= 1;
                    if pending == 0 {
                        self.stale_replies = 0;
                        let _ = cmd.reply.send((cmd.id, Ok(parts)));
                        return;
                    }
                    if crate::debug_enabled() {
                        tracing::debug!("discarded stale reply: {:?}", parts);
                    }
                }
                ReadOutcome::TimedOut => {
                    self.stale_replies = pending;
                    let _ = cmd.reply.send((cmd.id, Err(ClientError::Timeout(cmd.timeout_ms))));
                    return;
                }
                ReadOutcome::Closed => {
                    let _ = cmd.reply.send((cmd.id, Err(ClientError::ConnectionClosed)));
                    return;
                }
                ReadOutcome::Failed(e) => {
                    let _ = cmd.reply.send((cmd.id, Err(e)));
                    self.drop_wire().await;
                    return;
                }
            }
        }
    }

    async fn drop_wire(&mut self) {
        self.shared.set_disconnected();
        self.stale_replies = 0;
        if let Some(mut wire) = self.wire.take() {
            let _ = wire.stream.shutdown().await;
        }
    }

    /// Redial loop. Returns false when the connection was closed and the
    /// dispatcher should stop.
    async fn reconnect(&mut self) -> bool {
        if self.shared.is_closed() {
            return false;
        }
        self.shared.set_retrying();
        loop {
            let attempt = {
                let closed = &mut self.closed;
                let config = &self.config;
                let dialed = async {
                    let stream = dial(config).await?;
                    let mut wire = Wire::new(stream);
                    if let Some(token) = config.auth_token.as_deref() {
                        login(&mut wire, config, token).await?;
                    }
                    Ok::<Wire, ClientError>(wire)
                };
                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => return false,
                    result = dialed => result,
                }
            };
            match attempt {
                Ok(wire) => {
                    self.wire = Some(wire);
                    self.shared.set_connected();
                    tracing::info!(
                        "reconnected to {}:{}",
                        self.config.host,
                        self.config.port
                    );
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "reconnect to {}:{} failed: {}",
                        self.config.host,
                        self.config.port,
                        e
                    );
                    let closed = &mut self.closed;
                    tokio::select! {
                        _ = closed.wait_for(|closed| *closed) => return false,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.shared.set_closed();
        if let Some(mut wire) = self.wire.take() {
            let _ = wire.stream.shutdown().await;
        }
        // Dropping queued commands drops their reply senders, so every
        // pending waiter observes ConnectionClosed.
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if crate::debug_enabled() {
            tracing::debug!("dispatcher stopped");
        }
    }
}
