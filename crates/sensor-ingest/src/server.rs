// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest server.
//!
//! One listener thread accepts device connections and spawns a worker thread
//! per connection. A worker identifies the device family from the first bytes
//! and then runs the matching [`DeviceSession`] until it ends.
//!
//! ```text
//! accept -> identify (bounded reads) -> DeviceSession::open_* -> run -> teardown
//! ```

pub mod connection;
pub mod guard_session;
pub mod node_session;
pub mod overflow;
pub mod session;
pub mod sessions;

use crate::config::{ConfigError, IngestConfig, KeepaliveSettings, RegistryConfig, SinkConfig};
use crate::metrics::{IngestMetrics, MetricsSnapshot};
use crate::protocol::{self, Identification};
use crate::registry::{MemoryRegistry, Registry, RegistryError, SqliteRegistry};
use crate::sink::{InfluxSink, Sink, SinkError, WriterSink};
use connection::{DeviceConnection, ReadOutcome};
use session::{DeviceSession, SessionContext, SessionError};
use sessions::SessionTable;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),
}

/// Build the registry selected by `[registry]`.
pub fn build_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>, ServerError> {
    Ok(match config {
        RegistryConfig::Static { devices } => Arc::new(MemoryRegistry::from_seeds(devices)),
        RegistryConfig::Sqlite { path } => Arc::new(SqliteRegistry::open(path)?),
    })
}

/// Build the sink selected by `[sink]`.
pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>, ServerError> {
    Ok(match config {
        SinkConfig::Stdout => Arc::new(WriterSink::stdout()),
        SinkConfig::Influx {
            url,
            org,
            token,
            timeout_secs,
        } => Arc::new(InfluxSink::new(
            url,
            org.clone(),
            token.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
    })
}

/// Cloneable handle that stops a running server.
#[derive(Clone, Debug)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-connection limits that apply before a session exists.
#[derive(Debug, Clone, Copy)]
struct AcceptLimits {
    recv_size: usize,
    max_buffer_bytes: usize,
    max_identify_reads: usize,
}

/// Device ingestion server bound to a TCP port.
pub struct IngestServer {
    config: IngestConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: Arc<AtomicBool>,
}

impl IngestServer {
    /// Bind the listener. Nothing is accepted until [`Self::run`].
    pub fn bind(
        config: IngestConfig,
        registry: Arc<dyn Registry>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = config.server.socket_addr();
        let listener =
            create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(SessionContext {
            registry,
            sink,
            sessions: Arc::new(SessionTable::new()),
            metrics: Arc::new(IngestMetrics::new()),
            settings: config.server.session_settings(),
            shutdown: shutdown.clone(),
        });

        Ok(Self {
            config,
            listener,
            local_addr,
            ctx,
            shutdown,
        })
    }

    /// Build registry and sink from `config` and bind.
    pub fn from_config(config: IngestConfig) -> Result<Self, ServerError> {
        let registry = build_registry(&config.registry)?;
        let sink = build_sink(&config.sink)?;
        Self::bind(config, registry, sink)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.shutdown.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.ctx.metrics.clone()
    }

    pub fn sessions(&self) -> Arc<SessionTable> {
        self.ctx.sessions.clone()
    }

    /// Accept connections until stopped, then stop and join every session.
    pub fn run(self) -> Result<(), ServerError> {
        self.ctx.registry.reset_connection_states()?;

        let limits = AcceptLimits {
            recv_size: self.config.server.recv_size,
            max_buffer_bytes: self.config.server.max_buffer_bytes,
            max_identify_reads: self.config.server.max_identify_reads,
        };
        let keepalive = self.config.server.keepalive.clone();
        let stats_interval = Duration::from_secs(self.config.stats_interval_secs);

        info!(addr = %self.local_addr, "Ingest server listening");

        let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();
        let mut last_stats = Instant::now();
        let mut last_snapshot = self.ctx.metrics.snapshot();

        while !self.ctx.is_shutting_down() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.ctx.metrics.record_connection_accepted();
                    match self.spawn_worker(stream, peer, limits, &keepalive) {
                        Ok(handle) => workers.push(handle),
                        Err(e) => error!(%peer, "Failed to spawn connection worker: {}", e),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => warn!("Accept failed: {}", e),
            }

            workers.retain(|w| !w.is_finished());

            if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
                let snapshot = self.ctx.metrics.snapshot();
                log_stats(&snapshot, &last_snapshot);
                last_snapshot = snapshot;
                last_stats = Instant::now();
            }
        }

        let stopped = self.ctx.sessions.stop_all();
        info!(sessions = stopped, "Ingest server stopping");
        for worker in workers {
            if worker.join().is_err() {
                error!("Connection worker panicked");
            }
        }

        self.ctx.registry.reset_connection_states()?;
        info!("Ingest server stopped");
        Ok(())
    }

    /// Run on a background thread.
    pub fn spawn(self) -> io::Result<RunningServer> {
        let local_addr = self.local_addr;
        let stop = self.stop_handle();
        let metrics = self.metrics();
        let sessions = self.sessions();
        let handle = thread::Builder::new()
            .name("ingest-accept".into())
            .spawn(move || self.run())?;

        Ok(RunningServer {
            local_addr,
            stop,
            metrics,
            sessions,
            handle,
        })
    }

    fn spawn_worker(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        limits: AcceptLimits,
        keepalive: &KeepaliveSettings,
    ) -> io::Result<thread::JoinHandle<()>> {
        // Accepted sockets may inherit the listener's non-blocking mode.
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        if keepalive.enabled {
            if let Err(e) = set_keepalive(&stream, keepalive) {
                warn!(%peer, "Failed to enable TCP keep-alive: {}", e);
            }
        }
        debug!(%peer, "Connection accepted");

        let ctx = self.ctx.clone();
        thread::Builder::new()
            .name(format!("ingest-{}", peer))
            .spawn(move || handle_connection(stream, peer, ctx, limits))
    }
}

/// A server running on its own thread.
pub struct RunningServer {
    local_addr: SocketAddr,
    stop: StopHandle,
    metrics: Arc<IngestMetrics>,
    sessions: Arc<SessionTable>,
    handle: thread::JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Stop the server and wait for every session to end.
    pub fn shutdown(self) -> Result<(), ServerError> {
        self.stop.stop();
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(ServerError::Io(io::Error::new(
                io::ErrorKind::Other,
                "accept thread panicked",
            ))),
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn set_keepalive(stream: &TcpStream, settings: &KeepaliveSettings) -> io::Result<()> {
    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(settings.idle_secs));
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive
        .with_interval(Duration::from_secs(settings.interval_secs))
        .with_retries(settings.retries);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn log_stats(current: &MetricsSnapshot, previous: &MetricsSnapshot) {
    info!(
        active_sessions = current.active_sessions,
        connections = current.connections_accepted,
        rejected = current.connections_rejected,
        points_written = current.points_written,
        samples_dropped = current.samples_dropped,
        protocol_errors = current.protocol_errors,
        sink_errors = current.sink_errors,
        "Ingest stats: {:.1} points/s",
        current.write_rate_since(previous)
    );
}

/// Worker body: identify, open the family's session and run it.
fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    limits: AcceptLimits,
) {
    let mut conn = DeviceConnection::new(stream, peer, limits.recv_size, limits.max_buffer_bytes);
    if let Err(e) = conn.set_read_timeout(ctx.settings.read_timeout) {
        warn!(%peer, "Failed to set read timeout: {}", e);
        return;
    }

    let identification = match identify_device(&mut conn, &ctx, limits.max_identify_reads) {
        Ok(Some(identification)) => identification,
        Ok(None) => return,
        Err(e) => {
            warn!(%peer, "Identification failed: {}", e);
            if matches!(e, SessionError::Protocol(_)) {
                ctx.metrics.record_protocol_error();
            }
            ctx.metrics.record_connection_rejected();
            return;
        }
    };

    let opened = match identification {
        Identification::SensorNode { info, consumed } => {
            conn.consume(consumed);
            DeviceSession::open_node(ctx, conn, info)
        }
        Identification::FbGuard { header } => DeviceSession::open_guard(ctx, conn, &header),
        Identification::Pending | Identification::Unrecognized => return,
    };

    match opened {
        // The session logs its own outcome.
        Ok(session) => {
            let _ = session.run();
        }
        Err(e) => warn!(%peer, "Failed to open session: {}", e),
    }
}

/// Read until the first message identifies the device family.
///
/// `None` means the connection should simply be closed.
fn identify_device(
    conn: &mut DeviceConnection,
    ctx: &SessionContext,
    max_reads: usize,
) -> Result<Option<Identification>, SessionError> {
    let peer = conn.peer_addr();

    for _ in 0..max_reads {
        if ctx.is_shutting_down() {
            return Ok(None);
        }

        match conn.fill()? {
            ReadOutcome::Data(n) => ctx.metrics.record_bytes_received(n),
            ReadOutcome::TimedOut => {
                if conn.idle_for() >= ctx.settings.idle_timeout {
                    break;
                }
                continue;
            }
            ReadOutcome::Closed => {
                debug!(%peer, "Connection closed before identification");
                return Ok(None);
            }
        }

        match protocol::identify(conn.pending(), ctx.settings.max_guard_message)? {
            Identification::Pending => {}
            Identification::Unrecognized => {
                warn!(%peer, leading = %hex_preview(conn.pending()), "Unrecognized device, closing connection");
                ctx.metrics.record_connection_rejected();
                return Ok(None);
            }
            identified => return Ok(Some(identified)),
        }
    }

    warn!(%peer, buffered = conn.pending().len(), "Device did not identify itself, closing connection");
    ctx.metrics.record_connection_rejected();
    Ok(None)
}

fn hex_preview(bytes: &[u8]) -> String {
    const MAX: usize = 16;
    let mut out = bytes
        .iter()
        .take(MAX)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > MAX {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;

    fn loopback_config() -> IngestConfig {
        let mut config = IngestConfig::default();
        config.server.bind_address = Ipv4Addr::LOCALHOST.into();
        config.server.port = 0;
        config.server.read_timeout_ms = 50;
        config.server.params_poll_interval_ms = 50;
        config.stats_interval_secs = 0;
        config
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0xde, 0xad]), "de ad");
        assert_eq!(hex_preview(&[0u8; 20]).matches("00").count(), 16);
        assert!(hex_preview(&[0u8; 20]).ends_with(" .."));
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = IngestServer::bind(
            loopback_config(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.local_addr().ip().is_loopback());
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let mut config = loopback_config();
        config.server.recv_size = 0;
        let result = IngestServer::bind(
            config,
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_unrecognized_device_is_closed() {
        let running = IngestServer::bind(
            loopback_config(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemorySink::new()),
        )
        .unwrap()
        .spawn()
        .unwrap();

        let mut client = TcpStream::connect(running.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(&[0x7f, 0x7f, 0x7f, 0x7f]).unwrap();

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(running.metrics().snapshot().connections_rejected, 1);

        running.shutdown().unwrap();
    }

    #[test]
    fn test_build_from_config() {
        let config = IngestConfig::default();
        assert!(build_registry(&config.registry).is_ok());
        assert!(build_sink(&config.sink).is_ok());
        assert!(build_sink(&SinkConfig::influx("token")).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let registry = build_registry(&RegistryConfig::Sqlite {
            path: dir.path().join("registry.db"),
        });
        assert!(registry.is_ok());
    }
}
