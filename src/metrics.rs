//! Global counters and the Prometheus text exporter
//!
//! The counter block is a plain aggregate of relaxed atomics; the exporter
//! renders it on demand, so there is no sampling task and no lock shared
//! with the data path.

use crate::config::MetricsBind;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct Metrics {
    // gauges
    pub client_connections: AtomicU64,
    pub server_connections: AtomicU64,

    // accumulators
    pub client_connections_accepted: AtomicU64,
    pub server_connections_established: AtomicU64,
    pub server_connections_failed: AtomicU64,
    pub accepted_knocks: AtomicU64,
    pub rejected_knocks: AtomicU64,
    pub missing_knocks: AtomicU64,
    pub malformed_knocks: AtomicU64,
    pub accepted_logins: AtomicU64,
    pub rejected_logins: AtomicU64,
    pub malformed_logins: AtomicU64,
    pub delayed_connections: AtomicU64,
    pub client_bytes: AtomicU64,
    pub server_bytes: AtomicU64,
}

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Renders the Prometheus text format (version 0.0.4).
    pub fn render(&self) -> String {
        let gauges: [(&str, &str, &AtomicU64); 2] = [
            (
                "uologin_client_connections",
                "Current number of client connections",
                &self.client_connections,
            ),
            (
                "uologin_server_connections",
                "Current number of server connections",
                &self.server_connections,
            ),
        ];

        let counters: [(&str, &str, &AtomicU64); 13] = [
            (
                "uologin_client_connections_accepted",
                "Total accepted client connections",
                &self.client_connections_accepted,
            ),
            (
                "uologin_server_connections_established",
                "Total established server connections",
                &self.server_connections_established,
            ),
            (
                "uologin_server_connections_failed",
                "Total failed server connection attempts",
                &self.server_connections_failed,
            ),
            (
                "uologin_accepted_knocks",
                "Total accepted UDP knocks",
                &self.accepted_knocks,
            ),
            (
                "uologin_rejected_knocks",
                "Total knocks with bad credentials",
                &self.rejected_knocks,
            ),
            (
                "uologin_missing_knocks",
                "Total TCP connections rejected for missing knock",
                &self.missing_knocks,
            ),
            (
                "uologin_malformed_knocks",
                "Total malformed knock datagrams",
                &self.malformed_knocks,
            ),
            (
                "uologin_accepted_logins",
                "Total accepted logins",
                &self.accepted_logins,
            ),
            (
                "uologin_rejected_logins",
                "Total logins with bad credentials",
                &self.rejected_logins,
            ),
            (
                "uologin_malformed_logins",
                "Total malformed login handshakes",
                &self.malformed_logins,
            ),
            (
                "uologin_delayed_connections",
                "Total tarpit-delayed connections",
                &self.delayed_connections,
            ),
            (
                "uologin_client_bytes",
                "Bytes relayed from clients to the server",
                &self.client_bytes,
            ),
            (
                "uologin_server_bytes",
                "Bytes relayed from the server to clients",
                &self.server_bytes,
            ),
        ];

        let mut out = String::with_capacity(2048);
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}

/// Increments a gauge for as long as the guard lives.
pub struct GaugeGuard {
    metrics: Arc<Metrics>,
    gauge: Gauge,
}

#[derive(Clone, Copy)]
pub enum Gauge {
    ClientConnections,
    ServerConnections,
}

impl GaugeGuard {
    pub fn new(metrics: Arc<Metrics>, gauge: Gauge) -> Self {
        Self::field(&metrics, gauge).fetch_add(1, Ordering::Relaxed);
        Self { metrics, gauge }
    }

    fn field(metrics: &Metrics, gauge: Gauge) -> &AtomicU64 {
        match gauge {
            Gauge::ClientConnections => &metrics.client_connections,
            Gauge::ServerConnections => &metrics.server_connections,
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        Self::field(&self.metrics, self.gauge).fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serves the counter dump over HTTP until the task is cancelled.
pub async fn run_exporter(bind: MetricsBind, metrics: Arc<Metrics>) -> std::io::Result<()> {
    match bind {
        MetricsBind::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "metrics exporter listening");
            loop {
                let (stream, peer) = listener.accept().await?;
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve(stream, &metrics).await {
                        debug!(%peer, %error, "metrics request failed");
                    }
                });
            }
        }
        MetricsBind::Unix(path) => {
            let path = resolve_socket_path(&path);
            // a stale socket from a previous run would make bind() fail
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "removed stale metrics socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "metrics exporter listening");
            loop {
                let (stream, _) = listener.accept().await?;
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve(stream, &metrics).await {
                        debug!(%error, "metrics request failed");
                    }
                });
            }
        }
    }
}

/// Relative socket paths land in `RUNTIME_DIRECTORY`.
fn resolve_socket_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    match std::env::var_os("RUNTIME_DIRECTORY") {
        Some(dir) => PathBuf::from(dir).join(path),
        None => path.to_owned(),
    }
}

async fn serve<S>(mut stream: S, metrics: &Metrics) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read and discard the request line; the response is the same for
    // every path.
    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request).await?;

    let body = metrics.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
