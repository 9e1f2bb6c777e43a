//! Process-wide state and the run loop
//!
//! The instance owns everything the listeners share: configuration,
//! metrics, the credential store, the accounting map and the pipe pool.
//! Listeners run as tasks in one `JoinSet`; shutting down aborts them,
//! which in turn aborts every connection they spawned.

use crate::config::Config;
use crate::db::{DatabaseError, UserDatabase};
use crate::metrics::{self, Metrics};
use crate::net::accounting::ClientAccountingMap;
use crate::net::{knock, listener};
use crate::splice::PipePool;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info};

/// Per-client connection cap enforced by the accounting map.
const MAX_CONNECTIONS_PER_CLIENT: usize = 16;
/// Abusive clients are delayed rather than outright refused.
const TARPIT: bool = true;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

pub struct Instance {
    config: Config,
    metrics: Arc<Metrics>,
    database: Arc<UserDatabase>,
    accounting: Arc<ClientAccountingMap>,
    pipe_pool: Arc<PipePool>,
    require_knock: bool,
}

impl Instance {
    pub fn new(config: Config) -> Result<Arc<Self>, StartupError> {
        let runtime_dir = std::env::var_os("RUNTIME_DIRECTORY").map(PathBuf::from);
        let database = UserDatabase::open(
            config.user_database.as_deref(),
            config.auto_reload_user_database,
            runtime_dir.as_deref(),
        )?;

        let require_knock = config.knock_port.is_some();

        Ok(Arc::new(Self {
            config,
            metrics: Metrics::new(),
            database,
            accounting: ClientAccountingMap::new(MAX_CONNECTIONS_PER_CLIENT, TARPIT),
            pipe_pool: PipePool::new(),
            require_knock,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn database(&self) -> &UserDatabase {
        &self.database
    }

    pub fn accounting(&self) -> &ClientAccountingMap {
        &self.accounting
    }

    pub fn pipe_pool(&self) -> Arc<PipePool> {
        self.pipe_pool.clone()
    }

    /// With a knock listener configured, unknocked TCP clients are
    /// turned away.
    pub fn require_knock(&self) -> bool {
        self.require_knock
    }

    /// Binds all listeners and serves until SIGINT/SIGTERM.
    pub async fn run(self: &Arc<Self>) -> Result<(), StartupError> {
        let mut tasks = JoinSet::new();

        let tcp = listener::bind(self.config.listen_port)?;
        tasks.spawn(listener::run(self.clone(), tcp));

        if let Some(port) = self.config.knock_port {
            let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
            tasks.spawn(knock::run(self.clone(), udp));
        }

        if let Some(bind) = self.config.prometheus_exporter.clone() {
            let exporter_metrics = self.metrics_arc();
            tasks.spawn(async move {
                if let Err(e) = metrics::run_exporter(bind, exporter_metrics).await {
                    error!(error = %e, "metrics exporter failed");
                }
            });
        }

        tasks.spawn(self.accounting.clone().run_cleanup());

        shutdown_signal().await;
        info!("shutting down");

        // aborts listeners and, transitively, their connections
        tasks.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            error!(%error, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
