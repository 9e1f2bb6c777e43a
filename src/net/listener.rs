//! TCP listener: admission control and connection dispatch
//!
//! Admission order on accept: look up the accounting record, charge the
//! admission token, enforce the knock gate, enforce the per-client
//! connection cap, then dispatch either straight to a connection task or
//! into the tarpit. Dropping the listener task aborts every connection
//! it spawned.

use crate::instance::Instance;
use crate::metrics;
use crate::net::accounting::AccountedConnection;
use crate::net::{connection, delayed};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;
/// Kernel waits for the first payload before waking accept().
const DEFER_ACCEPT_SECS: libc::c_int = 10;
/// Unacknowledged data kills the connection after this long.
const USER_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Token cost of being admitted at all.
const ADMISSION_COST: f64 = 1.0;

/// Creates the listening socket with the tuned options.
pub fn bind(port: u16) -> std::io::Result<TcpListener> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_tcp_user_timeout(Some(USER_TIMEOUT))?;
    set_defer_accept(&socket)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

fn set_defer_accept(socket: &Socket) -> std::io::Result<()> {
    let seconds: libc::c_int = DEFER_ACCEPT_SECS;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            std::ptr::addr_of!(seconds).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Accept loop; runs until the task is aborted on shutdown.
pub async fn run(instance: Arc<Instance>, listener: TcpListener) {
    info!(
        port = instance.config().listen_port,
        "accepting client connections"
    );

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => accept(&instance, &mut connections, stream, peer),
                    Err(error) => warn!(%error, "accept failed"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

fn accept(
    instance: &Arc<Instance>,
    connections: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let metrics = instance.metrics();
    metrics::inc(&metrics.client_connections_accepted);
    let _ = stream.set_nodelay(true);

    let per_client = instance.accounting().get(peer);

    if let Some(per_client) = &per_client {
        per_client.update_token_bucket(ADMISSION_COST);
    }

    if instance.require_knock() {
        let knocked = per_client
            .as_ref()
            .map(|per_client| per_client.is_knocked())
            .unwrap_or(false);
        if !knocked {
            metrics::inc(&metrics.missing_knocks);
            debug!(peer = %peer, "rejecting connection without knock");
            return;
        }
    }

    if let Some(per_client) = &per_client {
        if !per_client.check() {
            warn!(peer = %peer, "per-client connection limit exceeded");
            return;
        }

        let delay = per_client.delay();
        if !delay.is_zero() {
            metrics::inc(&metrics.delayed_connections);
            let accounting = AccountedConnection::new(Some(per_client.clone()));
            connections.spawn(delayed::run(
                instance.clone(),
                accounting,
                stream,
                peer,
                delay,
            ));
            return;
        }
    }

    let accounting = AccountedConnection::new(per_client);
    connections.spawn(connection::handle(instance.clone(), accounting, stream, peer));
}
