//! Per-connection state machine
//!
//! Drives one client from handshake accumulation through credential
//! check, the optional server-list dialogue and the upstream connect,
//! into full-duplex zero-copy relaying. Each connection runs as one
//! task; every terminal condition simply returns, and cleanup (gauges,
//! accounting unlink, pipe return) happens in drops.

use crate::db::DatabaseError;
use crate::instance::Instance;
use crate::metrics::{self, Gauge, GaugeGuard};
use crate::net::accounting::AccountedConnection;
use crate::splice::{ReceiveResult, SendResult, SpliceBuffer};
use crate::uo::{
    build_account_login_reject, build_play_server, build_remote_ip, build_server_list, command,
    extract_cstr, username_str, ServerListEntry, ACCOUNT_LOGIN_PASSWORD, ACCOUNT_LOGIN_USERNAME,
    HANDSHAKE_SIZE, PLAY_SERVER_SIZE, REJECT_BAD_PASSWORD, SEED_SIZE,
};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The login packets must arrive promptly.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// The client gets a minute to pick from the server list; the upstream
/// gets the same to answer with its own list.
const DIALOG_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Token costs charged against the client's bucket.
mod cost {
    pub const ACCEPTED_LOGIN: f64 = 1.0;
    pub const INITIAL_ERROR: f64 = 4.0;
    pub const REJECTED_LOGIN: f64 = 5.0;
    pub const CONNECT_FAILED: f64 = 5.0;
    pub const TIMEOUT: f64 = 7.0;
    pub const MALFORMED_USERNAME: f64 = 8.0;
    pub const MALFORMED_COMMAND: f64 = 10.0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    CheckCredentials,
    ServerList,
    Connecting,
    SendPlayServer,
    Ready,
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("malformed handshake")]
    Malformed,

    #[error("credentials rejected")]
    Rejected,

    #[error("database failure: {0}")]
    Database(DatabaseError),

    #[error("invalid server selection")]
    BadSelection,

    #[error("upstream connect failed: {0}")]
    Connect(std::io::Error),

    #[error("unexpected upstream reply")]
    UpstreamProtocol,
}

/// Entry point for one accepted (and possibly previously delayed)
/// client socket.
pub async fn handle(
    instance: Arc<Instance>,
    accounting: AccountedConnection,
    incoming: TcpStream,
    peer: SocketAddr,
) {
    let _gauge = GaugeGuard::new(instance.metrics_arc(), Gauge::ClientConnections);

    let mut connection = Connection {
        instance,
        accounting,
        incoming,
        peer,
        handshake: [0; HANDSHAKE_SIZE],
        send_play_server: false,
        state: State::Initial,
    };

    match connection.run().await {
        Ok(()) => debug!(peer = %peer, "connection closed"),
        Err(error) => {
            debug!(peer = %peer, state = ?connection.state, %error, "connection terminated")
        }
    }
}

struct Connection {
    instance: Arc<Instance>,
    accounting: AccountedConnection,
    incoming: TcpStream,
    peer: SocketAddr,
    /// Seed + AccountLogin, forwarded verbatim once authenticated.
    handshake: [u8; HANDSHAKE_SIZE],
    send_play_server: bool,
    state: State,
}

impl Connection {
    async fn run(&mut self) -> Result<(), ConnectionError> {
        let (username, password) = self.read_handshake().await?;

        self.state = State::CheckCredentials;
        self.check_credentials(&username, &password).await?;

        let upstream_address = if self.instance.config().server_list.is_empty() {
            match self.instance.config().game_server {
                Some(address) => address,
                // config validation guarantees one of the two forms
                None => return Err(ConnectionError::BadSelection),
            }
        } else {
            self.state = State::ServerList;
            let address = self.server_list_dialogue().await?;
            self.send_play_server = true;
            address
        };

        self.state = State::Connecting;
        let mut outgoing = self.connect_upstream(upstream_address).await?;
        let _server_gauge = GaugeGuard::new(self.instance.metrics_arc(), Gauge::ServerConnections);
        metrics::inc(&self.instance.metrics().server_connections_established);

        self.send_greeting(&mut outgoing).await?;

        if self.send_play_server {
            self.state = State::SendPlayServer;
            match timeout(DIALOG_TIMEOUT, self.select_sole_upstream(&mut outgoing)).await {
                Ok(result) => result?,
                Err(_) => {
                    self.accounting.charge(cost::TIMEOUT);
                    return Err(ConnectionError::Timeout);
                }
            }
        }

        self.state = State::Ready;
        self.relay(&outgoing).await
    }

    /// Initial state: accumulate the 83 handshake bytes, validate the
    /// command bytes and the username character set.
    async fn read_handshake(&mut self) -> Result<(String, Vec<u8>), ConnectionError> {
        match timeout(
            HANDSHAKE_TIMEOUT,
            self.incoming.read_exact(&mut self.handshake),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                self.accounting.charge(cost::INITIAL_ERROR);
                return Err(error.into());
            }
            Err(_) => {
                self.accounting.charge(cost::TIMEOUT);
                return Err(ConnectionError::Timeout);
            }
        }

        let login = &self.handshake[SEED_SIZE..];
        if self.handshake[0] != command::SEED || login[0] != command::ACCOUNT_LOGIN {
            self.reject_malformed(cost::MALFORMED_COMMAND).await;
            return Err(ConnectionError::Malformed);
        }

        let username = match username_str(&login[ACCOUNT_LOGIN_USERNAME]) {
            Some(username) => username.to_owned(),
            None => {
                self.reject_malformed(cost::MALFORMED_USERNAME).await;
                return Err(ConnectionError::Malformed);
            }
        };
        let password = extract_cstr(&login[ACCOUNT_LOGIN_PASSWORD]).to_vec();

        Ok((username, password))
    }

    async fn check_credentials(
        &mut self,
        username: &str,
        password: &[u8],
    ) -> Result<(), ConnectionError> {
        match self.instance.database().check(username, password).await {
            Ok(true) => {
                self.accounting.charge(cost::ACCEPTED_LOGIN);
                metrics::inc(&self.instance.metrics().accepted_logins);
                info!(peer = %self.peer, username, "login accepted");
                Ok(())
            }
            Ok(false) => {
                self.accounting.charge(cost::REJECTED_LOGIN);
                metrics::inc(&self.instance.metrics().rejected_logins);
                warn!(peer = %self.peer, username, "login rejected");
                self.send_reject().await;
                Err(ConnectionError::Rejected)
            }
            Err(error) => {
                // not the client's fault: no counter, no token charge
                warn!(peer = %self.peer, %error, "credential check failed");
                self.send_reject().await;
                Err(ConnectionError::Database(error))
            }
        }
    }

    /// Offers the configured shards and waits for the client's pick.
    async fn server_list_dialogue(&mut self) -> Result<SocketAddr, ConnectionError> {
        let list = &self.instance.config().server_list;
        let entries: Vec<ServerListEntry<'_>> = list
            .iter()
            .map(|item| ServerListEntry { name: &item.name })
            .collect();
        let frame = build_server_list(&entries);
        self.incoming.write_all(&frame).await?;

        let mut reply = [0u8; PLAY_SERVER_SIZE];
        match timeout(DIALOG_TIMEOUT, self.incoming.read_exact(&mut reply)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => {
                self.accounting.charge(cost::TIMEOUT);
                return Err(ConnectionError::Timeout);
            }
        }

        if reply[0] != command::PLAY_SERVER {
            return Err(ConnectionError::BadSelection);
        }

        let index = usize::from(u16::from_be_bytes([reply[1], reply[2]]));
        match list.get(index) {
            Some(item) => {
                debug!(peer = %self.peer, index, shard = %item.name, "shard selected");
                Ok(item.address)
            }
            None => Err(ConnectionError::BadSelection),
        }
    }

    async fn connect_upstream(
        &mut self,
        address: SocketAddr,
    ) -> Result<TcpStream, ConnectionError> {
        let connected = match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        };

        match connected {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Err(error) => {
                self.accounting.charge(cost::CONNECT_FAILED);
                metrics::inc(&self.instance.metrics().server_connections_failed);
                warn!(peer = %self.peer, upstream = %address, %error, "upstream connect failed");
                Err(ConnectionError::Connect(error))
            }
        }
    }

    /// Forwards the buffered handshake upstream, with the REMOTE_IP
    /// extended packet between Seed and AccountLogin when enabled.
    async fn send_greeting(&mut self, outgoing: &mut TcpStream) -> Result<(), ConnectionError> {
        let mut greeting = BytesMut::with_capacity(HANDSHAKE_SIZE + 64);
        greeting.put_slice(&self.handshake[..SEED_SIZE]);
        if self.instance.config().send_remote_ip {
            greeting.put_slice(&build_remote_ip(self.peer.ip()));
        }
        greeting.put_slice(&self.handshake[SEED_SIZE..]);

        outgoing.write_all(&greeting).await?;
        Ok(())
    }

    /// The upstream offers its own (single-entry) server list; answer
    /// with index 0 so it proceeds as if the client had picked it.
    async fn select_sole_upstream(
        &mut self,
        outgoing: &mut TcpStream,
    ) -> Result<(), ConnectionError> {
        let mut header = [0u8; 3];
        outgoing.read_exact(&mut header).await?;
        if header[0] != command::SERVER_LIST {
            return Err(ConnectionError::UpstreamProtocol);
        }

        let length = usize::from(u16::from_be_bytes([header[1], header[2]]));
        let mut remainder = length
            .checked_sub(header.len())
            .ok_or(ConnectionError::UpstreamProtocol)?;
        let mut scratch = [0u8; 512];
        while remainder > 0 {
            let chunk = remainder.min(scratch.len());
            let n = outgoing.read(&mut scratch[..chunk]).await?;
            if n == 0 {
                return Err(ConnectionError::UpstreamProtocol);
            }
            remainder -= n;
        }

        outgoing.write_all(&build_play_server(0)).await?;
        Ok(())
    }

    /// Ready state: pure bidirectional splice. A full pipe parks the
    /// reader, a blocked writer parks the reader of the opposite socket,
    /// and EOF half-closes the peer.
    async fn relay(&mut self, outgoing: &TcpStream) -> Result<(), ConnectionError> {
        let metrics = self.instance.metrics_arc();
        let pool = self.instance.pipe_pool();

        let mut client_to_server = SpliceBuffer::new(pool.clone());
        let mut server_to_client = SpliceBuffer::new(pool);

        let mut read_client = true;
        let mut read_server = true;
        let mut write_client = false;
        let mut write_server = false;

        loop {
            let client_interest = interest(read_client, write_client);
            let server_interest = interest(read_server, write_server);

            tokio::select! {
                ready = self
                    .incoming
                    .ready(client_interest.unwrap_or(Interest::READABLE)),
                    if client_interest.is_some() =>
                {
                    let ready = ready?;

                    if ready.is_writable() && write_client {
                        if server_to_client.is_empty() {
                            write_client = false;
                            read_server = true;
                        } else {
                            match server_to_client.send_to(&self.incoming)? {
                                SendResult::Ok => {
                                    write_client = false;
                                    read_server = true;
                                }
                                SendResult::Partial | SendResult::SocketBlocking => {
                                    read_server = false;
                                }
                            }
                        }
                    }

                    if ready.is_readable() && read_client {
                        match client_to_server.receive_from(&self.incoming)? {
                            ReceiveResult::Ok(n) => {
                                metrics::add(&metrics.client_bytes, n as u64);
                                match client_to_server.send_to(outgoing)? {
                                    SendResult::Ok => write_server = false,
                                    SendResult::Partial | SendResult::SocketBlocking => {
                                        read_client = false;
                                        write_server = true;
                                    }
                                }
                            }
                            ReceiveResult::SocketBlocking => {}
                            ReceiveResult::SocketClosed => {
                                shutdown_write(outgoing);
                                return Ok(());
                            }
                            ReceiveResult::PipeFull => read_client = false,
                        }
                    }
                }

                ready = outgoing
                    .ready(server_interest.unwrap_or(Interest::READABLE)),
                    if server_interest.is_some() =>
                {
                    let ready = ready?;

                    if ready.is_writable() && write_server {
                        if client_to_server.is_empty() {
                            write_server = false;
                            read_client = true;
                        } else {
                            match client_to_server.send_to(outgoing)? {
                                SendResult::Ok => {
                                    write_server = false;
                                    read_client = true;
                                }
                                SendResult::Partial | SendResult::SocketBlocking => {
                                    read_client = false;
                                }
                            }
                        }
                    }

                    if ready.is_readable() && read_server {
                        match server_to_client.receive_from(outgoing)? {
                            ReceiveResult::Ok(n) => {
                                metrics::add(&metrics.server_bytes, n as u64);
                                match server_to_client.send_to(&self.incoming)? {
                                    SendResult::Ok => write_client = false,
                                    SendResult::Partial | SendResult::SocketBlocking => {
                                        read_server = false;
                                        write_client = true;
                                    }
                                }
                            }
                            ReceiveResult::SocketBlocking => {}
                            ReceiveResult::SocketClosed => {
                                shutdown_write(&self.incoming);
                                return Ok(());
                            }
                            ReceiveResult::PipeFull => read_server = false,
                        }
                    }
                }
            }
        }
    }

    async fn reject_malformed(&mut self, cost: f64) {
        metrics::inc(&self.instance.metrics().malformed_logins);
        self.accounting.charge(cost);
        self.send_reject().await;
    }

    /// Best-effort AccountLoginReject followed by a write shutdown; the
    /// connection is going away either way.
    async fn send_reject(&mut self) {
        let frame = build_account_login_reject(REJECT_BAD_PASSWORD);
        if self.incoming.write_all(&frame).await.is_ok() {
            let _ = self.incoming.shutdown().await;
        }
    }
}

fn interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Half-close: no more data will flow towards this socket.
fn shutdown_write(socket: &TcpStream) {
    unsafe {
        libc::shutdown(socket.as_raw_fd(), libc::SHUT_WR);
    }
}
