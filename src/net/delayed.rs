//! Tarpit holding pen
//!
//! A delayed connection parks the accepted socket without reading any
//! payload until its delay has been served, then hands it to the normal
//! connection path. An early hangup is detected by peeking: a FIN or
//! reset shows up as a zero-length peek. Once payload arrives the watch
//! stands down; data alone is not a hangup, and the handshake stays
//! untouched for the real reader.

use crate::instance::Instance;
use crate::net::accounting::AccountedConnection;
use crate::net::connection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::debug;

/// Token cost for clients that give up while being delayed.
const HANGUP_COST: f64 = 4.0;

pub async fn run(
    instance: Arc<Instance>,
    accounting: AccountedConnection,
    stream: TcpStream,
    peer: SocketAddr,
    delay: Duration,
) {
    debug!(peer = %peer, delay_ms = delay.as_millis() as u64, "delaying connection");

    tokio::select! {
        _ = sleep(delay) => {
            connection::handle(instance, accounting, stream, peer).await;
        }
        _ = wait_for_hangup(&stream) => {
            accounting.charge(HANGUP_COST);
            debug!(peer = %peer, "client hung up while delayed");
        }
    }
}

/// Resolves only when the peer goes away before sending anything.
async fn wait_for_hangup(stream: &TcpStream) {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        // FIN or reset before any payload
        Ok(0) | Err(_) => {}
        // payload arrived; from here on only the timer matters
        Ok(_) => std::future::pending().await,
    }
}
