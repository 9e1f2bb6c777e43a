//! UDP knock listener
//!
//! One datagram is exactly one AccountLogin frame. The source address
//! of a datagram cannot be trusted, so only valid credentials grant
//! knock status; everything else is charged against the sender's
//! bucket and dropped without a reply.

use crate::instance::Instance;
use crate::metrics;
use crate::nftables;
use crate::net::accounting::PerClientAccounting;
use crate::uo::{
    command, extract_cstr, username_str, ACCOUNT_LOGIN_PASSWORD, ACCOUNT_LOGIN_SIZE,
    ACCOUNT_LOGIN_USERNAME,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

mod cost {
    pub const REJECTED_KNOCK: f64 = 5.0;
    pub const BAD_USERNAME: f64 = 8.0;
    pub const MALFORMED_KNOCK: f64 = 10.0;
}

/// Receive loop; runs until the task is aborted on shutdown.
pub async fn run(instance: Arc<Instance>, socket: UdpSocket) {
    info!(
        port = instance.config().knock_port.unwrap_or_default(),
        "accepting knocks"
    );

    // one spare byte so oversized datagrams are distinguishable
    let mut datagram = [0u8; ACCOUNT_LOGIN_SIZE + 1];
    let mut checks = JoinSet::new();
    loop {
        tokio::select! {
            received = socket.recv_from(&mut datagram) => {
                match received {
                    Ok((len, peer)) => {
                        on_datagram(&instance, &mut checks, &datagram[..len], peer);
                    }
                    Err(error) => warn!(%error, "knock receive failed"),
                }
            }
            Some(_) = checks.join_next(), if !checks.is_empty() => {}
        }
    }
}

fn on_datagram(
    instance: &Arc<Instance>,
    checks: &mut JoinSet<()>,
    datagram: &[u8],
    peer: SocketAddr,
) {
    let Some(per_client) = instance.accounting().get(peer) else {
        return;
    };
    let metrics = instance.metrics();

    if datagram.len() != ACCOUNT_LOGIN_SIZE || datagram[0] != command::ACCOUNT_LOGIN {
        metrics::inc(&metrics.malformed_knocks);
        per_client.update_token_bucket(cost::MALFORMED_KNOCK);
        return;
    }

    let Some(username) = username_str(&datagram[ACCOUNT_LOGIN_USERNAME]) else {
        metrics::inc(&metrics.malformed_knocks);
        per_client.update_token_bucket(cost::BAD_USERNAME);
        return;
    };

    let username = username.to_owned();
    let password = extract_cstr(&datagram[ACCOUNT_LOGIN_PASSWORD]).to_vec();
    let instance = instance.clone();
    checks.spawn(async move {
        check_knock(instance, per_client, username, password, peer).await;
    });
}

async fn check_knock(
    instance: Arc<Instance>,
    per_client: Arc<PerClientAccounting>,
    username: String,
    password: Vec<u8>,
    peer: SocketAddr,
) {
    let metrics = instance.metrics();

    match instance.database().check(&username, &password).await {
        Ok(true) => {
            per_client.set_knocked();
            metrics::inc(&metrics.accepted_knocks);
            info!(peer = %peer, username, "knock accepted");

            if let Some(set) = &instance.config().knock_nft_set {
                // the knock is already granted in-memory; a firewall
                // failure is logged and nothing else
                if let Err(e) = nftables::add_element(set, peer.ip()).await {
                    error!(peer = %peer, set, error = %e, "nft invocation failed");
                }
            }
        }
        Ok(false) => {
            per_client.update_token_bucket(cost::REJECTED_KNOCK);
            metrics::inc(&metrics.rejected_knocks);
            debug!(peer = %peer, username, "knock rejected");
        }
        Err(error) => {
            warn!(peer = %peer, %error, "knock credential check failed");
        }
    }
}
