//! Per-client accounting: connection caps, token bucket, tarpit
//!
//! Every client address maps to one record keyed by a folded 64-bit
//! integer. The record carries a token bucket that is charged for every
//! noteworthy event (admission, malformed packets, failed logins); a
//! negative balance puts the address into the tarpit, growing a per-accept
//! delay that is served before the handshake is even read.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tokens regained per second.
pub const TOKEN_RATE: f64 = 1.0;
/// Maximum stored tokens.
pub const TOKEN_BURST: f64 = 10.0;

/// How long an overdrawn client stays in the tarpit.
const TARPIT_FOR: Duration = Duration::from_secs(60);
/// Per-overdraw growth of the accept delay, and its cap.
const DELAY_STEP: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Idle records linger this long after their last connection departs.
const EXPIRES_AFTER: Duration = Duration::from_secs(5 * 60);

/// Cleanup sweep interval of the accounting map.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Token bucket that may run a debt: costs are charged unconditionally
/// and the caller reacts to a negative balance.
#[derive(Debug)]
struct TokenBucket {
    level: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self {
            level: TOKEN_BURST,
            last_update: now,
        }
    }

    /// Refills for the elapsed time, charges `cost`, returns the new
    /// level. The level is capped at the burst size but not below zero.
    fn update(&mut self, now: Instant, cost: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.level = (self.level + elapsed * TOKEN_RATE - cost).min(TOKEN_BURST);
        self.last_update = now;
        self.level
    }
}

#[derive(Debug)]
struct ClientState {
    /// Live connections referencing this record.
    connections: usize,
    /// When an idle record may be garbage-collected.
    expires: Instant,
    /// Until this point the delay decays instead of resetting.
    tarpit_until: Instant,
    /// Accept delay currently served to this client.
    delay: Duration,
    bucket: TokenBucket,
    knocked: bool,
}

/// Accounting record for one client address.
#[derive(Debug)]
pub struct PerClientAccounting {
    address: u64,
    max_connections: usize,
    tarpit: bool,
    state: Mutex<ClientState>,
}

impl PerClientAccounting {
    fn new(address: u64, max_connections: usize, tarpit: bool, now: Instant) -> Self {
        Self {
            address,
            max_connections,
            tarpit,
            state: Mutex::new(ClientState {
                connections: 0,
                // grace period so a knock-only record survives until the
                // TCP connection it authorizes arrives
                expires: now + EXPIRES_AFTER,
                tarpit_until: now,
                delay: Duration::ZERO,
                bucket: TokenBucket::new(now),
                knocked: false,
            }),
        }
    }

    /// False when the per-client connection cap is exhausted.
    pub fn check(&self) -> bool {
        self.max_connections == 0 || self.state.lock().connections < self.max_connections
    }

    /// Charges the token bucket and advances the tarpit state.
    pub fn update_token_bucket(&self, cost: f64) {
        self.update_token_bucket_at(Instant::now(), cost);
    }

    pub(crate) fn update_token_bucket_at(&self, now: Instant, cost: f64) {
        if !self.tarpit {
            return;
        }

        let mut state = self.state.lock();
        let available = state.bucket.update(now, cost);
        if available < 0.0 {
            state.tarpit_until = now + TARPIT_FOR;
            if state.delay < MAX_DELAY {
                state.delay += DELAY_STEP;
            }
        } else if now < state.tarpit_until {
            state.delay = state.delay.saturating_sub(DELAY_STEP);
        } else {
            state.delay = Duration::ZERO;
        }

        if !state.delay.is_zero() {
            debug!(
                address = self.address,
                delay_ms = state.delay.as_millis() as u64,
                "client tarpitted"
            );
        }
    }

    /// Accept delay to serve before this client's next connection.
    pub fn delay(&self) -> Duration {
        self.state.lock().delay
    }

    pub fn set_knocked(&self) {
        self.state.lock().knocked = true;
    }

    pub fn is_knocked(&self) -> bool {
        self.state.lock().knocked
    }

    fn add_connection(&self) {
        self.state.lock().connections += 1;
    }

    fn remove_connection_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.connections = state.connections.saturating_sub(1);
        state.expires = now + EXPIRES_AFTER;
    }
}

/// Non-owning handle a connection keeps into its accounting record; all
/// operations are no-ops when the peer address is not accountable. The
/// record is unlinked on drop, never freed here: the map owns it until
/// its TTL expires.
pub struct AccountedConnection {
    per_client: Option<Arc<PerClientAccounting>>,
}

impl AccountedConnection {
    pub fn new(per_client: Option<Arc<PerClientAccounting>>) -> Self {
        if let Some(per_client) = &per_client {
            per_client.add_connection();
        }
        Self { per_client }
    }

    pub fn charge(&self, cost: f64) {
        if let Some(per_client) = &self.per_client {
            per_client.update_token_bucket(cost);
        }
    }
}

impl Drop for AccountedConnection {
    fn drop(&mut self) {
        if let Some(per_client) = self.per_client.take() {
            per_client.remove_connection_at(Instant::now());
        }
    }
}

/// Map of all accounting records, keyed by folded address.
pub struct ClientAccountingMap {
    max_connections: usize,
    tarpit: bool,
    map: Mutex<HashMap<u64, Arc<PerClientAccounting>>>,
}

impl ClientAccountingMap {
    pub fn new(max_connections: usize, tarpit: bool) -> Arc<Self> {
        Arc::new(Self {
            max_connections,
            tarpit,
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the record for this address, creating it on first contact.
    /// `None` for address families that cannot be keyed.
    pub fn get(&self, address: SocketAddr) -> Option<Arc<PerClientAccounting>> {
        let key = address_key(address.ip());
        if key == 0 {
            return None;
        }

        let mut map = self.map.lock();
        let per_client = map.entry(key).or_insert_with(|| {
            Arc::new(PerClientAccounting::new(
                key,
                self.max_connections,
                self.tarpit,
                Instant::now(),
            ))
        });
        Some(per_client.clone())
    }

    /// Drops idle records whose TTL has passed.
    pub fn cleanup(&self, now: Instant) {
        self.map.lock().retain(|_, per_client| {
            let state = per_client.state.lock();
            state.connections > 0 || now < state.expires
        });
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Periodic cleanup, run as a background task.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.cleanup(Instant::now());
        }
    }
}

/// Folds an address into the 64-bit accounting key: IPv4 is the network
/// order address value, IPv6 XORs the two halves, V4-mapped addresses
/// unwrap to their IPv4 form. 0 means "not accountable".
pub fn address_key(ip: IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u64::from(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return u64::from(u32::from_be_bytes(v4.octets()));
            }
            let octets = v6.octets();
            let hi = u64::from_be_bytes([
                octets[0], octets[1], octets[2], octets[3], octets[4], octets[5], octets[6],
                octets[7],
            ]);
            let lo = u64::from_be_bytes([
                octets[8], octets[9], octets[10], octets[11], octets[12], octets[13], octets[14],
                octets[15],
            ]);
            hi ^ lo
        }
    }
}
