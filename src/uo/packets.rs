//! Login-phase packet layouts and builders
//!
//! All integers are big-endian and all frames are byte-aligned with no
//! padding. Only the handshake subset the proxy inspects is modelled here;
//! everything after the PlayServer dialogue passes through the splice
//! engine untouched.

use bytes::{BufMut, BytesMut};
use std::net::IpAddr;

/// First byte of every login-phase frame.
pub mod command {
    /// Seed (21 bytes): session seed + client version.
    pub const SEED: u8 = 0xef;
    /// AccountLogin (62 bytes): credentials for the account server.
    pub const ACCOUNT_LOGIN: u8 = 0x80;
    /// AccountLoginReject (2 bytes): cmd + reason.
    pub const ACCOUNT_LOGIN_REJECT: u8 = 0x82;
    /// ServerList (variable): shard directory offered after login.
    pub const SERVER_LIST: u8 = 0xa8;
    /// PlayServer (3 bytes): cmd + big-endian shard index.
    pub const PLAY_SERVER: u8 = 0xa0;
    /// GameLogin (65 bytes): credentials for the game server.
    pub const GAME_LOGIN: u8 = 0x91;
    /// Extended (variable): cmd + length + extended_cmd + payload.
    pub const EXTENDED: u8 = 0xbf;
}

pub const SEED_SIZE: usize = 21;
pub const ACCOUNT_LOGIN_SIZE: usize = 62;
/// Seed and AccountLogin arrive back-to-back before anything is forwarded.
pub const HANDSHAKE_SIZE: usize = SEED_SIZE + ACCOUNT_LOGIN_SIZE;
pub const PLAY_SERVER_SIZE: usize = 3;
pub const GAME_LOGIN_SIZE: usize = 65;

/// Byte range of the username field inside an AccountLogin frame.
pub const ACCOUNT_LOGIN_USERNAME: std::ops::Range<usize> = 1..31;
/// Byte range of the password field inside an AccountLogin frame.
pub const ACCOUNT_LOGIN_PASSWORD: std::ops::Range<usize> = 31..61;

/// Extended sub-command carrying the real client address upstream.
pub const EXTENDED_REMOTE_IP: u16 = 0x5a6a;

/// The one reject reason ever sent ("incorrect password").
pub const REJECT_BAD_PASSWORD: u8 = 0x03;

/// On-wire IP advertised for every synthesized server-list entry. Clients
/// never connect to it; the follow-up PlayServer is dispatched by the
/// proxy, and the real addresses must not be disclosed.
pub const SERVER_LIST_SENTINEL_IP: u32 = 0xdead_beef;

pub fn build_account_login_reject(reason: u8) -> [u8; 2] {
    [command::ACCOUNT_LOGIN_REJECT, reason]
}

pub fn build_play_server(index: u16) -> [u8; PLAY_SERVER_SIZE] {
    let idx = index.to_be_bytes();
    [command::PLAY_SERVER, idx[0], idx[1]]
}

/// One entry of the synthesized ServerList.
pub struct ServerListEntry<'a> {
    pub name: &'a str,
}

/// Builds a ServerList frame advertising the configured shards with
/// sequential indexes starting at 0 and the sentinel address.
pub fn build_server_list(entries: &[ServerListEntry<'_>]) -> BytesMut {
    const ENTRY_SIZE: usize = 2 + 32 + 1 + 1 + 4;
    let length = 1 + 2 + 1 + 2 + entries.len() * ENTRY_SIZE;

    let mut buf = BytesMut::with_capacity(length);
    buf.put_u8(command::SERVER_LIST);
    buf.put_u16(length as u16);
    buf.put_u8(0x5d);
    buf.put_u16(entries.len() as u16);

    for (index, entry) in entries.iter().enumerate() {
        buf.put_u16(index as u16);

        let mut name = [0u8; 32];
        let raw = entry.name.as_bytes();
        let n = raw.len().min(name.len());
        name[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&name);

        buf.put_u8(0); // percent full
        buf.put_u8(0); // timezone
        buf.put_u32(SERVER_LIST_SENTINEL_IP);
    }

    buf
}

/// Builds the Extended packet telling the upstream server the real client
/// address: extended_cmd 0x5a6a, payload `REMOTE_IP=<ip>` (ASCII, no NUL).
pub fn build_remote_ip(addr: IpAddr) -> BytesMut {
    let payload = format!("REMOTE_IP={addr}");
    let length = 1 + 2 + 2 + payload.len();

    let mut buf = BytesMut::with_capacity(length);
    buf.put_u8(command::EXTENDED);
    buf.put_u16(length as u16);
    buf.put_u16(EXTENDED_REMOTE_IP);
    buf.put_slice(payload.as_bytes());
    buf
}
