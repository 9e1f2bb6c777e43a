//! Firewall set programming via the external `nft` CLI

use std::net::IpAddr;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const NFT: &str = "/usr/sbin/nft";
const FAMILY: &str = "inet";
const TABLE: &str = "filter";

#[derive(Debug, Error)]
pub enum NftError {
    #[error("failed to execute nft: {0}")]
    Spawn(std::io::Error),

    #[error("nft exited with status {0}")]
    Failed(i32),

    #[error("nft died from a signal")]
    Killed,
}

/// Runs `nft add element inet filter <set> { <address> }` and waits for
/// it to finish.
pub async fn add_element(set: &str, address: IpAddr) -> Result<(), NftError> {
    debug!(set, %address, "adding nftables set element");

    let ip = address.to_string();
    let status = Command::new(NFT)
        .args(["add", "element", FAMILY, TABLE, set, "{", &ip, "}"])
        .status()
        .await
        .map_err(NftError::Spawn)?;

    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(NftError::Failed(code)),
        None => Err(NftError::Killed),
    }
}
