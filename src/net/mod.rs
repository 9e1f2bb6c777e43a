//! Client-facing networking: admission, accounting, tarpit, relaying

pub mod accounting;
pub mod connection;
pub mod delayed;
pub mod knock;
pub mod listener;

// Re-exports
pub use accounting::{
    address_key, AccountedConnection, ClientAccountingMap, PerClientAccounting,
};
