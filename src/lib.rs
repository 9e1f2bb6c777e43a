pub mod config;
pub mod db;
pub mod instance;
pub mod metrics;
pub mod net;
pub mod nftables;
pub mod splice;
pub mod uo;

pub use config::{Config, ConfigError};
pub use db::{DatabaseError, UserDatabase};
pub use instance::{Instance, StartupError};
pub use metrics::Metrics;
pub use net::{AccountedConnection, ClientAccountingMap, PerClientAccounting};
pub use splice::{PipePool, SpliceBuffer};
