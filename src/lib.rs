//! # leasehold
//!
//! DHCP lease storage with relay-aware secondary indexes and an
//! asynchronous TCP bulk lease-query service.
//!
//! ## Features
//!
//! - v4 and v6 leases (IA_NA, IA_TA, IA_PD) keyed by address
//! - Relay-id / remote-id reverse tables kept consistent with every write
//! - Paginated lookups by relay-id, remote-id and link prefix
//! - Lease persistence across restarts, index rebuilt on load
//! - Length-prefixed TCP listener with idle timeouts, connection filtering
//!   and a per-connection audit trail
//! - Configurable packet queues buffering lease updates for a background worker
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasehold::{Config, LeaseQueryServer};
//!
//! #[tokio::main]
//! async fn main() -> leasehold::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = LeaseQueryServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Lease database, listener and packet queue settings
//! - [`Leases`] - Thread-safe lease store with extended-info indexes and persistence
//! - [`extended_info`] - Relay-id / remote-id tables and user-context parsing
//! - [`tcp::Listener`] - Accept loop, connection pool and audit trail
//! - [`LeaseQueryHandler`] - JSON bulk lease queries answered from [`Leases`]
//! - [`QueueManager`] - Registry of packet queue factories
//! - [`LeaseUpdater`] - Applies submitted lease events on a blocking worker
//! - [`LeaseQueryServer`] - Ties the pieces together

pub mod bulk_query;
pub mod config;
pub mod error;
pub mod extended_info;
pub mod intake;
pub mod lease;
pub mod queue;
pub mod server;
pub mod tcp;

pub use bulk_query::{BulkQuery, LeaseQueryHandler};
pub use config::Config;
pub use error::{Error, Result};
pub use extended_info::{ExtendedInfo, IdentifierKind};
pub use intake::{LeaseEvent, LeaseUpdater};
pub use lease::{ExtendedInfoAction, Lease, LeasePage, LeasePageSize, LeaseType, Leases, Link};
pub use queue::{PacketQueue, QueueManager, RingQueue, WorkQueue};
pub use server::LeaseQueryServer;
