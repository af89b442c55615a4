//! # dhcpcore
//!
//! The core of a DHCP server (RFC 2131 / RFC 2132): a zero-copy request
//! parser, a lease table with lazy expiration, a round-robin address
//! allocator and a reply builder that applies the RFC 2131 §4.1 addressing
//! rules.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpcore::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> dhcpcore::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config)?;
//!     server.run().await
//! }
//! ```
//!
//! The engine can also be driven without any socket:
//!
//! ```no_run
//! use dhcpcore::{Config, DhcpEngine};
//!
//! # fn receive() -> Vec<u8> { Vec::new() }
//! let engine = DhcpEngine::new(Config::default())?;
//! if let Some(reply) = engine.handle(&receive())? {
//!     let destination = reply.destination.socket_addr();
//!     let bytes = reply.encode();
//!     # let _ = (destination, bytes);
//! }
//! # Ok::<(), dhcpcore::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`RequestView`] - Classified view over one inbound datagram
//! - [`LeaseTable`] - Lock-protected set of [`Lease`] records
//! - [`DhcpEngine`] - DISCOVER/REQUEST handling and address allocation
//! - [`ReplyBuilder`] - OFFER/ACK/NAK construction and [`Destination`] selection
//! - [`DhcpServer`] - UDP transport on port 67

pub mod client_id;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod options;
pub mod reply;
pub mod request;
pub mod server;

pub use client_id::ClientIdentifier;
pub use config::Config;
pub use engine::{DhcpEngine, Pool};
pub use error::{Error, Result};
pub use lease::{Clock, Lease, LeaseTable, SystemClock};
pub use options::{DhcpOption, MessageType, RawOptions};
pub use reply::{Destination, Reply, ReplyBuilder};
pub use request::RequestView;
pub use server::DhcpServer;
