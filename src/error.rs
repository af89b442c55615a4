//! Error types for the DHCP server core.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur while handling DHCP traffic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP datagram received.
    ///
    /// Too short, wrong operation code, bad magic cookie or too many relay
    /// hops. Such datagrams are dropped without a reply.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Every address in the pool is held by a non-expired lease.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The output buffer cannot hold the serialized reply.
    #[error("Reply needs {required} bytes but buffer holds {available}")]
    BufferTooSmall { required: usize, available: usize },
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
