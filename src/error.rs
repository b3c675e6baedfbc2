//! Error types for the lease store and TCP listener.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::IpAddr;

/// Errors that can occur during lease store or listener operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config, lease files, queries).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and by
    /// constructors that receive out-of-range settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation, bind or listen error.
    ///
    /// Typically occurs when the listener port is already in use or when
    /// binding to a privileged port without the required rights.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A lease for this address is already stored.
    #[error("Lease for {0} already exists")]
    DuplicateEntry(IpAddr),

    /// No lease is stored for this address.
    #[error("No lease for {0}")]
    NoSuchLease(IpAddr),

    /// Packet queue parameters are missing or malformed.
    #[error("Invalid queue parameter: {0}")]
    InvalidQueueParameter(String),

    /// A query argument is out of range (zero page size, bad prefix length).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A payload does not fit in a length-prefixed frame.
    #[error("Frame payload of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

/// A specialized Result type for lease store and listener operations.
pub type Result<T> = std::result::Result<T, Error>;
