//!
//! Siteagent: propagates account, group and provisioning state for a site from
//! an authoritative database out to provisioning backends, and fans out
//! "update ready" notifications across a tree of cooperating agent processes.
//!
//! ## Core Concepts
//!
//! * **Site (`site::Site`)**: The single-threaded reactor owning the database
//!   session, the VSite registry and the peer connection sets. One iteration
//!   (`Site::turn`) handles database heartbeat/reconnect, scheduled VSite
//!   updates, one bounded readiness wait, and event dispatch.
//! * **VSites (`vsite::VSite`)**: Named administrative units within a site. Each
//!   runs its own prepare → update(groups, users) → finish cycle against a
//!   pluggable backend (`vsite::VSiteBackend`), with a persisted watermark and an
//!   independent retry deadline.
//! * **Peers (`peer`)**: Non-blocking TCP connections to an upstream (master)
//!   agent that tells us when to re-pull, and to downstream (slave) agents we
//!   notify after each completed update.
//! * **Wire (`wire`)**: The length-prefixed handshake and refresh frames spoken
//!   between agents.
//! * **Database (`db`)**: The site database contract, with a PostgreSQL
//!   implementation and an in-memory one for development and tests.

pub mod backends;
pub mod clock;
pub mod config;
pub mod db;
pub mod hooks;
pub mod peer;
pub mod site;
pub mod vsite;
pub mod wire;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use site::Site;
pub use vsite::Watermark;

/// Result type used throughout the siteagent library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the siteagent library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured database errors from the db module
    #[error(transparent)]
    Database(db::DatabaseError),

    /// Backend-specific update failures from the vsite module
    #[error(transparent)]
    Update(vsite::UpdateError),

    /// Protocol and connection failures from the peer module
    #[error(transparent)]
    Peer(peer::PeerError),

    /// Wire encoding errors from the wire module
    #[error(transparent)]
    Wire(wire::WireError),

    /// Configuration errors, fatal at startup
    #[error(transparent)]
    Config(config::ConfigError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Database(_) => "db",
            Error::Update(_) => "vsite",
            Error::Peer(_) => "peer",
            Error::Wire(_) => "wire",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error came from the database layer.
    ///
    /// Database errors close the session and schedule a site-wide reconnect.
    pub fn is_database_error(&self) -> bool {
        matches!(self, Error::Database(_))
    }

    /// Check if this error is a backend update failure.
    ///
    /// Backend I/O failures arrive as `UpdateError::Io`, so they count too.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, Error::Update(_))
    }

    /// Check if this error is a protocol violation by a peer.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            Error::Peer(peer_err) => peer_err.is_protocol_error(),
            Error::Wire(wire_err) => !wire_err.is_incomplete(),
            _ => false,
        }
    }

    /// Check if this error is a socket-level failure.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Peer(peer_err) => peer_err.is_connection_error(),
            _ => false,
        }
    }

    /// Check if this error is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
