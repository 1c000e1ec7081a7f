//! Peer connections between cooperating agents.
//!
//! Every peer wraps a non-blocking [`PeerConnection`]: a socket plus an
//! inbound buffer of bytes not yet decoded and an outbound buffer of bytes not
//! yet flushed. Two kinds of peer exist:
//!
//! - [`UpstreamLink`]: an outbound connection to a master agent. It sends our
//!   handshake on connect and yields [`Refresh`](crate::wire::Refresh) events.
//!   On failure it resets and reconnects after its retry interval.
//! - [`DownstreamPeer`]: an inbound connection accepted from a slave agent.
//!   It is scoped by the slave's handshake and receives refreshes for the
//!   VSites in that scope. On failure it is simply dropped.
//!
//! Peers are held in a [`ConnectionSet`], which drives reads and writes and
//! removes peers whose handlers return an error. Peers never reach into the
//! site registry directly; they see it through the read-only [`Catalog`].

mod connection;
mod downstream;
mod ready;
mod set;
mod upstream;

pub use connection::{MAX_BUFFERED, PeerConnection, READ_CHUNK, ReadOutcome};
pub use downstream::{DownstreamPeer, DownstreamSet};
pub use ready::ReadySet;
pub use set::{ConnectionId, ConnectionSet};
pub use upstream::{UpstreamLink, UpstreamSet};

use thiserror::Error;

use crate::vsite::Watermark;

/// Errors that end a peer connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PeerError {
    /// The peer sent something malformed or out of scope.
    #[error("Protocol error from {peer}: {reason}")]
    Protocol { peer: String, reason: String },

    /// Socket-level failure.
    #[error("Connection to {peer} failed")]
    Connection {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer closed its end.
    #[error("Peer {peer} disconnected")]
    Disconnected { peer: String },
}

impl PeerError {
    /// Get the peer this error is about.
    pub fn peer(&self) -> &str {
        match self {
            PeerError::Protocol { peer, .. }
            | PeerError::Connection { peer, .. }
            | PeerError::Disconnected { peer } => peer,
        }
    }

    /// Check if the peer violated the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, PeerError::Protocol { .. })
    }

    /// Check if the socket failed or closed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PeerError::Connection { .. } | PeerError::Disconnected { .. }
        )
    }
}

impl From<PeerError> for crate::Error {
    fn from(err: PeerError) -> Self {
        crate::Error::Peer(err)
    }
}

/// Read-only view of the VSites this site serves.
pub trait Catalog {
    fn site_name(&self) -> &str;

    /// Managed VSite names in stable order. Empty until loaded.
    fn vsite_names(&self) -> &[String];

    /// Current watermark of `vsite`, or `None` if it is not managed here.
    fn watermark(&self, vsite: &str) -> Option<Watermark>;

    /// Whether the VSite list has been loaded from the database yet.
    fn is_loaded(&self) -> bool;
}

/// Protocol behavior layered on a [`PeerConnection`].
///
/// Returning an error from either handler removes the peer from its set.
pub trait Peer {
    /// What the peer reports to the reactor.
    type Event;

    fn connection(&self) -> &PeerConnection;

    fn connection_mut(&mut self) -> &mut PeerConnection;

    /// Decode whatever complete frames are buffered.
    fn handle_input(
        &mut self,
        now: u64,
        catalog: &dyn Catalog,
        events: &mut Vec<Self::Event>,
    ) -> Result<(), PeerError>;

    /// The socket closed or failed.
    fn handle_disconnect(&mut self, now: u64) -> Result<(), PeerError>;
}
