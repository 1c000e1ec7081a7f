//! Wire protocol spoken between agents.
//!
//! Two frame shapes travel over plain TCP, both built from the XDR-style
//! primitives in [`xdr`]:
//!
//! - [`Handshake`]: sent once by a downstream agent after connecting,
//!   naming its site and the VSites it wants to hear about.
//! - [`Refresh`]: "this VSite has been updated at least through this
//!   timestamp", sent in either direction.
//!
//! Decoding never fails on a short buffer; it reports that more bytes are
//! needed so the caller can keep accumulating.

mod frame;
pub mod xdr;

pub use frame::{Frame, Handshake, Refresh, decode_frame};

use thiserror::Error;

/// Upper bound on a single encoded string, in bytes.
pub const MAX_STRING_LEN: u32 = 64 * 1024;

/// Upper bound on the element count of an encoded list.
pub const MAX_LIST_LEN: u32 = 16 * 1024;

/// Errors that can occur while decoding frames.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// Not enough bytes buffered yet to decode a complete frame.
    #[error("Incomplete frame: need at least {needed} more bytes")]
    Incomplete { needed: usize },

    /// A declared length exceeds the protocol limit.
    #[error("{what} length {len} exceeds limit {limit}")]
    Oversized {
        what: &'static str,
        len: u32,
        limit: u32,
    },

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8 {
        #[source]
        source: std::string::FromUtf8Error,
    },
}

impl WireError {
    /// Check if this error only means more bytes are needed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WireError::Incomplete { .. })
    }
}

impl From<WireError> for crate::Error {
    fn from(err: WireError) -> Self {
        crate::Error::Wire(err)
    }
}
