//! Handshake and refresh frames.

use super::{
    WireError,
    xdr::{Packer, Unpacker},
};
use crate::vsite::Watermark;

/// A message that can be written to and read from a peer byte stream.
pub trait Frame: Sized {
    fn encode(&self, packer: &mut Packer);

    fn decode(unpacker: &mut Unpacker<'_>) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut packer = Packer::new();
        self.encode(&mut packer);
        packer.into_bytes()
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` if the
/// buffer does not yet hold a complete frame.
pub fn decode_frame<F: Frame>(buf: &[u8]) -> Result<Option<(F, usize)>, WireError> {
    let mut unpacker = Unpacker::new(buf);
    match F::decode(&mut unpacker) {
        Ok(frame) => Ok(Some((frame, unpacker.position()))),
        Err(e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Sent once by a downstream agent: its site and the VSites it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub site: String,
    pub vsites: Vec<String>,
}

impl Frame for Handshake {
    fn encode(&self, packer: &mut Packer) {
        packer.pack_string(&self.site);
        packer.pack_list(&self.vsites, |p, name| p.pack_string(name));
    }

    fn decode(unpacker: &mut Unpacker<'_>) -> Result<Self, WireError> {
        let site = unpacker.unpack_string()?;
        let vsites = unpacker.unpack_list(|u| u.unpack_string())?;
        Ok(Self { site, vsites })
    }
}

/// "`vsite` is up to date at least through `timestamp`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refresh {
    pub vsite: String,
    pub timestamp: Watermark,
}

impl Refresh {
    pub fn new(vsite: impl Into<String>, timestamp: Watermark) -> Self {
        Self {
            vsite: vsite.into(),
            timestamp,
        }
    }
}

impl Frame for Refresh {
    fn encode(&self, packer: &mut Packer) {
        packer.pack_string(&self.vsite);
        packer.pack_string(self.timestamp.as_str());
    }

    fn decode(unpacker: &mut Unpacker<'_>) -> Result<Self, WireError> {
        let vsite = unpacker.unpack_string()?;
        let timestamp = Watermark::new(unpacker.unpack_string()?);
        Ok(Self { vsite, timestamp })
    }
}
