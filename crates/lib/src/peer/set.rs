//! A set of peers driven together.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, trace, warn};

use super::{Catalog, Peer, PeerError, ReadOutcome, ReadySet};

/// Identifies a peer within its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Peers keyed by [`ConnectionId`], serviced in insertion order.
#[derive(Debug)]
pub struct ConnectionSet<P> {
    peers: BTreeMap<ConnectionId, P>,
    next_id: u64,
}

impl<P> Default for ConnectionSet<P> {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<P: Peer> ConnectionSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: P) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, peer);
        id
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<P> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&P> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut P> {
        self.peers.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &P)> {
        self.peers.iter().map(|(id, peer)| (*id, peer))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut P)> {
        self.peers.iter_mut().map(|(id, peer)| (*id, peer))
    }

    /// Register every peer's socket.
    pub fn prepare_readiness<'a>(&'a self, ready: &mut ReadySet<'a>) {
        for peer in self.peers.values() {
            peer.connection().prepare_readiness(ready);
        }
    }

    /// Read from every peer that has data and decode what is buffered.
    ///
    /// Input already buffered is decoded even without new bytes, so frames
    /// deferred by a peer (for example until the catalog loads) are picked
    /// up later.
    pub fn read_if_ready(&mut self, now: u64, catalog: &dyn Catalog, events: &mut Vec<P::Event>) {
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let result = match peer.connection_mut().read_ready() {
                ReadOutcome::Data(n) => {
                    trace!(peer = %id, bytes = n, "Read");
                    peer.handle_input(now, catalog, events)
                }
                ReadOutcome::Idle if peer.connection().has_inbound() => {
                    peer.handle_input(now, catalog, events)
                }
                ReadOutcome::Idle => Ok(()),
                ReadOutcome::Closed => {
                    debug!(peer = %id, addr = %peer.connection().peer_label(), "Peer closed connection");
                    peer.handle_disconnect(now)
                }
                ReadOutcome::Failed(e) => {
                    warn!(peer = %id, addr = %peer.connection().peer_label(), "Read failed: {e}");
                    peer.handle_disconnect(now)
                }
                ReadOutcome::Overflow => {
                    warn!(peer = %id, addr = %peer.connection().peer_label(), "Too much unprocessed input");
                    peer.handle_disconnect(now)
                }
            };
            if let Err(e) = result {
                failed.push((*id, e));
            }
        }
        self.drop_failed(failed);
    }

    /// Flush pending output of every peer as far as the sockets allow.
    ///
    /// A peer whose backlog is still over the limit afterwards is treated as
    /// disconnected.
    pub fn write_if_ready(&mut self, now: u64) {
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let result = match peer.connection_mut().write_ready() {
                Ok(0) => Ok(()),
                Ok(n) => {
                    trace!(peer = %id, bytes = n, "Wrote");
                    Ok(())
                }
                Err(e) => {
                    warn!(peer = %id, addr = %peer.connection().peer_label(), "Write failed: {e}");
                    peer.handle_disconnect(now)
                }
            };
            let result = result.and_then(|()| {
                if peer.connection().is_outbound_full() {
                    warn!(
                        peer = %id,
                        addr = %peer.connection().peer_label(),
                        backlog = peer.connection().outbound_len(),
                        "Peer is not reading its output"
                    );
                    peer.handle_disconnect(now)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                failed.push((*id, e));
            }
        }
        self.drop_failed(failed);
    }

    fn drop_failed(&mut self, failed: Vec<(ConnectionId, PeerError)>) {
        for (id, err) in failed {
            if err.is_protocol_error() {
                info!(peer = %id, "Dropping peer: {err}");
            } else {
                debug!(peer = %id, "Dropping peer: {err}");
            }
            if let Some(mut peer) = self.peers.remove(&id) {
                peer.connection_mut().reset();
            }
        }
    }
}
