//! Slave agents connected to our listener.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::{Catalog, ConnectionId, ConnectionSet, Peer, PeerConnection, PeerError, ReadySet};
use crate::{
    vsite::Watermark,
    wire::{Handshake, Refresh},
};

/// An accepted slave connection.
///
/// The scope is empty until the slave's handshake has been validated, and
/// fixed afterwards.
#[derive(Debug)]
pub struct DownstreamPeer {
    conn: PeerConnection,
    scope: Option<BTreeSet<String>>,
}

impl DownstreamPeer {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            conn: PeerConnection::from_stream(stream, addr),
            scope: None,
        }
    }

    /// The VSites this slave asked for, once its handshake was accepted.
    pub fn scope(&self) -> Option<&BTreeSet<String>> {
        self.scope.as_ref()
    }

    pub fn is_scoped_to(&self, vsite: &str) -> bool {
        self.scope.as_ref().is_some_and(|scope| scope.contains(vsite))
    }

    fn protocol_error(&self, reason: impl Into<String>) -> PeerError {
        PeerError::Protocol {
            peer: self.conn.peer_label(),
            reason: reason.into(),
        }
    }

    /// Check a handshake against the catalog and fix the scope.
    fn accept_handshake(&mut self, handshake: Handshake, catalog: &dyn Catalog) -> Result<(), PeerError> {
        if handshake.site != catalog.site_name() {
            return Err(self.protocol_error(format!(
                "site '{}' does not match '{}'",
                handshake.site,
                catalog.site_name()
            )));
        }
        let mut catch_up = Vec::with_capacity(handshake.vsites.len());
        for vsite in &handshake.vsites {
            match catalog.watermark(vsite) {
                Some(watermark) => catch_up.push(Refresh::new(vsite.clone(), watermark)),
                None => {
                    return Err(self.protocol_error(format!("VSite '{vsite}' is not served here")));
                }
            }
        }
        info!(peer = %self.conn.peer_label(), vsites = ?handshake.vsites, "Slave handshake accepted");

        let mut scope = BTreeSet::new();
        for refresh in catch_up {
            if scope.insert(refresh.vsite.clone()) {
                self.conn.enqueue(&refresh);
            }
        }
        self.scope = Some(scope);
        Ok(())
    }
}

impl Peer for DownstreamPeer {
    type Event = Infallible;

    fn connection(&self) -> &PeerConnection {
        &self.conn
    }

    fn connection_mut(&mut self) -> &mut PeerConnection {
        &mut self.conn
    }

    fn handle_input(
        &mut self,
        _now: u64,
        catalog: &dyn Catalog,
        _events: &mut Vec<Infallible>,
    ) -> Result<(), PeerError> {
        // Hold the handshake until we know which VSites we serve.
        if !catalog.is_loaded() {
            return Ok(());
        }
        loop {
            let handshake = match self.conn.decode_next::<Handshake>() {
                Ok(Some(handshake)) => handshake,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.protocol_error(e.to_string())),
            };
            // Slaves only ever send one frame.
            if self.scope.is_some() {
                return Err(self.protocol_error("unexpected second handshake"));
            }
            self.accept_handshake(handshake, catalog)?;
        }
    }

    fn handle_disconnect(&mut self, _now: u64) -> Result<(), PeerError> {
        Err(PeerError::Disconnected {
            peer: self.conn.peer_label(),
        })
    }
}

/// The slave listener and every accepted slave.
#[derive(Debug)]
pub struct DownstreamSet {
    listener: TcpListener,
    peers: ConnectionSet<DownstreamPeer>,
}

impl DownstreamSet {
    /// Listen on `addr` (`host:port`).
    pub async fn bind(addr: &str) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Listening for slaves");
        Ok(Self {
            listener,
            peers: ConnectionSet::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Add a connection returned by the listener.
    pub fn accept(&mut self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let id = self.peers.insert(DownstreamPeer::new(stream, addr));
        debug!(peer = %id, %addr, "Accepted slave connection");
        id
    }

    pub fn peers(&self) -> &ConnectionSet<DownstreamPeer> {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn prepare_readiness<'a>(&'a self, ready: &mut ReadySet<'a>) {
        self.peers.prepare_readiness(ready);
    }

    pub fn read_if_ready(&mut self, now: u64, catalog: &dyn Catalog) {
        let mut events = Vec::new();
        self.peers.read_if_ready(now, catalog, &mut events);
    }

    pub fn write_if_ready(&mut self, now: u64) {
        self.peers.write_if_ready(now);
    }

    /// Queue a refresh for `vsite` to every slave scoped to it. Returns the
    /// number of slaves notified.
    pub fn notify_vsite(&mut self, vsite: &str, watermark: &Watermark) -> usize {
        let refresh = Refresh::new(vsite, watermark.clone());
        let mut notified = 0;
        for (_, peer) in self.peers.iter_mut() {
            if peer.is_scoped_to(vsite) {
                peer.conn.enqueue(&refresh);
                notified += 1;
            }
        }
        debug!(vsite, %watermark, notified, "Fanned out refresh");
        notified
    }
}
