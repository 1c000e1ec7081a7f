//! Links to master agents.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{Catalog, ConnectionSet, Peer, PeerConnection, PeerError};
use crate::{
    clock::deadline_after,
    wire::{Handshake, Refresh},
};

/// All configured master links.
pub type UpstreamSet = ConnectionSet<UpstreamLink>;

/// An outbound connection to a master agent.
///
/// While disconnected, `reconnect_at` says when to try again. Connection
/// failures and protocol errors both reset the link rather than removing it.
#[derive(Debug)]
pub struct UpstreamLink {
    address: String,
    conn: PeerConnection,
    reconnect_at: u64,
    retry_interval: Duration,
    connect_timeout: Duration,
}

impl UpstreamLink {
    /// A link to `address` (`host:port`) that will connect on the first turn.
    pub fn new(address: impl Into<String>, retry_interval: Duration, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            conn: PeerConnection::new(),
            reconnect_at: 0,
            retry_interval,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Next connection attempt, if disconnected.
    pub fn reconnect_at(&self) -> Option<u64> {
        (!self.conn.is_connected()).then_some(self.reconnect_at)
    }

    /// Connect if disconnected and due, then queue our handshake.
    pub async fn work_if_ready(&mut self, now: u64, catalog: &dyn Catalog) {
        if self.conn.is_connected() || now < self.reconnect_at {
            return;
        }
        debug!(master = %self.address, "Connecting to master");
        let connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(master = %self.address, "Cannot connect to master: {e}");
                self.schedule_reconnect(now);
                return;
            }
            Err(_) => {
                warn!(master = %self.address, timeout = ?self.connect_timeout, "Timed out connecting to master");
                self.schedule_reconnect(now);
                return;
            }
        };
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(master = %self.address, "Connection to master dropped: {e}");
                self.schedule_reconnect(now);
                return;
            }
        };
        self.conn.attach(stream, addr);
        self.conn.enqueue(&Handshake {
            site: catalog.site_name().to_string(),
            vsites: catalog.vsite_names().to_vec(),
        });
        info!(master = %self.address, "Connected to master");
    }

    /// Fold this link's reconnect deadline into `deadline`.
    pub fn compute_wake_time(&self, deadline: u64) -> u64 {
        match self.reconnect_at() {
            Some(at) => deadline.min(at),
            None => deadline,
        }
    }

    fn schedule_reconnect(&mut self, now: u64) {
        self.conn.reset();
        self.reconnect_at = deadline_after(now, self.retry_interval);
    }
}

impl Peer for UpstreamLink {
    type Event = Refresh;

    fn connection(&self) -> &PeerConnection {
        &self.conn
    }

    fn connection_mut(&mut self) -> &mut PeerConnection {
        &mut self.conn
    }

    fn handle_input(
        &mut self,
        now: u64,
        _catalog: &dyn Catalog,
        events: &mut Vec<Refresh>,
    ) -> Result<(), PeerError> {
        loop {
            match self.conn.decode_next::<Refresh>() {
                Ok(Some(refresh)) => {
                    debug!(master = %self.address, vsite = %refresh.vsite, timestamp = %refresh.timestamp, "Refresh from master");
                    events.push(refresh);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(master = %self.address, "Protocol error from master, reconnecting: {e}");
                    self.schedule_reconnect(now);
                    return Ok(());
                }
            }
        }
    }

    fn handle_disconnect(&mut self, now: u64) -> Result<(), PeerError> {
        info!(master = %self.address, retry_in = ?self.retry_interval, "Lost connection to master");
        self.schedule_reconnect(now);
        Ok(())
    }
}

impl ConnectionSet<UpstreamLink> {
    /// Drive connect timers of every link.
    pub async fn work_if_ready(&mut self, now: u64, catalog: &dyn Catalog) {
        for (_, link) in self.iter_mut() {
            link.work_if_ready(now, catalog).await;
        }
    }

    /// Fold every disconnected link's reconnect deadline into `deadline`.
    pub fn compute_wake_time(&self, deadline: u64) -> u64 {
        self.iter()
            .fold(deadline, |deadline, (_, link)| link.compute_wake_time(deadline))
    }
}
