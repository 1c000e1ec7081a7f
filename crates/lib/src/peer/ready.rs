//! Combined socket readiness.

use std::future::poll_fn;
use std::task::Poll;

use tokio::io::Interest;
use tokio::net::TcpStream;

/// Sockets and the directions the reactor is waiting on.
///
/// Built fresh every reactor turn from each connection's
/// [`prepare_readiness`](super::PeerConnection::prepare_readiness).
#[derive(Debug, Default)]
pub struct ReadySet<'a> {
    entries: Vec<(&'a TcpStream, Interest)>,
}

impl<'a> ReadySet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stream: &'a TcpStream, interest: Interest) {
        self.entries.push((stream, interest));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve once any registered socket is ready in a registered direction.
    ///
    /// Errors count as readiness; the following read or write reports them.
    /// Never resolves for an empty set.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            for (stream, interest) in &self.entries {
                if interest.is_readable() && stream.poll_read_ready(cx).is_ready() {
                    return Poll::Ready(());
                }
                if interest.is_writable() && stream.poll_write_ready(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        })
        .await
    }
}
