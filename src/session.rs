use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending side of one connected client.
///
/// Cheap to clone; the registry holds one copy and the session's own loop
/// holds another. Lines are queued on a bounded outbox drained by the
/// session's writer task, so a broadcast never waits on a slow socket.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    outbox: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl SessionHandle {
    /// Creates a handle and the receiving end of its outbox.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));

        let handle = Self {
            id,
            peer,
            outbox,
            closed: CancellationToken::new(),
        };

        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues one line for this client.
    ///
    /// Never attempted once the session is closed.
    pub fn send<S: Into<String>>(&self, line: S) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }

        self.outbox.try_send(line.into()).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Marks the session closed. Repeated calls are no-ops.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed from any path.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[test]
    fn queued_lines_reach_the_outbox() {
        let (handle, mut rx) = SessionHandle::new(SessionId(1), peer(), 4);

        handle.send("hello").unwrap();
        handle.send(String::from("world")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert_eq!(rx.try_recv().unwrap(), "world");
    }

    #[test]
    fn closed_session_refuses_sends() {
        let (handle, mut rx) = SessionHandle::new(SessionId(1), peer(), 4);

        handle.close();
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(handle.send("late"), Err(SendError::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_outbox_drops_the_line() {
        let (handle, _rx) = SessionHandle::new(SessionId(1), peer(), 1);

        handle.send("first").unwrap();
        assert_eq!(handle.send("second"), Err(SendError::Full));
        assert!(!handle.is_closed());
    }

    #[test]
    fn dropped_writer_reports_closed() {
        let (handle, rx) = SessionHandle::new(SessionId(1), peer(), 4);
        drop(rx);

        assert_eq!(handle.send("nobody home"), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn clones_share_liveness() {
        let (handle, _rx) = SessionHandle::new(SessionId(7), peer(), 4);
        let other = handle.clone();

        other.close();
        handle.closed().await;

        assert!(handle.is_closed());
        assert_eq!(handle.id().to_string(), "#7");
    }
}
