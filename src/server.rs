use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::registry::Registry;
use crate::session::SessionHandle;

/// What every session needs from the server: the registry to broadcast
/// through and the server-wide done flag.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Registry,
    done: CancellationToken,
}

impl ServerHandle {
    fn new() -> Self {
        Self {
            registry: Registry::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Delivers `message` to every registered session and returns how many
    /// accepted it. Nothing is sent once the server is done.
    pub fn broadcast(&self, message: &str) -> usize {
        if self.is_done() {
            return 0;
        }

        self.registry.broadcast(message)
    }

    /// Stops accepting connections and closes every session.
    ///
    /// Safe to call any number of times from any task.
    pub fn shutdown(&self) {
        if !self.done.is_cancelled() {
            info!("shutting down");
        }
        self.done.cancel();

        for session in self.registry.drain() {
            session.close();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }
}

/// Source of inbound connections.
pub trait Acceptor: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

pub struct Server<A = TcpListener> {
    acceptor: A,
    handle: ServerHandle,
    slots: Arc<Semaphore>,
    outbox_capacity: usize,
    tasks: TaskTracker,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self> {
        let listen = config.listen_addr();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {}", listen))?;

        info!(addr = %listener.local_addr()?, max_clients = config.max_clients, "listening");

        Ok(Self::with_acceptor(listener, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl<A: Acceptor> Server<A> {
    pub fn with_acceptor(acceptor: A, config: &Config) -> Self {
        Self {
            acceptor,
            handle: ServerHandle::new(),
            slots: Arc::new(Semaphore::new(config.max_clients.max(1))),
            outbox_capacity: config.outbox_capacity,
            tasks: TaskTracker::new(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accepts connections until shutdown, then waits for every session task.
    ///
    /// The acceptor is dropped, closing the listener, when this returns. An
    /// accept error is fatal and shuts the whole server down.
    pub async fn run(self) -> Result<()> {
        let result = self.accept_loop().await;

        if let Err(e) = &result {
            error!(error = %e, "listener failed");
        }
        self.handle.shutdown();

        let Self {
            acceptor, tasks, ..
        } = self;
        drop(acceptor);

        tasks.close();
        tasks.wait().await;
        info!("all sessions closed");

        result
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.handle.done() => return Ok(()),
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    permit.context("session slots closed")?
                }
            };

            let (socket, peer) = tokio::select! {
                biased;
                _ = self.handle.done() => return Ok(()),
                accepted = self.acceptor.accept() => accepted.context("accept failed")?,
            };

            if self.handle.is_done() {
                debug!(%peer, "dropping connection accepted during shutdown");
                continue;
            }

            self.spawn_session(socket, peer, permit);
        }
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let registry = self.handle.registry();
        let (session, outbox) = SessionHandle::new(registry.next_id(), peer, self.outbox_capacity);

        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        registry.add(session.clone());

        let server = self.handle.clone();
        self.tasks.spawn(async move {
            crate::conn::handle(server, session, outbox, socket).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> Config {
        Config::parse_from(["chat-relay", "--bind", "127.0.0.1", "--port", "0"])
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let server = Server::bind(&test_config()).await.unwrap();
        let handle = server.handle();
        let running = tokio::spawn(server.run());

        handle.shutdown();
        handle.shutdown();

        running.await.unwrap().unwrap();
        assert!(handle.is_done());
        assert!(handle.registry().is_empty());
    }

    #[tokio::test]
    async fn broadcast_after_shutdown_sends_nothing() {
        let server = Server::bind(&test_config()).await.unwrap();
        let handle = server.handle();

        let peer = SocketAddr::from(([127, 0, 0, 1], 6000));
        let (session, mut outbox) =
            SessionHandle::new(handle.registry().next_id(), peer, 4);
        handle.registry().add(session.clone());

        handle.shutdown();

        assert_eq!(handle.broadcast("too late"), 0);
        assert!(session.is_closed());
        assert!(outbox.try_recv().is_err());
        drop(server);
    }

    #[tokio::test]
    async fn listener_is_released_after_run() {
        let server = Server::bind(&test_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();

        handle.shutdown();
        server.run().await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    struct BrokenListener;

    impl Acceptor for BrokenListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            Err(io::Error::other("listener gone"))
        }
    }

    #[tokio::test]
    async fn accept_error_shuts_everything_down() {
        let server = Server::with_acceptor(BrokenListener, &test_config());
        let handle = server.handle();

        let peer = SocketAddr::from(([127, 0, 0, 1], 6001));
        let (session, _outbox) = SessionHandle::new(handle.registry().next_id(), peer, 4);
        handle.registry().add(session.clone());

        let err = server.run().await.unwrap_err();

        assert!(format!("{:#}", err).contains("listener gone"));
        assert!(handle.is_done());
        assert!(session.is_closed());
        assert!(handle.registry().is_empty());
        assert_eq!(handle.broadcast("anyone?"), 0);
    }
}
