use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SendError;
use crate::protocol::{self, Command, parse_command};
use crate::registry::Registry;
use crate::server::ServerHandle;
use crate::session::SessionHandle;

/// How long a closing session may spend flushing queued lines to its client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session loop stopped.
#[derive(Debug)]
enum Exit {
    /// Client closed its end.
    Eof,
    /// Client sent `/quit`.
    Quit,
    /// Reading from the client failed.
    Io(io::Error),
    /// The session was closed underneath us, usually by a failed write.
    Closed,
    /// The server is shutting down.
    Shutdown,
}

/// Removes the session from the registry and closes it when dropped.
///
/// Every way out of [`handle`] passes through this exactly once.
struct Teardown {
    registry: Registry,
    session: SessionHandle,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.session.close();
        if self.registry.remove(self.session.id()) {
            debug!(session = %self.session.id(), "removed from registry");
        }
    }
}

/// Newline-delimited reader that never rejects a line for its encoding.
///
/// Invalid UTF-8 is replaced with U+FFFD; `\n` and `\r\n` are stripped.
struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Returns `None` at end of stream. Cancel safe: a partial line stays
    /// buffered for the next call.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.inner.read_until(b'\n', &mut self.buf).await? == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Per-client state, only ever touched by this connection's own task.
struct ClientCtx {
    session: SessionHandle,
    nick: String,
}

/// Drives one accepted connection until it ends.
pub async fn handle(
    server: ServerHandle,
    session: SessionHandle,
    outbox: mpsc::Receiver<String>,
    socket: TcpStream,
) {
    let (reader, writer) = socket.into_split();
    let peer = session.peer();
    let id = session.id();

    let teardown = Teardown {
        registry: server.registry().clone(),
        session: session.clone(),
    };

    let mut writer_task = tokio::spawn(write_loop(writer, outbox, session.clone()));

    let mut lines = LineReader::new(BufReader::new(reader));
    let exit = converse(&server, session, &mut lines).await;

    match &exit {
        Exit::Io(e) => debug!(session = %id, %peer, error = %e, "read failed"),
        reason => debug!(session = %id, %peer, ?reason, "session ended"),
    }

    drop(teardown);

    // The writer flushes whatever is still queued before closing the socket.
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
        debug!(session = %id, %peer, "client not reading, dropping queued lines");
        writer_task.abort();
    }
    debug!(session = %id, %peer, "disconnected");
}

async fn converse(
    server: &ServerHandle,
    session: SessionHandle,
    lines: &mut LineReader<BufReader<OwnedReadHalf>>,
) -> Exit {
    if let Err(exit) = reply(&session, protocol::NICKNAME_PROMPT) {
        return exit;
    }

    let nick = match next_line(server, &session, lines).await {
        Ok(line) => line,
        Err(exit) => return exit,
    };

    info!(session = %session.id(), peer = %session.peer(), nickname = %nick, "connected");
    server.broadcast(&protocol::joined(&nick));

    let mut ctx = ClientCtx { session, nick };

    loop {
        let line = match next_line(server, &ctx.session, lines).await {
            Ok(line) => line,
            Err(exit) => return exit,
        };

        match parse_command(&line) {
            Command::Nick(Some(new_nick)) => {
                info!(session = %ctx.session.id(), from = %ctx.nick, to = %new_nick, "renamed");
                server.broadcast(&protocol::renamed(&ctx.nick, new_nick));
                ctx.nick = new_nick.to_string();

                if let Err(exit) = reply(&ctx.session, protocol::rename_confirmed(&ctx.nick)) {
                    return exit;
                }
            }

            Command::Nick(None) => {
                if let Err(exit) = reply(&ctx.session, protocol::NO_NICKNAME) {
                    return exit;
                }
            }

            Command::Quit => {
                info!(session = %ctx.session.id(), nickname = %ctx.nick, "left");
                server.broadcast(&protocol::left(&ctx.nick));
                return Exit::Quit;
            }

            Command::Msg(text) => {
                server.broadcast(&protocol::chat(&ctx.nick, text));
            }
        }
    }
}

/// Sends a line to this client only. A full outbox drops the line, the same
/// as it does for a broadcast; only a closed session ends the loop.
fn reply<S: Into<String>>(session: &SessionHandle, line: S) -> Result<(), Exit> {
    match session.send(line) {
        Ok(()) | Err(SendError::Full) => Ok(()),
        Err(SendError::Closed) => Err(Exit::Closed),
    }
}

/// Reads the next client line, giving up early if the session or the
/// server is closed while waiting.
async fn next_line(
    server: &ServerHandle,
    session: &SessionHandle,
    lines: &mut LineReader<BufReader<OwnedReadHalf>>,
) -> Result<String, Exit> {
    tokio::select! {
        _ = server.done() => Err(Exit::Shutdown),
        _ = session.closed() => Err(Exit::Closed),
        line = lines.next_line() => match line {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(Exit::Eof),
            Err(e) => Err(Exit::Io(e)),
        },
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<String>,
    session: SessionHandle,
) {
    loop {
        tokio::select! {
            biased;
            line = outbox.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = write_line(&mut writer, &line).await {
                    debug!(session = %session.id(), error = %e, "write failed");
                    session.close();
                    break;
                }
            }
            // Only reached once the outbox has been drained.
            _ = session.closed() => break,
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
