//! The connection lifecycle manager, which is the heart of the crate.
//!
//! The [`ConnectionManager`] structure is only a handle, the real work happens in a
//! background task owning the connection slot. The task is driven by a command channel and
//! decides when to create, reuse and close the underlying TCP connection:
//!
//! - a write command opens the connection when none is warm, otherwise reuses it;
//! - every write re-arms an idle deadline, so only a continuous gap of inactivity larger
//!   than the timeout closes the connection, a debounce and not a fixed interval;
//! - a write failure closes the connection right away, the next write reconnects;
//! - a release command closes the connection and leaves the task running, ready to open a
//!   new one later;
//! - the process shutdown notification closes the connection and stops the task.
//!
//! Because a single task owns the connection, every transition happens sequentially and two
//! teardowns can never overlap, there is no lock around the state. The task also stops,
//! after a last release, when every handle to the command channel is gone.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::shutdown::{self, Shutdown};
use crate::tcp_connection::TcpConnection;

// How many commands can sit in the channel before senders start waiting. Writers await the
// reply of each command, so in practice the channel never fills up.
const COMMAND_BUFFER: usize = 64;

/// The address pair the sender is bound to, immutable for its whole lifetime.
#[derive(Clone)]
pub(crate) struct Destination {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handle to the lifecycle task. Cheap to use, every operation is a message to the task.
pub(crate) struct ConnectionManager {
    commands_tx: mpsc::Sender<Command>,
}

enum Command {
    /// Write the payload, opening a connection when none is warm. The result of the write
    /// is sent back through the reply channel.
    Write {
        payload: Bytes,
        done: oneshot::Sender<crate::Result<()>>,
    },

    /// Close the connection if one is open. The reply only tells that the teardown is
    /// complete.
    Release { done: oneshot::Sender<()> },
}

/// The state owned by the lifecycle task.
struct Lifecycle {
    destination: Destination,
    idle_timeout: Duration,

    // The connection slot, at most one live connection exists at any instant.
    connection: Option<TcpConnection>,

    // The debounced expiry, re-armed every time the connection is acquired.
    idle_deadline: Instant,

    commands_rx: mpsc::Receiver<Command>,
    shutdown: Shutdown,
}

impl ConnectionManager {
    /// Spawn a new lifecycle task bound to the given destination and return its handle.
    ///
    /// No connection is opened here, the task starts idle and connects on the first write.
    pub(crate) fn spawn(destination: Destination, idle_timeout: Duration) -> ConnectionManager {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let lifecycle = Lifecycle {
            idle_deadline: Instant::now() + idle_timeout,
            destination,
            idle_timeout,
            connection: None,
            commands_rx,
            shutdown: shutdown::subscribe(),
        };
        tokio::spawn(lifecycle.run());

        ConnectionManager { commands_tx }
    }

    /// Write the payload through the managed connection.
    ///
    /// # Errors
    ///
    /// Connecting and writing failures both come back through here, there is no distinction
    /// between them. When the task is gone a [`crate::Error::ChannelClosed`] is returned.
    pub(crate) async fn write(&self, payload: Bytes) -> crate::Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.commands_tx
            .send(Command::Write { payload, done })
            .await
            .map_err(|_| crate::Error::ChannelClosed)?;
        done_rx.await.map_err(|_| crate::Error::ChannelClosed)?
    }

    /// Close the connection if one is open, waiting for the teardown to complete. Calling
    /// this with no open connection does nothing.
    pub(crate) async fn release(&self) {
        let (done, done_rx) = oneshot::channel();
        if self
            .commands_tx
            .send(Command::Release { done })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Whether the lifecycle task has stopped, which happens after the process shutdown
    /// notification. A finished manager can not be used anymore and must be replaced.
    pub(crate) fn is_finished(&self) -> bool {
        self.commands_tx.is_closed()
    }
}

impl Lifecycle {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Write { payload, done }) => {
                        let result = self.write(payload).await;
                        let _ = done.send(result);
                    }
                    Some(Command::Release { done }) => {
                        self.release().await;
                        let _ = done.send(());
                    }
                    // Every handle to the manager is gone, close whatever is open and stop.
                    None => {
                        self.release().await;
                        return;
                    }
                },
                _ = time::sleep_until(self.idle_deadline), if self.connection.is_some() => {
                    tracing::debug!(destination = %self.destination, "idle timeout expired");
                    self.release().await;
                }
                _ = self.shutdown.wait_shutdown() => {
                    self.release().await;
                    return;
                }
            }
        }
    }

    /// Write the payload to the destination, opening a connection when none is warm.
    ///
    /// On success the connection goes back into the slot to be reused by the next write. On
    /// failure it is closed and the slot stays empty, the next write starts from a clean
    /// state and reconnects. The failed payload itself is never retried.
    async fn write(&mut self, payload: Bytes) -> crate::Result<()> {
        let mut connection = self.acquire().await?;

        match connection.write(payload).await {
            Ok(()) => {
                self.connection = Some(connection);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(destination = %self.destination, "write failed: {}", error);
                connection.close().await;
                Err(error)
            }
        }
    }

    /// Take the warm connection out of the slot or open a new one, re-arming the idle
    /// deadline either way.
    ///
    /// # Errors
    ///
    /// This method can fail if a new connection is needed and it can not be established,
    /// which surfaces through the write path as any other transport failure.
    async fn acquire(&mut self) -> crate::Result<TcpConnection> {
        self.idle_deadline = Instant::now() + self.idle_timeout;

        match self.connection.take() {
            Some(connection) => Ok(connection),
            None => TcpConnection::open(&self.destination).await,
        }
    }

    /// Close the connection if one is open. Calling this twice in a row performs a single
    /// close sequence, the second call finds the slot empty and does nothing.
    async fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::debug!(destination = %self.destination, "closing connection");
            connection.close().await;
        }
    }
}
