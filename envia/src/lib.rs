//! A minimal crate that offers a fire-and-forget TCP sender.
//!
//! The main purpose of this project is to abstract all the connection handling and offer a
//! high level send primitive to be used by other projects, the kind of thing needed when
//! shipping log lines or metrics to a collector. Here we are looking forward to offer a
//! simple "create once, send many" API, nothing too fancy: no delivery acknowledgment, no
//! retries and no queuing of messages while disconnected. If a payload is lost the caller
//! decides whether it is worth resending.
//!
//! We are following a simple architecture to handle the connection lifecycle. The diagram
//! bellow is a high level view of how the project is organized.
//!
//! ```text
//!             +------------+                  +---------------------+
//!             |            |                  |                     |
//!             |   Sender   +------Write------>|  ConnectionManager  |
//!             |            |                  |                     |
//!             +------------+                  +----+-----------+----+
//!                                                  |           ^
//!                                          (open/reuse/close)  |
//!                                                  |         Notify
//!                                                  v           |
//!                                       +-------------------+  |
//!                                       |                   |  |
//!                                       |   TcpConnection   |  |
//!                                       |                   |  |
//!                                       +-------------------+  |
//!                                                              |
//!                                                    +---------+--------+
//!                                                    |     Shutdown     |
//!                                                    +------------------+
//! ```
//!
//! The only exposed part of the project is the [`crate::Sender`] structure, created through
//! the [`crate::create`] factory. Each sender is bound to a single destination and owns its
//! own connection manager, a background task that opens the connection on the first send,
//! reuses it while messages keep coming and closes it after a continuous gap of inactivity.
//! A write failure also tears the connection down, so the next send starts from a clean
//! state and transparently reconnects.
//!
//! The process shutdown is handled in a dedicated module, every connection manager
//! subscribes to a process wide notification so any connection still open is closed before
//! the process goes away, either through the [`crate::shutdown()`] routine or through the
//! ctrl-c hook that is registered a single time.
//!
//! Since we are in the asynchronous world, we will use [`tokio`] all around, along with the
//! [`bytes`] crate to assemble the wire payloads.

pub use crate::shutdown::shutdown;
pub use crate::transport::create;
pub use crate::transport::Credentials;
pub use crate::transport::ErrorHandler;
pub use crate::transport::Sender;
pub use crate::transport::SenderConfiguration;
pub use crate::transport::SenderConfigurationBuilder;

mod client;
mod shutdown;
mod tcp_connection;
mod transport;

use thiserror::Error;

/// The possible errors that can occur when using the current library.
///
/// There is on purpose a single interesting variant: a transport failure. We do not tell
/// apart "could not connect" from "connection dropped mid write", both surface as the same
/// I/O error from a send and both leave the manager disconnected, ready to reconnect on the
/// next send. The remaining variants only exist for the edges of the API.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred, either while connecting or while writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The destination host resolved to no address at all.
    #[error("destination {0} did not resolve to any address")]
    UnresolvedDestination(String),

    /// The channel to the connection manager task is broken.
    #[error("the connection manager is not running")]
    ChannelClosed,

    /// A required configuration parameter is missing. The description carried along tells
    /// which one.
    #[error("{0}")]
    MissingConfiguration(String),
}

/// A convenience type that will be used in all operations for the current library.
pub type Result<T> = std::result::Result<T, Error>;
