use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{self, TcpSocket, TcpStream};

use crate::client::Destination;

/// Represent a single outbound TCP connection.
///
/// This is a write only wrapper, the protocol expects no response from the peer so there is
/// no reading counterpart. The structure takes ownership over the [`TcpStream`] and exposes
/// only what the connection manager needs: write a payload and close.
pub(crate) struct TcpConnection {
    // The underlying socket itself, it is wrapped around a buffer. This avoids executing too
    // many syscalls, although that would not be a problem in our case where we write the
    // complete payload to the stream and flush it.
    stream: BufWriter<TcpStream>,
}

impl TcpConnection {
    /// Open a new connection against the given destination.
    ///
    /// The destination host is resolved first and the first resolved address is used. Keep
    /// alive is enabled on the socket before connecting, the whole point of the crate is to
    /// hold the connection open between bursts of messages.
    ///
    /// # Errors
    ///
    /// This method can fail if the host does not resolve to any address or if the connection
    /// can not be established with the destination.
    pub(crate) async fn open(destination: &Destination) -> crate::Result<TcpConnection> {
        let mut addresses =
            net::lookup_host((destination.host.as_str(), destination.port)).await?;
        let address = addresses
            .next()
            .ok_or_else(|| crate::Error::UnresolvedDestination(destination.to_string()))?;

        let socket = match address {
            SocketAddr::V4(..) => TcpSocket::new_v4()?,
            SocketAddr::V6(..) => TcpSocket::new_v6()?,
        };
        socket.set_keepalive(true)?;

        let stream = socket.connect(address).await?;
        tracing::debug!(%address, "connection established");

        Ok(TcpConnection {
            stream: BufWriter::new(stream),
        })
    }

    /// Write the complete payload into the stream and flush it.
    ///
    /// # Errors
    ///
    /// This can fail for any I/O error that can happen either while writing or flushing the
    /// payload.
    pub(crate) async fn write(&mut self, payload: Bytes) -> crate::Result<()> {
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Gracefully close the connection, flushing anything still buffered.
    ///
    /// Errors are only logged here, when we reach this point the connection is being
    /// discarded and there is nothing useful left to do with a failure.
    pub(crate) async fn close(mut self) {
        if let Err(error) = self.stream.shutdown().await {
            tracing::debug!("error while closing connection: {}", error);
        }
    }
}
