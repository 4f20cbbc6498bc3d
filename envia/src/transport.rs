//! The public surface of the crate: the configuration structures and the [`Sender`]
//! produced by the [`create`] factory.
//!
//! The sender is a thin layer, it assembles the wire payload, makes sure the process
//! termination hook exists and forwards the bytes to its connection manager. All the
//! interesting lifecycle behavior lives in the manager, see the `client` module.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::{ConnectionManager, Destination};
use crate::shutdown;

/// Delimiter placed between the shared secret and the payload when no other value is given.
const DEFAULT_DELIMITER: &str = "::";

/// Inactivity period after which an open connection is closed. Every send re-arms the
/// timer, so only a continuous gap of this size tears the connection down.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(3000);

/// The callback invoked when a send fails. It receives the error and the original payload,
/// without the credential prefix, so the caller can decide whether to resend it.
pub type ErrorHandler = Box<dyn FnMut(&crate::Error, &str) + Send>;

/// Optional shared secret prepended to every payload.
///
/// The wire format is simply `secret`, the delimiter and then the payload, there is no
/// escaping whatsoever: if the payload itself contains the delimiter sequence the receiver
/// can not tell it apart from the credential boundary. The secret is not validated nor
/// encrypted here, it is forwarded as given.
pub struct Credentials {
    secret: String,
    delimiter: String,
}

impl Credentials {
    /// Create credentials with the given secret and the default `::` delimiter.
    pub fn new(secret: impl Into<String>) -> Self {
        Credentials {
            secret: secret.into(),
            delimiter: String::from(DEFAULT_DELIMITER),
        }
    }

    /// Replace the delimiter placed between the secret and the payload.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }
}

/// This structure holds everything required to create a [`Sender`].
///
/// At this moment a sender talks to a single destination for its whole lifetime, it could
/// be fun to extend this so one sender fans out to multiple collectors at the same time.
pub struct SenderConfiguration {
    destination: Destination,
    credentials: Option<Credentials>,
    error_handler: Option<ErrorHandler>,
    idle_timeout: Duration,
}

impl SenderConfiguration {
    /// Creates a new [`SenderConfigurationBuilder`].
    pub fn builder() -> SenderConfigurationBuilder {
        SenderConfigurationBuilder::new()
    }
}

/// A convenience builder to create the [`SenderConfiguration`] structure.
///
/// We are only validating that all required arguments are available, we are not doing any
/// verification on the values itself, for example, empty hosts or a port nothing listens
/// on. A destination that does not answer only surfaces later, through the send path.
///
/// # Example
///
/// ```
/// fn main() {
///     let configuration = envia::SenderConfiguration::builder()
///         .with_host("localhost")
///         .with_port(9999)
///         .build();
///
///     assert!(configuration.is_ok());
/// }
/// ```
///
/// # Errors
///
/// The validation is only applied when the [`SenderConfigurationBuilder::build()`] method
/// is called. It can fail if one of the required parameters is not available, the returned
/// error is a [`crate::Error`].
pub struct SenderConfigurationBuilder {
    host: Option<String>,
    port: Option<u16>,
    credentials: Option<Credentials>,
    error_handler: Option<ErrorHandler>,
    idle_timeout: Duration,
}

impl SenderConfigurationBuilder {
    fn new() -> Self {
        SenderConfigurationBuilder {
            host: None,
            port: None,
            credentials: None,
            error_handler: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Defines the host the sender will connect into.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Defines the port the sender will connect into.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Defines the credentials prepended to every payload.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replaces the default 3 second idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Defines the callback invoked when a send fails, receiving the error and the original
    /// payload. Without a handler failures are still returned by the send itself.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&crate::Error, &str) + Send + 'static,
    {
        self.error_handler = Some(Box::new(handler));
        self
    }

    /// Build the [`SenderConfiguration`] structure with the given parameters.
    ///
    /// # Errors
    ///
    /// This method will return a [`crate::Error`] if one of the required parameters is
    /// missing.
    pub fn build(self) -> crate::Result<SenderConfiguration> {
        let host = self
            .host
            .ok_or(crate::Error::MissingConfiguration(String::from(
                "Missing `host` parameter",
            )))?;
        let port = self
            .port
            .ok_or(crate::Error::MissingConfiguration(String::from(
                "Missing `port` parameter",
            )))?;

        Ok(SenderConfiguration {
            destination: Destination { host, port },
            credentials: self.credentials,
            error_handler: self.error_handler,
            idle_timeout: self.idle_timeout,
        })
    }
}

/// Create a [`Sender`] for the destination in the given configuration.
///
/// Nothing happens on the network here, the connection is only opened by the first send and
/// closed again after the idle timeout, so creating senders is cheap and can be done
/// outside a runtime.
///
/// # Example
///
/// ```
/// #[tokio::main]
/// async fn main() {
///     let configuration = envia::SenderConfiguration::builder()
///         .with_host("localhost")
///         .with_port(9999)
///         .build()
///         .unwrap();
///
///     let mut sender = envia::create(configuration);
///     // sender.send("hello").await...
/// }
/// ```
pub fn create(configuration: SenderConfiguration) -> Sender {
    Sender {
        destination: configuration.destination,
        credentials: configuration.credentials,
        error_handler: configuration.error_handler,
        idle_timeout: configuration.idle_timeout,
        client: None,
    }
}

/// This is the structure used to ship payloads to the destination it was created for.
///
/// The underlying implementation holds a single connection that is opened on the first send
/// and reused while messages keep coming, so the best approach is to create one sender and
/// keep it around instead of creating one per message.
pub struct Sender {
    destination: Destination,
    credentials: Option<Credentials>,
    error_handler: Option<ErrorHandler>,
    idle_timeout: Duration,

    // The manager is spawned lazily by the first send, spawning needs a runtime and the
    // factory can run outside one.
    client: Option<ConnectionManager>,
}

impl Sender {
    /// Send a payload to the destination, fire and forget style.
    ///
    /// The returned future resolves once the payload was flushed into the socket, which is
    /// not a delivery acknowledgment, only that the transport accepted the bytes. When
    /// credentials are configured the payload is written prefixed by the secret and the
    /// delimiter.
    ///
    /// # Errors
    ///
    /// Connection and write failures surface here as the same thing, a transport failure.
    /// The connection was already torn down when this returns an error, so the next send
    /// transparently reconnects. The failure is also reported to the error handler, when
    /// one was configured, along with the original payload without the credential prefix.
    /// The failed payload is not retried, resending is a caller decision.
    pub async fn send(&mut self, data: impl Into<String>) -> crate::Result<()> {
        let data = data.into();

        // One hook for the whole process, no matter how many senders exist.
        shutdown::register_signal_hook();

        let payload = wire_payload(&self.credentials, &data);
        let result = self.client().write(payload).await;

        if let Err(error) = &result {
            if let Some(handler) = self.error_handler.as_mut() {
                handler(error, &data);
            }
        }
        result
    }

    /// Close the connection right away instead of waiting for the idle timeout.
    ///
    /// This is idempotent, calling it twice performs a single close sequence. The sender
    /// stays usable, the next send opens a new connection.
    pub async fn destroy(&mut self) {
        if let Some(client) = &self.client {
            client.release().await;
        }
    }

    // Return the managed client, spawning the lifecycle task on the first use and replacing
    // it if a process shutdown stopped the previous one.
    fn client(&mut self) -> &ConnectionManager {
        if matches!(&self.client, Some(client) if client.is_finished()) {
            self.client = None;
        }
        self.client.get_or_insert_with(|| {
            ConnectionManager::spawn(self.destination.clone(), self.idle_timeout)
        })
    }
}

/// Compute the bytes written to the wire for the given payload.
///
/// Credentials with a non empty secret prepend the secret and the delimiter, anything else
/// leaves the payload untouched.
fn wire_payload(credentials: &Option<Credentials>, data: &str) -> Bytes {
    match credentials {
        Some(credentials) if !credentials.secret.is_empty() => {
            let mut payload = BytesMut::with_capacity(
                credentials.secret.len() + credentials.delimiter.len() + data.len(),
            );
            payload.put_slice(credentials.secret.as_bytes());
            payload.put_slice(credentials.delimiter.as_bytes());
            payload.put_slice(data.as_bytes());
            payload.freeze()
        }
        _ => Bytes::copy_from_slice(data.as_bytes()),
    }
}
