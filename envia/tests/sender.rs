use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// What the test server observed on its side of the wire.
#[derive(Debug, PartialEq)]
enum Event {
    Opened,
    Data(String),
    Closed,
}

/// Stand up a listener on a random port, pushing everything that happens to it through the
/// returned channel: one `Opened` per accepted connection, the received chunks as `Data`
/// and one `Closed` when the peer goes away. Chunk boundaries are whatever the socket
/// returns, tests that care about the complete payload must concatenate.
async fn create_server() -> (u16, mpsc::Receiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local address").port();
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(..) => return,
            };
            let events = events_tx.clone();

            tokio::spawn(async move {
                let _ = events.send(Event::Opened).await;
                let mut buffer = vec![0u8; 8 * 1024];
                loop {
                    match socket.read(&mut buffer).await {
                        Ok(0) | Err(..) => break,
                        Ok(n) => {
                            let data = String::from_utf8_lossy(&buffer[..n]).to_string();
                            let _ = events.send(Event::Data(data)).await;
                        }
                    }
                }
                let _ = events.send(Event::Closed).await;
            });
        }
    });

    (port, events_rx)
}

async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
    let event = timeout(Duration::from_secs(5), events.recv()).await;
    assert!(event.is_ok(), "timed out waiting for a server event");
    event.unwrap().expect("the server went away")
}

fn sender_for(port: u16, idle_timeout: Duration) -> envia::Sender {
    let configuration = envia::SenderConfiguration::builder()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_idle_timeout(idle_timeout)
        .build()
        .expect("configuration");
    envia::create(configuration)
}

/// The complete lifecycle in one scenario: the first send opens a connection, a gap larger
/// than the idle timeout closes it automatically and the next send opens a fresh one.
#[tokio::test]
async fn idle_connection_closes_and_next_send_reconnects() {
    let (port, mut events) = create_server().await;
    let mut sender = sender_for(port, Duration::from_millis(300));

    assert!(sender.send("hello").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("hello")));

    // No sends from here on, the connection must go away on its own.
    assert_eq!(next_event(&mut events).await, Event::Closed);

    assert!(sender.send("world").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("world")));
}

/// Sends spaced under the idle timeout must ride a single connection, the timer is re-armed
/// on every send and only a continuous gap closes it.
#[tokio::test]
async fn consecutive_sends_reuse_the_connection() {
    let (port, mut events) = create_server().await;
    let mut sender = sender_for(port, Duration::from_millis(700));

    for i in 0..5 {
        assert!(sender.send(format!("message-{}", i)).await.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(next_event(&mut events).await, Event::Opened);

    // Everything until the idle close must arrive as data on that same connection, a second
    // `Opened` here would mean the debounce did not hold.
    let mut received = String::new();
    loop {
        match next_event(&mut events).await {
            Event::Data(data) => received.push_str(&data),
            Event::Closed => break,
            Event::Opened => panic!("a second connection was opened"),
        }
    }
    assert_eq!(
        received,
        "message-0message-1message-2message-3message-4"
    );
}

/// The wire payload is the secret, the delimiter and the data, nothing else. The receiver
/// side is the only place where this can be verified for real.
#[tokio::test]
async fn credentials_are_prefixed_on_the_wire() {
    let (port, mut events) = create_server().await;
    let configuration = envia::SenderConfiguration::builder()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_credentials(envia::Credentials::new("abc"))
        .build()
        .expect("configuration");
    let mut sender = envia::create(configuration);

    assert!(sender.send("msg").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("abc::msg")));
}

/// A destination that refuses the connection must surface through the error handler,
/// exactly once and with the original payload, not the prefixed one.
#[tokio::test]
async fn error_handler_receives_the_original_payload() {
    // Grab a port that refuses connections by binding and dropping a listener.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local address").port();
    drop(listener);

    let (calls_tx, mut calls_rx) = mpsc::channel(4);
    let configuration = envia::SenderConfiguration::builder()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_credentials(envia::Credentials::new("abc"))
        .on_error(move |error, data| {
            let _ = calls_tx.try_send((error.to_string(), String::from(data)));
        })
        .build()
        .expect("configuration");
    let mut sender = envia::create(configuration);

    assert!(sender.send("msg").await.is_err());

    // The handler runs inside the failed send, so the call is already there.
    let (error, data) = calls_rx.try_recv().expect("the handler must have run");
    assert_eq!(data, "msg");
    assert!(!error.is_empty());
    assert!(calls_rx.try_recv().is_err(), "the handler must run exactly once");
}

/// A connection reset under an open sender fails the next send, tears the connection down
/// and the send after that transparently reconnects.
#[tokio::test]
async fn send_reconnects_after_a_write_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local address").port();
    let (data_tx, mut data_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        // First connection: read the payload so the client is known to be warm, then reset
        // the socket under it. Lingering for zero turns the close into a hard RST.
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buffer = vec![0u8; 1024];
        let _ = socket.read(&mut buffer).await.expect("first payload");
        socket.set_linger(Some(Duration::ZERO)).expect("linger");
        drop(socket);

        // Second connection: behave and hand the payload over.
        let (mut socket, _) = listener.accept().await.expect("accept again");
        loop {
            match socket.read(&mut buffer).await {
                Ok(0) | Err(..) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buffer[..n]).to_string();
                    let _ = data_tx.send(data).await;
                }
            }
        }
    });

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let configuration = envia::SenderConfiguration::builder()
        .with_host("127.0.0.1")
        .with_port(port)
        .on_error(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("configuration");
    let mut sender = envia::create(configuration);

    assert!(sender.send("first").await.is_ok());

    // Give the reset time to reach our side of the wire, the write after it must fail.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sender.send("doomed").await.is_err());
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    assert!(sender.send("recovered").await.is_ok());
    let data = timeout(Duration::from_secs(5), data_rx.recv())
        .await
        .expect("timed out waiting for the reconnected payload")
        .expect("the server went away");
    assert_eq!(data, "recovered");
}

/// Destroying twice performs a single close sequence, and a destroyed sender is not dead:
/// the next send opens a new connection.
#[tokio::test]
async fn destroy_is_idempotent() {
    let (port, mut events) = create_server().await;
    let mut sender = sender_for(port, Duration::from_secs(3));

    assert!(sender.send("hello").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("hello")));

    sender.destroy().await;
    sender.destroy().await;
    assert_eq!(next_event(&mut events).await, Event::Closed);

    assert!(sender.send("again").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("again")));
}

/// Destroying a sender that never sent anything must not blow up nor open anything.
#[tokio::test]
async fn destroy_before_any_send_is_a_noop() {
    let (port, mut events) = create_server().await;
    let mut sender = sender_for(port, Duration::from_secs(3));

    sender.destroy().await;
    sender.destroy().await;

    assert!(sender.send("late").await.is_ok());
    assert_eq!(next_event(&mut events).await, Event::Opened);
    assert_eq!(next_event(&mut events).await, Event::Data(String::from("late")));
}
