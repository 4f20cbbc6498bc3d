//! Process wide shutdown handling.
//!
//! Every connection manager subscribes here so connections still open can be closed before
//! the process goes away. A single coordinator is created lazily for the complete process
//! lifetime, holding the two halves of the pattern: a broadcast channel to notify the
//! subscribers and an mpsc channel used only for completion, every subscriber holds a clone
//! of the sender side and never writes to it. When the last clone is dropped the receiver
//! knows that every subscriber finished its teardown, which is the same trick the mini-redis
//! server uses to wait for its handlers.
//!
//! The shutdown can be triggered in two ways. Through the public [`shutdown`] function,
//! meant to be invoked by the top level teardown sequence of the owning process, or through
//! the ctrl-c hook, which is registered a single time for the whole process on the first
//! message sent by any sender. Both paths end in the same routine and only the first
//! invocation performs the wait, later calls return right away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::signal;
use tokio::sync::{broadcast, mpsc};

/// The process wide shutdown state. The two `Option`s are taken by the first [`shutdown`]
/// call, which is how later calls know there is nothing left to wait for.
struct Coordinator {
    // Notifies every subscriber that the process is going away.
    notify: broadcast::Sender<()>,

    // Cloned into every subscription, dropped by the first `shutdown` call.
    complete_tx: Mutex<Option<mpsc::Sender<()>>>,

    // Consumed by the first `shutdown` call to wait for the subscribers.
    complete_rx: Mutex<Option<mpsc::Receiver<()>>>,

    // Whether the ctrl-c hook was already registered.
    hooked: AtomicBool,
}

static COORDINATOR: OnceLock<Coordinator> = OnceLock::new();

fn coordinator() -> &'static Coordinator {
    COORDINATOR.get_or_init(|| {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Coordinator {
            notify,
            complete_tx: Mutex::new(Some(complete_tx)),
            complete_rx: Mutex::new(Some(complete_rx)),
            hooked: AtomicBool::new(false),
        }
    })
}

/// Tells whether the process is shutting down.
///
/// This structure wraps the receiving side of the notification channel, after a value is
/// received the owner should tear itself down. It also carries the completion guard: when
/// the structure is dropped the coordinator counts its owner as done.
pub(crate) struct Shutdown {
    // Identify if the shutdown signal was received.
    shutdown: bool,

    // Channel to receive the shutdown notification.
    rx: broadcast::Receiver<()>,

    // Held only so the drop is observed by the coordinator. Subscriptions created after the
    // shutdown already ran carry no guard, there is nothing left to coordinate with.
    _complete: Option<mpsc::Sender<()>>,
}

impl Shutdown {
    fn new(rx: broadcast::Receiver<()>, complete: Option<mpsc::Sender<()>>) -> Self {
        Shutdown {
            shutdown: false,
            rx,
            _complete: complete,
        }
    }

    /// Verify if it was shutdown.
    pub(crate) fn is_shut(&self) -> bool {
        self.shutdown
    }

    /// Wait for the shutdown notification, this can only happen through the channel.
    pub(crate) async fn wait_shutdown(&mut self) {
        if self.shutdown {
            return;
        }

        // Does not matter what is the result, only that a result has happened at all.
        let _ = self.rx.recv().await;
        self.shutdown = true;
    }
}

/// Create a new subscription to the process shutdown.
pub(crate) fn subscribe() -> Shutdown {
    let coordinator = coordinator();
    let complete = coordinator
        .complete_tx
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Shutdown::new(coordinator.notify.subscribe(), complete)
}

/// Register the process termination hook, a single time for the process lifetime no matter
/// how many senders exist. The hook waits for ctrl-c and runs the [`shutdown`] routine.
pub(crate) fn register_signal_hook() {
    let coordinator = coordinator();
    if coordinator.hooked.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async {
        if signal::ctrl_c().await.is_ok() {
            tracing::debug!("termination signal received");
            shutdown().await;
        }
    });
}

/// Close every open connection before the process goes away.
///
/// The first call notifies every connection manager and waits until all of them finished
/// closing, later calls return right away. This is the explicit counterpart of the ctrl-c
/// hook, meant to be awaited by the top level teardown sequence of the owning process.
/// Senders created after this ran keep working, they simply are not enrolled in a shutdown
/// that already happened.
pub async fn shutdown() {
    let coordinator = coordinator();
    let _ = coordinator.notify.send(());

    // Dropping our own sender half leaves the subscribers as the only owners, so the recv
    // bellow returns `None` exactly when the last one finished its teardown.
    let complete_tx = coordinator
        .complete_tx
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let complete_rx = coordinator
        .complete_rx
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    drop(complete_tx);

    if let Some(mut complete_rx) = complete_rx {
        while complete_rx.recv().await.is_some() {}
        tracing::debug!("every connection closed");
    }
}
