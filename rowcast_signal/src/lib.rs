//! Module to signal phase changes in rowcast.
//!
//! Rowcast runs a long-lived emulation loop plus a handful of support tasks
//! and must coordinate exactly one phase change, shutdown, across all of
//! them. The mechanism here has two components, a `Broadcaster` and a
//! `Watcher`. The `Broadcaster` is responsible for signaling the `Watcher`
//! that the phase has been achieved. This is a one-time event and if multiple
//! phases are ever tracked multiple signal mechanisms are required. The
//! `Watcher` is responsible for waiting for the signal to be sent.
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel never carries data. It is here for its
    // closed-on-drop semantics: dropping the sender is the signal, and every
    // receiver observes it no matter when it subscribes.
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        signal_received: false,
        notify: Arc::clone(&notify),
        peer_count_decreased: false,
        registered: true,
    };

    let b = Broadcaster {
        peers,
        sender,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that a phase has been
/// achieved.
pub struct Broadcaster {
    /// The total number of peers subscribed to this `Broadcaster`. Used by this
    /// struct to understand when all `Watcher` instances have dropped off.
    peers: Arc<AtomicU32>,
    /// Transmission point for the signal to `Watcher` instances.
    sender: broadcast::Sender<()>,
    /// Allow the `Watchers` to notify `Broadcaster` that they have logged off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have ack'ed the signal.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until all peers have ack'ed the signal.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        // Wait for all peers to drop off. The loop does not consume CPU: it
        // parks until a `Watcher` signals that it has seen the transmission.
        //
        // Ordering matters: (1) register for notification, (2) check the
        // condition, (3) await. Checking before registering leaves a window
        // where a peer decrements and notifies unseen, and the wait hangs
        // forever.
        loop {
            let notified = self.notify.notified();

            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");

            notified.await;
        }
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been received and yet `register` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Mechanism to watch for phase changes, typically used to control shutdown.
pub struct Watcher {
    /// Used to track if the signal has been received without synchronization.
    signal_received: bool,
    /// Record whether the peer count of this Watcher has been decreased.
    peer_count_decreased: bool,
    /// The total number of peers subscribed to the `Broadcaster`. Used by this
    /// struct not to observe other `Watcher` instances but to inform
    /// `Broadcaster` of the existence/lack-of of this instance.
    peers: Arc<AtomicU32>,
    /// Transmission point for the signal from `Broadcaster`.
    receiver: broadcast::Receiver<()>,
    /// Allow the `Watchers` to notify `Broadcaster` that they have logged off.
    notify: Arc<Notify>,
    /// Whether the `Broadcaster` is aware of this instance's existence and will
    /// wait via `signal_and_wait` for it to terminate.
    registered: bool,
}

impl Watcher {
    /// Decrease the peer count in the `Broadcaster`, allowing the `Broadcaster`
    /// to unblock if waiting for peers. See `Broadcaster::signal_and_wait`.
    fn decrease_peer_count(&mut self) {
        if !self.registered {
            // The `Broadcaster` does not wait on unregistered instances, so
            // there is no count to maintain.
            return;
        }

        if self.peer_count_decreased {
            // The `Broadcaster` has already been told this peer is dropping
            // off. Set only by a previous call of this function.
            return;
        }

        // Not fetch_sub. That operation wraps at the zero boundary and the
        // peer count must never jump to u32::MAX.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.peer_count_decreased = true;
    }

    /// Receive the shutdown notice. This function will block if a notice has
    /// not already been sent.
    ///
    /// If `recv` is called multiple times after the signal has been received
    /// this function will return immediately.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast receiver has lagged behind, indicating a
    /// catastrophic programming error in the signal coordination system.
    pub async fn recv(mut self) {
        if self.signal_received {
            // Once the signal is received, if this function were called in a
            // `select!` it might drown out every other arm. Yield so the
            // caller's loop still makes progress.
            tokio::task::yield_now().await;
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {
                self.decrease_peer_count();
                self.signal_received = true;
            }
            Err(error::RecvError::Lagged(_)) => {
                panic!("Catastrophic programming error: lagged behind");
            }
        }
    }

    /// Check if a shutdown notice has been sent without blocking.
    ///
    /// If the signal has not been received returns Ok(false). If it has been
    /// received Ok(true). All calls after will return
    /// `TryRecvError::SignalReceived`.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` if the signal has already been
    /// received and processed by this watcher.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast receiver has lagged behind, indicating a
    /// catastrophic programming error in the signal coordination system.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        match self.receiver.try_recv() {
            Ok(()) | Err(error::TryRecvError::Closed) => {
                self.decrease_peer_count();
                self.signal_received = true;
                Ok(true)
            }
            Err(error::TryRecvError::Empty) => Ok(false),
            Err(error::TryRecvError::Lagged(_)) => {
                panic!("Catastrophic programming error: lagged behind")
            }
        }
    }

    /// Register with the `Broadcaster`, returning a new instance of `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if the signal has already been
    /// received by this watcher, preventing registration of new watchers after
    /// shutdown.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }

        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            // Do not copy existing peer count decreased state as this new peer
            // is independent.
            peer_count_decreased: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.decrease_peer_count();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            // Do not copy existing peer count decreased state as this new peer
            // is independent.
            peer_count_decreased: false,
            registered: false,
        }
    }
}
