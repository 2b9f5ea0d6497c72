//! Shutdown coordination between the accept loop and connection handlers
//!
//! The server owns a watch channel carrying its [`Lifecycle`]. Stopping
//! only closes the accept loop. Cancelling additionally tells every handler
//! to abandon its current read or write and run its cleanup.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Running,
    /// No new connections; existing handlers drain on their own.
    Stopping,
    /// Handlers unwind and close.
    Cancelling,
}

/// Control side, cheap to clone and hand to a signal task
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Lifecycle>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Lifecycle::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Stops accepting connections without touching in-flight handlers.
    pub fn stop(&self) {
        self.advance(Lifecycle::Stopping);
    }

    /// Stops accepting and cancels every handler.
    pub fn cancel(&self) {
        self.advance(Lifecycle::Cancelling);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    // Lifecycle only moves forward.
    fn advance(&self, next: Lifecycle) {
        self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side held by the accept loop and each handler
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Lifecycle>,
}

impl ShutdownSignal {
    /// Resolves once the server stops accepting.
    pub async fn stopped(&mut self) {
        self.reached(Lifecycle::Stopping).await
    }

    /// Resolves once handlers are told to unwind.
    pub async fn cancelled(&mut self) {
        self.reached(Lifecycle::Cancelling).await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() >= Lifecycle::Cancelling
    }

    async fn reached(&mut self, target: Lifecycle) {
        loop {
            if *self.rx.borrow_and_update() >= target {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Controller gone, nothing can ever signal us.
                std::future::pending::<()>().await;
            }
        }
    }
}
