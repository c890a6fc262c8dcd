//! Shutdown-aware waiting
//!
//! Every suspension point in the engine (slot acquisition, rate-limit waits,
//! backoff sleeps, inter-batch delays) waits through an [`Interrupt`], so a
//! shutdown request ends the wait with [`Interrupted`] instead of leaving it to
//! run out. Transport calls that are already in flight are never cancelled.

use std::{future::Future, time::Duration};

use tokio::sync::watch;

use crate::error::Interrupted;

/// Receiving side, cloned into every component that waits
#[derive(Debug, Clone)]
pub struct Interrupt {
    receiver: watch::Receiver<bool>,
}

/// Sending side, held by whoever owns the process lifecycle
#[derive(Debug)]
pub struct InterruptTrigger {
    sender: watch::Sender<bool>,
}

impl Interrupt {
    /// Create a connected trigger/interrupt pair
    #[must_use]
    pub fn new() -> (InterruptTrigger, Self) {
        let (sender, receiver) = watch::channel(false);
        (InterruptTrigger { sender }, Self { receiver })
    }

    /// An interrupt that can never fire
    #[must_use]
    pub fn never() -> Self {
        let (_trigger, interrupt) = Self::new();
        interrupt
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the trigger fires; pending forever if it never can
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }

            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless interrupted first
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the trigger fires before the sleep completes.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `future` to completion unless interrupted first
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the trigger fires first; `future` is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        if self.is_triggered() {
            return Err(Interrupted);
        }

        tokio::select! {
            biased;
            () = self.triggered() => Err(Interrupted),
            output = future => Ok(output),
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::never()
    }
}

impl InterruptTrigger {
    /// Fire the interrupt; idempotent
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// A new receiving side connected to this trigger
    #[must_use]
    pub fn subscribe(&self) -> Interrupt {
        Interrupt {
            receiver: self.sender.subscribe(),
        }
    }
}
