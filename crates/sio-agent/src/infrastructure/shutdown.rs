//! Graceful-shutdown signalling.
//!
//! A [`ShutdownTrigger`] / [`Shutdown`] pair wraps a `watch` channel.  The
//! relay selects on [`Shutdown::triggered`] next to its I/O, so a stop
//! request interrupts a blocked accept, a blocked read, or the pause
//! between serial reopen attempts.  SIGINT and SIGTERM fire the trigger.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

/// Fires the stop request.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observes the stop request.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Creates a connected trigger and observer.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    /// Requests a stop.  Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested.
    ///
    /// Also resolves if every trigger has been dropped, since nobody is
    /// left to request a stop.
    pub async fn triggered(&mut self) {
        // wait_for only errs when the sender is gone.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleeps for `delay`.  Returns `false` if a stop cut the sleep short.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.triggered() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Spawns a task that fires `trigger` on SIGINT or SIGTERM.
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            v = interrupt.recv() => v.map(|_| "SIGINT"),
            v = terminate.recv() => v.map(|_| "SIGTERM"),
        };
        match name {
            Some(name) => info!("{name} received; shutting down"),
            None => error!("signal stream closed; shutting down"),
        }
        trigger.trigger();
    });
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
