//! Silo-wide scheduling state shared by all activation pumps.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared state of the silo's two logical work pools.
///
/// Activation pumps run as cooperative tasks on the silo's local executor;
/// this struct carries the cross-cutting controls: the "application turns
/// stopped" switch, the shutdown signal, and the count of live pumps that
/// drain-mode waits on.
pub struct SiloScheduler {
    application_stopped: Cell<bool>,
    shutdown: watch::Sender<bool>,
    active_pumps: Cell<usize>,
}

impl SiloScheduler {
    pub fn new() -> Rc<Self> {
        let (shutdown, _) = watch::channel(false);
        Rc::new(Self {
            application_stopped: Cell::new(false),
            shutdown,
            active_pumps: Cell::new(0),
        })
    }

    /// Stop application turns silo-wide; system items keep flowing.
    pub fn stop_application_turns(&self) {
        tracing::info!("application turns stopped");
        self.application_stopped.set(true);
    }

    pub fn is_application_stopped(&self) -> bool {
        self.application_stopped.get()
    }

    /// Signal every pump to finish its current turn and drain.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver pumps select on to observe shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Register a pump; the guard decrements on drop.
    pub fn register_pump(self: &Rc<Self>) -> PumpGuard {
        self.active_pumps.set(self.active_pumps.get() + 1);
        PumpGuard {
            scheduler: self.clone(),
        }
    }

    pub fn active_pumps(&self) -> usize {
        self.active_pumps.get()
    }

    /// Wait until all pumps exited or the timeout elapses.
    ///
    /// Returns `true` on a clean drain.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_pumps.get() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.active_pumps.get(),
                    "drain timed out with pumps still running"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

/// Decrements the live-pump count when a pump task exits.
pub struct PumpGuard {
    scheduler: Rc<SiloScheduler>,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        let remaining = self.scheduler.active_pumps.get().saturating_sub(1);
        self.scheduler.active_pumps.set(remaining);
    }
}
