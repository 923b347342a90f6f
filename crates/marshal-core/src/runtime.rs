//! Cooperative shutdown for the long-running component loops.
//!
//! Each loop owns a `Shutdown` receiver and selects on it alongside its
//! ticker; an in-flight item finishes before the loop exits. The handle side
//! lives with whoever spawned the loop (the CLI's signal handler).

use tokio::sync::watch;

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Cancellation-safe for use in
    /// `tokio::select!`.
    pub async fn triggered(&mut self) {
        // An error means the handle was dropped, which we treat as shutdown.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let (handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move {
            shutdown.triggered().await;
        });
        handle.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_shutdown() {
        let (handle, mut shutdown) = shutdown_channel();
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .expect("drop should resolve waiters");
    }

    #[tokio::test]
    async fn triggered_resolves_immediately_when_already_set() {
        let (handle, mut shutdown) = shutdown_channel();
        handle.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("already-triggered shutdown must not block");
        assert!(shutdown.is_triggered());
    }
}
