//! Shared stop/registry machinery for the HTTP and TCP accept loops.
//!
//! Both loops need the same three things: an idempotent stop signal that can
//! interrupt a blocked `accept()`, a registry of in-flight connection tasks
//! so stop can abort them, and a cloneable handle type for callers. This is
//! implemented once here and shared by [`crate::server::accept::Server`] and
//! [`crate::tcp::TcpServer`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::{sync::watch, task::AbortHandle};

pub(crate) struct Control {
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, AbortHandle>>,
}

impl Control {
    pub(crate) fn new() -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            stop_tx,
            next_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a freshly spawned connection task, sweeping finished
    /// entries out of the registry first. If the server already stopped,
    /// aborts `handle` immediately instead of registering it, closing the
    /// race between a connection being spawned and [`stop`](Self::stop)
    /// draining the registry.
    pub(crate) fn register(&self, handle: AbortHandle) {
        let mut connections = self.connections.lock().unwrap();
        if self.stopped.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        connections.retain(|_, h| !h.is_finished());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        connections.insert(id, handle);
    }

    /// Suspends until [`stop`](Self::stop) has been called. Meant to race a
    /// blocked `accept()` in a `tokio::select!`.
    pub(crate) async fn wait_for_stop(&self) {
        let mut rx = self.stop_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent: sets the stopped flag, wakes any accept loop parked in
    /// [`wait_for_stop`](Self::wait_for_stop), and aborts every registered
    /// connection task.
    pub(crate) fn stop(&self) {
        let mut connections = self.connections.lock().unwrap();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        for (_, handle) in connections.drain() {
            handle.abort();
        }
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent_and_aborts_registered_tasks() {
        let control = Control::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        control.register(task.abort_handle());
        assert_eq!(control.live_connections(), 1);

        control.stop();
        control.stop();

        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn register_after_stop_aborts_immediately() {
        let control = Control::new();
        control.stop();

        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        control.register(task.abort_handle());

        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_stop_returns_once_stopped() {
        let control = Control::new();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_for_stop().await })
        };

        tokio::task::yield_now().await;
        control.stop();
        waiter.await.unwrap();
    }
}
