//! Per-connection FIFO write queue with a single drain task.
//!
//! The reference keeps a process-wide `sendQueue`/`waitEvents` mapping keyed
//! by socket handle. This crate moves both onto the connection itself: one
//! [`WriteQueue`] per accepted socket, backed by an unbounded
//! [`mpsc`](tokio::sync::mpsc) channel and a [`watch`](tokio::sync::watch)
//! channel carrying the outstanding message count, so
//! [`WriteQueue::wait_for_drain`] can subscribe and observe every change
//! since that subscription rather than relying on a waiter having already
//! registered before the drain task wakes it (a `Notify`-based version of
//! this had exactly that lost-wakeup window).

use std::{io, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{mpsc, watch},
    time::sleep,
};

/// Owns the write half of an accepted connection and serializes writes to
/// it through a single background task, preserving enqueue order.
pub(crate) struct WriteQueue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<watch::Sender<usize>>,
}

impl WriteQueue {
    /// Spawns the drain task and returns a handle for enqueuing messages.
    pub(crate) fn spawn(write_half: OwnedWriteHalf, write_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(watch::Sender::new(0usize));

        tokio::spawn(drain(receiver, write_half, write_timeout, Arc::clone(&pending)));

        Self { sender, pending }
    }

    /// Appends `bytes` to the queue. Never blocks the caller; if the drain
    /// task has already stopped (the socket closed), the message is simply
    /// dropped, matching "if socket is not open, drop" in the queue's
    /// contract.
    pub(crate) fn enqueue(&self, bytes: Vec<u8>) {
        self.pending.send_modify(|n| *n += 1);
        if self.sender.send(bytes).is_err() {
            self.pending.send_modify(|n| *n -= 1);
        }
    }

    /// Suspends until every message enqueued so far has been written (or the
    /// drain task has given up because the socket closed).
    pub(crate) async fn wait_for_drain(&self) {
        let mut rx = self.pending.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn drain(
    mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    mut write_half: OwnedWriteHalf,
    write_timeout: Duration,
    pending: Arc<watch::Sender<usize>>,
) {
    while let Some(bytes) = receiver.recv().await {
        if write_all_with_timeout(&mut write_half, &bytes, write_timeout)
            .await
            .is_err()
        {
            pending.send_modify(|n| *n = 0);
            return;
        }

        pending.send_modify(|n| *n -= 1);
    }
}

async fn write_all_with_timeout(
    write_half: &mut OwnedWriteHalf,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(), io::Error> {
    let mut offset = 0;
    while offset < bytes.len() {
        let written = tokio::select! {
            biased;
            result = write_half.write(&bytes[offset..]) => result?,
            _ = sleep(timeout) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
        };

        if written == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        offset += written;
    }
    Ok(())
}
