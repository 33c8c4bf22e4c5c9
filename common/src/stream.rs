//! Pair streams between the engine and user functions.
//!
//! Streams are tokio channels bounded at [`STREAM_CAPACITY`], so a producer
//! that runs ahead of its consumer is suspended instead of buffering without
//! limit. User functions only ever see the [`PairSender`] and
//! [`ValueReceiver`] halves; the engine keeps the other ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::Pair;

/// Smallest bound a tokio channel accepts.
pub const STREAM_CAPACITY: usize = 1;

/// The engine closed the stream, usually because the task is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream closed by the engine")]
pub struct StreamClosed;

/// Output half handed to a map or reduce function.
///
/// Dropping the sender closes the stream.
#[derive(Debug)]
pub struct PairSender {
    tx: mpsc::Sender<Pair>,
}

impl PairSender {
    /// Sends one pair, waiting until the engine has room for it.
    pub async fn send(&self, pair: Pair) -> Result<(), StreamClosed> {
        self.tx.send(pair).await.map_err(|_| StreamClosed)
    }

    pub async fn emit(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StreamClosed> {
        self.send(Pair::new(key, value)).await
    }
}

/// Input half handed to a reduce function: every value of one key, in merge
/// order.
#[derive(Debug)]
pub struct ValueReceiver {
    rx: mpsc::Receiver<String>,
    received: Arc<AtomicU64>,
}

impl ValueReceiver {
    /// Next value, or `None` once the engine has forwarded the whole group.
    pub async fn recv(&mut self) -> Option<String> {
        let value = self.rx.recv().await?;
        self.received.fetch_add(1, Ordering::Release);
        Some(value)
    }
}

/// Engine half of a value stream. Keeps count of the values it handed over
/// so it can tell whether the function took all of them.
#[derive(Debug)]
pub struct ValueFeed {
    tx: mpsc::Sender<String>,
    forwarded: u64,
    received: Arc<AtomicU64>,
}

/// Room for one value, see [`ValueFeed::reserve`].
pub struct ValuePermit<'a> {
    permit: mpsc::Permit<'a, String>,
    forwarded: &'a mut u64,
}

impl ValuePermit<'_> {
    pub fn send(self, value: String) {
        *self.forwarded += 1;
        self.permit.send(value);
    }
}

impl ValueFeed {
    /// Waits for room for one value. Cancel safe; fails once the function
    /// dropped its receiver.
    pub async fn reserve(&mut self) -> Result<ValuePermit<'_>, StreamClosed> {
        let permit = self.tx.reserve().await.map_err(|_| StreamClosed)?;
        Ok(ValuePermit {
            permit,
            forwarded: &mut self.forwarded,
        })
    }

    pub async fn send(&mut self, value: String) -> Result<(), StreamClosed> {
        self.reserve().await?.send(value);
        Ok(())
    }

    /// Waits until the function has taken every forwarded value or has
    /// dropped its receiver, and reports whether it took them all. Cancel
    /// safe.
    pub async fn drained(&self) -> bool {
        // Dropping the receiver closes the channel before it frees the slots
        // of unread values, so a free slot seen while still open was freed by
        // a receive.
        let idle = self.tx.capacity() == self.tx.max_capacity();
        if self.tx.is_closed() {
            return self.all_received();
        }
        if idle {
            return true;
        }
        match self.tx.reserve().await {
            Ok(_) => true,
            Err(_) => self.all_received(),
        }
    }

    fn all_received(&self) -> bool {
        self.received.load(Ordering::Acquire) >= self.forwarded
    }
}

/// Creates the output stream of one invocation.
pub fn output_stream() -> (PairSender, mpsc::Receiver<Pair>) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    (PairSender { tx }, rx)
}

/// Creates the value stream of one reduce invocation.
pub fn value_stream() -> (ValueFeed, ValueReceiver) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    let received = Arc::new(AtomicU64::new(0));
    (
        ValueFeed {
            tx,
            forwarded: 0,
            received: Arc::clone(&received),
        },
        ValueReceiver { rx, received },
    )
}
