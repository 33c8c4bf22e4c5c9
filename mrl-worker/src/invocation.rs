//! One running call of a user map or reduce function.
//!
//! An [`Invocation`] owns the spawned task and the engine's end of its
//! output stream. The engine drains the output into a [`PairSink`] and then
//! joins the task, so a function is known to have returned before the next
//! one is started.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::store::PairSink;
use common::{Pair, Phase, TaskError};

/// Why an invocation's deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Cancelled,
    TimedOut(Duration),
}

/// Cancellation token plus an optional point in time after which the
/// invocation is given up.
#[derive(Debug, Clone)]
pub(crate) struct Deadline {
    cancel: CancellationToken,
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    pub(crate) fn start(cancel: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel: cancel.clone(),
            at: timeout.map(|limit| (Instant::now() + limit, limit)),
        }
    }

    /// Resolves once the task is cancelled or the time is up.
    pub(crate) async fn expired(&self) -> Expiry {
        match self.at {
            Some((at, limit)) => tokio::select! {
                _ = self.cancel.cancelled() => Expiry::Cancelled,
                _ = tokio::time::sleep_until(at) => Expiry::TimedOut(limit),
            },
            None => {
                self.cancel.cancelled().await;
                Expiry::Cancelled
            }
        }
    }
}

pub(crate) struct Invocation {
    pub(crate) phase: Phase,
    pub(crate) key: String,
    pub(crate) output: mpsc::Receiver<Pair>,
    pub(crate) output_open: bool,
    pub(crate) deadline: Deadline,
    pub(crate) emitted: u64,
    handle: JoinHandle<anyhow::Result<()>>,
    joined: bool,
}

impl Invocation {
    pub(crate) fn spawn<F>(
        phase: Phase,
        key: String,
        output: mpsc::Receiver<Pair>,
        deadline: Deadline,
        call: F,
    ) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            phase,
            key,
            output,
            output_open: true,
            deadline,
            emitted: 0,
            handle: tokio::spawn(call),
            joined: false,
        }
    }

    pub(crate) fn expired(&self, expiry: Expiry) -> TaskError {
        match expiry {
            Expiry::Cancelled => TaskError::Cancelled,
            Expiry::TimedOut(limit) => TaskError::Timeout {
                phase: self.phase,
                key: self.key.clone(),
                limit,
            },
        }
    }

    /// Handles one result of `output.recv()`: persists a pair, or notes that
    /// the function closed its output.
    pub(crate) async fn accept(
        &mut self,
        pair: Option<Pair>,
        sink: &mut dyn PairSink,
    ) -> Result<(), TaskError> {
        match pair {
            Some(pair) => {
                sink.insert(pair).await?;
                self.emitted += 1;
            }
            None => self.output_open = false,
        }
        Ok(())
    }

    /// Drains the remaining output into `sink`, waits for the function to
    /// return, and reports how many pairs it emitted in total.
    ///
    /// On any failure the invocation is abandoned before the error is
    /// returned.
    pub(crate) async fn complete(mut self, sink: &mut dyn PairSink) -> Result<u64, TaskError> {
        if let Err(err) = self.drain(sink).await {
            self.abandon().await;
            return Err(err);
        }
        self.join().await?;
        Ok(self.emitted)
    }

    async fn drain(&mut self, sink: &mut dyn PairSink) -> Result<(), TaskError> {
        while self.output_open {
            tokio::select! {
                expiry = self.deadline.expired() => return Err(self.expired(expiry)),
                pair = self.output.recv() => self.accept(pair, sink).await?,
            }
        }
        Ok(())
    }

    /// Waits for the spawned function and classifies its result.
    async fn join(&mut self) -> Result<(), TaskError> {
        let joined = tokio::select! {
            expiry = self.deadline.expired() => {
                self.stop().await;
                return Err(self.expired(expiry));
            }
            joined = &mut self.handle => joined,
        };
        self.joined = true;

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TaskError::from_function(self.phase, &self.key, err)),
            Err(err) if err.is_panic() => Err(TaskError::Function {
                phase: self.phase,
                key: self.key.clone(),
                source: anyhow!("function panicked"),
            }),
            Err(_) => Err(TaskError::Cancelled),
        }
    }

    /// The function stopped taking input before the engine was done with
    /// it. Returns the function's own error if it had one.
    pub(crate) async fn rejected(&mut self) -> TaskError {
        // Let it finish so its own error (if any) can be reported; whatever
        // it still emits is thrown away.
        while self.output_open {
            tokio::select! {
                expiry = self.deadline.expired() => {
                    self.discard_output();
                    self.stop().await;
                    return self.expired(expiry);
                }
                pair = self.output.recv() => {
                    if pair.is_none() {
                        self.output_open = false;
                    }
                }
            }
        }

        match self.join().await {
            Err(err) => err,
            Ok(()) => TaskError::Protocol {
                phase: self.phase,
                key: self.key.clone(),
                message: "function returned before consuming every value".into(),
            },
        }
    }

    /// Closes the output from the engine side, throws away whatever is
    /// still buffered, and stops the function.
    pub(crate) async fn abandon(mut self) {
        if self.joined {
            return;
        }
        warn!("abandoning {} invocation for key {:?}", self.phase, self.key);
        self.discard_output();
        self.stop().await;
    }

    fn discard_output(&mut self) {
        self.output.close();
        while self.output.try_recv().is_ok() {}
        self.output_open = false;
    }

    async fn stop(&mut self) {
        self.handle.abort();
        // Join even an aborted task so it is gone before the engine moves on.
        let _ = (&mut self.handle).await;
        self.joined = true;
        debug!("stopped {} invocation for key {:?}", self.phase, self.key);
    }
}
