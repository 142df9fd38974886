//! Bounded single-producer/single-consumer queue of batches.
//!
//! The hand-off between adjacent stages. `push` suspends when the queue is
//! full — this is the backpressure mechanism: a slow sink throttles the whole
//! chain. End-of-stream is an explicit marker sent only on clean completion;
//! a producer that disappears without it never reads as a clean finish
//! downstream. All blocking operations race the run's cancellation token and
//! unblock with `Cancelled` the moment it flips.

use flowline_types::Batch;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum Envelope<T> {
    Batch(Batch<T>),
    End,
}

/// Outcome of a [`BatchReceiver::pop`].
#[derive(Debug)]
pub enum Pop<T> {
    /// A batch, in the exact order it was pushed.
    Batch(Batch<T>),
    /// No further data will arrive. Idempotent: every later `pop` returns
    /// this again without blocking.
    EndOfStream,
    /// The run was cancelled, or the producer vanished without sending
    /// end-of-stream.
    Cancelled,
}

/// Error from a [`BatchSender`] operation.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The run's cancellation token flipped while waiting for capacity.
    #[error("queue cancelled")]
    Cancelled,
    /// The consumer dropped its receiver.
    #[error("queue consumer disconnected")]
    Disconnected,
}

/// Producer half of a bounded batch queue.
pub struct BatchSender<T> {
    tx: mpsc::Sender<Envelope<T>>,
    cancel: CancellationToken,
}

/// Consumer half of a bounded batch queue.
pub struct BatchReceiver<T> {
    rx: mpsc::Receiver<Envelope<T>>,
    cancel: CancellationToken,
    ended: bool,
}

/// Create a bounded queue with the given capacity (in batches).
///
/// Capacity must be at least 1; config validation enforces this before any
/// queue is allocated.
pub fn bounded<T>(
    capacity: usize,
    cancel: CancellationToken,
) -> (BatchSender<T>, BatchReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        BatchSender {
            tx,
            cancel: cancel.clone(),
        },
        BatchReceiver {
            rx,
            cancel,
            ended: false,
        },
    )
}

impl<T> BatchSender<T> {
    /// Push a batch, waiting for capacity if the queue is full.
    pub async fn push(&self, batch: Batch<T>) -> Result<(), PushError> {
        self.send(Envelope::Batch(batch)).await
    }

    /// Send the end-of-stream marker. Call exactly once, on clean completion
    /// only: a failed stage must not forward it.
    pub async fn push_end(&self) -> Result<(), PushError> {
        self.send(Envelope::End).await
    }

    async fn send(&self, envelope: Envelope<T>) -> Result<(), PushError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(envelope) => sent.map_err(|_| PushError::Disconnected),
        }
    }
}

impl<T> BatchReceiver<T> {
    /// Pop the next batch, waiting when the queue is empty.
    pub async fn pop(&mut self) -> Pop<T> {
        if self.ended {
            return Pop::EndOfStream;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Pop::Cancelled,
            msg = self.rx.recv() => match msg {
                Some(Envelope::Batch(batch)) => Pop::Batch(batch),
                Some(Envelope::End) => {
                    self.ended = true;
                    Pop::EndOfStream
                }
                // Producer dropped without the marker: not a clean finish.
                None => Pop::Cancelled,
            },
        }
    }
}
