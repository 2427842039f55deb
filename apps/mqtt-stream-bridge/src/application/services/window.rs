//! Window Aggregator
//!
//! Groups a session's queued messages into batches. Without a window every
//! message is its own batch. With a window the first message of a batch
//! starts a timer and everything that arrives before it fires is flushed
//! together.
//!
//! Buffered messages and the pending deadline live in the aggregator, so
//! dropping a [`WindowAggregator::next_batch`] future (for example when it
//! loses a `select!` against cancellation) loses nothing.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domain::streaming::TimedMessage;

/// Batches messages from one session queue.
#[derive(Debug)]
pub struct WindowAggregator {
    rx: mpsc::Receiver<TimedMessage>,
    window: Option<Duration>,
    pending: Vec<TimedMessage>,
    deadline: Option<Instant>,
    closed: bool,
}

impl WindowAggregator {
    /// Create an aggregator. `None` means pass-through.
    #[must_use]
    pub const fn new(rx: mpsc::Receiver<TimedMessage>, window: Option<Duration>) -> Self {
        Self {
            rx,
            window,
            pending: Vec::new(),
            deadline: None,
            closed: false,
        }
    }

    /// Whether messages are batched by time.
    #[must_use]
    pub const fn is_windowed(&self) -> bool {
        self.window.is_some()
    }

    /// Number of messages waiting for the current window to close.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the next non-empty batch.
    ///
    /// Returns `None` once the queue is closed and everything buffered has
    /// been handed out. Cancel safe.
    pub async fn next_batch(&mut self) -> Option<Vec<TimedMessage>> {
        let Some(window) = self.window else {
            return self.rx.recv().await.map(|message| vec![message]);
        };

        loop {
            if self.closed {
                return self.take_pending();
            }

            match self.deadline {
                None => match self.rx.recv().await {
                    Some(message) => {
                        self.deadline = Some(Instant::now() + window);
                        self.pending.push(message);
                    }
                    None => self.closed = true,
                },
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        () = tokio::time::sleep_until(deadline) => {
                            return self.take_pending();
                        }
                        received = self.rx.recv() => match received {
                            Some(message) => self.pending.push(message),
                            None => self.closed = true,
                        },
                    }
                }
            }
        }
    }

    /// Discard buffered messages and stop accepting new ones.
    pub fn close(&mut self) {
        self.rx.close();
        self.pending.clear();
        self.deadline = None;
    }

    fn take_pending(&mut self) -> Option<Vec<TimedMessage>> {
        self.deadline = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}
