//! Frame Sender Port (Driven Port)
//!
//! Where a stream session pushes the frames it builds.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::streaming::Frame;

/// Frame emission error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The receiving side has gone away.
    #[error("frame receiver closed")]
    Closed,

    /// The host refused the frame.
    #[error("frame rejected: {message}")]
    Rejected {
        /// Error details.
        message: String,
    },
}

/// Port for pushing frames to the host.
#[async_trait]
pub trait FrameSender: Send + Sync {
    /// Send one frame.
    async fn send_frame(&self, frame: Frame) -> Result<(), SendError>;
}

/// Frame sender backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelFrameSender {
    tx: mpsc::Sender<Frame>,
}

impl ChannelFrameSender {
    /// Create a sender and the receiver the host reads from.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSender for ChannelFrameSender {
    async fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.send(frame).await.map_err(|_| SendError::Closed)
    }
}
