//! Stage event system for async event handling.
//!
//! Every stage broadcasts its lifecycle transitions. Receivers that fall
//! behind skip missed events rather than blocking the stage.

use super::stage::StageId;
use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;
use tokio::sync::broadcast;

/// Events emitted by a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    /// Items were forwarded to the worker.
    Push {
        /// The stage.
        stage: StageId,
        /// Number of items.
        count: usize,
    },

    /// A result arrived from the worker.
    Pull {
        /// The stage.
        stage: StageId,
        /// The result.
        value: Value,
    },

    /// An item failed to evaluate in the worker.
    Fault {
        /// The stage.
        stage: StageId,
        /// Evaluation error text.
        message: String,
    },

    /// `close` was sent; the stage is draining.
    Close {
        /// The stage.
        stage: StageId,
    },

    /// The worker drained. Emitted exactly once.
    Closed {
        /// The stage.
        stage: StageId,
        /// Scalar from a reduce-like operation.
        terminal: Option<Value>,
    },

    /// The stage was killed.
    Kill {
        /// The stage.
        stage: StageId,
    },

    /// The worker went away without draining.
    Failed {
        /// The stage.
        stage: StageId,
        /// Worker exit code, if it exited normally.
        code: Option<i32>,
        /// Channel error, if any.
        reason: Option<String>,
    },
}

impl StageEvent {
    /// The stage that emitted the event.
    pub fn stage(&self) -> StageId {
        match self {
            Self::Push { stage, .. }
            | Self::Pull { stage, .. }
            | Self::Fault { stage, .. }
            | Self::Close { stage }
            | Self::Closed { stage, .. }
            | Self::Kill { stage }
            | Self::Failed { stage, .. } => *stage,
        }
    }

    /// Whether no further events follow from this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::Kill { .. } | Self::Failed { .. }
        )
    }
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push { stage, count } => write!(f, "{} pushed {} items", stage, count),
            Self::Pull { stage, value } => write!(f, "{} pulled {}", stage, value),
            Self::Fault { stage, message } => write!(f, "{} fault: {}", stage, message),
            Self::Close { stage } => write!(f, "{} closing", stage),
            Self::Closed {
                stage,
                terminal: Some(v),
            } => write!(f, "{} closed with {}", stage, v),
            Self::Closed { stage, .. } => write!(f, "{} closed", stage),
            Self::Kill { stage } => write!(f, "{} killed", stage),
            Self::Failed { stage, code, .. } => match code {
                Some(c) => write!(f, "{} failed (exit {})", stage, c),
                None => write!(f, "{} failed", stage),
            },
        }
    }
}

/// Sender for stage events.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<StageEvent>,
}

impl EventSender {
    /// Create a new event sender with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event.
    ///
    /// Returns the number of receivers that received the event.
    /// Returns 0 if there are no receivers (which is fine).
    pub fn send(&self, event: StageEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Whether anyone is listening.
    pub fn has_receivers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Create a receiver for events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver for stage events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<StageEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped.
    pub async fn recv(&mut self) -> Option<StageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::trace!(missed = n, "event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    ///
    /// Returns `None` if no event is available or the sender has been dropped.
    pub fn try_recv(&mut self) -> Option<StageEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for the stage to reach a terminal event.
    ///
    /// Returns the terminal value on `Closed`, `Err(Killed)` on `Kill` and
    /// `Err(WorkerExited)` on `Failed`.
    pub async fn wait_closed(&mut self) -> Result<Option<Value>> {
        while let Some(event) = self.recv().await {
            match event {
                StageEvent::Closed { terminal, .. } => return Ok(terminal),
                StageEvent::Kill { .. } => return Err(Error::Killed),
                StageEvent::Failed { code, .. } => return Err(Error::WorkerExited { code }),
                _ => continue,
            }
        }
        Err(Error::ChannelClosed)
    }

    /// Turn the receiver into a `Stream` of events.
    pub fn into_stream(self) -> impl futures::Stream<Item = StageEvent> {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
    }
}
