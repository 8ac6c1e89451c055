//! Event publishing/subscription abstraction (mechanics only).
//!
//! The orchestrator publishes [`crate::BridgeEvent`]s here; dashboards, schedulers
//! and tests subscribe. Delivery is in publish order per subscriber. Subscribers
//! that fall behind have messages dropped for them instead of stalling the
//! publisher, and the bus reports how many were dropped.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives its own copy of every event published after it was
/// created.
///
/// ```ignore
/// let sub = bus.subscribe();
/// orchestrator.sync_all(None).await?;
/// while let Ok(event) = sub.try_recv() {
///     println!("{}", event.event_type());
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    ///
    /// Do not call this from inside an async task; use [`Self::try_recv`] there.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Publish/subscribe bus for typed events.
///
/// `publish` never blocks on slow consumers; implementations decide how
/// back-pressure is applied (bounded queues, drop counters).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
