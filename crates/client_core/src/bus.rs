//! Typed in-process publish/subscribe.
//!
//! Delivery is fire-and-forget: every subscription that exists when
//! [`EventBus::publish`] is called has the event queued before `publish`
//! returns. Nothing is persisted, so a subscriber created later never sees
//! earlier events; components must subscribe before any data load starts.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
    #[error("timed out after {0:?} waiting for event")]
    TimedOut(Duration),
    #[error("wait for event cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns how many subscriptions the event was queued for.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[derive(Debug)]
pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> Subscription<E> {
    pub async fn recv(&mut self) -> Result<E, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus: subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus: subscriber lagged; events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Waits for the first event matching `predicate`.
    ///
    /// There is no timeout: if nothing ever matches and the bus stays open
    /// this never resolves. Use [`Subscription::wait_for_timeout`] or
    /// [`Subscription::wait_for_or_cancel`] when that is not acceptable.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<E, BusError>
    where
        F: FnMut(&E) -> bool,
    {
        loop {
            let event = self.recv().await?;
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    pub async fn wait_for_timeout<F>(&mut self, predicate: F, timeout: Duration) -> Result<E, BusError>
    where
        F: FnMut(&E) -> bool,
    {
        tokio::time::timeout(timeout, self.wait_for(predicate))
            .await
            .map_err(|_| BusError::TimedOut(timeout))?
    }

    pub async fn wait_for_or_cancel<F, C>(&mut self, predicate: F, cancel: C) -> Result<E, BusError>
    where
        F: FnMut(&E) -> bool,
        C: Future<Output = ()>,
    {
        tokio::select! {
            result = self.wait_for(predicate) => result,
            _ = cancel => Err(BusError::Cancelled),
        }
    }

    pub fn into_stream(self) -> BroadcastStream<E> {
        BroadcastStream::new(self.rx)
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
