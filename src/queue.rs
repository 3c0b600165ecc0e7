//! Bounded single-producer/single-consumer hand-off between pipeline stages.
//!
//! Capacity is fixed at construction. When the queue is full the producer
//! either waits a short enqueue timeout and then drops the item
//! (`OverflowPolicy::Drop`, freshness over completeness) or waits until space
//! frees up or the run is cancelled (`OverflowPolicy::Block`). Dropping the
//! producer closes the queue; the consumer drains what is left and then sees
//! `Pop::Closed`.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::Deserialize;
use std::time::Duration;

use crate::cancel::StopToken;

/// What a full queue does with a new item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Drop,
    Block,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "block" => Ok(Self::Block),
            other => Err(anyhow!("unknown overflow policy '{}' (drop|block)", other)),
        }
    }
}

/// Outcome of offering an item to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Queue stayed full past the enqueue timeout; the item was discarded.
    Dropped,
    /// Consumer is gone.
    Closed,
    /// Stop was requested while waiting for space.
    Cancelled,
}

/// Outcome of waiting for an item.
#[derive(Debug)]
pub enum Pop<T> {
    Item(T),
    Timeout,
    /// Producer is gone and nothing is left to drain.
    Closed,
}

pub struct QueueSender<T> {
    tx: Sender<T>,
    policy: OverflowPolicy,
    enqueue_timeout: Duration,
}

pub struct QueueReceiver<T> {
    rx: Receiver<T>,
}

/// Create a bounded queue. Capacity must be at least one.
pub fn bounded<T>(
    capacity: usize,
    policy: OverflowPolicy,
    enqueue_timeout: Duration,
) -> Result<(QueueSender<T>, QueueReceiver<T>)> {
    if capacity == 0 {
        return Err(anyhow!("queue capacity must be >= 1"));
    }
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    Ok((
        QueueSender {
            tx,
            policy,
            enqueue_timeout,
        },
        QueueReceiver { rx },
    ))
}

impl<T> QueueSender<T> {
    pub fn push(&self, item: T, stop: &StopToken) -> Push {
        match self.policy {
            OverflowPolicy::Drop => match self.tx.send_timeout(item, self.enqueue_timeout) {
                Ok(()) => Push::Queued,
                Err(SendTimeoutError::Timeout(_)) => Push::Dropped,
                Err(SendTimeoutError::Disconnected(_)) => Push::Closed,
            },
            OverflowPolicy::Block => {
                let mut item = item;
                loop {
                    if stop.is_cancelled() {
                        return Push::Cancelled;
                    }
                    match self.tx.send_timeout(item, self.enqueue_timeout) {
                        Ok(()) => return Push::Queued,
                        Err(SendTimeoutError::Timeout(back)) => item = back,
                        Err(SendTimeoutError::Disconnected(_)) => return Push::Closed,
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}

impl<T> QueueReceiver<T> {
    pub fn pop(&self, wait: Duration) -> Pop<T> {
        match self.rx.recv_timeout(wait) {
            Ok(item) => Pop::Item(item),
            Err(RecvTimeoutError::Timeout) => Pop::Timeout,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Handle for observing occupancy from another thread.
    pub fn probe(&self) -> QueueProbe<T> {
        QueueProbe {
            rx: self.rx.clone(),
        }
    }
}

/// Read-only view of a queue's occupancy. Never receives items.
pub struct QueueProbe<T> {
    rx: Receiver<T>,
}

impl<T> QueueProbe<T> {
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
