//! Outbound FIFO between `set_reading` and the drain loop
//!
//! Pushing never blocks. The consumer waits on the queue's `Notify`, which
//! keeps a permit when nobody is waiting so a push between `pop` and the
//! wait is not lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::error::{HeatSrvError, Result};

/// One pending publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<OutboundItem>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and wake the consumer
    pub fn push(&self, item: OutboundItem) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HeatSrvError::QueueClosed);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Oldest item, if any
    pub fn pop(&self) -> Option<OutboundItem> {
        self.state.lock().items.pop_front()
    }

    /// Resolves after the next push (or immediately if one happened since the last wait)
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Stop accepting items; returns how many were still queued
    pub fn close(&self) -> usize {
        let remaining = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.len()
        };
        self.notify.notify_waiters();
        remaining
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}
