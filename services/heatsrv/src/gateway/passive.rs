//! Passive telegram capture
//!
//! Everything seen on the bus that no caller asked for. One entry per
//! (sender, receiver, index); a repeated telegram refreshes its entry instead of
//! adding a new one, and once the log is full the entry seen least recently is
//! evicted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::protocols::can::CanFrame;
use crate::protocols::elster::{ElsterTelegram, Unrecognized};

/// Upsert key. Receiver and index are absent for frames that did not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PassiveKey {
    pub sender: u32,
    pub receiver: Option<u16>,
    pub index: Option<u16>,
}

impl PassiveKey {
    fn for_frame(frame: &CanFrame, decoded: &Result<ElsterTelegram, Unrecognized>) -> Self {
        match decoded {
            Ok(telegram) => Self {
                sender: u32::from(telegram.sender),
                receiver: Some(telegram.receiver),
                index: Some(telegram.index()),
            },
            Err(_) => Self {
                sender: frame.id(),
                receiver: None,
                index: None,
            },
        }
    }
}

impl fmt::Display for PassiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.sender)?;
        if let Some(receiver) = self.receiver {
            write!(f, " -> 0x{:03x}", receiver)?;
        }
        if let Some(index) = self.index {
            write!(f, " index 0x{:04x}", index)?;
        }
        Ok(())
    }
}

/// One captured telegram
#[derive(Debug, Clone, Serialize)]
pub struct PassiveTelegram {
    pub key: PassiveKey,
    /// Most recent frame for this key
    pub frame: CanFrame,
    /// Decoded form of `frame`, if it was an Elster telegram
    pub telegram: Option<ElsterTelegram>,
    /// Why `frame` did not decode
    pub unrecognized: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: u64,
    #[serde(skip)]
    sequence: u64,
}

impl fmt::Display for PassiveTelegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.telegram {
            Some(telegram) => write!(
                f,
                "{} {:?} {} = {}",
                self.key,
                telegram.kind,
                telegram.value.name(),
                telegram.value
            )?,
            None => write!(f, "{} [{}]", self.frame, self.unrecognized.as_deref().unwrap_or("?"))?,
        }
        write!(
            f,
            " (seen {}x, last {})",
            self.seen_count,
            self.last_seen.format("%H:%M:%S")
        )
    }
}

#[derive(Debug, Default)]
struct PassiveInner {
    entries: HashMap<PassiveKey, PassiveTelegram>,
    next_sequence: u64,
    evictions: u64,
}

/// Bounded upsert log of unsolicited telegrams
#[derive(Debug)]
pub struct PassiveTelegramLog {
    capacity: usize,
    inner: Mutex<PassiveInner>,
}

impl PassiveTelegramLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PassiveInner::default()),
        }
    }

    /// Insert or refresh the entry for this frame
    pub fn record(&self, frame: &CanFrame, decoded: &Result<ElsterTelegram, Unrecognized>) {
        let key = PassiveKey::for_frame(frame, decoded);
        let now = Utc::now();

        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.frame = *frame;
            entry.last_seen = now;
            entry.seen_count += 1;
            entry.sequence = sequence;
            match decoded {
                Ok(telegram) => entry.telegram = Some(telegram.clone()),
                Err(reason) => entry.unrecognized = Some(reason.to_string()),
            }
            return;
        }

        if inner.entries.len() >= self.capacity {
            // oldest last-seen goes first; sequence breaks timestamp ties
            let oldest = inner
                .entries
                .values()
                .min_by_key(|entry| entry.sequence)
                .map(|entry| entry.key);
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            }
        }

        inner.entries.insert(
            key,
            PassiveTelegram {
                key,
                frame: *frame,
                telegram: decoded.as_ref().ok().cloned(),
                unrecognized: decoded.as_ref().err().map(ToString::to_string),
                first_seen: now,
                last_seen: now,
                seen_count: 1,
                sequence,
            },
        );
    }

    /// Snapshot ordered by (sender, receiver, index)
    pub fn list(&self) -> Vec<PassiveTelegram> {
        let mut entries: Vec<_> = self.inner.lock().entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.key);
        entries
    }

    pub fn get(&self, key: &PassiveKey) -> Option<PassiveTelegram> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped to stay within capacity
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}
