#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(
    missing_docs,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

//! Job event bus.
//!
//! # Design
//! - Every published event gets the next sequential id and lands in a bounded
//!   log of recent events; the oldest entry is dropped once the log is full.
//! - Live delivery goes through `tokio::broadcast`. Publishing never waits on
//!   subscribers, and a subscriber that falls behind skips ahead and counts
//!   what it missed.
//! - A subscriber may ask for logged events newer than a known id before the
//!   live feed starts.

mod payloads;

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, JobState};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast::{self, Receiver, Sender, error::RecvError};

/// Cloneable handle to the engine's event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    recent: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl EventBus {
    /// Bus keeping up to `capacity` recent events. Zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Bus with [`DEFAULT_REPLAY_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `event` and return its id.
    pub fn publish(&self, event: Event) -> EventId {
        let envelope = EventEnvelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };
        let id = envelope.id;
        {
            let mut recent = self.recent();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(envelope.clone());
        }
        // Sending fails only when nobody listens.
        let _ = self.sender.send(envelope);
        id
    }

    /// Live feed, preceded by logged events newer than `since` when given.
    #[must_use]
    pub fn subscribe(&self, since: Option<EventId>) -> EventStream {
        let replay = since.map_or_else(VecDeque::new, |since| {
            self.recent()
                .iter()
                .filter(|envelope| envelope.id > since)
                .cloned()
                .collect()
        });
        EventStream {
            replay,
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Logged events, oldest first.
    #[must_use]
    pub fn backlog(&self) -> Vec<EventEnvelope> {
        self.recent().iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    replay: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    missed: u64,
}

impl EventStream {
    /// Next event; `None` once every bus handle is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.replay.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events skipped because this subscriber fell behind.
    #[must_use]
    pub const fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn progress(n: u64) -> Event {
        Event::DownloadProgress {
            job_id: Uuid::from_u128(u128::from(n) + 1),
            download_id: Uuid::nil(),
            bytes_done: n * 1_000,
            bytes_total: 500_000,
            speed_bps: 0,
        }
    }

    #[tokio::test]
    async fn subscribers_resume_after_a_known_id() -> anyhow::Result<()> {
        let bus = EventBus::with_capacity(16);
        let ids: Vec<EventId> = (0..5).map(|n| bus.publish(progress(n))).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let mut stream = bus.subscribe(Some(2));
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.extend(stream.next().await.map(|envelope| envelope.id));
        }
        assert_eq!(seen, vec![3, 4, 5]);

        bus.publish(progress(9));
        assert_eq!(stream.next().await.map(|envelope| envelope.id), Some(6));
        Ok(())
    }

    #[test]
    fn log_keeps_only_the_newest_events() {
        let bus = EventBus::with_capacity(2);
        for n in 0..4 {
            bus.publish(progress(n));
        }
        let ids: Vec<EventId> = bus.backlog().iter().map(|envelope| envelope.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn slow_subscribers_count_what_they_missed() {
        let bus = EventBus::with_capacity(4);
        let mut stream = bus.subscribe(None);
        for n in 0..10 {
            bus.publish(progress(n));
        }
        let first = stream.next().await.map(|envelope| envelope.id);
        assert_eq!(first, Some(7));
        assert_eq!(stream.missed(), 6);

        drop(bus);
        let mut rest = 0;
        while stream.next().await.is_some() {
            rest += 1;
        }
        assert_eq!(rest, 3);
    }
}
