// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Tracking
//!
//! Deliveries waiting for a manual acknowledgment are tracked by message id
//! together with the handle needed to settle them. Ids of acknowledged
//! messages are remembered separately, so a redelivery of a message whose ack
//! was lost in a reconnect can be recognised and dropped.
//!
//! Both maps are swept periodically: entries older than the retention window
//! are removed. A consumer stalling longer than the window loses the ability
//! to ack its message through the provider.

use crate::transport::DeliveryHandle;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

/// A delivery waiting for a manual acknowledgment.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub id: String,
    pub handle: DeliveryHandle,
    pub received_at: Instant,
}

/// Number of entries removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tracked: usize,
    pub acked: usize,
}

#[derive(Default)]
struct Maps {
    tracked: HashMap<String, TrackedMessage>,
    acked: HashMap<String, Instant>,
}

/// Tracked deliveries and acknowledged ids, shared by the message processor,
/// the ack/nack verbs and the housekeeping task.
#[derive(Default)]
pub struct MessageTracker {
    maps: Mutex<Maps>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracks a delivery. A redelivery of an id still tracked replaces the
    /// previous handle, which belonged to a channel that is gone.
    pub fn track(&self, id: &str, handle: DeliveryHandle) {
        self.lock().tracked.insert(
            id.to_owned(),
            TrackedMessage {
                id: id.to_owned(),
                handle,
                received_at: Instant::now(),
            },
        );
    }

    pub fn lookup(&self, id: &str) -> Option<TrackedMessage> {
        self.lock().tracked.get(id).cloned()
    }

    pub fn untrack(&self, id: &str) -> Option<TrackedMessage> {
        self.lock().tracked.remove(id)
    }

    /// Puts back an entry taken with [`MessageTracker::untrack`] whose
    /// settlement failed, unless a redelivery is tracked under the same id
    /// in the meantime.
    pub fn reinstate(&self, message: TrackedMessage) {
        self.lock()
            .tracked
            .entry(message.id.clone())
            .or_insert(message);
    }

    /// Records `id` as acknowledged.
    pub fn mark_acked(&self, id: &str) {
        self.lock().acked.insert(id.to_owned(), Instant::now());
    }

    pub fn is_acked(&self, id: &str) -> bool {
        self.lock().acked.contains_key(id)
    }

    pub fn tracked_len(&self) -> usize {
        self.lock().tracked.len()
    }

    pub fn acked_len(&self) -> usize {
        self.lock().acked.len()
    }

    /// Removes every entry whose age at `now` exceeds `retention`.
    pub fn sweep(&self, now: Instant, retention: Duration) -> SweepReport {
        let mut maps = self.lock();
        let expired = |at: Instant| now.saturating_duration_since(at) > retention;

        let tracked = maps.tracked.len();
        maps.tracked.retain(|_, m| !expired(m.received_at));
        let acked = maps.acked.len();
        maps.acked.retain(|_, at| !expired(*at));

        SweepReport {
            tracked: tracked - maps.tracked.len(),
            acked: acked - maps.acked.len(),
        }
    }
}

/// Spawns the periodic sweep. The first sweep runs one `every` after the call.
pub fn spawn_housekeeping(
    tracker: Arc<MessageTracker>,
    every: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = tracker.sweep(Instant::now(), retention);
            if report.tracked > 0 || report.acked > 0 {
                debug!(
                    tracked = report.tracked,
                    acked = report.acked,
                    "housekeeping removed stale entries"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBrokerChannel;

    fn handle(tag: u64) -> DeliveryHandle {
        DeliveryHandle::new(tag, Arc::new(MockBrokerChannel::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn track_lookup_untrack() {
        let tracker = MessageTracker::new();
        tracker.track("m1", handle(1));

        let record = tracker.lookup("m1").unwrap();
        assert_eq!(record.id, "m1");
        assert_eq!(record.handle.delivery_tag(), 1);

        assert!(tracker.untrack("m1").is_some());
        assert!(tracker.lookup("m1").is_none());
        assert!(tracker.untrack("m1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retracking_replaces_the_handle() {
        let tracker = MessageTracker::new();
        tracker.track("m1", handle(1));
        tracker.track("m1", handle(9));

        assert_eq!(tracker.tracked_len(), 1);
        assert_eq!(tracker.lookup("m1").unwrap().handle.delivery_tag(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn reinstate_keeps_a_newer_redelivery() {
        let tracker = MessageTracker::new();
        tracker.track("m1", handle(1));
        let taken = tracker.untrack("m1").unwrap();

        tracker.reinstate(taken.clone());
        assert_eq!(tracker.lookup("m1").unwrap().handle.delivery_tag(), 1);

        tracker.untrack("m1");
        tracker.track("m1", handle(7));
        tracker.reinstate(taken);
        assert_eq!(tracker.lookup("m1").unwrap().handle.delivery_tag(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_removes_entries_older_than_the_window() {
        let tracker = MessageTracker::new();
        let window = Duration::from_secs(60);

        tracker.track("old", handle(1));
        tracker.mark_acked("old-ack");
        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.track("young", handle(2));
        tracker.mark_acked("young-ack");
        tokio::time::advance(Duration::from_secs(30)).await;

        let report = tracker.sweep(Instant::now(), window);

        assert_eq!(report, SweepReport { tracked: 1, acked: 1 });
        assert!(tracker.lookup("old").is_none());
        assert!(tracker.lookup("young").is_some());
        assert!(!tracker.is_acked("old-ack"));
        assert!(tracker.is_acked("young-ack"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_entries_exactly_at_the_window() {
        let tracker = MessageTracker::new();
        tracker.track("edge", handle(1));
        tokio::time::advance(Duration::from_secs(60)).await;

        tracker.sweep(Instant::now(), Duration::from_secs(60));
        assert!(tracker.lookup("edge").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn housekeeping_sweeps_on_its_interval() {
        let tracker = Arc::new(MessageTracker::new());
        tracker.track("m1", handle(1));
        tracker.mark_acked("m0");

        let task = spawn_housekeeping(
            tracker.clone(),
            Duration::from_secs(10),
            Duration::from_secs(15),
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(tracker.tracked_len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(tracker.tracked_len(), 0);
        assert_eq!(tracker.acked_len(), 0);

        task.abort();
    }
}
