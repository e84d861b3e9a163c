// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Remembers how every live consumer was registered, keyed by its consumer
//! tag, so the registrations can be replayed after a reconnection. Each entry
//! also remembers the channel it was registered on: an entry is live only
//! while that channel is the current one and still open.

use crate::{
    provider::{Callback, Subscription},
    transport::{same_link, BrokerChannel},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

/// Verb a registration was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Consume,
    Subscribe,
}

/// What is needed to register a consumer again.
#[derive(Clone)]
pub struct Registration {
    pub operation: Operation,
    pub params: Subscription,
    pub callback: Callback,
    pub channel: Weak<dyn BrokerChannel>,
}

impl Registration {
    /// Whether the consumer is still registered on `current`.
    pub fn is_live_on(&self, current: &Arc<dyn BrokerChannel>) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|c| same_link(&c, current) && !c.link_state().borrow().is_closed())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("operation", &self.operation)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, consumer_tag: &str, registration: Registration) {
        self.lock().insert(consumer_tag.to_owned(), registration);
    }

    pub fn remove(&self, consumer_tag: &str) -> Option<Registration> {
        self.lock().remove(consumer_tag)
    }

    pub fn get(&self, consumer_tag: &str) -> Option<Registration> {
        self.lock().get(consumer_tag).cloned()
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.lock().contains_key(consumer_tag)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every registration, for replay outside the lock.
    pub fn snapshot(&self) -> Vec<(String, Registration)> {
        self.lock()
            .iter()
            .map(|(tag, reg)| (tag.clone(), reg.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::callback,
        transport::{LinkState, MockBrokerChannel},
    };
    use tokio::sync::watch;

    fn registration_on(queue: &str, channel: &Arc<dyn BrokerChannel>) -> Registration {
        Registration {
            operation: Operation::Consume,
            params: Subscription::new(queue),
            callback: callback(|_| async { Ok(()) }),
            channel: Arc::downgrade(channel),
        }
    }

    fn registration(queue: &str) -> Registration {
        let channel: Arc<dyn BrokerChannel> = Arc::new(MockBrokerChannel::new());
        registration_on(queue, &channel)
    }

    fn channel_with(link: &watch::Sender<LinkState>) -> Arc<dyn BrokerChannel> {
        let link = link.subscribe();
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_link_state()
            .returning(move || link.clone());
        Arc::new(channel)
    }

    #[test]
    fn register_get_remove() {
        let registry = ConsumerRegistry::new();
        registry.register("ctag-1", registration("q1"));

        assert!(registry.contains("ctag-1"));
        assert_eq!(registry.get("ctag-1").unwrap().params.queue, "q1");
        assert!(registry.remove("ctag-1").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_does_not_drain() {
        let registry = ConsumerRegistry::new();
        registry.register("ctag-1", registration("q1"));
        registry.register("ctag-2", registration("q2"));

        let mut tags = registry
            .snapshot()
            .into_iter()
            .map(|(tag, _)| tag)
            .collect::<Vec<_>>();
        tags.sort();

        assert_eq!(tags, vec!["ctag-1", "ctag-2"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registration_is_live_only_on_its_open_channel() {
        let (link, _) = watch::channel(LinkState::Open);
        let current = channel_with(&link);
        let (other_link, _) = watch::channel(LinkState::Open);
        let other = channel_with(&other_link);

        let on_current = registration_on("q1", &current);
        assert!(on_current.is_live_on(&current));
        assert!(!registration_on("q1", &other).is_live_on(&current));
        assert!(!registration("q1").is_live_on(&current));

        link.send_replace(LinkState::Closed("gone".to_owned()));
        assert!(!on_current.is_live_on(&current));
    }
}
