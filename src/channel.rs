// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! The [`ChannelManager`] owns the channel every provider operation runs on.
//! It creates the channel on the live connection, watches it, and recreates
//! it when it closes on its own (a channel may close while its connection
//! stays up, e.g. after a protocol error). When no connection is available it
//! fails fast and leaves the retrying to the channel-recreate loop, which
//! runs at most once at a time.
//!
//! State machine: `None -> Creating -> Open -> None -> Creating -> ...`
//!
//! A channel re-created after closing on its own, on a connection that stayed
//! up, is announced as [`ChannelEvent::Recreated`]: its consumers are gone and
//! need to be registered again.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    transport::{same_link, BrokerChannel, BrokerConnection, LinkState},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

const EVENTS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    None,
    Creating,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Closed(String),
    Recreated,
}

pub struct ChannelManager {
    connection: Arc<ConnectionManager>,
    re_channel_after: Duration,
    creating: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    recreating: AtomicBool,
    orphaned: AtomicBool,
    closed: AtomicBool,
}

impl ChannelManager {
    pub fn new(
        connection: Arc<ConnectionManager>,
        re_channel_after: Duration,
    ) -> Arc<ChannelManager> {
        let (state, _) = watch::channel(ChannelState::None);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Arc::new(ChannelManager {
            connection,
            re_channel_after,
            creating: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            state,
            events,
            recreating: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<dyn BrokerChannel>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.lock_current().clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_recreating(&self) -> bool {
        self.recreating.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Returns the open channel, or creates one on the live connection.
    ///
    /// # Parameters
    /// * `force` - Create a new channel even if one is open; the replaced
    ///   channel is closed. A forced channel is never announced as
    ///   `Recreated`: the caller takes care of its consumers
    ///
    /// # Returns
    /// The channel, or `AmqpError::ChannelError` when there is no live
    /// connection or the broker refused the channel. Both failures start the
    /// recreate loop.
    pub async fn channel(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }

        let _creating = self.creating.lock().await;

        let Some(conn) = self.connection.current() else {
            debug!("no live connection to create a channel on");
            self.start_recreate_loop();
            return Err(AmqpError::ChannelError);
        };
        if !force {
            if let Some(channel) = self.current() {
                return Ok(channel);
            }
        }

        self.state.send_replace(ChannelState::Creating);
        match conn.create_channel().await {
            Ok(channel) => {
                let previous = self.lock_current().replace(channel.clone());
                self.state.send_replace(ChannelState::Open);
                self.watch(channel.clone(), conn);

                if let Some(previous) = previous {
                    tokio::spawn(async move {
                        let _ = previous.close().await;
                    });
                }

                if self.orphaned.swap(false, Ordering::SeqCst) && !force {
                    debug!("channel re-created on the same connection");
                    let _ = self.events.send(ChannelEvent::Recreated);
                }
                Ok(channel)
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to create a channel");
                let state = if self.current().is_some() {
                    ChannelState::Open
                } else {
                    ChannelState::None
                };
                self.state.send_replace(state);
                self.start_recreate_loop();
                Err(err)
            }
        }
    }

    fn watch(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>, conn: Arc<dyn BrokerConnection>) {
        let mut link = channel.link_state();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = match link.wait_for(LinkState::is_closed).await {
                Ok(state) => match &*state {
                    LinkState::Closed(reason) => reason.clone(),
                    LinkState::Open => String::new(),
                },
                Err(_) => "channel dropped".to_owned(),
            };

            let Some(manager) = manager.upgrade() else {
                return;
            };
            let cleared = {
                let mut current = manager.lock_current();
                match current.as_ref() {
                    Some(c) if same_link(c, &channel) => current.take().is_some(),
                    _ => false,
                }
            };
            if !cleared || manager.closed.load(Ordering::SeqCst) {
                return;
            }

            let connection_up = manager.connection.current().is_some_and(|c| {
                let open = !c.link_state().borrow().is_closed();
                open && same_link(&c, &conn)
            });
            if connection_up {
                manager.orphaned.store(true, Ordering::SeqCst);
            }
            let _ = manager.events.send(ChannelEvent::Closed(reason.clone()));

            warn!(reason, "channel closed, recreating");
            manager.state.send_replace(ChannelState::None);
            let _ = manager.channel(false).await;
        });
    }

    fn start_recreate_loop(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.recreating.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(
            interval_ms = self.re_channel_after.as_millis() as u64,
            "starting channel recreate loop"
        );
        let manager = self.clone();
        tokio::spawn(async move {
            let every = manager.re_channel_after;
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if manager.closed.load(Ordering::SeqCst) || manager.current().is_some() {
                    break;
                }
                if manager.channel(false).await.is_ok() {
                    debug!("channel recreated");
                    break;
                }
            }

            manager.recreating.store(false, Ordering::SeqCst);
            if !manager.closed.load(Ordering::SeqCst) && manager.current().is_none() {
                manager.start_recreate_loop();
            }
        });
    }

    /// Stops the recreate loop and hands out the channel for closing.
    pub(crate) fn shutdown(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.lock_current().take();
        self.state.send_replace(ChannelState::None);
        channel
    }

    /// Stops the recreate loop and closes the channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match self.shutdown() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    const RECONNECT: Duration = Duration::from_secs(30);
    const RE_CHANNEL: Duration = Duration::from_secs(2);

    fn managers(broker: &MemoryBroker) -> (Arc<ConnectionManager>, Arc<ChannelManager>) {
        let connection = ConnectionManager::new("amqp://memory", RECONNECT, Arc::new(broker.clone()));
        let channel = ChannelManager::new(connection.clone(), RE_CHANNEL);
        (connection, channel)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_without_a_connection_then_recovers() {
        let broker = MemoryBroker::new();
        let (connection, channels) = managers(&broker);

        assert_eq!(
            channels.channel(false).await.err(),
            Some(AmqpError::ChannelError)
        );
        assert!(channels.is_recreating());
        assert_eq!(channels.state(), ChannelState::None);

        connection.connect(false).await.unwrap();
        tokio::time::sleep(RE_CHANNEL + Duration::from_millis(1)).await;

        assert_eq!(channels.state(), ChannelState::Open);
        assert!(!channels.is_recreating());
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_the_open_channel_unless_forced() {
        let broker = MemoryBroker::new();
        let (connection, channels) = managers(&broker);
        connection.connect(false).await.unwrap();

        let first = channels.channel(false).await.unwrap();
        let second = channels.channel(false).await.unwrap();
        assert!(same_link(&first, &second));

        let forced = channels.channel(true).await.unwrap();
        assert!(!same_link(&first, &forced));

        settle().await;
        assert_eq!(broker.open_channels(), 1);
        assert_eq!(channels.state(), ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_closed_by_broker_is_recreated_immediately() {
        let broker = MemoryBroker::new();
        let (connection, channels) = managers(&broker);
        connection.connect(false).await.unwrap();
        let first = channels.channel(false).await.unwrap();

        broker.close_channels();
        settle().await;

        let current = channels.current().unwrap();
        assert!(!same_link(&first, &current));
        assert!(connection.is_connected());
        assert!(!channels.is_recreating());
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recreation_on_a_live_connection_is_announced() {
        let broker = MemoryBroker::new();
        let (connection, channels) = managers(&broker);
        connection.connect(false).await.unwrap();
        channels.channel(false).await.unwrap();
        let mut events = channels.subscribe();

        broker.close_channels();
        settle().await;

        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Closed(_)));
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Recreated);

        // forced replacements are not announced
        channels.channel(true).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_falls_back_to_recreate_loop() {
        let broker = MemoryBroker::new();
        let (connection, channels) = managers(&broker);
        connection.connect(false).await.unwrap();
        channels.channel(false).await.unwrap();

        broker.sever_connections();
        settle().await;

        assert!(channels.current().is_none());
        assert!(channels.is_recreating());

        // the connection comes back on the reconnect tick, the channel on the next recreate tick
        tokio::time::sleep(RECONNECT + RE_CHANNEL + Duration::from_millis(1)).await;
        assert!(connection.is_connected());
        assert_eq!(channels.state(), ChannelState::Open);
    }
}
