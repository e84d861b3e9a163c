// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] owns the broker connection of one provider. It
//! connects lazily, watches the connection for close/error, and runs the
//! reconnect loop: a fixed-interval timer retrying `connect(true)` until it
//! succeeds. At most one reconnect loop runs at a time.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected -> ...`
//!
//! Lifecycle changes are broadcast as [`LifecycleEvent`]s; a successful
//! connection made after a loss is announced as `Reconnected`, which is what
//! the provider listens to for re-creating its channel and replaying consumers.

use crate::{
    errors::AmqpError,
    transport::{same_link, BrokerConnection, LinkState, Transport},
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
use tracing::{debug, info, warn};

const EVENTS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected(String),
    Reconnected,
}

pub struct ConnectionManager {
    url: String,
    reconnect_after: Duration,
    transport: Arc<dyn Transport>,
    handshake: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
    reconnecting: AtomicBool,
    lost: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        url: &str,
        reconnect_after: Duration,
        transport: Arc<dyn Transport>,
    ) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Arc::new(ConnectionManager {
            url: url.to_owned(),
            reconnect_after,
            transport,
            handshake: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            state,
            events,
            reconnecting: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<dyn BrokerConnection>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live connection, if any. Never performs I/O.
    pub fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.lock_current().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_current().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Returns the live connection, or performs the broker handshake.
    ///
    /// Without `force` an existing connection is returned as is. Concurrent
    /// callers share a single handshake. A failed handshake rejects this call
    /// and starts the reconnect loop in the background.
    pub async fn connect(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }
        if !force {
            if let Some(conn) = self.current() {
                return Ok(conn);
            }
        }

        let _handshake = self.handshake.lock().await;
        if !force {
            if let Some(conn) = self.current() {
                return Ok(conn);
            }
        }

        self.state.send_replace(ConnectionState::Connecting);
        debug!(url = self.url, "connecting to the broker...");

        match self.transport.connect(&self.url).await {
            Ok(conn) => {
                if self.closed.load(Ordering::SeqCst) {
                    let _ = conn.close().await;
                    return Err(AmqpError::Closed);
                }

                let previous = self.lock_current().replace(conn.clone());
                self.state.send_replace(ConnectionState::Connected);
                self.watch(conn.clone());

                if let Some(previous) = previous {
                    tokio::spawn(async move {
                        let _ = previous.close().await;
                    });
                }

                debug!("connected to the broker");
                let _ = self.events.send(LifecycleEvent::Connected);
                if self.lost.swap(false, Ordering::SeqCst) {
                    info!("connection to the broker restored");
                    let _ = self.events.send(LifecycleEvent::Reconnected);
                }

                Ok(conn)
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to connect to the broker");
                if self.current().is_some() {
                    self.state.send_replace(ConnectionState::Connected);
                } else {
                    self.state.send_replace(ConnectionState::Disconnected);
                    self.lost.store(true, Ordering::SeqCst);
                    self.start_reconnect_loop();
                }
                Err(err)
            }
        }
    }

    fn watch(self: &Arc<Self>, conn: Arc<dyn BrokerConnection>) {
        let mut link = conn.link_state();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = match link.wait_for(LinkState::is_closed).await {
                Ok(state) => match &*state {
                    LinkState::Closed(reason) => reason.clone(),
                    LinkState::Open => String::new(),
                },
                Err(_) => "connection dropped".to_owned(),
            };

            if let Some(manager) = manager.upgrade() {
                let is_current = manager
                    .lock_current()
                    .as_ref()
                    .is_some_and(|c| same_link(c, &conn));
                if is_current {
                    manager.handle_close(&reason);
                }
            }
        });
    }

    /// Drops the cached connection and starts the reconnect loop.
    pub(crate) fn handle_close(self: &Arc<Self>, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(reason, "broker connection lost");

        self.lock_current().take();
        self.state.send_replace(ConnectionState::Disconnected);
        self.lost.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(LifecycleEvent::Disconnected(reason.to_owned()));

        self.start_reconnect_loop();
    }

    fn start_reconnect_loop(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect loop already running");
            return;
        }

        debug!(
            interval_ms = self.reconnect_after.as_millis() as u64,
            "starting reconnect loop"
        );
        let manager = self.clone();
        tokio::spawn(async move {
            let every = manager.reconnect_after;
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if manager.closed.load(Ordering::SeqCst) || manager.current().is_some() {
                    break;
                }
                match manager.connect(true).await {
                    Ok(_) => break,
                    Err(err) => warn!(error = err.to_string(), "reconnect attempt failed"),
                }
            }

            manager.reconnecting.store(false, Ordering::SeqCst);
            // a close may have landed while the flag was still set
            if !manager.closed.load(Ordering::SeqCst) && manager.current().is_none() {
                manager.start_reconnect_loop();
            }
        });
    }

    /// Stops the reconnect loop and hands out the connection for closing.
    pub(crate) fn shutdown(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.closed.store(true, Ordering::SeqCst);
        let conn = self.lock_current().take();
        self.state.send_replace(ConnectionState::Disconnected);
        conn
    }

    /// Stops the reconnect loop and closes the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match self.shutdown() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
