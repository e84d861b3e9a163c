// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::Config,
    memory::MemoryBroker,
    processor::Message,
    provider::{callback, Callback, Provider},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

pub const RECONNECT: Duration = Duration::from_secs(10);
pub const RE_CHANNEL: Duration = Duration::from_secs(3);

pub fn config() -> Config {
    Config::default()
        .url("amqp://memory")
        .reconnect_after(RECONNECT)
        .re_channel_after(RE_CHANNEL)
}

pub fn provider(broker: &MemoryBroker) -> Provider {
    Provider::new(config(), Arc::new(broker.clone()))
}

/// Lets spawned tasks (consumers, watchers, supervisor) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Collects the messages handed to a consumer callback.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Message>>>);

impl Inbox {
    pub fn callback(&self) -> Callback {
        let inbox = self.clone();
        callback(move |message| {
            let inbox = inbox.clone();
            async move {
                inbox.push(message);
                Ok(())
            }
        })
    }

    pub fn push(&self, message: Message) {
        self.0.lock().unwrap().push(message);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
