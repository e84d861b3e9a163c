// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::common::config;
use crate::{
    errors::{AmqpError, ValidationError},
    memory::MemoryBroker,
    provider::{BoxError, Provider, QueueMessage, Recovery},
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Stash {
    saved: Mutex<Vec<(&'static str, QueueMessage)>>,
    broken: bool,
}

#[async_trait]
impl Recovery for Stash {
    async fn recover(&self, verb: &'static str, message: &QueueMessage) -> Result<(), BoxError> {
        if self.broken {
            return Err("disk full".into());
        }
        self.saved.lock().unwrap().push((verb, message.clone()));
        Ok(())
    }
}

fn unreachable_broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    broker
}

#[tokio::test(start_paused = true)]
async fn failed_produce_is_handed_to_recovery() {
    let stash = Arc::new(Stash::default());
    let provider = Provider::with_recovery(
        config(),
        Arc::new(unreachable_broker()),
        stash.clone(),
    );
    let message = QueueMessage::new("q1").json(json!({"x": 1}));

    let err = provider.produce(message.clone()).await.unwrap_err();

    assert_eq!(err, AmqpError::ConnectionError);
    assert_eq!(*stash.saved.lock().unwrap(), vec![("produce", message)]);
}

#[tokio::test(start_paused = true)]
async fn failing_recovery_reports_both_errors() {
    let stash = Arc::new(Stash {
        broken: true,
        ..Default::default()
    });
    let provider = Provider::with_recovery(config(), Arc::new(unreachable_broker()), stash);

    let err = provider
        .publish(QueueMessage::new("news").json(json!({"x": 1})))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        AmqpError::Recovery(vec!["failure to connect".to_owned(), "disk full".to_owned()])
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_messages_are_not_recovered() {
    let stash = Arc::new(Stash::default());
    let provider = Provider::with_recovery(
        config(),
        Arc::new(unreachable_broker()),
        stash.clone(),
    );

    let err = provider
        .produce(QueueMessage::new("q1").json(json!("not an object")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AmqpError::Validation(ValidationError::TypeMismatch { .. })
    ));
    assert!(stash.saved.lock().unwrap().is_empty());
}
