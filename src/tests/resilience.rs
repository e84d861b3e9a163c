// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::common::{config, provider, settle, Inbox, RECONNECT, RE_CHANNEL};
use crate::{
    channel::ChannelState,
    connection::{ConnectionState, LifecycleEvent},
    errors::AmqpError,
    memory::MemoryBroker,
    processor::AckMode,
    provider::{AckParams, CancelParams, Provider, QueueMessage, Subscription},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

#[tokio::test(start_paused = true)]
async fn consumers_are_replayed_after_reconnecting() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    let previous = provider
        .consume(Subscription::new("q1"), inbox.callback())
        .await
        .unwrap()
        .result;
    let mut events = provider.lifecycle();

    broker.sever_connections();
    settle().await;

    assert!(!provider.health_check());
    assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    assert_eq!(broker.consumer_count("q1"), 0);

    tokio::time::sleep(RECONNECT).await;

    assert!(provider.health_check());
    assert_eq!(provider.channel_state(), ChannelState::Open);
    assert_eq!(broker.consumer_count("q1"), 1);
    assert_eq!(provider.registry().len(), 1);
    assert!(!provider.registry().contains(&previous));
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::Disconnected(_)
    ));
    assert_eq!(events.recv().await.unwrap(), LifecycleEvent::Connected);
    assert_eq!(events.recv().await.unwrap(), LifecycleEvent::Reconnected);

    provider
        .produce(QueueMessage::new("q1").json(json!({"x": 2})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(inbox.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unacked_message_is_redelivered_to_the_replayed_consumer() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    provider
        .consume(Subscription::new("q1").ack(AckMode::Manual), inbox.callback())
        .await
        .unwrap();
    provider
        .produce(QueueMessage::new("q1").json(json!({"id": "m-1"})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(inbox.len(), 1);

    broker.sever_connections();
    settle().await;
    assert_eq!(broker.queue_depth("q1"), Some(1));

    tokio::time::sleep(RECONNECT).await;

    let messages = inbox.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "m-1");
    assert!(messages[1].redelivered);

    provider.ack(AckParams::new("m-1")).await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_get_a_new_queue_after_reconnecting() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    provider
        .subscribe(Subscription::new("news"), inbox.callback())
        .await
        .unwrap();
    broker.sever_connections();
    tokio::time::sleep(RECONNECT + Duration::from_millis(10)).await;

    provider
        .publish(QueueMessage::new("news").json(json!({"headline": "back"})))
        .await
        .unwrap();
    settle().await;

    assert_eq!(inbox.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_replay_keeps_the_registration_and_is_retried() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    let previous = provider
        .consume(Subscription::new("q1"), inbox.callback())
        .await
        .unwrap()
        .result;
    broker.refuse_channels(true);
    broker.sever_connections();
    tokio::time::sleep(RECONNECT + Duration::from_millis(10)).await;

    assert!(provider.health_check());
    assert_eq!(broker.consumer_count("q1"), 0);
    assert_eq!(provider.registry().len(), 1);
    assert!(provider.registry().contains(&previous));

    broker.refuse_channels(false);
    tokio::time::sleep(RE_CHANNEL + Duration::from_millis(10)).await;

    assert_eq!(provider.channel_state(), ChannelState::Open);
    assert_eq!(broker.consumer_count("q1"), 1);
    assert_eq!(provider.registry().len(), 1);
    assert!(!provider.registry().contains(&previous));

    provider
        .produce(QueueMessage::new("q1").json(json!({"x": 1})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(inbox.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn consumer_added_on_a_recreated_channel_is_not_registered_twice() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let first = Inbox::default();
    let second = Inbox::default();

    provider
        .consume(Subscription::new("q1"), first.callback())
        .await
        .unwrap();
    broker.refuse_channels(true);
    broker.close_channels();
    settle().await;
    assert_eq!(provider.channel_state(), ChannelState::None);

    broker.refuse_channels(false);
    provider
        .consume(Subscription::new("q2"), second.callback())
        .await
        .unwrap();
    settle().await;

    assert_eq!(broker.consumer_count("q1"), 1);
    assert_eq!(broker.consumer_count("q2"), 1);
    assert_eq!(provider.registry().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn channel_closed_by_the_broker_gets_its_consumers_back() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    provider
        .consume(Subscription::new("q1"), inbox.callback())
        .await
        .unwrap();
    broker.close_channels();
    settle().await;

    assert!(provider.health_check());
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.consumer_count("q1"), 1);
    assert_eq!(provider.registry().len(), 1);

    provider
        .produce(QueueMessage::new("q1").json(json!({"x": 1})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(inbox.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_consumer_comes_back_after_reconnecting() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    let inbox = Inbox::default();

    let consumer_tag = provider
        .consume(Subscription::new("q1"), inbox.callback())
        .await
        .unwrap()
        .result;
    provider
        .cancel(CancelParams::new(&consumer_tag))
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("q1"), 0);

    broker.sever_connections();
    tokio::time::sleep(RECONNECT + Duration::from_millis(10)).await;

    assert_eq!(broker.consumer_count("q1"), 1);
}

#[tokio::test(start_paused = true)]
async fn operations_fail_fast_while_the_broker_is_down() {
    let broker = MemoryBroker::new();
    let provider = provider(&broker);
    provider
        .produce(QueueMessage::new("q1").json(json!({"x": 1})))
        .await
        .unwrap();

    broker.set_available(false);
    broker.sever_connections();
    settle().await;

    let err = provider
        .produce(QueueMessage::new("q1").json(json!({"x": 2})))
        .await
        .unwrap_err();
    assert_eq!(err, AmqpError::ConnectionError);

    broker.set_available(true);
    tokio::time::sleep(RECONNECT).await;

    assert!(provider.health_check());
    provider
        .produce(QueueMessage::new("q1").json(json!({"x": 3})))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("q1"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn housekeeping_forgets_stale_deliveries() {
    let broker = MemoryBroker::new();
    let provider = Provider::new(
        config()
            .clear_interval(Duration::from_secs(60))
            .clear_offset(Duration::from_secs(120)),
        Arc::new(broker.clone()),
    );
    let inbox = Inbox::default();

    provider
        .consume(Subscription::new("q1").ack(AckMode::Manual), inbox.callback())
        .await
        .unwrap();
    provider
        .produce(QueueMessage::new("q1").json(json!({"id": "m-1"})))
        .await
        .unwrap();
    settle().await;
    assert!(provider.tracker().lookup("m-1").is_some());

    tokio::time::sleep(Duration::from_secs(121)).await;
    assert!(provider.tracker().lookup("m-1").is_some());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        provider.ack(AckParams::new("m-1")).await.unwrap_err(),
        AmqpError::UnknownMessage("m-1".to_owned())
    );
}
