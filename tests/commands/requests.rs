//! Sender side: correlation, fan-out, timeouts and misses.

use std::future::ready;
use std::time::Duration;

use red_rover::{RoverConfig, RoverError};
use serde_json::{json, Map};

use crate::support::{eventually, len, responses, rover, rover_with, settle};

#[tokio::test]
async fn hello_world_round_trip() {
    let (rover, bus) = rover();
    let receiver = rover.receiver("greetings", Some("greeters")).await.unwrap();
    receiver.on_request(|command| {
        let reply = if command.payload() == "Hello" {
            json!("World")
        } else {
            json!(null)
        };
        ready(reply)
    });

    let sender = rover.sender("greetings").await.unwrap();
    let (replies, callback) = responses();
    let id = sender.request(&"Hello", callback).await.unwrap();

    eventually("the reply", || len(&replies) == 1).await;
    let reply = replies.lock().unwrap()[0].clone();
    assert_eq!(reply.payload(), &json!("World"));
    assert_eq!(reply.correlates_to(), Some(id.as_str()));
    assert_eq!(bus.published_on("greetings::command").len(), 1);
    assert_eq!(bus.published_on("greetings::response").len(), 1);
}

#[tokio::test]
async fn fan_out_across_groups_sums_to_111() {
    let (rover, _bus) = rover();
    let mut receivers = Vec::new();
    for (group, value) in [(None, 1), (Some("A"), 10), (Some("B"), 100), (Some("B"), 100)] {
        let receiver = rover.receiver("sum", group).await.unwrap();
        receiver.on_request(move |_| ready(json!(value)));
        receivers.push(receiver);
    }

    let sender = rover.sender("sum").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&json!({}), callback).await.unwrap();

    eventually("three replies", || len(&replies) == 3).await;
    settle().await;
    assert_eq!(len(&replies), 3);
    let total: i64 = replies
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.payload().as_i64().unwrap())
        .sum();
    assert_eq!(total, 111);
    assert_eq!(sender.stats().dispatched, 3);
    assert_eq!(sender.pending(), 1);
}

#[tokio::test]
async fn grouped_receivers_answer_once() {
    let (rover, _bus) = rover();
    let mut receivers = Vec::new();
    for value in [1, 10, 100] {
        let receiver = rover.receiver("sum", Some("adders")).await.unwrap();
        receiver.on_request(move |_| ready(json!(value)));
        receivers.push(receiver);
    }

    let sender = rover.sender("sum").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&json!({}), callback).await.unwrap();

    eventually("one reply", || len(&replies) == 1).await;
    settle().await;
    assert_eq!(len(&replies), 1);
    let handled: usize = receivers.iter().map(|r| r.stats().handled).sum();
    assert_eq!(handled, 1);
}

#[tokio::test]
async fn request_one_resolves_with_the_first_response() {
    let (rover, _bus) = rover();
    let receiver = rover.receiver("echo", None).await.unwrap();
    receiver.on_request(|command| ready(command.payload().clone()));

    let sender = rover.sender("echo").await.unwrap();
    let reply = sender.request_one(&json!({ "n": 7 })).await.unwrap();

    assert_eq!(reply.payload()["n"], 7);
    assert_eq!(sender.pending(), 0);
}

#[tokio::test]
async fn request_one_times_out_without_receivers() {
    let (rover, _bus) = rover_with(RoverConfig {
        request_timeout_ms: Some(50),
        ..RoverConfig::default()
    });
    let sender = rover.sender("nobody-home").await.unwrap();

    let err = sender.request_one(&"ping").await.unwrap_err();
    assert!(matches!(err, RoverError::Timeout(_)));
    assert_eq!(sender.pending(), 0);

    let err = sender
        .request_one_within(&"ping", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, RoverError::Timeout(_)));
}

#[tokio::test]
async fn configured_timeout_evicts_callback_requests() {
    let (rover, _bus) = rover_with(RoverConfig {
        request_timeout_ms: Some(30),
        ..RoverConfig::default()
    });
    let sender = rover.sender("slow").await.unwrap();
    let (_replies, callback) = responses();
    sender.request(&"work", callback).await.unwrap();
    assert_eq!(sender.pending(), 1);

    eventually("eviction", || sender.pending() == 0).await;
}

#[tokio::test]
async fn unknown_correlation_ids_are_counted_as_misses() {
    let (rover, _bus) = rover();
    let sender = rover.sender("orders").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&"real", callback).await.unwrap();

    let mut meta = Map::new();
    meta.insert("_re".into(), json!("someone-else"));
    let stray = rover.publisher().await.unwrap();
    stray
        .publish_with_meta("orders::response", &"stray", meta)
        .await
        .unwrap();
    stray.publish("orders::response", &"uncorrelated").await.unwrap();

    eventually("two misses", || sender.stats().misses == 2).await;
    assert_eq!(len(&replies), 0);
    assert_eq!(sender.stats().dispatched, 0);
}

#[tokio::test]
async fn cancelled_requests_stop_receiving() {
    let (rover, _bus) = rover();
    let receiver = rover.receiver("jobs", None).await.unwrap();
    receiver.on_request(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        json!("done")
    });

    let sender = rover.sender("jobs").await.unwrap();
    let (replies, callback) = responses();
    let id = sender.request(&"job", callback).await.unwrap();
    assert!(sender.cancel(&id));

    eventually("the late reply", || sender.stats().misses == 1).await;
    assert_eq!(len(&replies), 0);
}

#[tokio::test]
async fn empty_topic_is_rejected() {
    let (rover, _bus) = rover();
    assert!(matches!(
        rover.sender("").await,
        Err(RoverError::InvalidArgument(_))
    ));
    assert!(matches!(
        rover.receiver("", None).await,
        Err(RoverError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn stop_reports_stats_and_closes() {
    let (rover, bus) = rover();
    let receiver = rover.receiver("echo", None).await.unwrap();
    receiver.on_request(|command| ready(command.payload().clone()));
    let sender = rover.sender("echo").await.unwrap();
    sender.request_one(&1).await.unwrap();

    let stats = sender.stop().await.unwrap();
    assert_eq!((stats.sent, stats.dispatched, stats.misses), (1, 1, 0));
    assert_eq!(bus.subscriber_count("echo::response"), 0);

    receiver.stop().await.unwrap();
    assert_eq!(bus.subscriber_count("echo::command"), 0);
}
