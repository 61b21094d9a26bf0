//! Receiver side: handler fan-out, async handlers and response publishing.

use std::future::ready;
use std::time::Duration;

use serde_json::json;

use crate::support::{eventually, len, responses, rover, settle};

#[tokio::test]
async fn every_handler_publishes_its_own_response() {
    let (rover, bus) = rover();
    let receiver = rover.receiver("multi", None).await.unwrap();
    receiver.on_request(|_| ready(json!("a")));
    receiver.on_request(|_| ready(json!("b")));

    let sender = rover.sender("multi").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&(), callback).await.unwrap();

    eventually("both replies", || len(&replies) == 2).await;
    let mut payloads: Vec<_> = replies
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.payload().clone())
        .collect();
    payloads.sort_by_key(|v| v.to_string());
    assert_eq!(payloads, vec![json!("a"), json!("b")]);

    let stats = receiver.stats();
    assert_eq!((stats.handled, stats.responded, stats.publish_failures), (1, 2, 0));
    assert_eq!(bus.published_on("multi::response").len(), 2);
}

#[tokio::test]
async fn slow_handlers_do_not_block_dispatch() {
    let (rover, _bus) = rover();
    let receiver = rover.receiver("work", None).await.unwrap();
    receiver.on_request(|command| async move {
        if command.payload() == "slow" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        command.payload().clone()
    });

    let sender = rover.sender("work").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&"slow", callback).await.unwrap();
    let fast = sender.request_one(&"fast").await.unwrap();

    assert_eq!(fast.payload(), &json!("fast"));
    assert_eq!(len(&replies), 0);
    eventually("the slow reply", || len(&replies) == 1).await;
}

#[tokio::test]
async fn commands_without_handlers_get_no_response() {
    let (rover, bus) = rover();
    let receiver = rover.receiver("silent", None).await.unwrap();
    let sender = rover.sender("silent").await.unwrap();
    let (replies, callback) = responses();
    sender.request(&"anyone?", callback).await.unwrap();

    eventually("the command", || receiver.stats().handled == 1).await;
    settle().await;
    assert_eq!(len(&replies), 0);
    assert!(bus.published_on("silent::response").is_empty());
}

#[tokio::test]
async fn receiver_reports_its_group() {
    let (rover, _bus) = rover();
    let grouped = rover.receiver("t", Some("g")).await.unwrap();
    let loose = rover.receiver("t", None).await.unwrap();
    assert_eq!(grouped.group(), Some("g"));
    assert_eq!(loose.group(), None);
    assert_eq!(grouped.topic(), "t");
}
