//! Publishing and dispatch on channels and patterns.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use red_rover::{Bus, OnceState, RoverError, SubscriptionState};
use serde_json::{json, Value};

use crate::support::{count, eventually, inbox, rover, settle};

#[tokio::test]
async fn receives_events() {
    let (rover, _bus) = rover();
    let subscriber = rover.subscriber(None).await.unwrap();
    let received = inbox(&subscriber);

    assert_eq!(subscriber.subscribe("events").await.unwrap(), 1);
    assert_eq!(
        subscriber.state("events"),
        Some(SubscriptionState::Subscribed)
    );

    let publisher = rover.publisher().await.unwrap();
    let id = publisher
        .publish("events", &json!({ "foo": "bar" }))
        .await
        .unwrap();

    eventually("the event", || count(&received) == 1).await;
    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.channel, "events");
    assert_eq!(message.pattern, None);
    assert_eq!(message.envelope.id(), id);
    assert_eq!(message.envelope.payload()["foo"], "bar");
}

#[tokio::test]
async fn publish_without_payload_still_carries_an_id() {
    let (rover, _bus) = rover();
    let subscriber = rover.subscriber(None).await.unwrap();
    let received = inbox(&subscriber);
    subscriber.subscribe("events").await.unwrap();

    let id = rover
        .publisher()
        .await
        .unwrap()
        .publish("events", &())
        .await
        .unwrap();

    eventually("the event", || count(&received) == 1).await;
    let message = received.lock().unwrap()[0].clone();
    assert!(!id.is_empty());
    assert_eq!(message.envelope.id(), id);
    assert_eq!(message.envelope.payload(), &Value::Null);
}

#[tokio::test]
async fn every_ungrouped_subscriber_receives() {
    let (rover, _bus) = rover();
    let first = rover.subscriber(None).await.unwrap();
    let second = rover.subscriber(None).await.unwrap();
    let first_inbox = inbox(&first);
    let second_inbox = inbox(&second);
    first.subscribe("events").await.unwrap();
    second.subscribe("events").await.unwrap();

    let publisher = rover.publisher().await.unwrap();
    publisher.publish("events", &1).await.unwrap();
    publisher.publish("events", &2).await.unwrap();

    eventually("both subscribers", || {
        count(&first_inbox) == 2 && count(&second_inbox) == 2
    })
    .await;
    let order: Vec<Value> = first_inbox
        .lock()
        .unwrap()
        .iter()
        .map(|m| m.envelope.payload().clone())
        .collect();
    assert_eq!(order, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn handlers_run_in_registration_order() {
    let (rover, _bus) = rover();
    let subscriber = rover.subscriber(None).await.unwrap();
    let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let calls = calls.clone();
        subscriber.on(move |_| calls.lock().unwrap().push(name));
    }
    subscriber.subscribe("events").await.unwrap();

    rover
        .publisher()
        .await
        .unwrap()
        .publish("events", &"hi")
        .await
        .unwrap();

    eventually("both handlers", || calls.lock().unwrap().len() == 2).await;
    assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(subscriber.delivered(), 1);
}

#[tokio::test]
async fn patterns_scope_deliveries() {
    let (rover, _bus) = rover();
    let subscriber = rover.subscriber(None).await.unwrap();
    let received = inbox(&subscriber);
    assert_eq!(subscriber.psubscribe("orders.*").await.unwrap(), 1);

    let publisher = rover.publisher().await.unwrap();
    publisher.publish("users.created", &1).await.unwrap();
    publisher.publish("orders.created", &2).await.unwrap();

    eventually("the order event", || count(&received) == 1).await;
    settle().await;
    assert_eq!(count(&received), 1);

    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.channel, "orders.created");
    assert_eq!(message.pattern.as_deref(), Some("orders.*"));
    assert_eq!(message.envelope.payload(), &json!(2));
}

#[tokio::test]
async fn malformed_messages_are_isolated() {
    let (rover, bus) = rover();
    let mut subscriber = rover.subscriber(None).await.unwrap();
    let mut errors = subscriber.take_errors().unwrap();
    let received = inbox(&subscriber);
    subscriber.subscribe("events").await.unwrap();

    let (raw, _) = bus.connect().await.unwrap();
    raw.publish("events", b"definitely not json").await.unwrap();
    raw.publish("events", br#"{"msg":"no id"}"#).await.unwrap();
    rover
        .publisher()
        .await
        .unwrap()
        .publish("events", &"fine")
        .await
        .unwrap();

    for _ in 0..2 {
        let err = errors.recv().await.unwrap();
        assert!(matches!(
            err,
            RoverError::MalformedEnvelope { ref channel, .. } if channel == "events"
        ));
    }
    eventually("the valid event", || count(&received) == 1).await;
    assert_eq!(
        received.lock().unwrap()[0].envelope.payload(),
        &json!("fine")
    );
}

#[tokio::test]
async fn empty_channel_is_rejected() {
    let (rover, bus) = rover();
    let subscriber = rover.subscriber(None).await.unwrap();

    assert!(matches!(
        subscriber.subscribe("").await,
        Err(RoverError::InvalidArgument(_))
    ));
    assert!(matches!(
        rover.publisher().await.unwrap().publish("", &1).await,
        Err(RoverError::InvalidArgument(_))
    ));
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn once_subscriber_fires_a_single_time() {
    let (rover, _bus) = rover();
    let subscriber = rover.subscriber_once(None).await.unwrap();
    let received = inbox(&subscriber);
    subscriber.subscribe("events").await.unwrap();

    let publisher = rover.publisher().await.unwrap();
    publisher.publish("events", &"first").await.unwrap();
    publisher.publish("events", &"second").await.unwrap();

    eventually("the first event", || count(&received) == 1).await;
    settle().await;
    assert_eq!(count(&received), 1);
    assert_eq!(subscriber.once_state(), OnceState::Satisfied);
    assert_eq!(
        received.lock().unwrap()[0].envelope.payload(),
        &json!("first")
    );
}

#[tokio::test]
async fn once_helper_resolves_and_cleans_up() {
    let (rover, bus) = rover();

    let waiting = {
        let rover = rover.clone();
        tokio::spawn(async move { rover.once("ready").await })
    };
    eventually("the once subscription", || bus.subscriber_count("ready") == 1).await;

    let publisher = rover.publisher().await.unwrap();
    publisher.publish("ready", &json!({ "n": 1 })).await.unwrap();
    publisher.publish("ready", &json!({ "n": 2 })).await.unwrap();

    let envelope = waiting.await.unwrap().unwrap();
    assert_eq!(envelope.payload()["n"], 1);
    assert_eq!(bus.subscriber_count("ready"), 0);
}

#[tokio::test]
async fn handler_panic_stops_the_subscriber() {
    let (rover, _bus) = rover();
    let mut subscriber = rover.subscriber(None).await.unwrap();
    let mut errors = subscriber.take_errors().unwrap();
    let received = inbox(&subscriber);
    subscriber.on(|message| {
        if message.envelope.payload() == &json!("boom") {
            panic!("handler failed on boom");
        }
    });
    subscriber.subscribe("events").await.unwrap();

    let publisher = rover.publisher().await.unwrap();
    publisher.publish("events", &json!("boom")).await.unwrap();

    let error = errors.recv().await.unwrap();
    assert!(matches!(
        error,
        RoverError::HandlerPanicked { ref channel } if channel == "events"
    ));
    assert!(subscriber.is_stopped());
    assert_eq!(subscriber.state("events"), None);
    assert!(matches!(
        subscriber.subscribe("events").await,
        Err(RoverError::Closed(_))
    ));

    let closed = AssertUnwindSafe(subscriber.closed()).catch_unwind().await;
    let panic = closed.unwrap_err();
    assert_eq!(panic.downcast_ref::<&str>(), Some(&"handler failed on boom"));
    assert_eq!(count(&received), 1);
}
