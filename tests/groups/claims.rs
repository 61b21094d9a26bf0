//! Claim lifetime and claim-store failures.

use std::time::Duration;

use red_rover::{Envelope, RoverError};
use serde_json::json;

use crate::support::{count, eventually, members, rover, settle};

#[tokio::test(start_paused = true)]
async fn claims_expire_after_their_ttl() {
    let (rover, claims) = rover();
    let coordinator = rover.coordinator();

    assert!(coordinator.claim("workers", "m-1").await.unwrap());
    assert!(!coordinator.claim("workers", "m-1").await.unwrap());
    assert_eq!(claims.len(), 1);

    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(!coordinator.claim("workers", "m-1").await.unwrap());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(coordinator.claim("workers", "m-1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn redelivered_id_is_processed_again_only_after_expiry() {
    let (rover, _claims) = rover();
    let (_members, inbox) = members(&rover, Some("workers"), 2, "jobs").await;
    let publisher = rover.publisher().await.unwrap();
    let envelope = Envelope::new(json!("job"));

    publisher.publish_envelope("jobs", &envelope).await.unwrap();
    eventually("the first delivery", || count(&inbox) == 1).await;

    publisher.publish_envelope("jobs", &envelope).await.unwrap();
    settle().await;
    assert_eq!(count(&inbox), 1);

    tokio::time::advance(Duration::from_secs(301)).await;
    publisher.publish_envelope("jobs", &envelope).await.unwrap();
    eventually("the redelivery", || count(&inbox) == 2).await;
}

#[tokio::test]
async fn claim_store_failure_skips_grouped_handlers_only() {
    let (rover, claims) = rover();
    let mut grouped = rover.subscriber(Some("workers")).await.unwrap();
    let mut errors = grouped.take_errors().unwrap();
    let grouped_inbox = crate::support::Inbox::default();
    {
        let sink = grouped_inbox.clone();
        grouped.on(move |m| sink.lock().unwrap().push(m.clone()));
    }
    grouped.subscribe("jobs").await.unwrap();
    let (_loose, ungrouped) = members(&rover, None, 1, "jobs").await;

    claims.fail_with("connection refused");
    let publisher = rover.publisher().await.unwrap();
    let id = publisher.publish("jobs", &1).await.unwrap();

    match errors.recv().await.unwrap() {
        RoverError::ClaimStoreFailure { key, .. } => assert_eq!(key, format!("workers:{}", id)),
        other => panic!("unexpected error {:?}", other),
    }
    eventually("the ungrouped delivery", || count(&ungrouped) == 1).await;
    settle().await;
    assert_eq!(count(&grouped_inbox), 0);

    claims.recover();
    publisher.publish("jobs", &2).await.unwrap();
    eventually("delivery after recovery", || count(&grouped_inbox) == 1).await;
}
