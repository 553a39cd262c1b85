//! End-to-end message lifecycle against the in-memory store: create ->
//! queued -> processing -> completed, plus the redelivery no-op path every
//! consumer binary relies on.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::config::Stage;
use relay_core::message::{Message, MessageStatus, MessageType};
use relay_core::persistence::{ConditionalUpdateOutcome, InMemoryStore, Store};

fn new_message() -> Message {
    Message::new(
        Stage::Dev,
        MessageType::HelloWorld,
        "integration-test",
        HashMap::new(),
        HashMap::new(),
    )
}

#[tokio::test]
async fn full_lifecycle_reaches_completed() {
    let store = InMemoryStore::new();
    let message = new_message();
    store.put_message(&message).await.unwrap();

    for (new_status, precondition) in [
        (MessageStatus::Queued, &[MessageStatus::Created][..]),
        (MessageStatus::Processing, &[MessageStatus::Created, MessageStatus::Queued][..]),
        (MessageStatus::Completed, &[MessageStatus::Processing][..]),
    ] {
        let outcome = store
            .update_message_conditional(&message.id, new_status, precondition, None)
            .await
            .unwrap();
        assert!(matches!(outcome, ConditionalUpdateOutcome::Updated(_)));
    }

    let fetched = store.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, MessageStatus::Completed);
}

#[tokio::test]
async fn redelivery_after_completion_is_a_silent_no_op() {
    let store = InMemoryStore::new();
    let message = new_message();
    store.put_message(&message).await.unwrap();

    store
        .update_message_conditional(&message.id, MessageStatus::Processing, &[MessageStatus::Created, MessageStatus::Queued], None)
        .await
        .unwrap();
    store
        .update_message_conditional(&message.id, MessageStatus::Completed, &[MessageStatus::Processing], None)
        .await
        .unwrap();

    // A redelivered message tries the same Processing transition again.
    let redelivered = store
        .update_message_conditional(&message.id, MessageStatus::Processing, &[MessageStatus::Created, MessageStatus::Queued], None)
        .await
        .unwrap();

    assert!(matches!(redelivered, ConditionalUpdateOutcome::AlreadyTransitioned));
    let fetched = store.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, MessageStatus::Completed);
}

#[tokio::test]
async fn failed_transition_carries_the_error_message() {
    let store = InMemoryStore::new();
    let message = new_message();
    store.put_message(&message).await.unwrap();
    store
        .update_message_conditional(&message.id, MessageStatus::Processing, &[MessageStatus::Created, MessageStatus::Queued], None)
        .await
        .unwrap();

    store
        .update_message_conditional(
            &message.id,
            MessageStatus::Failed,
            &[MessageStatus::Processing],
            Some("upstream returned 503".to_string()),
        )
        .await
        .unwrap();

    let fetched = store.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, MessageStatus::Failed);
    assert_eq!(fetched.error_message.as_deref(), Some("upstream returned 503"));
}

#[tokio::test]
async fn put_message_is_idempotent_on_same_id() {
    let store = Arc::new(InMemoryStore::new());
    let mut message = new_message();
    message.id = "fixed-id".to_string();

    store.put_message(&message).await.unwrap();
    let mut resent = message.clone();
    resent.payload.insert("duplicate".to_string(), serde_json::Value::Bool(true));
    store.put_message(&resent).await.unwrap();

    let fetched = store.get_message("fixed-id").await.unwrap().unwrap();
    assert!(!fetched.payload.contains_key("duplicate"), "first write wins on a redelivered id");
}
