//! `rate()`/`cron()`/`at()` schedule-expression grammar and the registrar's
//! end-to-end create/pause/resume/delete cycle against an in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use relay_core::config::Stage;
use relay_core::message::{Message, MessageType};
use relay_core::persistence::{InMemoryStore, Store};
use relay_core::schedule::{FakeScheduleBackend, Registrar, RateUnit, ScheduleExpression, ScheduleStatus};
use serde_json::Value;

fn create_message(extra: &[(&str, &str)]) -> Message {
    let mut arguments = HashMap::new();
    arguments.insert("action".to_string(), Value::String("create".to_string()));
    for (k, v) in extra {
        arguments.insert(k.to_string(), Value::String(v.to_string()));
    }
    Message::new(Stage::Dev, MessageType::ScheduleCreation, "integration-test", HashMap::new(), arguments)
}

#[test]
fn rate_expression_accepts_plural_and_singular_units() {
    assert_eq!(
        ScheduleExpression::parse("rate(1 day)").unwrap(),
        ScheduleExpression::Rate { amount: 1, unit: RateUnit::Day }
    );
    assert_eq!(
        ScheduleExpression::parse("rate(15 minutes)").unwrap(),
        ScheduleExpression::Rate { amount: 15, unit: RateUnit::Minute }
    );
}

#[test]
fn cron_expression_requires_all_six_fields_in_order() {
    let parsed = ScheduleExpression::parse("cron(0 9 * * ? *)").unwrap();
    match parsed {
        ScheduleExpression::Cron { minute, hour, .. } => {
            assert_eq!(minute, "0");
            assert_eq!(hour, "9");
        }
        _ => panic!("expected a Cron variant"),
    }
}

#[test]
fn at_expression_requires_rfc3339() {
    assert!(ScheduleExpression::parse("at(2026-06-01T12:00:00Z)").is_ok());
    assert!(ScheduleExpression::parse("at(not-a-timestamp)").is_err());
}

#[test]
fn garbage_input_matches_no_grammar_arm() {
    assert!(ScheduleExpression::parse("whenever").is_err());
    assert!(ScheduleExpression::parse("rate(five minutes)").is_err());
}

#[tokio::test]
async fn create_registers_against_the_external_backend_and_persists_active() {
    let store = Arc::new(InMemoryStore::new());
    let backend = Arc::new(FakeScheduleBackend::default());
    let registrar = Registrar::new(store.clone(), backend.clone());

    let create = create_message(&[
        ("name", "Nightly Reservation Sweep"),
        ("schedule_expression", "rate(1 day)"),
        ("target_type", "web_action"),
        ("timezone", "America/Los_Angeles"),
    ]);
    registrar.handle(&create, Utc::now()).await.unwrap();

    assert_eq!(backend.created.lock().await.len(), 1);
    assert!(backend.created.lock().await[0].starts_with("NightlyReservationSweep"));
}

#[tokio::test]
async fn pause_then_resume_round_trips_through_the_backend() {
    let store = Arc::new(InMemoryStore::new());
    let backend = Arc::new(FakeScheduleBackend::default());
    let registrar = Registrar::new(store.clone(), backend.clone());

    let now = Utc::now();
    let schedule = relay_core::schedule::Schedule {
        id: "sched_integration_test".to_string(),
        name: "Nightly Reservation Sweep".to_string(),
        description: None,
        schedule_expression: "rate(1 day)".to_string(),
        timezone: "UTC".to_string(),
        target_type: relay_core::schedule::ScheduleTargetType::WebAction,
        target_topic_arn: String::new(),
        payload: "{}".to_string(),
        eventbridge_arn: Some("arn:fake:schedule:nightly-sweep".to_string()),
        eventbridge_name: Some("nightly-sweep".to_string()),
        status: ScheduleStatus::Active,
        created_by: "integration-test".to_string(),
        created_date: now,
        updated_date: now,
        last_triggered: None,
        execution_count: 0,
        error_message: None,
        stage: Stage::Dev,
    };
    store.put_schedule(&schedule).await.unwrap();

    let mut pause_args = HashMap::new();
    pause_args.insert("action".to_string(), Value::String("pause".to_string()));
    pause_args.insert("schedule_id".to_string(), Value::String(schedule.id.clone()));
    let pause = Message::new(Stage::Dev, MessageType::ScheduleCreation, "integration-test", HashMap::new(), pause_args);
    registrar.handle(&pause, now).await.unwrap();
    assert_eq!(
        store.get_schedule(&schedule.id).await.unwrap().unwrap().status,
        ScheduleStatus::Paused
    );

    let mut resume_args = HashMap::new();
    resume_args.insert("action".to_string(), Value::String("resume".to_string()));
    resume_args.insert("schedule_id".to_string(), Value::String(schedule.id.clone()));
    let resume = Message::new(Stage::Dev, MessageType::ScheduleCreation, "integration-test", HashMap::new(), resume_args);
    registrar.handle(&resume, now).await.unwrap();
    assert_eq!(
        store.get_schedule(&schedule.id).await.unwrap().unwrap().status,
        ScheduleStatus::Active
    );
}

#[tokio::test]
async fn create_with_bad_grammar_fails_before_touching_the_backend() {
    let store = Arc::new(InMemoryStore::new());
    let backend = Arc::new(FakeScheduleBackend::default());
    let registrar = Registrar::new(store, backend.clone());

    let create = create_message(&[
        ("name", "Broken Schedule"),
        ("schedule_expression", "whenever I feel like it"),
        ("target_type", "web_action"),
    ]);

    assert!(registrar.handle(&create, Utc::now()).await.is_err());
    assert!(backend.created.lock().await.is_empty());
}
