//! The engine over a replicated backend: partitions and deadlines.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use sso_ticket_storage::{ReadConsistency, testutil::replicated_backend_with};
use sso_tickets::{
    Service, TicketError, TicketsConfig, ValidationSpecification,
    testutil::{APP_SERVICE, TestHarness, epoch, password_authentication},
};

#[tokio::test]
async fn tickets_validate_from_a_replica_node() {
    let backend = Arc::new(replicated_backend_with(
        1,
        ReadConsistency::Linearizable,
        Duration::ZERO,
    ));
    let harness = TestHarness::on_backend(backend, TicketsConfig::default());
    let tgt = harness.login().await;
    let st = harness.service_ticket(&tgt, APP_SERVICE).await;

    let app = Service::new(APP_SERVICE);
    harness
        .engine
        .validate_service_ticket(&st, &app, ValidationSpecification::service())
        .await
        .expect("validate through the primary");
}

#[tokio::test]
async fn partitioned_node_reports_registry_unavailable() {
    let backend = Arc::new(replicated_backend_with(
        1,
        ReadConsistency::Linearizable,
        Duration::ZERO,
    ));
    let harness = TestHarness::on_backend(Arc::clone(&backend), TicketsConfig::default());
    let tgt = harness.login().await;
    let st = harness.service_ticket(&tgt, APP_SERVICE).await;
    let app = Service::new(APP_SERVICE);

    backend.isolate(1);
    let err = harness
        .engine
        .validate_service_ticket(&st, &app, ValidationSpecification::service())
        .await
        .expect_err("primary unreachable");
    assert!(matches!(err, TicketError::RegistryUnavailable { .. }), "got {err:?}");
    assert!(!err.is_invalid_ticket());

    // The failed attempt consumed nothing.
    backend.rejoin(1);
    harness
        .engine
        .validate_service_ticket(&st, &app, ValidationSpecification::service())
        .await
        .expect("validate after rejoin");
}

#[tokio::test]
async fn slow_storage_times_out_without_partial_state() {
    let backend = Arc::new(replicated_backend_with(
        1,
        ReadConsistency::Linearizable,
        Duration::from_millis(200),
    ));
    let config = TicketsConfig::builder()
        .request_timeout(Duration::from_millis(50))
        .build()
        .expect("valid config");
    let harness = TestHarness::on_backend(Arc::clone(&backend), config);

    let err = harness
        .engine
        .issue_ticket_granting_ticket(password_authentication(epoch()))
        .await
        .expect_err("deadline exceeded");
    assert!(matches!(err, TicketError::Timeout), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let primary = backend.node_store(0).expect("primary node");
    assert!(primary.is_empty(), "timed-out insert must leave nothing behind");
}
