//! At-most-once consumption and use accounting under concurrent requests.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use sso_ticket_storage::{
    ReadConsistency, StorageBackend,
    testutil::{replicated_backend, replicated_backend_with},
};
use sso_tickets::{
    ExpirationPolicy, Service, Ticket, TicketError, TicketKind, TicketPayload, TicketTypeConfig,
    TicketsConfig, ValidationSpecification,
    testutil::{APP_SERVICE, TestHarness},
};
use tokio::{sync::Barrier, task::JoinSet};

/// Validators racing for the same ticket.
const VALIDATORS: usize = 16;

/// Tickets raced per test.
const ROUNDS: usize = 20;

/// Comfortably longer than the test cluster's replication interval.
const REPLICATION_SETTLE: Duration = Duration::from_millis(100);

fn from_new_login(ticket: &Ticket) -> bool {
    matches!(ticket.payload(), TicketPayload::ServiceTicket { from_new_login: true, .. })
}

/// Fires [`VALIDATORS`] simultaneous service ticket requests on one TGT.
async fn issue_burst<B: StorageBackend + 'static>(
    harness: &Arc<TestHarness<B>>,
) -> Vec<Result<Ticket, TicketError>> {
    let tgt = harness.login().await;
    let barrier = Arc::new(Barrier::new(VALIDATORS));

    let mut set = JoinSet::new();
    for _ in 0..VALIDATORS {
        let harness = Arc::clone(harness);
        let barrier = Arc::clone(&barrier);
        let tgt = tgt.clone();
        set.spawn(async move {
            barrier.wait().await;
            harness.engine.issue_service_ticket(&tgt, &Service::new(APP_SERVICE)).await
        });
    }

    let mut outcomes = Vec::with_capacity(VALIDATORS);
    while let Some(result) = set.join_next().await {
        outcomes.push(result.expect("issuer should not panic"));
    }
    outcomes
}

async fn race<B: StorageBackend + 'static>(harness: Arc<TestHarness<B>>) {
    let tgt = harness.login().await;

    for round in 0..ROUNDS {
        let st = harness.service_ticket(&tgt, APP_SERVICE).await;

        let mut set = JoinSet::new();
        for _ in 0..VALIDATORS {
            let harness = Arc::clone(&harness);
            let st = st.clone();
            set.spawn(async move {
                harness
                    .engine
                    .validate_service_ticket(
                        &st,
                        &Service::new(APP_SERVICE),
                        ValidationSpecification::service(),
                    )
                    .await
            });
        }

        let mut winners = 0;
        while let Some(result) = set.join_next().await {
            match result.expect("validator should not panic") {
                Ok(assertion) => {
                    assert_eq!(assertion.ticket_id, st);
                    winners += 1;
                },
                Err(TicketError::AlreadyConsumed { .. }) => {},
                Err(e) => panic!("round {round}: unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1, "round {round}: expected exactly one successful validation");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_validator_wins_memory() {
    race(Arc::new(TestHarness::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_validator_wins_replicated() {
    let harness =
        TestHarness::on_backend(Arc::new(replicated_backend()), TicketsConfig::default());
    race(Arc::new(harness)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issuance_yields_distinct_tickets() {
    let harness = Arc::new(TestHarness::new());
    let tgt = harness.login().await;

    let mut set = JoinSet::new();
    for _ in 0..VALIDATORS {
        let harness = Arc::clone(&harness);
        let tgt = tgt.clone();
        set.spawn(async move { harness.service_ticket(&tgt, APP_SERVICE).await });
    }

    let mut issued = std::collections::HashSet::new();
    while let Some(result) = set.join_next().await {
        assert!(issued.insert(result.expect("issuer should not panic")), "duplicate ticket id");
    }
    assert_eq!(issued.len(), VALIDATORS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttled_session_admits_one_request_of_a_burst() {
    let config = TicketsConfig::builder()
        .types(
            [(
                TicketKind::TicketGrantingTicket,
                TicketTypeConfig {
                    expiration: ExpirationPolicy::ThrottledRate {
                        min_interval: Duration::from_secs(60),
                        time_to_kill: Duration::from_secs(2 * 60 * 60),
                    },
                    ..TicketTypeConfig::for_kind(TicketKind::TicketGrantingTicket)
                },
            )]
            .into(),
        )
        .build()
        .expect("valid config");
    let harness = Arc::new(TestHarness::with_config(config));

    let mut issued = Vec::new();
    for outcome in issue_burst(&harness).await {
        match outcome {
            Ok(st) => issued.push(st),
            Err(TicketError::ThrottledReplay { .. }) => {},
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(issued.len(), 1, "the minimum interval admits a single use");
    assert!(from_new_login(&issued[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_the_first_use_of_a_session_is_a_new_login() {
    let harness = Arc::new(TestHarness::new());

    let issued: Vec<Ticket> = issue_burst(&harness)
        .await
        .into_iter()
        .map(|outcome| outcome.expect("unthrottled sessions serve every request"))
        .collect();
    assert_eq!(issued.len(), VALIDATORS);
    assert_eq!(issued.iter().filter(|st| from_new_login(st)).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_validator_wins_across_nodes() {
    let first_node = replicated_backend_with(1, ReadConsistency::Eventual, Duration::ZERO);
    let second_node = first_node.for_node(2).expect("node 2 handle");
    let nodes = [
        Arc::new(TestHarness::on_backend(Arc::new(first_node), TicketsConfig::default())),
        Arc::new(TestHarness::on_backend(Arc::new(second_node), TicketsConfig::default())),
    ];
    let tgt = nodes[0].login().await;

    for round in 0..ROUNDS {
        let st = nodes[0].service_ticket(&tgt, APP_SERVICE).await;
        tokio::time::sleep(REPLICATION_SETTLE).await;

        let mut set = JoinSet::new();
        for validator in 0..VALIDATORS {
            let harness = Arc::clone(&nodes[validator % nodes.len()]);
            let st = st.clone();
            set.spawn(async move {
                harness
                    .engine
                    .validate_service_ticket(
                        &st,
                        &Service::new(APP_SERVICE),
                        ValidationSpecification::service(),
                    )
                    .await
            });
        }

        let mut winners = 0;
        while let Some(result) = set.join_next().await {
            match result.expect("validator should not panic") {
                Ok(_) => winners += 1,
                Err(TicketError::AlreadyConsumed { .. }) => {},
                Err(e) => panic!("round {round}: unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1, "round {round}: one validation across both nodes");
    }
}
