//! Bus-level routing flows: placement, capacity drain, requeue, and the
//! reservation confirm handshake.

use std::collections::HashMap;
use std::sync::Arc;

use fulcrum_protocol::{
    channels, BusMessage, Envelope, RouteFailure, RouteOutcome, RouteRequest, ServerRegistration,
    SlotId,
};
use registry::bus::{CollectingPublisher, MessageHandler};
use registry::config::RegistryConfig;
use registry::RegistryService;
use registry_store::{create_store, StoreBackend, StoreFactoryConfig};
use uuid::Uuid;

async fn service_with_server(
    capacity: u32,
    config: RegistryConfig,
) -> (Arc<RegistryService>, Arc<CollectingPublisher>) {
    let store = create_store(StoreFactoryConfig {
        backend: StoreBackend::Memory,
        ..Default::default()
    })
    .expect("memory store");
    let publisher = Arc::new(CollectingPublisher::new());
    let service = RegistryService::new(config, store, publisher.clone());

    service
        .handle(
            channels::REGISTRATION,
            Envelope::new(
                "boot-1",
                BusMessage::RegisterServer(ServerRegistration {
                    temp_id: "boot-1".to_string(),
                    host: "10.0.0.1".to_string(),
                    port: 25601,
                    server_type: "mini".to_string(),
                    capacity: HashMap::from([("mini".to_string(), capacity)]),
                    known_id: None,
                }),
            ),
        )
        .await;
    publisher.take();
    (service, publisher)
}

fn route_msg(player: &str) -> Envelope {
    Envelope::new(
        "fulcrum-proxy-1",
        BusMessage::RouteRequest(RouteRequest {
            player: player.to_string(),
            family: "mini".to_string(),
            variant: None,
            preferred_slot: None,
            blocked_slots: Vec::new(),
            rejoin: false,
        }),
    )
}

fn route_outcomes(publisher: &CollectingPublisher) -> Vec<(String, RouteOutcome)> {
    publisher
        .on_channel(channels::ROUTE)
        .into_iter()
        .filter_map(|envelope| match envelope.payload {
            BusMessage::RouteResponse { player, outcome } => Some((player, outcome)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn players_drain_capacity_in_order() {
    let (service, publisher) = service_with_server(3, RegistryConfig::default()).await;

    for player in ["Alpha", "Bravo", "Charlie"] {
        service.handle(channels::ROUTE, route_msg(player)).await;
    }

    let outcomes = route_outcomes(&publisher);
    assert_eq!(outcomes.len(), 3);
    for (_, outcome) in &outcomes {
        assert!(
            matches!(outcome, RouteOutcome::Assigned { slot_id, .. } if slot_id.0 == "mini1A"),
            "expected assignment to mini1A, got {outcome:?}"
        );
    }

    // Counter crossed zero: the capacity-changed trail ends unadvertised.
    let remaining: Vec<(u32, bool)> = publisher
        .on_channel(channels::EVENTS)
        .into_iter()
        .filter_map(|e| match e.payload {
            BusMessage::CapacityChanged {
                remaining,
                advertising,
                ..
            } => Some((remaining, advertising)),
            _ => None,
        })
        .collect();
    assert_eq!(remaining, vec![(2, true), (1, true), (0, false)]);

    // A fourth player finds no advertised slot and is requeued.
    service.handle(channels::ROUTE, route_msg("Delta")).await;
    let outcomes = route_outcomes(&publisher);
    assert!(
        matches!(
            outcomes.last(),
            Some((player, RouteOutcome::Requeued { retries: 1 })) if player == "Delta"
        ),
        "expected Delta requeued, got {:?}",
        outcomes.last()
    );
    assert_eq!(service.pending_len(), 1);
}

#[tokio::test]
async fn requeued_request_fails_once_budget_is_exhausted() {
    let mut config = RegistryConfig::default();
    config.route.max_retries = 2;
    let (service, publisher) = service_with_server(0, config).await;

    service.handle(channels::ROUTE, route_msg("Echo")).await;
    service.pump_pending().await.unwrap();
    service.pump_pending().await.unwrap();

    let reasons: Vec<RouteOutcome> = route_outcomes(&publisher)
        .into_iter()
        .map(|(_, outcome)| outcome)
        .collect();
    assert_eq!(
        reasons,
        vec![
            RouteOutcome::Requeued { retries: 1 },
            RouteOutcome::Requeued { retries: 2 },
            RouteOutcome::Failed {
                reason: RouteFailure::RetriesExhausted
            },
        ]
    );
    assert_eq!(service.pending_len(), 0);
}

#[tokio::test]
async fn requeue_responses_keep_the_originating_correlation_id() {
    let (service, publisher) = service_with_server(0, RegistryConfig::default()).await;

    let request = route_msg("Foxtrot");
    service.handle(channels::ROUTE, request.clone()).await;
    service.pump_pending().await.unwrap();

    let responses = publisher.on_channel(channels::ROUTE);
    assert_eq!(responses.len(), 2);
    for response in responses {
        assert_eq!(response.correlation_id, request.correlation_id);
    }
}

#[tokio::test]
async fn reservation_confirm_consumes_once_and_rejects_mismatch() {
    let (service, publisher) = service_with_server(2, RegistryConfig::default()).await;

    service.handle(channels::ROUTE, route_msg("Golf")).await;
    let (slot_id, reservation) = match route_outcomes(&publisher).pop() {
        Some((
            _,
            RouteOutcome::Assigned {
                slot_id,
                reservation,
                ..
            },
        )) => (slot_id, reservation),
        other => panic!("expected assignment, got {other:?}"),
    };

    // A wrong token is reported back as a mismatch.
    service
        .handle(
            channels::ROUTE,
            Envelope::new(
                "mini1",
                BusMessage::RouteConfirm {
                    player: "Golf".to_string(),
                    slot_id: slot_id.clone(),
                    reservation: Uuid::new_v4(),
                },
            ),
        )
        .await;
    assert!(matches!(
        route_outcomes(&publisher).last(),
        Some((
            _,
            RouteOutcome::Failed {
                reason: RouteFailure::ReservationMismatch
            }
        ))
    ));

    // The real token consumes and confirms.
    service
        .handle(
            channels::ROUTE,
            Envelope::new(
                "mini1",
                BusMessage::RouteConfirm {
                    player: "Golf".to_string(),
                    slot_id: slot_id.clone(),
                    reservation,
                },
            ),
        )
        .await;
    assert!(publisher.on_channel(channels::EVENTS).iter().any(|e| matches!(
        &e.payload,
        BusMessage::RouteConfirmed { player, .. } if player == "Golf"
    )));

    // Second consume of the same token reports it gone.
    service
        .handle(
            channels::ROUTE,
            Envelope::new(
                "mini1",
                BusMessage::RouteConfirm {
                    player: "Golf".to_string(),
                    slot_id,
                    reservation,
                },
            ),
        )
        .await;
    assert!(matches!(
        route_outcomes(&publisher).last(),
        Some((
            _,
            RouteOutcome::Failed {
                reason: RouteFailure::ReservationExpired
            }
        ))
    ));
}

#[tokio::test]
async fn kicked_player_is_not_bounced_back_to_the_same_slot() {
    let (service, publisher) = service_with_server(3, RegistryConfig::default()).await;

    let request = Envelope::new(
        "fulcrum-proxy-1",
        BusMessage::RouteRequest(RouteRequest {
            player: "Hotel".to_string(),
            family: "mini".to_string(),
            variant: None,
            preferred_slot: None,
            blocked_slots: vec![SlotId::from("mini1A")],
            rejoin: false,
        }),
    );
    service.handle(channels::ROUTE, request).await;

    // The only slot is the one they were kicked from.
    assert!(matches!(
        route_outcomes(&publisher).last(),
        Some((_, RouteOutcome::Requeued { .. }))
    ));
}
