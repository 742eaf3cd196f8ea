//! Route evaluation: pick a slot for a pending placement request.
//!
//! Candidate selection filters the family's advertised slots through the
//! request's blocked set, orders them (preferred slot first on rejoins,
//! then fewest online players, then slot id — a total order), and attempts
//! an atomic capacity reservation on each until one wins. Losing every
//! candidate costs one retry; an exhausted budget or wait threshold fails
//! the request.

use std::collections::HashSet;
use std::sync::Arc;

use fulcrum_protocol::{LogicalSlot, RouteFailure};
use registry_store::{CapacityReservation, SlotStore};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::RouteConfig;
use crate::error::RegistryResult;
use crate::observability::metrics;
use crate::routing::PlayerRequestContext;

/// Decision for one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Capacity reserved; the player should connect to `slot`.
    Assigned {
        slot: LogicalSlot,
        reservation: Uuid,
        /// Family units left on the slot's server after this reservation.
        remaining: u32,
    },
    /// No candidate won this pass but budget remains; re-enqueue.
    Requeued { retries: u32 },
    /// The request is over; reason says why.
    Failed { reason: RouteFailure },
}

pub struct RouteEvaluator {
    slots: Arc<dyn SlotStore>,
    config: RouteConfig,
}

impl RouteEvaluator {
    pub fn new(slots: Arc<dyn SlotStore>, config: RouteConfig) -> Self {
        Self { slots, config }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Run one evaluation pass for a pending request.
    #[instrument(skip(self, ctx), fields(player = %ctx.player(), family = %ctx.family()))]
    pub async fn evaluate(&self, ctx: &mut PlayerRequestContext) -> RegistryResult<Placement> {
        if ctx.has_exceeded_wait(self.config.wait_threshold()) {
            metrics::route_failed("wait_exceeded");
            return Ok(Placement::Failed {
                reason: RouteFailure::WaitExceeded,
            });
        }

        let candidates = self.candidates(ctx).await?;
        if candidates.is_empty() {
            debug!("No eligible slots this pass");
        }

        for slot in candidates {
            match self
                .slots
                .reserve_capacity(&slot.server_id, ctx.family())
                .await?
            {
                CapacityReservation::Reserved { remaining } => {
                    let reservation = Uuid::new_v4();
                    self.slots
                        .create_reservation(
                            ctx.player(),
                            &reservation.to_string(),
                            &slot.id,
                            self.config.reservation_ttl_ms,
                        )
                        .await?;
                    self.slots
                        .reassign_player_slot(ctx.player(), &slot.id)
                        .await?;
                    debug!(slot = %slot.id, remaining, "Reserved slot");
                    metrics::route_assigned();
                    return Ok(Placement::Assigned {
                        slot,
                        reservation,
                        remaining,
                    });
                }
                CapacityReservation::NoCapacity => {
                    // Lost the race on this candidate; try the next one.
                    continue;
                }
            }
        }

        if ctx.register_retry(self.config.max_retries) {
            ctx.mark_enqueued();
            Ok(Placement::Requeued {
                retries: ctx.retries(),
            })
        } else {
            metrics::route_failed("retries_exhausted");
            Ok(Placement::Failed {
                reason: RouteFailure::RetriesExhausted,
            })
        }
    }

    /// Eligible slots for the request, in attempt order.
    async fn candidates(&self, ctx: &PlayerRequestContext) -> RegistryResult<Vec<LogicalSlot>> {
        let advertising: HashSet<String> = self
            .slots
            .advertisers(ctx.family())
            .await?
            .into_iter()
            .map(|id| id.0)
            .collect();

        let mut eligible: Vec<LogicalSlot> = self
            .slots
            .list_slots()
            .await?
            .into_iter()
            .filter(|slot| slot.family == ctx.family())
            .filter(|slot| advertising.contains(&slot.server_id.0))
            .filter(|slot| !ctx.is_blocked_slot(&slot.id))
            .filter(|slot| match (ctx.request().variant.as_deref(), slot.variant.as_deref()) {
                (Some(wanted), Some(offered)) => wanted == offered,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();

        // Fewest online players first, slot id as the tie break; the order
        // is total so concurrent evaluators walk candidates identically.
        eligible.sort_by(|a, b| {
            a.online_players
                .cmp(&b.online_players)
                .then_with(|| a.id.cmp(&b.id))
        });

        // A rejoin goes back to the preferred slot before anything else.
        if ctx.request().rejoin {
            if let Some(preferred) = ctx.preferred_slot() {
                if let Some(at) = eligible.iter().position(|slot| preferred.matches(&slot.id)) {
                    let slot = eligible.remove(at);
                    eligible.insert(0, slot);
                }
            }
        }

        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fulcrum_protocol::{RouteRequest, ServerId, SlotId};
    use registry_store::MemorySlotStore;

    use super::*;

    async fn seed_slot(
        store: &Arc<dyn SlotStore>,
        slot_id: &str,
        server_id: &str,
        online: u32,
        capacity: u32,
    ) {
        store
            .set_capacity(&ServerId::from(server_id), "mini", capacity)
            .await
            .unwrap();
        store
            .store_slot(&LogicalSlot {
                id: SlotId::from(slot_id),
                server_id: ServerId::from(server_id),
                family: "mini".to_string(),
                variant: None,
                max_players: 16,
                online_players: online,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
    }

    fn evaluator(store: &Arc<dyn SlotStore>) -> RouteEvaluator {
        RouteEvaluator::new(Arc::clone(store), RouteConfig::default())
    }

    fn route_request(blocked: &[&str], preferred: Option<&str>, rejoin: bool) -> RouteRequest {
        RouteRequest {
            player: "Notch".to_string(),
            family: "mini".to_string(),
            variant: None,
            preferred_slot: preferred.map(SlotId::from),
            blocked_slots: blocked.iter().map(|s| SlotId::from(*s)).collect(),
            rejoin,
        }
    }

    #[tokio::test]
    async fn picks_least_occupied_slot() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 5, 3).await;
        seed_slot(&store, "mini2A", "mini2", 2, 3).await;

        let mut ctx = PlayerRequestContext::new(route_request(&[], None, false));
        let placement = evaluator(&store).evaluate(&mut ctx).await.unwrap();
        match placement {
            Placement::Assigned { slot, .. } => assert_eq!(slot.id.0, "mini2A"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_slot_is_skipped() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 0, 3).await;
        seed_slot(&store, "mini2A", "mini2", 9, 3).await;

        let mut ctx = PlayerRequestContext::new(route_request(&["mini1A"], None, false));
        let placement = evaluator(&store).evaluate(&mut ctx).await.unwrap();
        match placement {
            Placement::Assigned { slot, .. } => assert_eq!(slot.id.0, "mini2A"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejoin_prefers_blocked_origin_slot() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 9, 3).await;
        seed_slot(&store, "mini2A", "mini2", 0, 3).await;

        let mut ctx =
            PlayerRequestContext::new(route_request(&["mini1A"], Some("mini1A"), true));
        let placement = evaluator(&store).evaluate(&mut ctx).await.unwrap();
        match placement {
            Placement::Assigned { slot, .. } => assert_eq!(slot.id.0, "mini1A"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidates_requeues_until_budget_exhausted() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        let eval = RouteEvaluator::new(
            Arc::clone(&store),
            RouteConfig {
                max_retries: 2,
                ..Default::default()
            },
        );

        let mut ctx = PlayerRequestContext::new(route_request(&[], None, false));
        assert_eq!(
            eval.evaluate(&mut ctx).await.unwrap(),
            Placement::Requeued { retries: 1 }
        );
        assert_eq!(
            eval.evaluate(&mut ctx).await.unwrap(),
            Placement::Requeued { retries: 2 }
        );
        assert_eq!(
            eval.evaluate(&mut ctx).await.unwrap(),
            Placement::Failed {
                reason: RouteFailure::RetriesExhausted
            }
        );
    }

    #[tokio::test]
    async fn wait_threshold_fails_immediately() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 0, 3).await;
        let eval = RouteEvaluator::new(
            Arc::clone(&store),
            RouteConfig {
                wait_threshold_secs: 0,
                ..Default::default()
            },
        );

        let mut ctx = PlayerRequestContext::new(route_request(&[], None, false));
        assert_eq!(
            eval.evaluate(&mut ctx).await.unwrap(),
            Placement::Failed {
                reason: RouteFailure::WaitExceeded
            }
        );
    }

    #[tokio::test]
    async fn exhausted_family_reports_no_candidates() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 0, 1).await;

        // Drain the single unit; the advertiser set is now empty.
        store
            .reserve_capacity(&ServerId::from("mini1"), "mini")
            .await
            .unwrap();

        let mut ctx = PlayerRequestContext::new(route_request(&[], None, false));
        let placement = evaluator(&store).evaluate(&mut ctx).await.unwrap();
        assert_eq!(placement, Placement::Requeued { retries: 1 });
    }

    #[tokio::test]
    async fn variant_filter_applies() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        seed_slot(&store, "mini1A", "mini1", 0, 3).await;
        store
            .store_slot(&LogicalSlot {
                id: SlotId::from("mini1B"),
                server_id: ServerId::from("mini1"),
                family: "mini".to_string(),
                variant: Some("rush".to_string()),
                max_players: 16,
                online_players: 3,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        let mut request = route_request(&[], None, false);
        request.variant = Some("rush".to_string());
        let mut ctx = PlayerRequestContext::new(request);
        let placement = evaluator(&store).evaluate(&mut ctx).await.unwrap();
        match placement {
            Placement::Assigned { slot, .. } => assert_eq!(slot.id.0, "mini1B"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }
}
