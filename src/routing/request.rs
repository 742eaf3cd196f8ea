//! Per-pending-placement request state.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use fulcrum_protocol::{RouteRequest, SlotId};

/// State carried by one pending placement request while it waits for a
/// slot: blocked-slot filtering, the retry budget, and wait-time tracking.
#[derive(Debug, Clone)]
pub struct PlayerRequestContext {
    request: RouteRequest,
    created_at: Instant,
    /// Slot the player currently occupies, when reconnecting.
    current_slot: Option<SlotId>,
    /// Lowercased blocked slot ids; comparison is case-insensitive.
    blocked: HashSet<String>,
    retries: u32,
    last_enqueued_at: Option<Instant>,
}

impl PlayerRequestContext {
    pub fn new(request: RouteRequest) -> Self {
        let blocked = request
            .blocked_slots
            .iter()
            .map(|slot| slot.0.to_ascii_lowercase())
            .collect();
        Self {
            request,
            created_at: Instant::now(),
            current_slot: None,
            blocked,
            retries: 0,
            last_enqueued_at: None,
        }
    }

    pub fn with_current_slot(mut self, slot: Option<SlotId>) -> Self {
        self.current_slot = slot;
        self
    }

    pub fn request(&self) -> &RouteRequest {
        &self.request
    }

    pub fn player(&self) -> &str {
        &self.request.player
    }

    pub fn family(&self) -> &str {
        &self.request.family
    }

    pub fn preferred_slot(&self) -> Option<&SlotId> {
        self.request.preferred_slot.as_ref()
    }

    pub fn current_slot(&self) -> Option<&SlotId> {
        self.current_slot.as_ref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether `slot` is blocked for this player. A rejoin request bypasses
    /// the block for exactly the preferred slot, so a player can return to
    /// the slot they came from; every other blocked slot stays blocked.
    pub fn is_blocked_slot(&self, slot: &SlotId) -> bool {
        if self.request.rejoin {
            if let Some(preferred) = &self.request.preferred_slot {
                if preferred.matches(slot) {
                    return false;
                }
            }
        }
        self.blocked.contains(&slot.0.to_ascii_lowercase())
    }

    /// True once the request has been pending for at least `threshold`.
    pub fn has_exceeded_wait(&self, threshold: Duration) -> bool {
        self.created_at.elapsed() >= threshold
    }

    /// Count one more attempt. Returns whether budget remains; once it
    /// does not, the caller must fail the request instead of looping.
    pub fn register_retry(&mut self, max_retries: u32) -> bool {
        self.retries += 1;
        self.retries <= max_retries
    }

    /// Record the most recent time this request entered a waiting queue.
    pub fn mark_enqueued(&mut self) {
        self.last_enqueued_at = Some(Instant::now());
    }

    pub fn last_enqueued_at(&self) -> Option<Instant> {
        self.last_enqueued_at
    }
}
