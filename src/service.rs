//! The registry service: wires the allocator, registries, slot manager,
//! and route evaluator behind the message bus.
//!
//! Inbound envelopes arrive through [`MessageHandler::handle`] on bounded
//! worker tasks; every mutation is persisted through the store before the
//! corresponding event is published. The service is a constructed instance
//! — tests build one over the memory backend with a collecting publisher.

use std::sync::Arc;

use async_trait::async_trait;
use fulcrum_protocol::{
    channels, BusMessage, Envelope, EntityId, HeartbeatReport, ProxyId, ProxyRegistration,
    RegisteredProxy, RegisteredServer, RegistrationState, RouteFailure, RouteOutcome,
    RouteRequest, ServerId, ServerRegistration, SlotId,
};
use parking_lot::Mutex;
use registry_store::{SlotStore, StoreBundle, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventPublisher, MessageHandler};
use crate::config::RegistryConfig;
use crate::core::registry::FleetRegistry;
use crate::core::{CapacityChange, HeartbeatMonitor, IdAllocator, ProxyRegistry, ServerRegistry, SlotManager};
use crate::core::registry::HeartbeatEffect;
use crate::error::{RegistryError, RegistryResult};
use crate::now_ms;
use crate::observability::metrics;
use crate::routing::{Placement, PlayerRequestContext, RouteEvaluator};

pub struct RegistryService {
    config: RegistryConfig,
    allocator: Arc<IdAllocator>,
    servers: Arc<ServerRegistry>,
    proxies: Arc<ProxyRegistry>,
    slots: Arc<SlotManager>,
    evaluator: RouteEvaluator,
    publisher: Arc<dyn EventPublisher>,
    /// Requeued placement requests awaiting the next evaluation pass,
    /// keyed by their originating correlation id.
    pending: Mutex<Vec<(Uuid, PlayerRequestContext)>>,
}

impl RegistryService {
    pub fn new(
        config: RegistryConfig,
        store: StoreBundle,
        publisher: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        let allocator = Arc::new(IdAllocator::new(Arc::clone(&store.ids)));
        let servers = Arc::new(FleetRegistry::new(Arc::clone(&store.servers)));
        let proxies = Arc::new(FleetRegistry::new(Arc::clone(&store.proxies)));
        let slots = Arc::new(SlotManager::new(
            Arc::clone(&store.slots),
            Arc::clone(&allocator),
        ));
        let evaluator = RouteEvaluator::new(store.slots, config.route.clone());
        Arc::new(Self {
            config,
            allocator,
            servers,
            proxies,
            slots,
            evaluator,
            publisher,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn allocator(&self) -> &Arc<IdAllocator> {
        &self.allocator
    }

    /// Start the heartbeat monitor over this service.
    pub fn monitor(self: &Arc<Self>, cancel: tokio_util::sync::CancellationToken) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Arc::clone(self), cancel)
    }

    /// Rehydrate both registries from the store. Persisted states are
    /// restored verbatim; capacity counters already live in the store and
    /// are not re-seeded.
    pub async fn restore(&self) -> RegistryResult<()> {
        let (servers_active, servers_parked) = self.servers.restore().await?;
        let (proxies_active, proxies_parked) = self.proxies.restore().await?;
        info!(
            servers_active,
            servers_parked, proxies_active, proxies_parked, "Registry restored from store"
        );
        metrics::set_active_servers(servers_active);
        metrics::set_active_proxies(proxies_active);
        Ok(())
    }

    fn envelope(&self, payload: BusMessage) -> Envelope {
        Envelope::new(&self.config.identity, payload)
    }

    async fn publish(&self, channel: &str, payload: BusMessage) -> RegistryResult<()> {
        self.publisher.publish(channel, &self.envelope(payload)).await
    }

    async fn publish_reply(
        &self,
        origin: &Envelope,
        channel: &str,
        payload: BusMessage,
    ) -> RegistryResult<()> {
        let reply = origin.reply(&self.config.identity, payload);
        self.publisher.publish(channel, &reply).await
    }

    async fn publish_capacity_change(&self, change: &CapacityChange) -> RegistryResult<()> {
        metrics::set_family_remaining(&change.family, &change.server_id.0, change.remaining);
        self.publish(
            channels::EVENTS,
            BusMessage::CapacityChanged {
                server_id: change.server_id.clone(),
                family: change.family.clone(),
                remaining: change.remaining,
                advertising: change.advertising,
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register_server(
        &self,
        origin: &Envelope,
        registration: ServerRegistration,
    ) -> RegistryResult<()> {
        let temp_id = registration.temp_id.clone();
        match self.try_register_server(registration).await {
            Ok((record, opened)) => {
                self.publish_reply(
                    origin,
                    channels::REGISTRATION,
                    BusMessage::RegistrationAccepted {
                        temp_id,
                        assigned: EntityId::Server(record.id.clone()),
                    },
                )
                .await?;
                for slot in opened {
                    self.publish(channels::EVENTS, BusMessage::SlotRegistered(slot))
                        .await?;
                }
                for (family, declared) in &record.capacity {
                    self.publish_capacity_change(&CapacityChange {
                        server_id: record.id.clone(),
                        family: family.clone(),
                        remaining: *declared,
                        advertising: *declared > 0,
                    })
                    .await?;
                }
                metrics::set_active_servers(self.servers.len());
                Ok(())
            }
            Err(e) => {
                warn!(%temp_id, error = %e, "Server registration rejected");
                self.publish_reply(
                    origin,
                    channels::REGISTRATION,
                    BusMessage::RegistrationRejected {
                        temp_id,
                        reason: e.to_string(),
                    },
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn try_register_server(
        &self,
        registration: ServerRegistration,
    ) -> RegistryResult<(RegisteredServer, Vec<fulcrum_protocol::LogicalSlot>)> {
        if registration.server_type.is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "empty server type".into(),
            ));
        }
        let address = format!("{}:{}", registration.host, registration.port);
        if let Some(existing) = self.servers.id_for_address(&address).await? {
            return Err(RegistryError::AlreadyRegistered {
                address,
                id: existing,
            });
        }

        let id = match &registration.known_id {
            Some(known) => {
                self.allocator.claim_server_id(known).await?;
                known.clone()
            }
            None => {
                self.allocator
                    .allocate_server_id(&registration.server_type)
                    .await?
            }
        };

        let record = RegisteredServer {
            id,
            host: registration.host,
            port: registration.port,
            capacity: registration.capacity,
            status: Default::default(),
            state: RegistrationState::Pending,
            last_heartbeat_ms: now_ms(),
            unavailable_since_ms: None,
            temp_id: Some(registration.temp_id),
        };
        self.servers.insert_active(record.clone()).await?;
        let opened = self.slots.register_server(&record).await?;
        info!(id = %record.id, "Server registered");
        Ok((record, opened))
    }

    pub async fn register_proxy(
        &self,
        origin: &Envelope,
        registration: ProxyRegistration,
    ) -> RegistryResult<()> {
        let temp_id = registration.temp_id.clone();
        match self.try_register_proxy(registration).await {
            Ok(record) => {
                self.publish_reply(
                    origin,
                    channels::REGISTRATION,
                    BusMessage::RegistrationAccepted {
                        temp_id,
                        assigned: EntityId::Proxy(record.id.clone()),
                    },
                )
                .await?;
                metrics::set_active_proxies(self.proxies.len());
                Ok(())
            }
            Err(e) => {
                warn!(%temp_id, error = %e, "Proxy registration rejected");
                self.publish_reply(
                    origin,
                    channels::REGISTRATION,
                    BusMessage::RegistrationRejected {
                        temp_id,
                        reason: e.to_string(),
                    },
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn try_register_proxy(
        &self,
        registration: ProxyRegistration,
    ) -> RegistryResult<RegisteredProxy> {
        let id = self.allocator.allocate_proxy_id().await?;
        let record = RegisteredProxy {
            id,
            host: registration.host,
            port: registration.port,
            status: Default::default(),
            state: RegistrationState::Pending,
            last_heartbeat_ms: now_ms(),
            unavailable_since_ms: None,
            temp_id: Some(registration.temp_id),
        };
        self.proxies.insert_active(record.clone()).await?;
        info!(id = %record.id, "Proxy registered");
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Heartbeats and lifecycle
    // ------------------------------------------------------------------

    pub async fn heartbeat(&self, report: HeartbeatReport) -> RegistryResult<()> {
        let now = now_ms();
        match &report.entity {
            EntityId::Server(id) => {
                let (record, effect) = self.servers.heartbeat(&id.0, now).await?;
                if effect == HeartbeatEffect::Recovered {
                    // Parking withdrew the server's slots and counters;
                    // returning to service re-seeds them.
                    let opened = self.slots.register_server(&record).await?;
                    for slot in opened {
                        self.publish(channels::EVENTS, BusMessage::SlotRegistered(slot))
                            .await?;
                    }
                    for (family, declared) in &record.capacity {
                        self.publish_capacity_change(&CapacityChange {
                            server_id: record.id.clone(),
                            family: family.clone(),
                            remaining: *declared,
                            advertising: *declared > 0,
                        })
                        .await?;
                    }
                }
            }
            EntityId::Proxy(id) => {
                self.proxies.heartbeat(&id.0, now).await?;
            }
        }
        Ok(())
    }

    /// Graceful shutdown announced by the entity itself — a deliberate
    /// release, unlike raw connection loss.
    pub async fn shutdown_entity(&self, entity: &EntityId) -> RegistryResult<()> {
        match entity {
            EntityId::Server(id) => self.release_server(id).await,
            EntityId::Proxy(id) => self.release_proxy(id, true).await,
        }
    }

    /// Release a server: frees its capacity, slots, record, and number.
    pub async fn release_server(&self, id: &ServerId) -> RegistryResult<()> {
        let record = self.servers.release(&id.0).await?;
        self.slots.withdraw_server(&record).await?;
        self.allocator.release_server_id(id).await?;
        metrics::entity_released();
        metrics::set_active_servers(self.servers.len());
        self.publish(
            channels::EVENTS,
            BusMessage::EntityReleased {
                entity: EntityId::Server(id.clone()),
            },
        )
        .await
    }

    /// Release a proxy. The number only returns to the recycle pool here —
    /// never on disconnect — and an actively registered proxy is refused
    /// unless `force` is set.
    pub async fn release_proxy(&self, id: &ProxyId, force: bool) -> RegistryResult<()> {
        let record = self
            .proxies
            .get(&id.0)
            .ok_or_else(|| RegistryError::UnknownEntity(id.0.clone()))?;
        if record.state == RegistrationState::Active && !force {
            return Err(RegistryError::StillActive(id.0.clone()));
        }
        self.proxies.release(&id.0).await?;
        self.allocator.release_proxy_id(id).await?;
        metrics::entity_released();
        metrics::set_active_proxies(self.proxies.len());
        self.publish(
            channels::EVENTS,
            BusMessage::EntityReleased {
                entity: EntityId::Proxy(id.clone()),
            },
        )
        .await
    }

    /// Park a server that failed heartbeat checks, withdrawing its
    /// advertised capacity while it sits in the reclaim window.
    async fn park_server(&self, id: &ServerId, now: u64) -> RegistryResult<()> {
        let record = self.servers.mark_unavailable(&id.0, now).await?;
        self.slots.withdraw_server(&record).await?;
        metrics::entity_parked();
        metrics::set_active_servers(self.servers.len());
        self.publish(
            channels::EVENTS,
            BusMessage::EntityUnavailable {
                entity: EntityId::Server(id.clone()),
            },
        )
        .await
    }

    async fn park_proxy(&self, id: &ProxyId, now: u64) -> RegistryResult<()> {
        self.proxies.mark_unavailable(&id.0, now).await?;
        metrics::entity_parked();
        metrics::set_active_proxies(self.proxies.len());
        self.publish(
            channels::EVENTS,
            BusMessage::EntityUnavailable {
                entity: EntityId::Proxy(id.clone()),
            },
        )
        .await
    }

    /// One pass of the staleness and reclaim timers. Driven by the
    /// heartbeat monitor.
    pub async fn sweep(&self, now: u64) -> RegistryResult<()> {
        let stale_cutoff = now.saturating_sub(self.config.heartbeat.timeout_ms());
        for record in self.servers.stale(stale_cutoff) {
            match record.state {
                // Never heartbeated: the registration is withdrawn whole.
                RegistrationState::Pending => self.release_server(&record.id).await?,
                _ => self.park_server(&record.id, now).await?,
            }
        }
        for record in self.proxies.stale(stale_cutoff) {
            match record.state {
                RegistrationState::Pending => {
                    // Withdrawn before first heartbeat; the number is NOT
                    // recycled — only the explicit release path frees it.
                    self.proxies.release(&record.id.0).await?;
                    metrics::set_active_proxies(self.proxies.len());
                }
                _ => self.park_proxy(&record.id, now).await?,
            }
        }

        let reclaim_cutoff = now.saturating_sub(self.config.heartbeat.reclaim_window_ms());
        for record in self.servers.reclaimable(reclaim_cutoff) {
            info!(id = %record.id, "Reclaiming server past the retention window");
            self.release_server(&record.id).await?;
        }
        for record in self.proxies.reclaimable(reclaim_cutoff) {
            // Confirmed dead for the whole window: this is the deliberate
            // release decision that recycles the proxy number.
            info!(id = %record.id, "Reclaiming proxy past the retention window");
            self.release_proxy(&record.id, false).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub async fn route(&self, origin: &Envelope, request: RouteRequest) -> RegistryResult<()> {
        let current = self
            .slots
            .store()
            .player_slot(&request.player)
            .await?;
        let ctx = PlayerRequestContext::new(request).with_current_slot(current);
        self.drive_route(origin.correlation_id, ctx).await
    }

    /// Run one evaluation pass and publish its outcome. Requeued requests
    /// are parked for the next pump.
    async fn drive_route(
        &self,
        correlation_id: Uuid,
        mut ctx: PlayerRequestContext,
    ) -> RegistryResult<()> {
        let player = ctx.player().to_string();
        let outcome = match self.evaluator.evaluate(&mut ctx).await? {
            Placement::Assigned {
                slot,
                reservation,
                remaining,
            } => {
                self.publish_capacity_change(&CapacityChange {
                    server_id: slot.server_id.clone(),
                    family: slot.family.clone(),
                    remaining,
                    advertising: remaining > 0,
                })
                .await?;
                RouteOutcome::Assigned {
                    slot_id: slot.id,
                    server_id: slot.server_id,
                    reservation,
                }
            }
            Placement::Requeued { retries } => {
                self.pending.lock().push((correlation_id, ctx));
                RouteOutcome::Requeued { retries }
            }
            Placement::Failed { reason } => RouteOutcome::Failed { reason },
        };

        let reply = Envelope {
            correlation_id,
            sender: self.config.identity.clone(),
            payload: BusMessage::RouteResponse { player, outcome },
        };
        self.publisher.publish(channels::ROUTE, &reply).await
    }

    /// Re-evaluate every parked request. Driven on the requeue interval by
    /// the heartbeat monitor task.
    pub async fn pump_pending(&self) -> RegistryResult<()> {
        let parked = std::mem::take(&mut *self.pending.lock());
        for (correlation_id, ctx) in parked {
            self.drive_route(correlation_id, ctx).await?;
        }
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    async fn confirm_route(
        &self,
        origin: &Envelope,
        player: &str,
        slot_id: &SlotId,
        reservation: Uuid,
    ) -> RegistryResult<()> {
        match self
            .slots
            .store()
            .consume_reservation(player, &reservation.to_string(), slot_id)
            .await
        {
            Ok(()) => {
                debug!(%player, slot = %slot_id, "Reservation consumed");
                self.publish_reply(
                    origin,
                    channels::EVENTS,
                    BusMessage::RouteConfirmed {
                        player: player.to_string(),
                        slot_id: slot_id.clone(),
                    },
                )
                .await
            }
            Err(e @ (StoreError::ReservationExpired { .. }
            | StoreError::ReservationMismatch { .. }
            | StoreError::ReservationLocked { .. })) => {
                let reason = match &e {
                    StoreError::ReservationMismatch { .. } => RouteFailure::ReservationMismatch,
                    _ => RouteFailure::ReservationExpired,
                };
                warn!(%player, slot = %slot_id, error = %e, "Reservation rejected");
                self.publish_reply(
                    origin,
                    channels::ROUTE,
                    BusMessage::RouteResponse {
                        player: player.to_string(),
                        outcome: RouteOutcome::Failed { reason },
                    },
                )
                .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_inner(&self, channel: &str, envelope: Envelope) -> RegistryResult<()> {
        match envelope.payload.clone() {
            BusMessage::RegisterServer(registration) => {
                self.register_server(&envelope, registration).await
            }
            BusMessage::RegisterProxy(registration) => {
                self.register_proxy(&envelope, registration).await
            }
            BusMessage::Heartbeat(report) => self.heartbeat(report).await,
            BusMessage::Shutdown { entity } => self.shutdown_entity(&entity).await,
            BusMessage::RouteRequest(request) => self.route(&envelope, request).await,
            BusMessage::RouteConfirm {
                player,
                slot_id,
                reservation,
            } => {
                self.confirm_route(&envelope, &player, &slot_id, reservation)
                    .await
            }
            BusMessage::SlotRegistered(slot) => {
                // Externally announced slot (a game server opening an
                // extra instance); persist it as-is.
                self.slots.store_slot(&slot).await
            }
            BusMessage::SlotRemoved { slot_id } => {
                if let Some(change) = self.slots.remove_slot(&slot_id).await? {
                    self.publish_capacity_change(&change).await?;
                }
                Ok(())
            }
            other => {
                debug!(channel, payload = ?other, "Ignoring bus message");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RegistryService {
    async fn handle(&self, channel: &str, envelope: Envelope) {
        let correlation_id = envelope.correlation_id;
        if let Err(e) = self.handle_inner(channel, envelope).await {
            // Typed allocation/capacity failures were already answered on
            // the bus; everything else is logged and the entity keeps its
            // prior state. Store connectivity failures fail closed.
            warn!(channel, %correlation_id, error = %e, "Message handling failed");
        }
    }
}
