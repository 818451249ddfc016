//! # Synchronization Engine
//!
//! The single-threaded owner of all client state. Everything the rest of
//! the process learns about offers, the ride, or connectivity is a snapshot
//! published by this loop.
//!
//! ```text
//!                  intents (mpsc)                    snapshots (watch)
//!  EngineHandle ─────────────────►┌─────────────┐─────────────────► observers
//!                                 │             │
//!  SessionChannel ─ChannelEvent──►│  SyncEngine │──► SessionHandle (commands)
//!  TopicChannel ───ChannelEvent──►│   (select!  │──► TopicHandle (sub / pub)
//!  task outcomes ────────────────►│    loop)    │──► DispatchApi (REST seed)
//!  health watches ───────────────►│             │──► SessionStore (disk)
//!  sweep timer ──────────────────►└─────────────┘
//! ```
//!
//! One iteration handles exactly one input, then republishes the snapshot
//! if anything changed. The offer board, the ride machine and the arrival
//! detector live inside the task; nothing else can touch them, so none of
//! the usual locking questions arise.
//!
//! Commands are two-phase. The loop applies the optimistic local transition
//! and answers the caller immediately; the network round trip runs on a
//! spawned task whose verdict is fed back into the loop later. Before a
//! verdict is applied it is checked against the state that exists by then:
//! an ack for an offer the sweep already expired, or for a ride the server
//! already cancelled, is recognized as stale and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use drover_core::types::{OfferId, RideId, RideStatus, Worker, WorkerId};
use drover_core::{
    Admission, GeoLocation, GeoPoint, OfferBoard, ProximityDetector, RemoteApply, RideMachine,
    TransitionError, PROXIMITY_RADIUS_METERS,
};

use crate::channel::{ChannelHealth, ChannelKind};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::persist::{SessionState, SessionStore};
use crate::protocol::{topics, ChannelEvent, LocationBroadcast, StatusBroadcast};
use crate::rest::{DispatchApi, RestClient, RestSnapshot};
use crate::session::{CommandVerdict, SessionChannel, SessionHandle, SessionSettings};
use crate::store::{Connectivity, EngineSnapshot, StateStore};
use crate::topic::{TopicChannel, TopicHandle, TopicSettings};

/// How many intents may queue before callers are pushed back.
const INTENT_QUEUE: usize = 64;

/// How many task verdicts may queue before spawned tasks wait.
const OUTCOME_QUEUE: usize = 64;

// =============================================================================
// Intents & Outcomes
// =============================================================================

/// Commands the presentation layer sends into the loop.
pub(crate) enum EngineIntent {
    AcceptOffer {
        offer_id: OfferId,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    RejectOffer {
        offer_id: OfferId,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ConfirmPickup {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    CompleteRide {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SetOnline {
        online: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    AcknowledgeRide {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    ReportLocation {
        location: GeoLocation,
    },
    ClearError,
    Shutdown,
}

/// Verdict of a spawned dispatch call, fed back into the loop.
enum TaskOutcome {
    Accept {
        offer_id: OfferId,
        result: EngineResult<CommandVerdict>,
    },
    Reject {
        offer_id: OfferId,
        result: EngineResult<CommandVerdict>,
    },
    Pickup {
        ride_id: RideId,
        result: EngineResult<CommandVerdict>,
    },
    Complete {
        ride_id: RideId,
        result: EngineResult<CommandVerdict>,
    },
    Status {
        online: bool,
        result: EngineResult<CommandVerdict>,
    },
    Telemetry {
        result: EngineResult<CommandVerdict>,
    },
    Reconcile {
        result: EngineResult<RestSnapshot>,
    },
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Cloneable handle for talking to a running engine.
///
/// Every command resolves with the LOCAL verdict: `Ok` means the engine
/// applied the optimistic transition and is telling the server about it,
/// not that the server agreed. Server disagreement surfaces later through
/// the snapshot (a reverted ride, a `last_error`).
#[derive(Debug, Clone)]
pub struct EngineHandle {
    intents_tx: mpsc::Sender<EngineIntent>,
    snapshots_rx: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    /// Claims an offer. Refused locally while another ride is active or
    /// another accept is still in flight.
    pub async fn accept_offer(&self, offer_id: OfferId) -> EngineResult<()> {
        self.request(|reply| EngineIntent::AcceptOffer { offer_id, reply })
            .await
    }

    /// Declines an offer and removes it from the board.
    pub async fn reject_offer(&self, offer_id: OfferId) -> EngineResult<()> {
        self.request(|reply| EngineIntent::RejectOffer { offer_id, reply })
            .await
    }

    /// Marks the passenger as picked up.
    pub async fn confirm_pickup(&self) -> EngineResult<()> {
        self.request(|reply| EngineIntent::ConfirmPickup { reply })
            .await
    }

    /// Marks the active ride as completed.
    pub async fn complete_ride(&self) -> EngineResult<()> {
        self.request(|reply| EngineIntent::CompleteRide { reply })
            .await
    }

    /// Toggles this worker's availability.
    pub async fn set_online(&self, online: bool) -> EngineResult<()> {
        self.request(|reply| EngineIntent::SetOnline { online, reply })
            .await
    }

    /// Clears a terminal ride once its outcome has been shown.
    pub async fn acknowledge_ride(&self) -> EngineResult<()> {
        self.request(|reply| EngineIntent::AcknowledgeRide { reply })
            .await
    }

    /// Feeds a GPS sample in. Drives arrival detection and telemetry;
    /// never waits for the engine to act on it.
    pub async fn report_location(&self, location: GeoLocation) -> EngineResult<()> {
        self.intents_tx
            .send(EngineIntent::ReportLocation { location })
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Dismisses the sticky `last_error` from the snapshot.
    pub async fn clear_error(&self) -> EngineResult<()> {
        self.intents_tx
            .send(EngineIntent::ClearError)
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots_rx.borrow().clone()
    }

    /// Returns a receiver that observes every snapshot publish.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots_rx.clone()
    }

    /// Asks the engine to stop. Both channels are closed on the way out.
    pub async fn shutdown(&self) {
        let _ = self.intents_tx.send(EngineIntent::Shutdown).await;
    }

    async fn request<F>(&self, make: F) -> EngineResult<()>
    where
        F: FnOnce(oneshot::Sender<EngineResult<()>>) -> EngineIntent,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        reply_rx.await.map_err(|_| EngineError::ShuttingDown)?
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Assembles an engine from a validated config.
///
/// Production use is `EngineBuilder::new(config).spawn()`; the setters exist
/// so an embedder can substitute the REST client or the session file
/// location without touching the channels.
pub struct EngineBuilder {
    config: EngineConfig,
    api: Option<Arc<dyn DispatchApi>>,
    session_store: Option<SessionStore>,
}

impl EngineBuilder {
    /// Starts a builder around the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            api: None,
            session_store: None,
        }
    }

    /// Replaces the REST client used for seeding and reconciliation.
    pub fn with_api(mut self, api: Arc<dyn DispatchApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Replaces the session persistence location.
    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Validates the config, restores the persisted session, spawns both
    /// channel tasks and the engine loop. Must run inside a Tokio runtime.
    pub fn spawn(self) -> EngineResult<EngineHandle> {
        self.config.validate()?;

        let session_store = match self.session_store {
            Some(store) => store,
            None => SessionStore::at_default_path()?,
        };
        let saved = session_store.load_or_default();
        let auth_token = saved
            .auth_token
            .clone()
            .or_else(|| self.config.worker.auth_token.clone());

        let api: Arc<dyn DispatchApi> = match self.api {
            Some(api) => api,
            None => Arc::new(RestClient::new(
                &self.config.endpoints.rest_url,
                self.config.rest_timeout(),
            )?),
        };

        let (session, session_events) = SessionChannel::spawn(SessionSettings {
            url: self.config.endpoints.session_url.clone(),
            worker_id: self.config.worker_id(),
            auth_token: auth_token.clone(),
            connect_timeout: self.config.connect_timeout(),
            ack_timeout: self.config.ack_timeout(),
            ping_interval: self.config.ping_interval(),
            backoff: self.config.backoff_settings(),
            command_queue: self.config.channel.command_queue,
        });

        let (topic, topic_events) = TopicChannel::spawn(TopicSettings {
            url: self.config.endpoints.topic_url.clone(),
            connect_timeout: self.config.connect_timeout(),
            ping_interval: self.config.ping_interval(),
            backoff: self.config.backoff_settings(),
            request_queue: self.config.channel.command_queue,
        });

        Ok(SyncEngine::wire(
            self.config,
            saved,
            auth_token,
            api,
            session_store,
            session,
            session_events,
            topic,
            topic_events,
        ))
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// The state-owning loop. Constructed through [`EngineBuilder`].
pub struct SyncEngine {
    worker_id: WorkerId,
    auth_token: Option<String>,

    board: OfferBoard,
    machine: RideMachine,
    detector: ProximityDetector,
    worker: Option<Worker>,
    online: bool,
    last_error: Option<String>,
    last_location: Option<GeoLocation>,
    last_telemetry: Option<Instant>,
    connectivity: Connectivity,
    subscribed_ride: Option<RideId>,

    telemetry_min_interval: Duration,
    sweep_interval: Duration,

    session: SessionHandle,
    topic: TopicHandle,
    api: Arc<dyn DispatchApi>,
    session_store: SessionStore,
    store: StateStore,

    intents_rx: mpsc::Receiver<EngineIntent>,
    session_events: mpsc::Receiver<ChannelEvent>,
    topic_events: mpsc::Receiver<ChannelEvent>,
    session_health: watch::Receiver<ChannelHealth>,
    topic_health: watch::Receiver<ChannelHealth>,
    outcome_tx: mpsc::Sender<TaskOutcome>,
    outcome_rx: mpsc::Receiver<TaskOutcome>,

    reconcile_inflight: bool,
    session_events_closed: bool,
    topic_events_closed: bool,
    session_health_closed: bool,
    topic_health_closed: bool,
    dirty: bool,
}

impl SyncEngine {
    /// Builds and spawns an engine with production collaborators.
    pub fn spawn(config: EngineConfig) -> EngineResult<EngineHandle> {
        EngineBuilder::new(config).spawn()
    }

    /// Wires an engine around already-built collaborators and spawns it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn wire(
        config: EngineConfig,
        saved: SessionState,
        auth_token: Option<String>,
        api: Arc<dyn DispatchApi>,
        session_store: SessionStore,
        session: SessionHandle,
        session_events: mpsc::Receiver<ChannelEvent>,
        topic: TopicHandle,
        topic_events: mpsc::Receiver<ChannelEvent>,
    ) -> EngineHandle {
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_QUEUE);
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_QUEUE);
        let session_health = session.subscribe_health();
        let topic_health = topic.subscribe_health();

        let machine = RideMachine::resume(saved.active_ride);
        let mut detector = ProximityDetector::new(PROXIMITY_RADIUS_METERS);
        if let Some(target) = machine.active().and_then(|ride| ride.current_target()) {
            detector.retarget(target);
        }

        let online = saved.online;
        let mut worker = saved.worker;
        if let Some(profile) = worker.as_mut() {
            profile.online = online;
        }

        let store = StateStore::new(EngineSnapshot {
            worker: worker.clone(),
            offers: Vec::new(),
            ride: machine.active().cloned(),
            connectivity: Connectivity::default(),
            last_error: None,
        });
        let snapshots_rx = store.subscribe();

        let engine = SyncEngine {
            worker_id: config.worker_id(),
            auth_token,
            board: OfferBoard::new(),
            machine,
            detector,
            worker,
            online,
            last_error: None,
            last_location: None,
            last_telemetry: None,
            connectivity: Connectivity::default(),
            subscribed_ride: None,
            telemetry_min_interval: config.telemetry_min_interval(),
            sweep_interval: config.sweep_interval(),
            session,
            topic,
            api,
            session_store,
            store,
            intents_rx,
            session_events,
            topic_events,
            session_health,
            topic_health,
            outcome_tx,
            outcome_rx,
            reconcile_inflight: false,
            session_events_closed: false,
            topic_events_closed: false,
            session_health_closed: false,
            topic_health_closed: false,
            dirty: false,
        };

        tokio::spawn(engine.run());

        EngineHandle {
            intents_tx,
            snapshots_rx,
        }
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    async fn run(mut self) {
        info!(worker = %self.worker_id, "Sync engine started");

        // Offers for this worker arrive on a per-worker topic; the ride
        // topic is joined and left as rides come and go.
        if let Err(e) = self.topic.subscribe(topics::worker_offers(self.worker_id)).await {
            warn!(?e, "Could not queue the offer subscription");
        }
        self.sync_ride_subscription().await;

        // Seed from REST; the channels will trigger further passes as they
        // come up.
        self.start_reconcile();

        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                intent = self.intents_rx.recv() => {
                    match intent {
                        Some(EngineIntent::Shutdown) | None => {
                            info!("Sync engine shutting down");
                            break;
                        }
                        Some(intent) => self.handle_intent(intent).await,
                    }
                }

                event = self.session_events.recv(), if !self.session_events_closed => {
                    match event {
                        Some(event) => self.handle_channel_event(ChannelKind::Session, event).await,
                        None => self.session_events_closed = true,
                    }
                }

                event = self.topic_events.recv(), if !self.topic_events_closed => {
                    match event {
                        Some(event) => self.handle_channel_event(ChannelKind::Topic, event).await,
                        None => self.topic_events_closed = true,
                    }
                }

                // The engine keeps its own sender, so this arm never closes.
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }

                changed = self.session_health.changed(), if !self.session_health_closed => {
                    match changed {
                        Ok(()) => {
                            let health = *self.session_health.borrow_and_update();
                            self.apply_health(ChannelKind::Session, health);
                        }
                        Err(_) => self.session_health_closed = true,
                    }
                }

                changed = self.topic_health.changed(), if !self.topic_health_closed => {
                    match changed {
                        Ok(()) => {
                            let health = *self.topic_health.borrow_and_update();
                            self.apply_health(ChannelKind::Topic, health);
                        }
                        Err(_) => self.topic_health_closed = true,
                    }
                }

                _ = sweep.tick() => {
                    self.handle_sweep();
                }
            }

            if self.dirty {
                self.publish_snapshot();
                self.dirty = false;
            }
        }

        self.session.shutdown().await;
        self.topic.shutdown().await;
        info!("Sync engine stopped");
    }

    // =========================================================================
    // Intents
    // =========================================================================

    async fn handle_intent(&mut self, intent: EngineIntent) {
        match intent {
            EngineIntent::AcceptOffer { offer_id, reply } => {
                let verdict = self.start_accept(offer_id);
                let _ = reply.send(verdict);
            }
            EngineIntent::RejectOffer { offer_id, reply } => {
                let verdict = self.start_reject(offer_id);
                let _ = reply.send(verdict);
            }
            EngineIntent::ConfirmPickup { reply } => {
                let verdict = self.start_pickup("manual");
                let _ = reply.send(verdict);
            }
            EngineIntent::CompleteRide { reply } => {
                let verdict = self.start_complete("manual");
                let _ = reply.send(verdict);
            }
            EngineIntent::SetOnline { online, reply } => {
                let verdict = self.start_set_online(online);
                let _ = reply.send(verdict);
            }
            EngineIntent::AcknowledgeRide { reply } => {
                let verdict = self.acknowledge_ride().await;
                let _ = reply.send(verdict);
            }
            EngineIntent::ReportLocation { location } => {
                self.handle_location(location);
            }
            EngineIntent::ClearError => {
                if self.last_error.take().is_some() {
                    self.dirty = true;
                }
            }
            // Consumed by the loop before this point.
            EngineIntent::Shutdown => {}
        }
    }

    /// Local admission for an accept: the machine gates first, then the
    /// board. Only when both agree does a command leave the device.
    fn start_accept(&mut self, offer_id: OfferId) -> EngineResult<()> {
        self.machine.ensure_can_accept()?;

        let now = Utc::now();
        let offer = match self.board.get(offer_id) {
            Some(offer) if !offer.is_expired(now) => offer.clone(),
            _ => return Err(TransitionError::OfferUnavailable { offer_id }.into()),
        };

        self.machine.begin_accept(&offer, now)?;
        info!(offer = %offer_id, reward = offer.reward_points, "Accepting offer");

        // The offer stays on the board while the command is in flight; the
        // sweep may still expire it, superseding the accept.
        self.sync_detector();
        self.dispatch_accept(offer_id);
        self.dirty = true;
        self.persist_session();
        Ok(())
    }

    fn start_reject(&mut self, offer_id: OfferId) -> EngineResult<()> {
        if self.machine.pending_accept() == Some(offer_id) {
            return Err(TransitionError::AcceptPending { offer_id }.into());
        }
        let now = Utc::now();
        if self.board.take(offer_id, now).is_none() {
            return Err(TransitionError::OfferUnavailable { offer_id }.into());
        }

        info!(offer = %offer_id, "Rejecting offer");
        self.dispatch_reject(offer_id);
        self.dirty = true;
        Ok(())
    }

    fn start_pickup(&mut self, origin: &'static str) -> EngineResult<()> {
        let now = Utc::now();
        let ride_id = self.machine.begin_pickup(now)?;
        info!(ride = %ride_id, origin, "Confirming pickup");

        self.sync_detector();
        self.dispatch_pickup(ride_id);
        self.dirty = true;
        self.persist_session();
        Ok(())
    }

    fn start_complete(&mut self, origin: &'static str) -> EngineResult<()> {
        let now = Utc::now();
        let ride_id = self.machine.begin_complete(now)?;
        info!(ride = %ride_id, origin, "Completing ride");

        let final_location = self.last_location.as_ref().map(|sample| sample.point);
        self.sync_detector();
        self.dispatch_complete(ride_id, final_location);
        self.dirty = true;
        self.persist_session();
        Ok(())
    }

    fn start_set_online(&mut self, online: bool) -> EngineResult<()> {
        self.online = online;
        if let Some(worker) = self.worker.as_mut() {
            worker.online = online;
        }
        info!(online, "Updating availability");

        self.dispatch_status(online);
        self.broadcast_status(online);
        self.dirty = true;
        self.persist_session();
        Ok(())
    }

    async fn acknowledge_ride(&mut self) -> EngineResult<()> {
        if let Some(ride) = self.machine.acknowledge() {
            info!(ride = %ride.ride_id, status = %ride.status, "Ride outcome acknowledged");
            self.sync_detector();
            self.sync_ride_subscription().await;
            self.dirty = true;
            self.persist_session();
        }
        Ok(())
    }

    fn handle_location(&mut self, location: GeoLocation) {
        self.last_location = Some(location);

        // Arrival checks are disarmed while an accept verdict is pending;
        // the machine would refuse the transition anyway.
        if self.machine.pending_accept().is_none() && self.detector.observe(location.point) {
            match self.machine.active().map(|ride| ride.status) {
                Some(RideStatus::Accepted) => {
                    info!("Arrived at the pickup point");
                    if let Err(e) = self.start_pickup("arrival") {
                        warn!(?e, "Arrival pickup refused");
                    }
                }
                Some(RideStatus::PickedUp) => {
                    info!("Arrived at the destination");
                    if let Err(e) = self.start_complete("arrival") {
                        warn!(?e, "Arrival completion refused");
                    }
                }
                _ => {}
            }
        }

        self.maybe_send_telemetry(location);
    }

    fn maybe_send_telemetry(&mut self, location: GeoLocation) {
        let due = self
            .last_telemetry
            .map_or(true, |sent| sent.elapsed() >= self.telemetry_min_interval);
        if !due {
            return;
        }
        self.last_telemetry = Some(Instant::now());

        self.dispatch_telemetry(location);

        let body = LocationBroadcast {
            worker_id: self.worker_id,
            location: location.point,
            recorded_at: location.recorded_at.to_rfc3339(),
        };
        match serde_json::to_value(&body) {
            Ok(data) => self.topic.publish(topics::worker_location(self.worker_id), data),
            Err(e) => debug!(?e, "Could not encode the location broadcast"),
        }
    }

    fn broadcast_status(&self, online: bool) {
        let body = StatusBroadcast {
            worker_id: self.worker_id,
            online,
        };
        match serde_json::to_value(&body) {
            Ok(data) => self.topic.publish(topics::worker_status(self.worker_id), data),
            Err(e) => debug!(?e, "Could not encode the status broadcast"),
        }
    }

    // =========================================================================
    // Channel Events
    // =========================================================================

    async fn handle_channel_event(&mut self, channel: ChannelKind, event: ChannelEvent) {
        let now = Utc::now();
        match event {
            ChannelEvent::Registered { worker } => {
                info!(channel = %channel, "Registration confirmed");
                if let Some(mut profile) = worker {
                    // The server's profile wins, except the availability
                    // flag the driver controls locally.
                    profile.online = self.online;
                    self.worker = Some(profile);
                }
                if self.online {
                    // Reassert presence; the server may have marked this
                    // worker offline during the outage.
                    self.dispatch_status(true);
                }
                self.dirty = true;
                self.persist_session();
            }
            ChannelEvent::OfferCreated(offer) => {
                let offer_id = offer.offer_id;
                match self.board.admit(offer, now) {
                    Admission::Inserted => {
                        info!(channel = %channel, offer = %offer_id, "Offer received");
                        self.dirty = true;
                    }
                    verdict => {
                        debug!(channel = %channel, offer = %offer_id, ?verdict, "Offer not admitted");
                    }
                }
            }
            ChannelEvent::OfferWithdrawn(offer_id) => {
                // Never aborts a pending accept for the same offer: the
                // fill racing back on the other channel may be our own.
                // The ack, or a reconciliation, settles it.
                if self.board.withdraw(offer_id, now) {
                    info!(channel = %channel, offer = %offer_id, "Offer withdrawn");
                    self.dirty = true;
                } else {
                    debug!(channel = %channel, offer = %offer_id, "Withdrawal for an unknown offer");
                }
            }
            ChannelEvent::RideChanged(update) => {
                let ride_id = update.ride_id;
                match self.machine.apply_remote(&update) {
                    RemoteApply::Applied => {
                        info!(channel = %channel, ride = %ride_id, "Ride updated by the server");
                        if self
                            .machine
                            .active()
                            .is_some_and(|ride| ride.status == RideStatus::Cancelled)
                        {
                            warn!(ride = %ride_id, "Ride cancelled by dispatch");
                            self.last_error = Some("ride cancelled by dispatch".to_string());
                        }
                        self.sync_detector();
                        self.sync_ride_subscription().await;
                        self.dirty = true;
                        self.persist_session();
                    }
                    verdict => {
                        debug!(channel = %channel, ride = %ride_id, ?verdict, "Ride update dropped");
                    }
                }
            }
            ChannelEvent::ServerNotice { code, message } => {
                warn!(channel = %channel, code = %code, message = %message, "Server notice");
                self.last_error = Some(message);
                self.dirty = true;
            }
        }
    }

    fn apply_health(&mut self, channel: ChannelKind, health: ChannelHealth) {
        let slot = match channel {
            ChannelKind::Session => &mut self.connectivity.session,
            ChannelKind::Topic => &mut self.connectivity.topic,
        };
        let was_connected = slot.is_connected();
        *slot = health;
        self.dirty = true;

        // Anything could have happened while the channel was down; a fresh
        // seed closes the gap deliveries left.
        if !was_connected && health.is_connected() {
            info!(channel = %channel, "Channel up; reconciling");
            self.start_reconcile();
        }
    }

    // =========================================================================
    // Task Outcomes
    // =========================================================================

    async fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Accept { offer_id, result } => self.finish_accept(offer_id, result).await,
            TaskOutcome::Reject { offer_id, result } => self.finish_reject(offer_id, result),
            TaskOutcome::Pickup { ride_id, result } => self.finish_pickup(ride_id, result),
            TaskOutcome::Complete { ride_id, result } => {
                self.finish_complete(ride_id, result).await
            }
            TaskOutcome::Status { online, result } => self.finish_status(online, result),
            TaskOutcome::Telemetry { result } => {
                if let Err(e) = result {
                    debug!(?e, "Location report not delivered");
                }
            }
            TaskOutcome::Reconcile { result } => self.finish_reconcile(result).await,
        }
    }

    async fn finish_accept(&mut self, offer_id: OfferId, result: EngineResult<CommandVerdict>) {
        // The sweep may have expired the offer and aborted the attempt
        // while the command was in flight; its verdict is then stale.
        if self.machine.pending_accept() != Some(offer_id) {
            debug!(offer = %offer_id, "Dropping verdict for a superseded accept");
            return;
        }

        let now = Utc::now();
        match result {
            Ok(CommandVerdict::Acked(ack)) if ack.success => {
                if let Err(e) = self.machine.resolve_accept(ack.ride.as_ref()) {
                    warn!(?e, "Accept acknowledgement not applicable");
                }
                self.board.take(offer_id, now);
                if let Some(mut profile) = ack.worker {
                    profile.online = self.online;
                    self.worker = Some(profile);
                }
                if let Some(ride) = self.machine.active() {
                    info!(offer = %offer_id, ride = %ride.ride_id, "Accept confirmed");
                }
            }
            Ok(CommandVerdict::Acked(ack)) => {
                let reason = ack
                    .error
                    .unwrap_or_else(|| "offer no longer available".to_string());
                warn!(offer = %offer_id, reason = %reason, "Accept refused");
                self.machine.abort_accept();
                self.board.withdraw(offer_id, now);
                self.last_error = Some(reason);
            }
            Ok(CommandVerdict::AssumedDelivered) => {
                info!(offer = %offer_id, "Accept unacknowledged; keeping the provisional ride");
                if let Err(e) = self.machine.resolve_accept(None) {
                    warn!(?e, "Accept resolution not applicable");
                }
                self.board.take(offer_id, now);
                // The server may have bound a different ride id, or given
                // the offer away. Only a fresh seed can tell.
                self.start_reconcile();
            }
            Err(e) => {
                warn!(offer = %offer_id, ?e, "Accept could not be sent");
                self.machine.abort_accept();
                self.last_error = Some(e.to_string());
            }
        }

        self.sync_detector();
        self.sync_ride_subscription().await;
        self.dirty = true;
        self.persist_session();
    }

    fn finish_reject(&mut self, offer_id: OfferId, result: EngineResult<CommandVerdict>) {
        // The local removal stands either way; dispatch times the offer
        // out for this worker on its own if the reject never arrived.
        match result {
            Ok(CommandVerdict::Acked(ack)) if !ack.success => {
                debug!(offer = %offer_id, error = ?ack.error, "Reject refused by the server");
            }
            Ok(_) => {}
            Err(e) => debug!(offer = %offer_id, ?e, "Reject could not be sent"),
        }
    }

    fn finish_pickup(&mut self, ride_id: RideId, result: EngineResult<CommandVerdict>) {
        if self.machine.active().map(|ride| ride.ride_id) != Some(ride_id) {
            debug!(ride = %ride_id, "Dropping verdict for a superseded pickup");
            return;
        }

        match result {
            Ok(CommandVerdict::Acked(ack)) if ack.success => {
                if let Err(e) = self.machine.confirm_pickup(ack.ride.as_ref()) {
                    debug!(?e, "Pickup acknowledgement not applicable anymore");
                    return;
                }
                info!(ride = %ride_id, "Pickup confirmed");
                self.sync_detector();
            }
            Ok(CommandVerdict::Acked(ack)) => {
                let reason = ack.error.unwrap_or_else(|| "pickup rejected".to_string());
                warn!(ride = %ride_id, reason = %reason, "Pickup refused");
                if self.machine.revert_pickup().is_ok() {
                    self.last_error = Some(reason);
                }
                // No automatic retry after a refusal; the driver confirms
                // by hand once the disagreement is sorted out.
                self.detector.clear_target();
            }
            Ok(CommandVerdict::AssumedDelivered) => {
                info!(ride = %ride_id, "Pickup unacknowledged; optimistic state stands");
                if let Err(e) = self.machine.confirm_pickup(None) {
                    debug!(?e, "Pickup acknowledgement not applicable anymore");
                    return;
                }
                self.sync_detector();
            }
            Err(e) => {
                warn!(ride = %ride_id, ?e, "Pickup could not be sent");
                if self.machine.revert_pickup().is_ok() {
                    self.last_error = Some(e.to_string());
                }
                self.detector.clear_target();
            }
        }

        self.dirty = true;
        self.persist_session();
    }

    async fn finish_complete(&mut self, ride_id: RideId, result: EngineResult<CommandVerdict>) {
        if self.machine.active().map(|ride| ride.ride_id) != Some(ride_id) {
            debug!(ride = %ride_id, "Dropping verdict for a superseded completion");
            return;
        }

        match result {
            Ok(CommandVerdict::Acked(ack)) if ack.success => {
                match self.machine.confirm_complete(ack.awarded_points) {
                    Ok(credited) => {
                        info!(ride = %ride_id, credited, "Ride completed");
                        if let Some(mut profile) = ack.worker {
                            // Completion acks that carry the profile are
                            // authoritative for the balance.
                            profile.online = self.online;
                            self.worker = Some(profile);
                        } else if let Some(worker) = self.worker.as_mut() {
                            worker.credit_points(credited);
                        }
                    }
                    Err(e) => {
                        debug!(?e, "Completion acknowledgement not applicable anymore");
                        return;
                    }
                }
            }
            Ok(CommandVerdict::Acked(ack)) => {
                let reason = ack
                    .error
                    .unwrap_or_else(|| "completion rejected".to_string());
                warn!(ride = %ride_id, reason = %reason, "Completion refused");
                if self.machine.revert_complete().is_ok() {
                    self.last_error = Some(reason);
                }
                self.detector.clear_target();
            }
            Ok(CommandVerdict::AssumedDelivered) => match self.machine.confirm_complete(None) {
                Ok(credited) => {
                    info!(ride = %ride_id, credited, "Completion unacknowledged; crediting the estimate");
                    if let Some(worker) = self.worker.as_mut() {
                        worker.credit_points(credited);
                    }
                    // The authoritative award arrives with the next seed.
                    self.start_reconcile();
                }
                Err(e) => {
                    debug!(?e, "Completion acknowledgement not applicable anymore");
                    return;
                }
            },
            Err(e) => {
                warn!(ride = %ride_id, ?e, "Completion could not be sent");
                if self.machine.revert_complete().is_ok() {
                    self.last_error = Some(e.to_string());
                }
                self.detector.clear_target();
            }
        }

        self.sync_ride_subscription().await;
        self.dirty = true;
        self.persist_session();
    }

    fn finish_status(&mut self, online: bool, result: EngineResult<CommandVerdict>) {
        // A newer toggle has already replaced this one.
        if self.online != online {
            debug!("Dropping verdict for a superseded status change");
            return;
        }

        match result {
            Ok(CommandVerdict::Acked(ack)) if !ack.success => {
                let reason = ack
                    .error
                    .unwrap_or_else(|| "status change rejected".to_string());
                warn!(online, reason = %reason, "Status change refused");
                self.online = !online;
                if let Some(worker) = self.worker.as_mut() {
                    worker.online = self.online;
                }
                self.last_error = Some(reason);
                self.dirty = true;
                self.persist_session();
            }
            Ok(_) => debug!(online, "Status change settled"),
            Err(e) => debug!(online, ?e, "Status change not confirmed"),
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    fn start_reconcile(&mut self) {
        if self.reconcile_inflight {
            debug!("Reconciliation already in flight");
            return;
        }
        self.reconcile_inflight = true;

        let api = self.api.clone();
        let worker_id = self.worker_id;
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_snapshot(worker_id).await;
            let _ = outcome_tx.send(TaskOutcome::Reconcile { result }).await;
        });
    }

    async fn finish_reconcile(&mut self, result: EngineResult<RestSnapshot>) {
        self.reconcile_inflight = false;

        let seed = match result {
            Ok(seed) => seed,
            Err(e) => {
                warn!(?e, "Reconciliation fetch failed");
                return;
            }
        };

        let now = Utc::now();
        let mut admitted = 0;
        for offer in seed.offers {
            if matches!(self.board.admit(offer, now), Admission::Inserted) {
                admitted += 1;
            }
        }

        if self.machine.pending_accept().is_some() {
            // An accept verdict is in flight; this REST record predates it
            // and must not fight the ack that is about to land.
            debug!("Skipping ride reconciliation while an accept is pending");
        } else {
            match seed.ride {
                Some(ride) => {
                    info!(ride = %ride.ride_id, status = %ride.status, "Adopting the server's ride record");
                    self.machine.adopt(ride);
                }
                None => {
                    if let Some(dropped) = self.machine.adopt_none() {
                        warn!(ride = %dropped.ride_id, "Server reports no active ride; dropping the local one");
                    }
                }
            }
            self.sync_detector();
            self.sync_ride_subscription().await;
            self.persist_session();
        }

        debug!(admitted, "Reconciliation pass finished");
        self.dirty = true;
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    fn handle_sweep(&mut self) {
        let now = Utc::now();
        let expired = self.board.sweep(now);
        for offer_id in &expired {
            info!(offer = %offer_id, "Offer expired");
        }

        // Expiry supersedes an in-flight accept; the late verdict will be
        // recognized as stale and dropped.
        if let Some(pending) = self.machine.pending_accept() {
            if expired.contains(&pending) {
                warn!(offer = %pending, "Offer expired while its accept was in flight");
                self.machine.abort_accept();
                self.last_error = Some("offer expired".to_string());
                self.sync_detector();
                self.persist_session();
            }
        }

        // Republish while offers are pending so countdowns stay live.
        if !expired.is_empty() || !self.board.is_empty() {
            self.dirty = true;
        }
    }

    /// Points the arrival detector at whatever the active ride needs next,
    /// or disarms it when there is nothing to drive to.
    fn sync_detector(&mut self) {
        match self.machine.active().and_then(|ride| ride.current_target()) {
            Some(target) => self.detector.retarget(target),
            None => self.detector.clear_target(),
        }
    }

    /// Follows the active ride with a `rides/{id}/events` subscription.
    ///
    /// While an accept is pending the ride id is provisional, so the
    /// subscription waits for the verdict.
    async fn sync_ride_subscription(&mut self) {
        let desired = match self.machine.pending_accept() {
            Some(_) => None,
            None => self
                .machine
                .active()
                .filter(|ride| !ride.is_terminal())
                .map(|ride| ride.ride_id),
        };

        if desired == self.subscribed_ride {
            return;
        }

        if let Some(old) = self.subscribed_ride.take() {
            if let Err(e) = self.topic.unsubscribe(topics::ride_events(old)).await {
                debug!(?e, "Ride unsubscribe dropped");
            }
        }
        if let Some(new) = desired {
            match self.topic.subscribe(topics::ride_events(new)).await {
                Ok(()) => self.subscribed_ride = Some(new),
                Err(e) => debug!(?e, "Ride subscribe dropped"),
            }
        }
    }

    fn publish_snapshot(&self) {
        let now = Utc::now();
        let mut worker = self.worker.clone();
        if let Some(profile) = worker.as_mut() {
            profile.online = self.online;
        }
        self.store.publish(EngineSnapshot {
            worker,
            offers: self.board.views(now),
            ride: self.machine.active().cloned(),
            connectivity: self.connectivity,
            last_error: self.last_error.clone(),
        });
    }

    fn persist_session(&self) {
        let mut worker = self.worker.clone();
        if let Some(profile) = worker.as_mut() {
            profile.online = self.online;
        }
        let state = SessionState {
            auth_token: self.auth_token.clone(),
            worker,
            active_ride: self.machine.active().cloned(),
            online: self.online,
        };
        if let Err(e) = self.session_store.save(&state) {
            warn!(?e, "Could not persist the session");
        }
    }

    // =========================================================================
    // Command Dispatch
    // =========================================================================

    fn dispatch_accept(&self, offer_id: OfferId) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.accept_offer(offer_id).await;
            let _ = outcome_tx.send(TaskOutcome::Accept { offer_id, result }).await;
        });
    }

    fn dispatch_reject(&self, offer_id: OfferId) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.reject_offer(offer_id).await;
            let _ = outcome_tx.send(TaskOutcome::Reject { offer_id, result }).await;
        });
    }

    fn dispatch_pickup(&self, ride_id: RideId) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.confirm_pickup(ride_id).await;
            let _ = outcome_tx.send(TaskOutcome::Pickup { ride_id, result }).await;
        });
    }

    fn dispatch_complete(&self, ride_id: RideId, final_location: Option<GeoPoint>) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.complete_ride(ride_id, final_location).await;
            let _ = outcome_tx
                .send(TaskOutcome::Complete { ride_id, result })
                .await;
        });
    }

    fn dispatch_status(&self, online: bool) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.update_status(online).await;
            let _ = outcome_tx.send(TaskOutcome::Status { online, result }).await;
        });
    }

    fn dispatch_telemetry(&self, location: GeoLocation) {
        let session = self.session.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = session.update_location(&location).await;
            let _ = outcome_tx.send(TaskOutcome::Telemetry { result }).await;
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
