//! # Session Channel Adapter (Channel A)
//!
//! WebSocket client for the dispatch session channel: the only channel that
//! carries commands, and one of two that push ride events.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session Channel                                  │
//! │                                                                         │
//! │  engine ──► SessionHandle::accept_offer(..)                            │
//! │                    │                                                    │
//! │                    │ SessionRequest { requestId, frame, ack oneshot }   │
//! │                    ▼                                                    │
//! │            ┌───────────────┐  register first, then commands            │
//! │            │ channel task  │ ───────────────────────────► dispatch     │
//! │            │  pending acks │ ◄─────────────────────────── server       │
//! │            └───────────────┘  acks, pushes, pings                      │
//! │                    │                                                    │
//! │                    ├── ack in time ──► CommandVerdict::Acked           │
//! │                    ├── no ack ───────► CommandVerdict::AssumedDelivered│
//! │                    └── pushes ───────► ChannelEvent (to the engine)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Lifecycle
//! Reconnects forever with exponential backoff (500 ms doubling to a 60 s
//! cap), resetting after every successful registration. The channel reports
//! `Connected` only once the register handshake is acknowledged; a socket
//! that dials but never registers is treated the same as no socket.
//!
//! ## Command Semantics
//! Commands are queued in a bounded channel and flushed while connected, so
//! a command issued during an outage is delivered after the reconnect. The
//! caller never waits longer than the ack window: with no acknowledgement
//! the verdict is [`CommandVerdict::AssumedDelivered`] and the next
//! reconciliation pass corrects any divergence.

use std::collections::HashMap;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drover_core::geo::{GeoLocation, GeoPoint};
use drover_core::types::{OfferId, RideId, Worker, WorkerId};

use crate::channel::{
    connect_with_timeout, BackoffSettings, ChannelHealth, ChannelState, WsStream,
};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{normalize_session, AckPayload, ChannelEvent, SessionFrame};

// =============================================================================
// Settings
// =============================================================================

/// Session channel parameters, derived from [`crate::config::EngineConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,

    /// Worker this session acts for.
    pub worker_id: WorkerId,

    /// Bearer token sent with the register handshake.
    pub auth_token: Option<String>,

    /// Dial + handshake timeout.
    pub connect_timeout: Duration,

    /// How long a command waits for its ack before resolving optimistically.
    pub ack_timeout: Duration,

    /// Keepalive ping cadence.
    pub ping_interval: Duration,

    /// Reconnect backoff parameters.
    pub backoff: BackoffSettings,

    /// Outbound queue depth while disconnected.
    pub command_queue: usize,
}

// =============================================================================
// Command Verdict
// =============================================================================

/// What a command call resolves to.
#[derive(Debug)]
pub enum CommandVerdict {
    /// The server answered within the ack window.
    Acked(AckPayload),

    /// No answer in time. The command is treated as delivered; the next
    /// reconciliation pass corrects any divergence.
    AssumedDelivered,
}

/// One queued command: the frame plus the oneshot its ack resolves.
pub(crate) struct SessionRequest {
    pub(crate) request_id: Uuid,
    pub(crate) frame: SessionFrame,
    pub(crate) ack: oneshot::Sender<AckPayload>,
}

/// Pending-ack table entry.
struct PendingAck {
    reply: oneshot::Sender<AckPayload>,
    sent_at: Instant,
}

/// Why the connection loop returned.
enum LoopEnd {
    /// Shutdown was requested; do not reconnect.
    Shutdown,

    /// The peer closed or the stream ended; reconnect after backoff.
    ConnectionLost,
}

// =============================================================================
// Session Handle
// =============================================================================

/// Cloneable handle for issuing commands on the session channel.
///
/// All command methods resolve within the ack window, whatever the network
/// is doing; see [`CommandVerdict`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests_tx: mpsc::Sender<SessionRequest>,
    health_rx: watch::Receiver<ChannelHealth>,
    shutdown_tx: mpsc::Sender<()>,
    worker_id: WorkerId,
    ack_timeout: Duration,
}

impl SessionHandle {
    /// Assembles a handle from its parts. Engine tests wire this to a
    /// scripted peer instead of a live socket.
    pub(crate) fn from_parts(
        requests_tx: mpsc::Sender<SessionRequest>,
        health_rx: watch::Receiver<ChannelHealth>,
        shutdown_tx: mpsc::Sender<()>,
        worker_id: WorkerId,
        ack_timeout: Duration,
    ) -> Self {
        SessionHandle {
            requests_tx,
            health_rx,
            shutdown_tx,
            worker_id,
            ack_timeout,
        }
    }

    /// Claims an offer for this worker.
    pub async fn accept_offer(&self, offer_id: OfferId) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(
            request_id,
            SessionFrame::accept_offer(request_id, offer_id, self.worker_id),
        )
        .await
    }

    /// Declines an offer.
    pub async fn reject_offer(&self, offer_id: OfferId) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(
            request_id,
            SessionFrame::reject_offer(request_id, offer_id, self.worker_id),
        )
        .await
    }

    /// Reports the passenger picked up.
    pub async fn confirm_pickup(&self, ride_id: RideId) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(request_id, SessionFrame::confirm_pickup(request_id, ride_id))
            .await
    }

    /// Reports the passenger dropped off.
    pub async fn complete_ride(
        &self,
        ride_id: RideId,
        final_location: Option<GeoPoint>,
    ) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(
            request_id,
            SessionFrame::complete_ride(request_id, ride_id, final_location),
        )
        .await
    }

    /// Reports the worker online or offline.
    pub async fn update_status(&self, online: bool) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(
            request_id,
            SessionFrame::update_status(request_id, self.worker_id, online),
        )
        .await
    }

    /// Reports a position sample.
    pub async fn update_location(&self, location: &GeoLocation) -> EngineResult<CommandVerdict> {
        let request_id = Uuid::new_v4();
        self.call(
            request_id,
            SessionFrame::update_location(request_id, self.worker_id, location),
        )
        .await
    }

    /// Current channel health.
    pub fn health(&self) -> ChannelHealth {
        *self.health_rx.borrow()
    }

    /// Watch receiver for health changes.
    pub fn subscribe_health(&self) -> watch::Receiver<ChannelHealth> {
        self.health_rx.clone()
    }

    /// Asks the channel task to close the socket and stop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Queues one command and waits out the ack window.
    async fn call(&self, request_id: Uuid, frame: SessionFrame) -> EngineResult<CommandVerdict> {
        let command = frame.type_name();
        let (ack_tx, ack_rx) = oneshot::channel();

        self.requests_tx
            .try_send(SessionRequest {
                request_id,
                frame,
                ack: ack_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EngineError::CommandQueueFull,
                mpsc::error::TrySendError::Closed(_) => EngineError::ShuttingDown,
            })?;

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(CommandVerdict::Acked(ack)),
            Ok(Err(_)) => {
                // The channel task dropped the pending entry (reconnect).
                // The frame may or may not have reached the server.
                debug!(command, "Pending command dropped by reconnect; assuming delivered");
                Ok(CommandVerdict::AssumedDelivered)
            }
            Err(_) => {
                debug!(
                    command,
                    request_id = %request_id,
                    "No ack within the window; assuming delivered"
                );
                Ok(CommandVerdict::AssumedDelivered)
            }
        }
    }
}

// =============================================================================
// Session Channel
// =============================================================================

/// Background task owning the session socket.
pub struct SessionChannel {
    settings: SessionSettings,
    requests_rx: mpsc::Receiver<SessionRequest>,
    events_tx: mpsc::Sender<ChannelEvent>,
    shutdown_rx: mpsc::Receiver<()>,
    health_tx: watch::Sender<ChannelHealth>,
    pending: HashMap<Uuid, PendingAck>,
}

impl SessionChannel {
    /// Creates the channel and spawns its background task.
    ///
    /// Returns a handle for issuing commands and a receiver for normalized
    /// inbound events.
    pub fn spawn(settings: SessionSettings) -> (SessionHandle, mpsc::Receiver<ChannelEvent>) {
        let (requests_tx, requests_rx) = mpsc::channel(settings.command_queue);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());

        let handle = SessionHandle {
            requests_tx,
            health_rx,
            shutdown_tx,
            worker_id: settings.worker_id,
            ack_timeout: settings.ack_timeout,
        };

        let channel = SessionChannel {
            settings,
            requests_rx,
            events_tx,
            shutdown_rx,
            health_tx,
            pending: HashMap::new(),
        };

        tokio::spawn(channel.run());

        (handle, events_rx)
    }

    /// Main channel loop: connect, register, serve, back off, repeat.
    async fn run(mut self) {
        info!(url = %self.settings.url, worker = %self.settings.worker_id, "Session channel starting");

        let mut backoff = self.settings.backoff.build();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Session channel received shutdown signal");
                break;
            }

            self.set_state(ChannelState::Connecting);

            match connect_with_timeout(&self.settings.url, self.settings.connect_timeout).await {
                Ok(ws_stream) => {
                    info!("Session socket connected, registering");
                    self.set_state(ChannelState::Registering);

                    let (mut write, mut read) = ws_stream.split();

                    match self.register_handshake(&mut write, &mut read).await {
                        Ok(worker) => {
                            info!(worker = %self.settings.worker_id, "Worker registered");

                            // Reset backoff on successful registration
                            backoff.reset();
                            self.set_state(ChannelState::Connected);

                            if self
                                .events_tx
                                .send(ChannelEvent::Registered { worker })
                                .await
                                .is_err()
                            {
                                info!("Event receiver dropped, session channel exiting");
                                break;
                            }

                            match self.connection_loop(&mut write, &mut read).await {
                                Ok(LoopEnd::Shutdown) => break,
                                Ok(LoopEnd::ConnectionLost) => warn!("Session connection lost"),
                                Err(e) => warn!(?e, "Session connection loop ended"),
                            }
                        }
                        Err(e) => error!(?e, "Registration failed"),
                    }

                    // Acks can no longer arrive for these; callers resolve
                    // optimistically when the senders drop.
                    self.pending.clear();
                }
                Err(e) => {
                    error!(?e, "Failed to connect session channel");
                }
            }

            // Connection lost or failed - enter backoff
            self.set_state(ChannelState::Backoff);
            self.bump_reconnects();

            let Some(duration) = backoff.next_backoff() else {
                // Unreachable with no elapsed-time limit
                error!("Session backoff exhausted");
                break;
            };

            debug!(?duration, "Waiting before session reconnect");

            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    self.set_state(ChannelState::Reconnecting);
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown during session backoff");
                    break;
                }
            }
        }

        self.set_state(ChannelState::Disconnected);
        info!("Session channel stopped");
    }

    /// Sends the register command and waits for its ack.
    ///
    /// The whole handshake is bounded by the connect timeout. Anything the
    /// server pushes before acknowledging registration is dropped; it will
    /// be re-sent or re-fetched once the engine reconciles.
    async fn register_handshake(
        &mut self,
        write: &mut SplitSink<WsStream, WsMessage>,
        read: &mut SplitStream<WsStream>,
    ) -> EngineResult<Option<Worker>> {
        let request_id = Uuid::new_v4();
        let frame = SessionFrame::register(
            request_id,
            self.settings.worker_id,
            self.settings.auth_token.clone(),
        );
        write.send(WsMessage::Text(frame.to_json()?.into())).await?;

        let handshake = async {
            loop {
                let Some(result) = read.next().await else {
                    return Err(EngineError::Disconnected);
                };

                match result? {
                    WsMessage::Text(text) => match SessionFrame::from_json(&text) {
                        Ok(SessionFrame::Ack(ack)) if ack.request_id == request_id => {
                            if ack.success {
                                return Ok(ack.worker);
                            }
                            let reason = ack
                                .error
                                .unwrap_or_else(|| "registration refused".to_string());
                            return Err(EngineError::CommandRejected(reason));
                        }
                        Ok(frame) => {
                            debug!(frame = %frame.type_name(), "Frame before register ack, dropped");
                        }
                        Err(e) => {
                            warn!(?e, "Failed to parse frame during handshake");
                        }
                    },
                    WsMessage::Ping(data) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    WsMessage::Close(frame) => {
                        info!(?frame, "Server closed during handshake");
                        return Err(EngineError::Disconnected);
                    }
                    _ => {}
                }
            }
        };

        match timeout(self.settings.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.settings.connect_timeout.as_secs())),
        }
    }

    /// Serves one registered connection until it drops or shutdown.
    async fn connection_loop(
        &mut self,
        write: &mut SplitSink<WsStream, WsMessage>,
        read: &mut SplitStream<WsStream>,
    ) -> EngineResult<LoopEnd> {
        let mut ping_interval = interval(self.settings.ping_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Dead pending entries are swept once a second; their callers have
        // already resolved optimistically.
        let mut prune_interval = interval(Duration::from_secs(1));
        prune_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Flush queued commands
                Some(request) = self.requests_rx.recv() => {
                    let json = request.frame.to_json()?;
                    debug!(
                        frame = %request.frame.type_name(),
                        request_id = %request.request_id,
                        "Sending command"
                    );
                    self.pending.insert(request.request_id, PendingAck {
                        reply: request.ack,
                        sent_at: Instant::now(),
                    });
                    write.send(WsMessage::Text(json.into())).await?;
                }

                // Handle incoming frames
                next = read.next() => {
                    let Some(result) = next else {
                        info!("Session stream ended");
                        return Ok(LoopEnd::ConnectionLost);
                    };

                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match SessionFrame::from_json(&text) {
                                Ok(SessionFrame::Ack(ack)) => self.resolve_ack(ack),
                                Ok(SessionFrame::Ping { timestamp }) => {
                                    let pong = SessionFrame::pong(&timestamp).to_json()?;
                                    write.send(WsMessage::Text(pong.into())).await?;
                                }
                                Ok(SessionFrame::Pong { .. }) => {
                                    debug!("Received session pong");
                                }
                                Ok(frame) => {
                                    debug!(frame = %frame.type_name(), "Received push");
                                    if let Some(event) = normalize_session(frame) {
                                        if self.events_tx.send(event).await.is_err() {
                                            info!("Event receiver dropped, closing session");
                                            return Ok(LoopEnd::Shutdown);
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(?e, "Failed to parse session frame, dropped");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Session closed by server");
                            return Ok(LoopEnd::ConnectionLost);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Unexpected binary frame on session channel");
                        }
                        Ok(WsMessage::Frame(_)) => {
                            // Raw frame, ignore
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                // Send periodic pings
                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(vec![].into())).await?;
                    debug!("Sent session ping");
                }

                // Sweep the pending-ack table
                _ = prune_interval.tick() => {
                    self.prune_pending();
                }

                // Check for shutdown
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing session");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopEnd::Shutdown);
                }
            }
        }
    }

    /// Resolves one ack against the pending table.
    fn resolve_ack(&mut self, ack: AckPayload) {
        match self.pending.remove(&ack.request_id) {
            Some(pending) => {
                debug!(
                    request_id = %ack.request_id,
                    success = ack.success,
                    elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
                    "Command acknowledged"
                );
                if pending.reply.send(ack).is_err() {
                    // Caller resolved optimistically before the ack landed.
                    debug!("Ack arrived after the caller gave up");
                }
            }
            None => {
                debug!(request_id = %ack.request_id, "Ack for unknown or pruned request");
            }
        }
    }

    /// Drops pending entries past the ack window.
    fn prune_pending(&mut self) {
        let window = self.settings.ack_timeout;
        let before = self.pending.len();
        self.pending.retain(|_, p| p.sent_at.elapsed() <= window);

        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, "Pruned pending commands past the ack window");
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.health_tx.send_modify(|h| h.state = state);
    }

    fn bump_reconnects(&self) {
        self.health_tx.send_modify(|h| h.reconnects += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(
        capacity: usize,
        ack_timeout: Duration,
    ) -> (
        SessionHandle,
        mpsc::Receiver<SessionRequest>,
        watch::Sender<ChannelHealth>,
    ) {
        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);

        let handle = SessionHandle::from_parts(
            requests_tx,
            health_rx,
            shutdown_tx,
            WorkerId::new(42),
            ack_timeout,
        );
        (handle, requests_rx, health_tx)
    }

    fn ack_for(request_id: Uuid, success: bool) -> AckPayload {
        AckPayload {
            request_id,
            success,
            error: None,
            ride: None,
            awarded_points: None,
            worker: None,
        }
    }

    #[tokio::test]
    async fn test_command_resolves_with_ack() {
        let (handle, mut requests_rx, _health) = test_handle(8, Duration::from_secs(3));

        let responder = tokio::spawn(async move {
            let request = requests_rx.recv().await.unwrap();
            assert!(matches!(request.frame, SessionFrame::AcceptOffer(_)));
            request.ack.send(ack_for(request.request_id, true)).unwrap();
        });

        let verdict = handle.accept_offer(OfferId::new(7)).await.unwrap();
        match verdict {
            CommandVerdict::Acked(ack) => assert!(ack.success),
            other => panic!("expected ack, got {other:?}"),
        }
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_assumes_delivered() {
        let (handle, mut requests_rx, _health) = test_handle(8, Duration::from_secs(3));

        // Nothing ever answers; the ack window elapses.
        let verdict = handle.confirm_pickup(RideId::new(101)).await.unwrap();
        assert!(matches!(verdict, CommandVerdict::AssumedDelivered));

        // The command itself was queued for delivery.
        let request = requests_rx.try_recv().unwrap();
        assert!(matches!(request.frame, SessionFrame::ConfirmPickup(_)));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let (handle, _requests_rx, _health) = test_handle(1, Duration::from_millis(50));

        let occupant = handle.clone();
        let first = tokio::spawn(async move { occupant.update_status(true).await });
        tokio::task::yield_now().await;

        let err = handle.update_status(false).await.unwrap_err();
        assert!(matches!(err, EngineError::CommandQueueFull));

        // First command still resolves on its own (optimistically here).
        let verdict = first.await.unwrap().unwrap();
        assert!(matches!(verdict, CommandVerdict::AssumedDelivered));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_shutdown() {
        let (handle, requests_rx, _health) = test_handle(4, Duration::from_millis(50));
        drop(requests_rx);

        let err = handle.accept_offer(OfferId::new(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_failed_ack_carries_reason() {
        let (handle, mut requests_rx, _health) = test_handle(8, Duration::from_secs(3));

        let responder = tokio::spawn(async move {
            let request = requests_rx.recv().await.unwrap();
            let mut ack = ack_for(request.request_id, false);
            ack.error = Some("offer already filled".to_string());
            request.ack.send(ack).unwrap();
        });

        let verdict = handle.accept_offer(OfferId::new(7)).await.unwrap();
        match verdict {
            CommandVerdict::Acked(ack) => {
                assert!(!ack.success);
                assert_eq!(ack.error.as_deref(), Some("offer already filled"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
        responder.await.unwrap();
    }

    #[test]
    fn test_health_snapshot_tracks_watch() {
        let (handle, _requests_rx, health_tx) = test_handle(4, Duration::from_secs(3));
        assert!(!handle.health().is_connected());

        health_tx.send_modify(|h| {
            h.state = ChannelState::Connected;
            h.reconnects = 2;
        });

        assert!(handle.health().is_connected());
        assert_eq!(handle.health().reconnects, 2);
    }
}
