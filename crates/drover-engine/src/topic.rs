//! # Topic Channel Adapter (Channel B)
//!
//! WebSocket client for the broker-style pub/sub channel. Carries the same
//! offer and ride events as the session channel (each event typically
//! arrives on both) plus fire-and-forget telemetry publishes.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Topic Channel                                   │
//! │                                                                         │
//! │  engine ──► TopicHandle::subscribe("workers/42/offers")                │
//! │  engine ──► TopicHandle::publish("workers/42/location", {...})         │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │            ┌────────────────┐  subscribe / publish                     │
//! │            │  channel task  │ ───────────────────────► broker          │
//! │            │  subscription  │ ◄─────────────────────── broker          │
//! │            │  set (replay)  │  event { topic, data }                   │
//! │            └────────────────┘                                          │
//! │                    │                                                    │
//! │                    └── normalize ──► ChannelEvent (to the engine)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Subscription Replay
//! The broker forgets subscriptions on disconnect, so the task remembers
//! every active topic and replays the full set after each reconnect, before
//! reporting `Connected`. Subscribe/unsubscribe requests issued during an
//! outage still mutate the set; only publishes are dropped while offline
//! (telemetry is fire-and-forget by contract).

use std::collections::HashSet;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::channel::{
    connect_with_timeout, BackoffSettings, ChannelHealth, ChannelState, WsStream,
};
use crate::error::{EngineError, EngineResult};
use crate::protocol::{normalize_topic, ChannelEvent, TopicEvent, TopicFrame};

// =============================================================================
// Settings
// =============================================================================

/// Topic channel parameters, derived from [`crate::config::EngineConfig`].
#[derive(Debug, Clone)]
pub struct TopicSettings {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,

    /// Dial timeout.
    pub connect_timeout: Duration,

    /// Keepalive ping cadence.
    pub ping_interval: Duration,

    /// Reconnect backoff parameters.
    pub backoff: BackoffSettings,

    /// Outbound request queue depth.
    pub request_queue: usize,
}

/// Requests the handle forwards to the channel task.
#[derive(Debug)]
pub(crate) enum TopicRequest {
    /// Add a topic to the subscription set.
    Subscribe(String),

    /// Remove a topic from the subscription set.
    Unsubscribe(String),

    /// One-shot telemetry publish.
    Publish {
        topic: String,
        data: serde_json::Value,
    },
}

/// Why the connection loop returned.
enum LoopEnd {
    Shutdown,
    ConnectionLost,
}

// =============================================================================
// Topic Handle
// =============================================================================

/// Cloneable handle for driving the topic channel.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    requests_tx: mpsc::Sender<TopicRequest>,
    health_rx: watch::Receiver<ChannelHealth>,
    shutdown_tx: mpsc::Sender<()>,
}

impl TopicHandle {
    /// Assembles a handle from its parts. Engine tests wire this to a
    /// scripted peer instead of a live socket.
    pub(crate) fn from_parts(
        requests_tx: mpsc::Sender<TopicRequest>,
        health_rx: watch::Receiver<ChannelHealth>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        TopicHandle {
            requests_tx,
            health_rx,
            shutdown_tx,
        }
    }

    /// Adds a topic to the subscription set. Survives reconnects.
    pub async fn subscribe(&self, topic: String) -> EngineResult<()> {
        self.requests_tx
            .send(TopicRequest::Subscribe(topic))
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Removes a topic from the subscription set.
    pub async fn unsubscribe(&self, topic: String) -> EngineResult<()> {
        self.requests_tx
            .send(TopicRequest::Unsubscribe(topic))
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Publishes telemetry. Fire-and-forget: dropped without error when the
    /// queue is full or the channel is going away.
    pub fn publish(&self, topic: String, data: serde_json::Value) {
        if self
            .requests_tx
            .try_send(TopicRequest::Publish { topic, data })
            .is_err()
        {
            debug!("Telemetry publish dropped");
        }
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
}

// =============================================================================
// Topic Channel
// =============================================================================

/// Background task owning the topic socket and the subscription set.
pub struct TopicChannel {
    settings: TopicSettings,
    requests_rx: mpsc::Receiver<TopicRequest>,
    events_tx: mpsc::Sender<ChannelEvent>,
    shutdown_rx: mpsc::Receiver<()>,
    health_tx: watch::Sender<ChannelHealth>,
    subscriptions: HashSet<String>,
}

impl TopicChannel {
    /// Creates the channel and spawns its background task.
    pub fn spawn(settings: TopicSettings) -> (TopicHandle, mpsc::Receiver<ChannelEvent>) {
        let (requests_tx, requests_rx) = mpsc::channel(settings.request_queue);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());

        let handle = TopicHandle {
            requests_tx,
            health_rx,
            shutdown_tx,
        };

        let channel = TopicChannel {
            settings,
            requests_rx,
            events_tx,
            shutdown_rx,
            health_tx,
            subscriptions: HashSet::new(),
        };

        tokio::spawn(channel.run());

        (handle, events_rx)
    }

    /// Main channel loop: connect, replay subscriptions, serve, back off.
    async fn run(mut self) {
        info!(url = %self.settings.url, "Topic channel starting");

        let mut backoff = self.settings.backoff.build();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Topic channel received shutdown signal");
                break;
            }

            self.set_state(ChannelState::Connecting);

            match connect_with_timeout(&self.settings.url, self.settings.connect_timeout).await {
                Ok(ws_stream) => {
                    info!("Topic socket connected");

                    let (mut write, mut read) = ws_stream.split();

                    match self.replay_subscriptions(&mut write).await {
                        Ok(()) => {
                            backoff.reset();
                            self.set_state(ChannelState::Connected);

                            match self.connection_loop(&mut write, &mut read).await {
                                Ok(LoopEnd::Shutdown) => break,
                                Ok(LoopEnd::ConnectionLost) => warn!("Topic connection lost"),
                                Err(e) => warn!(?e, "Topic connection loop ended"),
                            }
                        }
                        Err(e) => error!(?e, "Failed to replay subscriptions"),
                    }
                }
                Err(e) => {
                    error!(?e, "Failed to connect topic channel");
                }
            }

            self.set_state(ChannelState::Backoff);
            self.bump_reconnects();

            let Some(duration) = backoff.next_backoff() else {
                // Unreachable with no elapsed-time limit
                error!("Topic backoff exhausted");
                break;
            };

            debug!(?duration, "Waiting before topic reconnect");

            // Keep the subscription set current while offline; publishes
            // are dropped here, subscriptions replay on reconnect.
            let mut reconnect = false;
            while !reconnect {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        self.set_state(ChannelState::Reconnecting);
                        reconnect = true;
                    }
                    Some(request) = self.requests_rx.recv() => {
                        if let Some(TopicFrame::Publish(_)) = self.apply_request(request) {
                            debug!("Telemetry publish dropped while disconnected");
                        }
                    }
                    _ = self.shutdown_rx.recv() => {
                        info!("Shutdown during topic backoff");
                        self.set_state(ChannelState::Disconnected);
                        info!("Topic channel stopped");
                        return;
                    }
                }
            }
        }

        self.set_state(ChannelState::Disconnected);
        info!("Topic channel stopped");
    }

    /// Re-issues a subscribe for every remembered topic.
    async fn replay_subscriptions(
        &mut self,
        write: &mut SplitSink<WsStream, WsMessage>,
    ) -> EngineResult<()> {
        for topic in &self.subscriptions {
            let frame = TopicFrame::subscribe(topic.clone());
            write.send(WsMessage::Text(frame.to_json()?.into())).await?;
        }

        if !self.subscriptions.is_empty() {
            debug!(
                count = self.subscriptions.len(),
                "Replayed topic subscriptions"
            );
        }
        Ok(())
    }

    /// Serves one connection until it drops or shutdown.
    async fn connection_loop(
        &mut self,
        write: &mut SplitSink<WsStream, WsMessage>,
        read: &mut SplitStream<WsStream>,
    ) -> EngineResult<LoopEnd> {
        let mut ping_interval = interval(self.settings.ping_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Apply and forward handle requests
                Some(request) = self.requests_rx.recv() => {
                    if let Some(frame) = self.apply_request(request) {
                        debug!(frame = %frame.type_name(), "Sending topic frame");
                        write.send(WsMessage::Text(frame.to_json()?.into())).await?;
                    }
                }

                // Handle incoming frames
                next = read.next() => {
                    let Some(result) = next else {
                        info!("Topic stream ended");
                        return Ok(LoopEnd::ConnectionLost);
                    };

                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match TopicFrame::from_json(&text) {
                                Ok(TopicFrame::Event(delivery)) => {
                                    match serde_json::from_value::<TopicEvent>(delivery.data) {
                                        Ok(body) => {
                                            let event = normalize_topic(body);
                                            if self.events_tx.send(event).await.is_err() {
                                                info!("Event receiver dropped, closing topic channel");
                                                return Ok(LoopEnd::Shutdown);
                                            }
                                        }
                                        Err(e) => {
                                            warn!(
                                                ?e,
                                                topic = %delivery.topic,
                                                "Failed to parse topic event body, dropped"
                                            );
                                        }
                                    }
                                }
                                Ok(TopicFrame::Ping { timestamp }) => {
                                    let pong = TopicFrame::pong(&timestamp).to_json()?;
                                    write.send(WsMessage::Text(pong.into())).await?;
                                }
                                Ok(TopicFrame::Pong { .. }) => {
                                    debug!("Received topic pong");
                                }
                                Ok(frame) => {
                                    debug!(frame = %frame.type_name(), "Unexpected topic frame, dropped");
                                }
                                Err(e) => {
                                    warn!(?e, "Failed to parse topic frame, dropped");
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
                            info!(?frame, "Topic channel closed by broker");
                            return Ok(LoopEnd::ConnectionLost);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Unexpected binary frame on topic channel");
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
                    debug!("Sent topic ping");
                }

                // Check for shutdown
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing topic channel");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopEnd::Shutdown);
                }
            }
        }
    }

    /// Mutates the subscription set and returns the frame to send, if any.
    ///
    /// Duplicate subscribes and unknown unsubscribes produce no frame, so
    /// the broker sees each (topic, worker) subscription at most once.
    fn apply_request(&mut self, request: TopicRequest) -> Option<TopicFrame> {
        match request {
            TopicRequest::Subscribe(topic) => {
                if self.subscriptions.insert(topic.clone()) {
                    Some(TopicFrame::subscribe(topic))
                } else {
                    None
                }
            }
            TopicRequest::Unsubscribe(topic) => {
                if self.subscriptions.remove(&topic) {
                    Some(TopicFrame::unsubscribe(topic))
                } else {
                    None
                }
            }
            TopicRequest::Publish { topic, data } => Some(TopicFrame::publish(topic, data)),
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

    fn test_channel() -> TopicChannel {
        let (_requests_tx, requests_rx) = mpsc::channel(8);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (health_tx, _health_rx) = watch::channel(ChannelHealth::default());

        TopicChannel {
            settings: TopicSettings {
                url: "ws://localhost:9101/topics".into(),
                connect_timeout: Duration::from_secs(1),
                ping_interval: Duration::from_secs(30),
                backoff: BackoffSettings::default(),
                request_queue: 8,
            },
            requests_rx,
            events_tx,
            shutdown_rx,
            health_tx,
            subscriptions: HashSet::new(),
        }
    }

    #[test]
    fn test_requests_mutate_subscription_set() {
        let mut channel = test_channel();

        let frame = channel.apply_request(TopicRequest::Subscribe("workers/42/offers".into()));
        assert!(matches!(frame, Some(TopicFrame::Subscribe { .. })));
        assert!(channel.subscriptions.contains("workers/42/offers"));

        // Duplicate subscribe produces no frame
        let frame = channel.apply_request(TopicRequest::Subscribe("workers/42/offers".into()));
        assert!(frame.is_none());

        let frame = channel.apply_request(TopicRequest::Subscribe("rides/101/events".into()));
        assert!(frame.is_some());
        assert_eq!(channel.subscriptions.len(), 2);

        let frame = channel.apply_request(TopicRequest::Unsubscribe("rides/101/events".into()));
        assert!(matches!(frame, Some(TopicFrame::Unsubscribe { .. })));
        assert!(!channel.subscriptions.contains("rides/101/events"));

        // Unknown unsubscribe produces no frame
        let frame = channel.apply_request(TopicRequest::Unsubscribe("rides/999/events".into()));
        assert!(frame.is_none());
    }

    #[test]
    fn test_publish_passes_through_without_tracking() {
        let mut channel = test_channel();

        let frame = channel.apply_request(TopicRequest::Publish {
            topic: "workers/42/location".into(),
            data: serde_json::json!({ "latitude": 33.68, "longitude": 73.04 }),
        });
        assert!(matches!(frame, Some(TopicFrame::Publish(_))));
        assert!(channel.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_handle_subscribe_reaches_task() {
        let (requests_tx, mut requests_rx) = mpsc::channel(8);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let handle = TopicHandle::from_parts(requests_tx, health_rx, shutdown_tx);
        let _ = health_tx;

        handle.subscribe("workers/42/offers".into()).await.unwrap();

        let request = requests_rx.recv().await.unwrap();
        assert!(matches!(request, TopicRequest::Subscribe(topic) if topic == "workers/42/offers"));
    }

    #[tokio::test]
    async fn test_publish_never_errors_when_full() {
        let (requests_tx, _requests_rx) = mpsc::channel(1);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let handle = TopicHandle::from_parts(requests_tx, health_rx, shutdown_tx);
        let _ = health_tx;

        // Second publish overflows the queue; it is silently dropped.
        handle.publish("workers/42/location".into(), serde_json::json!({}));
        handle.publish("workers/42/location".into(), serde_json::json!({}));
    }
}
