//! # Shared Channel Plumbing
//!
//! State, health reporting, and connection helpers common to both push
//! channels.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Channel Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │            session only      │ socket up                      │
//! │        │           ┌────────────┐     │                                 │
//! │        │           │Registering │ ◄───┤ (topic goes straight           │
//! │        │           └─────┬──────┘     │  to Connected)                 │
//! │        │                 │ ack        ▼                                 │
//! │        │                 └──────► ┌────────────┐                       │
//! │        │                          │ Connected  │                       │
//! │        │                          └─────┬──────┘                       │
//! │        │                                │ disconnect/error              │
//! │        │                          ┌─────▼──────┐   timer   ┌──────────┐│
//! │        └───────────────────────── │  Backoff   │ ────────► │Reconnect-││
//! │                                   └────────────┘           │   ing    ││
//! │                                                            └──────────┘│
//! │                                                                         │
//! │  BACKOFF STRATEGY (Exponential with Jitter)                            │
//! │  ───────────────────────────────────────────                           │
//! │  Attempt 1: 500ms ─ Attempt 2: 1s ─ Attempt 3: 2s ─ ... ─ Max: 60s     │
//! │  Retries forever: a driver's phone rides through tunnels all day.      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each adapter publishes its [`ChannelHealth`] through a `tokio::sync::watch`
//! channel; the engine folds both into the connectivity part of the snapshot
//! and treats each not-connected → connected edge as a reconciliation trigger.

use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// The WebSocket stream type both channels run on.
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Channel Identity
// =============================================================================

/// Which push channel an event or log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Channel A: the session channel (commands + acks + pushes).
    Session,
    /// Channel B: the topic channel (broker-style pub/sub).
    Topic,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Session => write!(f, "session"),
            ChannelKind::Topic => write!(f, "topic"),
        }
    }
}

// =============================================================================
// Channel State
// =============================================================================

/// Connection state of a push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Socket up, registration ack outstanding (session channel only).
    Registering,
    /// Connected and ready.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Registering => write!(f, "registering"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Backoff => write!(f, "backoff"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Channel Health
// =============================================================================

/// What the engine (and ultimately the UI) knows about one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    /// Current connection state.
    pub state: ChannelState,

    /// Total reconnect attempts since the engine started. Monotonic; a
    /// climbing number with a connected state means a flapping link.
    pub reconnects: u64,
}

impl ChannelHealth {
    /// Whether the channel is usable right now.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }
}

impl Default for ChannelHealth {
    fn default() -> Self {
        ChannelHealth {
            state: ChannelState::Disconnected,
            reconnects: 0,
        }
    }
}

// =============================================================================
// Backoff Settings
// =============================================================================

/// Reconnect backoff parameters shared by both channels.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSettings {
    /// First retry delay.
    pub initial: Duration,

    /// Cap for the exponential growth.
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffSettings {
    /// Builds the exponential backoff state for one reconnect cycle.
    ///
    /// No elapsed-time limit: channels retry until shutdown.
    pub(crate) fn build(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial,
            max_interval: self.max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Connection Helper
// =============================================================================

/// Dials a WebSocket endpoint with a bounded connect time.
pub(crate) async fn connect_with_timeout(
    url: &str,
    connect_timeout: Duration,
) -> EngineResult<WsStream> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((ws_stream, response))) => {
            debug!(status = ?response.status(), "WebSocket handshake complete");
            Ok(ws_stream)
        }
        Ok(Err(e)) => Err(EngineError::from(e)),
        Err(_) => Err(EngineError::Timeout(connect_timeout.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_display() {
        assert_eq!(ChannelState::Connected.to_string(), "connected");
        assert_eq!(ChannelState::Registering.to_string(), "registering");
        assert_eq!(ChannelState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_health_defaults_disconnected() {
        let health = ChannelHealth::default();
        assert_eq!(health.state, ChannelState::Disconnected);
        assert_eq!(health.reconnects, 0);
        assert!(!health.is_connected());
    }

    #[test]
    fn test_backoff_settings_build() {
        let settings = BackoffSettings::default();
        let backoff = settings.build();
        assert_eq!(backoff.initial_interval, Duration::from_millis(500));
        assert_eq!(backoff.max_interval, Duration::from_secs(60));
        assert!(backoff.max_elapsed_time.is_none());
    }
}
