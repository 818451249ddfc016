//! # State Store
//!
//! Single source of truth for the presentation layer. The engine mutates
//! its internal state and publishes one coherent [`EngineSnapshot`] per
//! event; observers read or watch, never write.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use drover_core::types::{ActiveRide, Worker};
use drover_core::OfferView;

use crate::channel::ChannelHealth;

// =============================================================================
// Connectivity
// =============================================================================

/// Health of both push channels, as the UI renders it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connectivity {
    /// Session channel (commands + pushes).
    pub session: ChannelHealth,

    /// Topic channel (pub/sub).
    pub topic: ChannelHealth,
}

impl Connectivity {
    /// Whether any push channel delivers events right now.
    pub fn is_any_connected(&self) -> bool {
        self.session.is_connected() || self.topic.is_connected()
    }
}

// =============================================================================
// Engine Snapshot
// =============================================================================

/// Everything the presentation layer renders, in one consistent piece.
///
/// Offer countdowns are pre-derived (`seconds_remaining`); observers never
/// compute against the offer deadline themselves, so every displayed timer
/// ticks from the engine's clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Worker profile, once the server has confirmed one.
    pub worker: Option<Worker>,

    /// Pending offers, ordered by deadline (soonest first).
    pub offers: Vec<OfferView>,

    /// The active ride, if any. Stays set through terminal states until
    /// the presentation acknowledges the outcome.
    pub ride: Option<ActiveRide>,

    /// Push channel health.
    pub connectivity: Connectivity,

    /// Last engine-level error, until cleared or replaced.
    pub last_error: Option<String>,
}

// =============================================================================
// State Store
// =============================================================================

/// Publishes engine snapshots to any number of observers.
///
/// Thin wrapper over a [`watch`] channel: observers always see the latest
/// snapshot and are woken on every publish. The store keeps the channel
/// alive regardless of subscriber count.
pub struct StateStore {
    tx: watch::Sender<EngineSnapshot>,
}

impl StateStore {
    /// Creates a store seeded with an initial snapshot.
    pub fn new(initial: EngineSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        StateStore { tx }
    }

    /// Replaces the current snapshot and wakes all observers.
    pub fn publish(&self, snapshot: EngineSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Returns a receiver that observes every subsequent publish.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.tx.subscribe()
    }

    /// Returns a clone of the current snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use drover_core::types::WorkerId;

    use super::*;

    #[test]
    fn test_snapshot_defaults_to_empty() {
        let store = StateStore::new(EngineSnapshot::default());
        let snapshot = store.snapshot();

        assert!(snapshot.worker.is_none());
        assert!(snapshot.offers.is_empty());
        assert!(snapshot.ride.is_none());
        assert!(!snapshot.connectivity.is_any_connected());
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_publish_wakes_subscribers() {
        let store = StateStore::new(EngineSnapshot::default());
        let mut rx = store.subscribe();

        let mut next = EngineSnapshot::default();
        next.worker = Some(Worker::new(WorkerId::new(42), "+92-300-1234567"));
        store.publish(next);

        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().worker.as_ref().map(|w| w.id),
            Some(WorkerId::new(42))
        );
    }

    #[test]
    fn test_snapshot_returns_latest_publish() {
        let store = StateStore::new(EngineSnapshot::default());

        let mut first = EngineSnapshot::default();
        first.last_error = Some("first".into());
        store.publish(first);

        let mut second = EngineSnapshot::default();
        second.last_error = Some("second".into());
        store.publish(second);

        assert_eq!(store.snapshot().last_error.as_deref(), Some("second"));
    }
}
