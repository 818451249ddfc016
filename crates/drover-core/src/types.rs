//! # Domain Types
//!
//! Core domain types used throughout Drover.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Worker       │   │   RideOffer     │   │   ActiveRide    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (WorkerId)  │   │  offer_id       │   │  ride_id        │       │
//! │  │  phone_number   │   │  pickup         │   │  status         │       │
//! │  │  points_balance │   │  destination    │   │  pickup/dest    │       │
//! │  │  online         │   │  reward_points  │   │  timestamps     │       │
//! │  │                 │   │  expires_at     │   │  awarded_points │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                             │
//! │  │   RideStatus    │   │   RideUpdate    │                             │
//! │  │  ─────────────  │   │  ─────────────  │                             │
//! │  │  Accepted       │   │  server-pushed  │                             │
//! │  │  PickedUp       │   │  partial ride:  │                             │
//! │  │  Completed      │   │  every field    │                             │
//! │  │  Cancelled      │   │  except the id  │                             │
//! │  └─────────────────┘   │  is optional    │                             │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! All identifiers are numeric newtypes issued by the dispatch backend. The
//! offer id and the ride id share a number space but are distinct types, so
//! an offer id can never be passed where a ride id is expected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::geo::GeoPoint;

// =============================================================================
// Identifier Newtypes
// =============================================================================

/// Identifier of a worker (driver) account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Creates a worker id from its numeric value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        WorkerId(id)
    }

    /// Returns the numeric value.
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a ride offer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct OfferId(u64);

impl OfferId {
    /// Creates an offer id from its numeric value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        OfferId(id)
    }

    /// Returns the numeric value.
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a ride.
///
/// The server assigns the authoritative ride id when an accept is confirmed.
/// Until then the engine carries a provisional id derived from the offer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct RideId(u64);

impl RideId {
    /// Creates a ride id from its numeric value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        RideId(id)
    }

    /// Returns the numeric value.
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// The driver account this engine instance acts for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Worker {
    /// Backend-issued worker identifier.
    pub id: WorkerId,

    /// Phone number the account was registered with (display only).
    pub phone_number: String,

    /// Lifetime reward points balance.
    pub points_balance: i64,

    /// Whether the worker is accepting offers.
    pub online: bool,
}

impl Worker {
    /// Creates a fresh worker record with an empty balance, offline.
    pub fn new(id: WorkerId, phone_number: impl Into<String>) -> Self {
        Worker {
            id,
            phone_number: phone_number.into(),
            points_balance: 0,
            online: false,
        }
    }

    /// Credits reward points after a completed ride.
    pub fn credit_points(&mut self, points: i64) {
        self.points_balance = self.points_balance.saturating_add(points);
    }
}

// =============================================================================
// Ride Offer
// =============================================================================

/// A ride offered to this worker, pending a decision.
///
/// Offers are contended: every eligible worker sees the same offer and the
/// first accept wins. An offer is immutable once admitted; only its derived
/// countdown changes as time passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RideOffer {
    /// Backend-issued offer identifier.
    pub offer_id: OfferId,

    /// Where the passenger waits.
    pub pickup: GeoPoint,

    /// Where the passenger is going.
    pub destination: GeoPoint,

    /// Reward points estimated for completing this ride.
    pub reward_points: i64,

    /// Hard server-side deadline; the offer is worthless afterwards.
    #[ts(as = "String")]
    pub expires_at: DateTime<Utc>,
}

impl RideOffer {
    /// Checks whether the deadline has passed.
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds left before expiry, clamped to zero.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

// =============================================================================
// Ride Status
// =============================================================================

/// The phase of an active ride.
///
/// `Accepted → PickedUp → Completed` is the forward path; the server can
/// revert a phase (rejected confirmation) or cancel outright. "No ride" is
/// not a status: it is the absence of an [`ActiveRide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    /// Accept confirmed (or assumed); driving to the pickup point.
    Accepted,
    /// Passenger on board; driving to the destination.
    PickedUp,
    /// Drop-off done; awaiting presentation acknowledgement.
    Completed,
    /// Aborted by dispatch; terminal, never retried.
    Cancelled,
}

impl RideStatus {
    /// Whether this phase ends the ride.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideStatus::Accepted => "accepted",
            RideStatus::PickedUp => "picked_up",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Active Ride
// =============================================================================

/// The single ride this worker is currently committed to.
///
/// At most one exists per worker at any time; the ride machine enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ActiveRide {
    /// Backend-issued ride identifier (provisional until the accept ack).
    pub ride_id: RideId,

    /// Current phase.
    pub status: RideStatus,

    /// Where the passenger waits.
    pub pickup: GeoPoint,

    /// Where the passenger is going.
    pub destination: GeoPoint,

    /// Reward estimate carried over from the offer.
    pub reward_points: i64,

    /// When the accept was issued locally (or confirmed by the server).
    #[ts(as = "String")]
    pub accepted_at: DateTime<Utc>,

    /// When the passenger boarded.
    #[ts(as = "Option<String>")]
    pub picked_up_at: Option<DateTime<Utc>>,

    /// When the drop-off happened.
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Points actually credited by the server on completion.
    pub awarded_points: Option<i64>,
}

impl ActiveRide {
    /// Builds the optimistic ride created the moment an accept is issued.
    ///
    /// The ride id starts as the offer id; the accept acknowledgement rebinds
    /// it to the server's authoritative value.
    pub fn from_offer(offer: &RideOffer, accepted_at: DateTime<Utc>) -> Self {
        ActiveRide {
            ride_id: RideId::new(offer.offer_id.get()),
            status: RideStatus::Accepted,
            pickup: offer.pickup,
            destination: offer.destination,
            reward_points: offer.reward_points,
            accepted_at,
            picked_up_at: None,
            completed_at: None,
            awarded_points: None,
        }
    }

    /// Whether the ride reached a terminal phase.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The point the driver is currently heading to, if the ride is live.
    pub fn current_target(&self) -> Option<GeoPoint> {
        match self.status {
            RideStatus::Accepted => Some(self.pickup),
            RideStatus::PickedUp => Some(self.destination),
            RideStatus::Completed | RideStatus::Cancelled => None,
        }
    }
}

// =============================================================================
// Ride Update
// =============================================================================

/// A partial ride record pushed by the server.
///
/// Backend payloads vary by event source: some carry the full ride, some only
/// the id and status. Every field except the id is optional and the machine
/// merges `Some` fields over local state, never blanking what the payload
/// omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideUpdate {
    /// Ride the update refers to.
    pub ride_id: RideId,

    /// New phase, if the server sent one.
    #[serde(default)]
    pub status: Option<RideStatus>,

    /// Pickup point, if the server sent one.
    #[serde(default)]
    pub pickup: Option<GeoPoint>,

    /// Destination point, if the server sent one.
    #[serde(default)]
    pub destination: Option<GeoPoint>,

    /// Updated reward estimate.
    #[serde(default)]
    pub reward_points: Option<i64>,

    /// Server-recorded accept time.
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,

    /// Server-recorded pickup time.
    #[serde(default)]
    pub picked_up_at: Option<DateTime<Utc>>,

    /// Server-recorded completion time.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Points credited on completion.
    #[serde(default)]
    pub awarded_points: Option<i64>,
}

impl RideUpdate {
    /// Minimal update carrying only an id and a phase.
    pub fn status_only(ride_id: RideId, status: RideStatus) -> Self {
        RideUpdate {
            ride_id,
            status: Some(status),
            pickup: None,
            destination: None,
            reward_points: None,
            accepted_at: None,
            picked_up_at: None,
            completed_at: None,
            awarded_points: None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
