//! # drover-core: Pure Domain Logic for Drover
//!
//! This crate is the **heart** of Drover. It contains every rule the driver
//! client must enforce, as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Drover Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Driver PWA (frontend)                        │   │
//! │  │    Offer list ──► Ride card ──► Map guidance ──► Earnings      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ snapshot subscription                  │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               drover-engine (channels, REST, engine)            │   │
//! │  │    session channel ─┐                 ┌─ topic channel          │   │
//! │  │                     ▼                 ▼                          │   │
//! │  │              single event loop (owns all state)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ drover-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  offers   │  │   ride    │  │    geo    │  │   │
//! │  │   │ RideOffer │  │OfferBoard │  │RideMachine│  │ haversine │  │   │
//! │  │   │ActiveRide │  │ dedup+TTL │  │transitions│  │ proximity │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO SOCKETS • NO CLOCKS • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Worker, RideOffer, ActiveRide, RideStatus)
//! - [`offers`] - Offer board: idempotent admission, withdrawal tombstones, expiry
//! - [`ride`] - Ride state machine with optimistic transitions and server merges
//! - [`geo`] - Great-circle distance and the fire-once proximity detector
//! - [`error`] - Domain error types
//!
//! ## Design Principles
//!
//! 1. **Pure Functions**: time is always a parameter, never read from a clock
//! 2. **No I/O**: sockets, HTTP, file system access is FORBIDDEN here
//! 3. **One Active Ride**: the machine makes violating states unrepresentable
//! 4. **Explicit Errors**: all errors are typed, never strings or panics
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use drover_core::offers::{Admission, OfferBoard};
//! use drover_core::types::{OfferId, RideOffer};
//! use drover_core::geo::GeoPoint;
//!
//! let now = Utc::now();
//! let offer = RideOffer {
//!     offer_id: OfferId::new(7),
//!     pickup: GeoPoint::new(33.6844, 73.0479),
//!     destination: GeoPoint::new(33.7294, 73.0931),
//!     reward_points: 120,
//!     expires_at: now + Duration::seconds(30),
//! };
//!
//! let mut board = OfferBoard::new();
//! assert_eq!(board.admit(offer.clone(), now), Admission::Inserted);
//! // The same offer arriving on the other channel is a no-op.
//! assert_eq!(board.admit(offer, now), Admission::Duplicate);
//! assert_eq!(board.len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod geo;
pub mod offers;
pub mod ride;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use drover_core::RideOffer` instead of
// `use drover_core::types::RideOffer`

pub use error::{CoreResult, TransitionError};
pub use geo::{GeoLocation, GeoPoint, ProximityDetector};
pub use offers::{Admission, OfferBoard, OfferView};
pub use ride::{RemoteApply, RideMachine};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Radius of the arrival geofence, in meters.
///
/// ## Business Reason
/// Dispatch considers a driver "arrived" when strictly inside 100 m of the
/// target. The boundary itself does not count, so a driver parked exactly on
/// the circle never triggers an accidental pickup confirmation.
pub const PROXIMITY_RADIUS_METERS: f64 = 100.0;

/// How long a withdrawal is remembered after the offer is gone, in seconds.
///
/// ## Business Reason
/// The two push channels do not order events across each other. A withdrawal
/// can land before the creation it cancels; the tombstone suppresses that
/// late creation instead of resurrecting a dead offer.
pub const WITHDRAWAL_GRACE_SECONDS: i64 = 10;

/// Longest interval between expiry sweeps, in milliseconds.
///
/// ## Business Reason
/// Offer countdowns are rendered from `seconds_remaining`, so a 1 Hz sweep is
/// the coarsest cadence that keeps displayed countdowns honest while waking
/// up O(1) times per second regardless of how many offers are pending.
pub const SWEEP_INTERVAL_MILLIS: u64 = 1_000;
