//! # Error Types
//!
//! Domain-specific error types for drover-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  drover-core errors (this file)                                         │
//! │  └── TransitionError  - Ride lifecycle rule violations                  │
//! │                                                                         │
//! │  drover-engine errors (separate crate)                                  │
//! │  └── EngineError      - Transport/REST/config/persistence failures      │
//! │                                                                         │
//! │  Flow: TransitionError → EngineError → snapshot.last_error → Frontend   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (offer id, ride id, status)
//! 3. Errors are enum variants, never String
//! 4. Each error variant maps to a user-facing message

use thiserror::Error;

use crate::types::{OfferId, RideId, RideStatus};

// =============================================================================
// Transition Error
// =============================================================================

/// Ride lifecycle rule violations.
///
/// Every variant is raised *before* any network traffic: the engine rejects
/// the command locally and the caller gets one of these on its reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// A second accept was attempted while a ride is in progress.
    ///
    /// ## When This Occurs
    /// - Driver taps accept on offer B while ride A is active
    /// - A queued accept arrives after another accept already succeeded
    #[error("a ride is already in progress (ride {ride_id})")]
    RideInProgress { ride_id: RideId },

    /// An accept was attempted while a previous accept is still unresolved.
    ///
    /// Double-tap protection: the first accept holds the slot until the
    /// server answers or the local timeout resolves it.
    #[error("an accept decision is still pending for offer {offer_id}")]
    AcceptPending { offer_id: OfferId },

    /// The referenced offer is not on the board.
    ///
    /// ## When This Occurs
    /// - Offer expired or was filled between render and tap
    /// - Offer was withdrawn by dispatch while the card was on screen
    #[error("offer {offer_id} is no longer available")]
    OfferUnavailable { offer_id: OfferId },

    /// An operation requires an active ride but there is none.
    #[error("no active ride")]
    NoActiveRide,

    /// The active ride is in the wrong phase for the requested operation.
    ///
    /// ## When This Occurs
    /// - Pickup confirmation while the ride is already picked up
    /// - Completion before pickup
    #[error("ride {ride_id} is {actual}, expected {expected}")]
    WrongStatus {
        ride_id: RideId,
        expected: RideStatus,
        actual: RideStatus,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with TransitionError.
pub type CoreResult<T> = Result<T, TransitionError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TransitionError::RideInProgress {
            ride_id: RideId::new(101),
        };
        assert_eq!(err.to_string(), "a ride is already in progress (ride 101)");

        let err = TransitionError::OfferUnavailable {
            offer_id: OfferId::new(7),
        };
        assert_eq!(err.to_string(), "offer 7 is no longer available");
    }

    #[test]
    fn test_wrong_status_message_names_both_phases() {
        let err = TransitionError::WrongStatus {
            ride_id: RideId::new(5),
            expected: RideStatus::Accepted,
            actual: RideStatus::PickedUp,
        };
        assert_eq!(err.to_string(), "ride 5 is picked_up, expected accepted");
    }
}
