//! # Ride State Machine
//!
//! Owns the zero-or-one active ride and every legal transition on it.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RideMachine                                     │
//! │                                                                         │
//! │                 begin_accept (optimistic)                               │
//! │   (no ride) ───────────────────────────────► ACCEPTED*                  │
//! │        ▲                                        │    * = accept pending │
//! │        │  abort_accept (server said no)         │ resolve_accept        │
//! │        └────────────────────────────────────────┤ (rebinds ride id)     │
//! │                                                 ▼                       │
//! │                      revert_pickup          ACCEPTED                    │
//! │                  ┌──────────────────────────── │                        │
//! │                  ▼                              │ begin_pickup          │
//! │              ACCEPTED ◄─────────────────┐       ▼                       │
//! │                                         │   PICKED_UP                   │
//! │                      revert_complete    │       │ begin_complete        │
//! │                  (completion rejected) ─┘       ▼                       │
//! │                                             COMPLETED ──► acknowledge   │
//! │                                                              │          │
//! │   CANCELLED (remote only) ──► acknowledge ───────────────────┴► (no     │
//! │                                                                  ride)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transitions are optimistic: the local record moves first, the server
//! acknowledgement (or its absence) confirms, merges, or reverts it later.
//! Server pushes for the active ride always win; pushes for any other ride
//! id are not this machine's business and are reported as ignored.

use chrono::{DateTime, Utc};

use crate::error::{CoreResult, TransitionError};
use crate::types::{ActiveRide, OfferId, RideId, RideOffer, RideStatus, RideUpdate};

// =============================================================================
// Remote Application Result
// =============================================================================

/// Outcome of feeding a server push into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The update targeted the active ride and was merged.
    Applied,
    /// The update names a ride this worker is not on; dropped.
    ForeignRide,
    /// There is no active ride to apply anything to; dropped.
    NoRide,
}

// =============================================================================
// Ride Machine
// =============================================================================

/// State machine for the single ride a worker can hold.
///
/// `Option<ActiveRide>` plus an accept latch. The latch is what makes a
/// double-tap on two offer cards impossible to turn into two rides: the
/// second accept is refused locally before any command leaves the device.
#[derive(Debug)]
pub struct RideMachine {
    ride: Option<ActiveRide>,
    pending_accept: Option<OfferId>,
}

impl RideMachine {
    /// A machine with no ride.
    pub fn new() -> Self {
        RideMachine {
            ride: None,
            pending_accept: None,
        }
    }

    /// Restores a machine from a persisted ride (app reload mid-ride).
    pub fn resume(ride: Option<ActiveRide>) -> Self {
        RideMachine {
            ride,
            pending_accept: None,
        }
    }

    /// The active ride, if any.
    pub fn active(&self) -> Option<&ActiveRide> {
        self.ride.as_ref()
    }

    /// The offer whose accept is still awaiting a verdict, if any.
    pub fn pending_accept(&self) -> Option<OfferId> {
        self.pending_accept
    }

    /// Checks both occupancy rules without changing anything.
    pub fn ensure_can_accept(&self) -> CoreResult<()> {
        if let Some(offer_id) = self.pending_accept {
            return Err(TransitionError::AcceptPending { offer_id });
        }
        if let Some(ride) = &self.ride {
            return Err(TransitionError::RideInProgress {
                ride_id: ride.ride_id,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Accept
    // =========================================================================

    /// Starts an accept: creates the optimistic ride and arms the latch.
    pub fn begin_accept(&mut self, offer: &RideOffer, now: DateTime<Utc>) -> CoreResult<()> {
        self.ensure_can_accept()?;
        self.pending_accept = Some(offer.offer_id);
        self.ride = Some(ActiveRide::from_offer(offer, now));
        Ok(())
    }

    /// Resolves the pending accept.
    ///
    /// With a server record the provisional ride id is rebound to the
    /// authoritative one and server fields are merged. Without one (ack never
    /// arrived) the optimistic record simply stands until reconciliation.
    pub fn resolve_accept(&mut self, server: Option<&RideUpdate>) -> CoreResult<()> {
        if self.pending_accept.take().is_none() {
            return Err(TransitionError::NoActiveRide);
        }
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if let Some(update) = server {
            ride.ride_id = update.ride_id;
            merge_update(ride, update);
        }
        Ok(())
    }

    /// Undoes a pending accept after the server refused it.
    ///
    /// Returns the dropped optimistic ride, `None` if no accept was pending.
    pub fn abort_accept(&mut self) -> Option<ActiveRide> {
        self.pending_accept.take()?;
        self.ride.take()
    }

    // =========================================================================
    // Pickup
    // =========================================================================

    /// Optimistically marks the passenger as picked up.
    ///
    /// Refused while the accept verdict is still pending: the ride id is
    /// provisional until then and a pickup command would name the wrong ride.
    pub fn begin_pickup(&mut self, now: DateTime<Utc>) -> CoreResult<RideId> {
        if let Some(offer_id) = self.pending_accept {
            return Err(TransitionError::AcceptPending { offer_id });
        }
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if ride.status != RideStatus::Accepted {
            return Err(TransitionError::WrongStatus {
                ride_id: ride.ride_id,
                expected: RideStatus::Accepted,
                actual: ride.status,
            });
        }
        ride.status = RideStatus::PickedUp;
        ride.picked_up_at = Some(now);
        Ok(ride.ride_id)
    }

    /// Merges the server's pickup acknowledgement.
    ///
    /// Backend pickup payloads sometimes omit the geographic fields; the
    /// merge only overwrites what the server actually sent, so locally known
    /// coordinates survive.
    pub fn confirm_pickup(&mut self, server: Option<&RideUpdate>) -> CoreResult<()> {
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if let Some(update) = server {
            merge_update(ride, update);
        }
        Ok(())
    }

    /// Reverts a pickup the server rejected.
    pub fn revert_pickup(&mut self) -> CoreResult<()> {
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if ride.status != RideStatus::PickedUp {
            return Err(TransitionError::WrongStatus {
                ride_id: ride.ride_id,
                expected: RideStatus::PickedUp,
                actual: ride.status,
            });
        }
        ride.status = RideStatus::Accepted;
        ride.picked_up_at = None;
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Optimistically marks the ride as completed.
    pub fn begin_complete(&mut self, now: DateTime<Utc>) -> CoreResult<RideId> {
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if ride.status != RideStatus::PickedUp {
            return Err(TransitionError::WrongStatus {
                ride_id: ride.ride_id,
                expected: RideStatus::PickedUp,
                actual: ride.status,
            });
        }
        ride.status = RideStatus::Completed;
        ride.completed_at = Some(now);
        Ok(ride.ride_id)
    }

    /// Records the awarded points from the completion acknowledgement.
    ///
    /// When the server omits the award (or never answered), the estimate
    /// carried from the offer is credited; the next reconciliation corrects
    /// any difference. Returns the credited amount.
    pub fn confirm_complete(&mut self, awarded: Option<i64>) -> CoreResult<i64> {
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if ride.status != RideStatus::Completed {
            return Err(TransitionError::WrongStatus {
                ride_id: ride.ride_id,
                expected: RideStatus::Completed,
                actual: ride.status,
            });
        }
        let credited = awarded.unwrap_or(ride.reward_points);
        ride.awarded_points = Some(credited);
        Ok(credited)
    }

    /// Reverts a completion the server rejected.
    pub fn revert_complete(&mut self) -> CoreResult<()> {
        let ride = self.ride.as_mut().ok_or(TransitionError::NoActiveRide)?;
        if ride.status != RideStatus::Completed {
            return Err(TransitionError::WrongStatus {
                ride_id: ride.ride_id,
                expected: RideStatus::Completed,
                actual: ride.status,
            });
        }
        ride.status = RideStatus::PickedUp;
        ride.completed_at = None;
        ride.awarded_points = None;
        Ok(())
    }

    // =========================================================================
    // Server Pushes & Reconciliation
    // =========================================================================

    /// Applies a server push. The server wins, in any direction.
    ///
    /// Only the active ride id is accepted; a stray update for some other
    /// ride (stale subscription, server bug) must not corrupt local state.
    pub fn apply_remote(&mut self, update: &RideUpdate) -> RemoteApply {
        match self.ride.as_mut() {
            None => RemoteApply::NoRide,
            Some(ride) if ride.ride_id != update.ride_id => RemoteApply::ForeignRide,
            Some(ride) => {
                merge_update(ride, update);
                RemoteApply::Applied
            }
        }
    }

    /// Adopts the server's ride record wholesale (reconciliation).
    pub fn adopt(&mut self, ride: ActiveRide) {
        self.ride = Some(ride);
    }

    /// Accepts the server's claim that no ride is active.
    ///
    /// A terminal local ride is kept: it already happened, and the
    /// presentation still owes the driver a completion screen. Returns the
    /// ride that was dropped, if any.
    pub fn adopt_none(&mut self) -> Option<ActiveRide> {
        match &self.ride {
            Some(ride) if !ride.is_terminal() => self.ride.take(),
            _ => None,
        }
    }

    /// Clears a terminal ride once the presentation has shown it.
    ///
    /// Idempotent: acknowledging with no ride, or a live one, does nothing.
    pub fn acknowledge(&mut self) -> Option<ActiveRide> {
        if self.ride.as_ref().is_some_and(|r| r.is_terminal()) {
            self.ride.take()
        } else {
            None
        }
    }
}

impl Default for RideMachine {
    fn default() -> Self {
        RideMachine::new()
    }
}

/// Overwrites ride fields with whatever the server actually sent.
///
/// `None` means "not included in this payload", never "clear the field".
fn merge_update(ride: &mut ActiveRide, update: &RideUpdate) {
    if let Some(status) = update.status {
        ride.status = status;
    }
    if let Some(pickup) = update.pickup {
        ride.pickup = pickup;
    }
    if let Some(destination) = update.destination {
        ride.destination = destination;
    }
    if let Some(reward) = update.reward_points {
        ride.reward_points = reward;
    }
    if let Some(at) = update.accepted_at {
        ride.accepted_at = at;
    }
    if let Some(at) = update.picked_up_at {
        ride.picked_up_at = Some(at);
    }
    if let Some(at) = update.completed_at {
        ride.completed_at = Some(at);
    }
    if let Some(points) = update.awarded_points {
        ride.awarded_points = Some(points);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::geo::GeoPoint;

    use super::*;

    fn offer(id: u64) -> RideOffer {
        RideOffer {
            offer_id: OfferId::new(id),
            pickup: GeoPoint::new(33.6844, 73.0479),
            destination: GeoPoint::new(33.7294, 73.0931),
            reward_points: 120,
            expires_at: Utc::now() + Duration::seconds(30),
        }
    }

    fn machine_with_accepted_ride() -> RideMachine {
        let mut machine = RideMachine::new();
        machine.begin_accept(&offer(7), Utc::now()).unwrap();
        machine
            .resolve_accept(Some(&RideUpdate::status_only(
                RideId::new(101),
                RideStatus::Accepted,
            )))
            .unwrap();
        machine
    }

    #[test]
    fn test_accept_rebinds_provisional_ride_id() {
        let mut machine = RideMachine::new();
        let now = Utc::now();

        machine.begin_accept(&offer(7), now).unwrap();
        assert_eq!(machine.pending_accept(), Some(OfferId::new(7)));
        assert_eq!(machine.active().unwrap().ride_id, RideId::new(7));

        machine
            .resolve_accept(Some(&RideUpdate::status_only(
                RideId::new(101),
                RideStatus::Accepted,
            )))
            .unwrap();

        assert_eq!(machine.pending_accept(), None);
        let ride = machine.active().unwrap();
        assert_eq!(ride.ride_id, RideId::new(101));
        assert_eq!(ride.status, RideStatus::Accepted);
    }

    #[test]
    fn test_second_accept_refused_while_ride_active() {
        let mut machine = machine_with_accepted_ride();
        let err = machine.begin_accept(&offer(8), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::RideInProgress {
                ride_id: RideId::new(101)
            }
        );
    }

    #[test]
    fn test_second_accept_refused_while_first_pending() {
        let mut machine = RideMachine::new();
        machine.begin_accept(&offer(7), Utc::now()).unwrap();

        let err = machine.begin_accept(&offer(8), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::AcceptPending {
                offer_id: OfferId::new(7)
            }
        );
    }

    #[test]
    fn test_abort_accept_returns_to_no_ride() {
        let mut machine = RideMachine::new();
        machine.begin_accept(&offer(7), Utc::now()).unwrap();

        let dropped = machine.abort_accept().unwrap();
        assert_eq!(dropped.ride_id, RideId::new(7));
        assert!(machine.active().is_none());
        assert!(machine.ensure_can_accept().is_ok());
    }

    #[test]
    fn test_unacknowledged_accept_keeps_optimistic_ride() {
        let mut machine = RideMachine::new();
        machine.begin_accept(&offer(7), Utc::now()).unwrap();

        // Ack never arrived; the timeout resolves without a server record.
        machine.resolve_accept(None).unwrap();

        assert_eq!(machine.pending_accept(), None);
        assert_eq!(machine.active().unwrap().ride_id, RideId::new(7));
    }

    #[test]
    fn test_pickup_requires_accepted_phase() {
        let mut machine = RideMachine::new();
        assert_eq!(
            machine.begin_pickup(Utc::now()).unwrap_err(),
            TransitionError::NoActiveRide
        );

        let mut machine = machine_with_accepted_ride();
        let now = Utc::now();
        assert_eq!(machine.begin_pickup(now).unwrap(), RideId::new(101));
        assert_eq!(machine.active().unwrap().status, RideStatus::PickedUp);
        assert_eq!(machine.active().unwrap().picked_up_at, Some(now));

        let err = machine.begin_pickup(now).unwrap_err();
        assert!(matches!(err, TransitionError::WrongStatus { .. }));
    }

    #[test]
    fn test_pickup_refused_while_accept_pending() {
        let mut machine = RideMachine::new();
        machine.begin_accept(&offer(7), Utc::now()).unwrap();

        let err = machine.begin_pickup(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::AcceptPending {
                offer_id: OfferId::new(7)
            }
        );
    }

    #[test]
    fn test_pickup_ack_without_geo_preserves_coordinates() {
        let mut machine = machine_with_accepted_ride();
        let local_pickup = machine.active().unwrap().pickup;
        let local_destination = machine.active().unwrap().destination;
        machine.begin_pickup(Utc::now()).unwrap();

        // Sparse payload: id and status only, no coordinates.
        let sparse = RideUpdate::status_only(RideId::new(101), RideStatus::PickedUp);
        machine.confirm_pickup(Some(&sparse)).unwrap();

        let ride = machine.active().unwrap();
        assert_eq!(ride.pickup, local_pickup);
        assert_eq!(ride.destination, local_destination);
        assert_eq!(ride.status, RideStatus::PickedUp);
    }

    #[test]
    fn test_rejected_pickup_reverts_to_accepted() {
        let mut machine = machine_with_accepted_ride();
        machine.begin_pickup(Utc::now()).unwrap();

        machine.revert_pickup().unwrap();
        let ride = machine.active().unwrap();
        assert_eq!(ride.status, RideStatus::Accepted);
        assert!(ride.picked_up_at.is_none());
    }

    #[test]
    fn test_completion_awards_server_points() {
        let mut machine = machine_with_accepted_ride();
        machine.begin_pickup(Utc::now()).unwrap();
        machine.begin_complete(Utc::now()).unwrap();

        let credited = machine.confirm_complete(Some(150)).unwrap();
        assert_eq!(credited, 150);
        assert_eq!(machine.active().unwrap().awarded_points, Some(150));
    }

    #[test]
    fn test_completion_falls_back_to_estimate() {
        let mut machine = machine_with_accepted_ride();
        machine.begin_pickup(Utc::now()).unwrap();
        machine.begin_complete(Utc::now()).unwrap();

        let credited = machine.confirm_complete(None).unwrap();
        assert_eq!(credited, 120);
    }

    #[test]
    fn test_completion_requires_pickup_first() {
        let mut machine = machine_with_accepted_ride();
        let err = machine.begin_complete(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::WrongStatus {
                ride_id: RideId::new(101),
                expected: RideStatus::PickedUp,
                actual: RideStatus::Accepted,
            }
        );
    }

    #[test]
    fn test_rejected_completion_reverts_to_picked_up() {
        let mut machine = machine_with_accepted_ride();
        machine.begin_pickup(Utc::now()).unwrap();
        machine.begin_complete(Utc::now()).unwrap();
        machine.confirm_complete(None).unwrap();

        machine.revert_complete().unwrap();
        let ride = machine.active().unwrap();
        assert_eq!(ride.status, RideStatus::PickedUp);
        assert!(ride.completed_at.is_none());
        assert!(ride.awarded_points.is_none());
    }

    #[test]
    fn test_remote_update_for_foreign_ride_is_ignored() {
        let mut machine = machine_with_accepted_ride();
        let foreign = RideUpdate::status_only(RideId::new(999), RideStatus::Cancelled);

        assert_eq!(machine.apply_remote(&foreign), RemoteApply::ForeignRide);
        assert_eq!(machine.active().unwrap().status, RideStatus::Accepted);
    }

    #[test]
    fn test_remote_cancel_wins_over_local_state() {
        let mut machine = machine_with_accepted_ride();
        let cancel = RideUpdate::status_only(RideId::new(101), RideStatus::Cancelled);

        assert_eq!(machine.apply_remote(&cancel), RemoteApply::Applied);
        assert!(machine.active().unwrap().is_terminal());
    }

    #[test]
    fn test_remote_update_without_ride_is_ignored() {
        let mut machine = RideMachine::new();
        let update = RideUpdate::status_only(RideId::new(101), RideStatus::Accepted);
        assert_eq!(machine.apply_remote(&update), RemoteApply::NoRide);
        assert!(machine.active().is_none());
    }

    #[test]
    fn test_adopt_none_spares_terminal_ride() {
        let mut machine = machine_with_accepted_ride();
        machine.begin_pickup(Utc::now()).unwrap();
        machine.begin_complete(Utc::now()).unwrap();

        // Server has already moved on; the completion card must survive.
        assert!(machine.adopt_none().is_none());
        assert!(machine.active().is_some());
    }

    #[test]
    fn test_adopt_none_clears_live_ride() {
        let mut machine = machine_with_accepted_ride();
        let dropped = machine.adopt_none().unwrap();
        assert_eq!(dropped.ride_id, RideId::new(101));
        assert!(machine.active().is_none());
    }

    #[test]
    fn test_acknowledge_clears_terminal_ride_only() {
        let mut machine = machine_with_accepted_ride();
        assert!(machine.acknowledge().is_none());

        machine.begin_pickup(Utc::now()).unwrap();
        machine.begin_complete(Utc::now()).unwrap();
        machine.confirm_complete(None).unwrap();

        let done = machine.acknowledge().unwrap();
        assert_eq!(done.status, RideStatus::Completed);
        assert!(machine.active().is_none());
        assert!(machine.acknowledge().is_none());
    }

    #[test]
    fn test_resume_restores_persisted_ride() {
        let now = Utc::now();
        let ride = ActiveRide::from_offer(&offer(7), now);
        let machine = RideMachine::resume(Some(ride.clone()));
        assert_eq!(machine.active(), Some(&ride));
    }
}
