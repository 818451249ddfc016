//! # Offer Board
//!
//! Deduplicated, expiring set of pending ride offers.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          OfferBoard                                     │
//! │                                                                         │
//! │   session channel ──► newOffer ────┐                                    │
//! │   topic channel   ──► newOffer ────┼──► admit() ── first write wins     │
//! │   REST snapshot   ──► offers[] ────┘        │                           │
//! │                                             ▼                           │
//! │   either channel ──► withdrawal ──► withdraw() ──► tombstone (10 s)     │
//! │                                             │                           │
//! │   engine 1 Hz tick ─────────────────► sweep() ──► expired ids out       │
//! │                                             │                           │
//! │   presentation ◄── views(): soonest-to-expire first, with countdown     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The two push channels deliver the same offers with no ordering guarantee
//! between them. The board absorbs that: duplicates are no-ops that keep the
//! first-seen deadline, and a withdrawal arriving *before* its creation
//! leaves a tombstone so the late creation is suppressed instead of
//! resurrecting a dead offer.
//!
//! Time is always a parameter. The board never reads a clock, which is what
//! makes every edge here testable with plain asserts.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{OfferId, RideOffer};
use crate::WITHDRAWAL_GRACE_SECONDS;

// =============================================================================
// Admission Result
// =============================================================================

/// What happened when an offer arrived at the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New offer, now on the board.
    Inserted,
    /// Already on the board; the existing entry (and its deadline) stands.
    Duplicate,
    /// A withdrawal for this id was seen recently; the creation is ignored.
    Suppressed,
    /// Dead on arrival: the deadline had already passed.
    Expired,
}

// =============================================================================
// Offer View
// =============================================================================

/// A pending offer as the presentation layer sees it.
///
/// `seconds_remaining` is derived at snapshot time; it is the only countdown
/// the frontend gets, so all displayed timers tick from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct OfferView {
    /// The offer itself.
    pub offer: RideOffer,

    /// Whole seconds until expiry, clamped to zero.
    pub seconds_remaining: i64,
}

// =============================================================================
// Offer Board
// =============================================================================

/// The set of offers currently awaiting a decision.
///
/// Owned exclusively by the engine loop; no interior mutability, no clocks.
#[derive(Debug)]
pub struct OfferBoard {
    /// Live offers keyed by id. At most one entry per id, ever.
    offers: HashMap<OfferId, RideOffer>,

    /// Recently withdrawn or consumed ids, with the time of removal.
    /// Suppresses late cross-channel duplicates of dead offers.
    tombstones: HashMap<OfferId, DateTime<Utc>>,

    /// How long a tombstone keeps suppressing.
    grace: Duration,
}

impl OfferBoard {
    /// Creates a board with the standard withdrawal grace window.
    pub fn new() -> Self {
        OfferBoard::with_grace(Duration::seconds(WITHDRAWAL_GRACE_SECONDS))
    }

    /// Creates a board with a custom grace window (tests, tuning).
    pub fn with_grace(grace: Duration) -> Self {
        OfferBoard {
            offers: HashMap::new(),
            tombstones: HashMap::new(),
            grace,
        }
    }

    /// Admits an offer delivered by any source.
    ///
    /// First write wins: a duplicate never replaces the stored entry, so a
    /// redelivery with a different deadline cannot reset the countdown.
    pub fn admit(&mut self, offer: RideOffer, now: DateTime<Utc>) -> Admission {
        if offer.is_expired(now) {
            return Admission::Expired;
        }

        let id = offer.offer_id;
        if let Some(withdrawn_at) = self.tombstones.get(&id).copied() {
            if now - withdrawn_at < self.grace {
                return Admission::Suppressed;
            }
            self.tombstones.remove(&id);
        }

        if self.offers.contains_key(&id) {
            return Admission::Duplicate;
        }

        self.offers.insert(id, offer);
        Admission::Inserted
    }

    /// Withdraws an offer on behalf of the server (filled or revoked).
    ///
    /// Returns whether an offer was actually removed. Unknown ids still leave
    /// a tombstone: the creation may simply not have arrived yet.
    pub fn withdraw(&mut self, id: OfferId, now: DateTime<Utc>) -> bool {
        let removed = self.offers.remove(&id).is_some();
        self.tombstones.insert(id, now);
        removed
    }

    /// Takes an offer off the board because this worker decided on it.
    ///
    /// Tombstoned like a withdrawal, so the other channel's copy of the same
    /// offer cannot bring a decided offer back.
    pub fn take(&mut self, id: OfferId, now: DateTime<Utc>) -> Option<RideOffer> {
        let taken = self.offers.remove(&id);
        if taken.is_some() {
            self.tombstones.insert(id, now);
        }
        taken
    }

    /// Removes every offer whose deadline passed and prunes stale tombstones.
    ///
    /// Driven by the engine's single 1 Hz tick; returns the expired ids,
    /// soonest deadline first, for logging.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<OfferId> {
        let mut expired: Vec<(DateTime<Utc>, OfferId)> = self
            .offers
            .values()
            .filter(|offer| offer.is_expired(now))
            .map(|offer| (offer.expires_at, offer.offer_id))
            .collect();
        expired.sort();

        let ids: Vec<OfferId> = expired.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            self.offers.remove(id);
        }

        let grace = self.grace;
        self.tombstones
            .retain(|_, withdrawn_at| now - *withdrawn_at < grace);

        ids
    }

    /// Looks up a live offer.
    pub fn get(&self, id: OfferId) -> Option<&RideOffer> {
        self.offers.get(&id)
    }

    /// Whether the offer is live on the board.
    pub fn contains(&self, id: OfferId) -> bool {
        self.offers.contains_key(&id)
    }

    /// Number of live offers.
    pub fn len(&self) -> usize {
        self.offers.len()
    }

    /// Whether the board has no live offers.
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Snapshot for the presentation layer, soonest expiry first.
    pub fn views(&self, now: DateTime<Utc>) -> Vec<OfferView> {
        let mut views: Vec<OfferView> = self
            .offers
            .values()
            .map(|offer| OfferView {
                seconds_remaining: offer.seconds_remaining(now),
                offer: offer.clone(),
            })
            .collect();
        views.sort_by_key(|v| (v.offer.expires_at, v.offer.offer_id));
        views
    }
}

impl Default for OfferBoard {
    fn default() -> Self {
        OfferBoard::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::geo::GeoPoint;

    use super::*;

    fn offer(id: u64, expires_at: DateTime<Utc>) -> RideOffer {
        RideOffer {
            offer_id: OfferId::new(id),
            pickup: GeoPoint::new(33.6844, 73.0479),
            destination: GeoPoint::new(33.7294, 73.0931),
            reward_points: 100,
            expires_at,
        }
    }

    #[test]
    fn test_duplicate_keeps_first_deadline() {
        let now = Utc::now();
        let mut board = OfferBoard::new();

        let first = offer(7, now + Duration::seconds(30));
        let redelivery = offer(7, now + Duration::seconds(90));

        assert_eq!(board.admit(first, now), Admission::Inserted);
        assert_eq!(board.admit(redelivery, now), Admission::Duplicate);

        assert_eq!(board.len(), 1);
        let stored = board.get(OfferId::new(7)).unwrap();
        assert_eq!(stored.expires_at, now + Duration::seconds(30));
    }

    #[test]
    fn test_expired_offer_refused_on_arrival() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        let stale = offer(3, now - Duration::seconds(1));

        assert_eq!(board.admit(stale, now), Admission::Expired);
        assert!(board.is_empty());
    }

    #[test]
    fn test_withdrawal_removes_offer() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        board.admit(offer(7, now + Duration::seconds(30)), now);

        assert!(board.withdraw(OfferId::new(7), now));
        assert!(!board.contains(OfferId::new(7)));
        assert!(!board.withdraw(OfferId::new(7), now));
    }

    #[test]
    fn test_withdrawal_before_creation_suppresses_it() {
        let now = Utc::now();
        let mut board = OfferBoard::new();

        // Channels are unordered: the withdrawal lands first.
        assert!(!board.withdraw(OfferId::new(9), now));

        let late_creation = offer(9, now + Duration::seconds(30));
        assert_eq!(
            board.admit(late_creation, now + Duration::seconds(2)),
            Admission::Suppressed
        );
        assert!(board.is_empty());
    }

    #[test]
    fn test_suppression_ends_after_grace() {
        let now = Utc::now();
        let mut board = OfferBoard::with_grace(Duration::seconds(10));
        board.withdraw(OfferId::new(9), now);

        let after_grace = now + Duration::seconds(11);
        let fresh = offer(9, after_grace + Duration::seconds(30));
        assert_eq!(board.admit(fresh, after_grace), Admission::Inserted);
    }

    #[test]
    fn test_sweep_expires_at_deadline_not_before() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        board.admit(offer(7, now + Duration::seconds(30)), now);

        assert!(board.sweep(now + Duration::seconds(29)).is_empty());
        assert!(board.contains(OfferId::new(7)));

        let expired = board.sweep(now + Duration::seconds(31));
        assert_eq!(expired, vec![OfferId::new(7)]);
        assert!(board.is_empty());
    }

    #[test]
    fn test_sweep_prunes_stale_tombstones() {
        let now = Utc::now();
        let mut board = OfferBoard::with_grace(Duration::seconds(10));
        board.withdraw(OfferId::new(5), now);

        board.sweep(now + Duration::seconds(5));
        assert_eq!(
            board.admit(offer(5, now + Duration::seconds(60)), now + Duration::seconds(6)),
            Admission::Suppressed
        );

        board.sweep(now + Duration::seconds(12));
        assert_eq!(
            board.admit(offer(5, now + Duration::seconds(60)), now + Duration::seconds(13)),
            Admission::Inserted
        );
    }

    #[test]
    fn test_take_blocks_redelivery_of_decided_offer() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        board.admit(offer(7, now + Duration::seconds(30)), now);

        let taken = board.take(OfferId::new(7), now);
        assert_eq!(taken.unwrap().offer_id, OfferId::new(7));

        // The other channel redelivers the same offer moments later.
        assert_eq!(
            board.admit(offer(7, now + Duration::seconds(30)), now + Duration::seconds(1)),
            Admission::Suppressed
        );
    }

    #[test]
    fn test_take_unknown_offer_is_none() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        assert!(board.take(OfferId::new(404), now).is_none());
        // No tombstone for something we never held.
        assert_eq!(
            board.admit(offer(404, now + Duration::seconds(30)), now),
            Admission::Inserted
        );
    }

    #[test]
    fn test_views_sorted_by_soonest_expiry() {
        let now = Utc::now();
        let mut board = OfferBoard::new();
        board.admit(offer(1, now + Duration::seconds(60)), now);
        board.admit(offer(2, now + Duration::seconds(15)), now);
        board.admit(offer(3, now + Duration::seconds(45)), now);

        let views = board.views(now);
        let ids: Vec<OfferId> = views.iter().map(|v| v.offer.offer_id).collect();
        assert_eq!(ids, vec![OfferId::new(2), OfferId::new(3), OfferId::new(1)]);
        assert_eq!(views[0].seconds_remaining, 15);
    }
}
