//! # Geodesy & Proximity
//!
//! Great-circle distance and the arrival detector that auto-advances a ride.
//!
//! ## The Fire-Once Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ProximityDetector                                  │
//! │                                                                         │
//! │        outside                 inside                 outside           │
//! │   ──●──────────●────────●──▶●────────●──▶●──────────●──▶               │
//! │     observe    observe  │   observe  │   observe                       │
//! │     false      false    │   TRUE     │   false  ◀── latched            │
//! │                         │   (once)   │                                  │
//! │                      radius       GPS jitter must not                   │
//! │                      boundary     confirm pickup twice                  │
//! │                                                                         │
//! │   retarget(new point) ──► latch re-armed                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! GPS positions wobble. Once a target has fired, crossing out of the circle
//! and back in again must not re-trigger the transition; only a new target
//! (the next ride phase) re-arms the detector. A point at exactly the radius
//! is "outside": the comparison is strict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Mean Earth radius in meters (IUGG), for the spherical distance model.
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

// =============================================================================
// Geo Point
// =============================================================================

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct GeoPoint {
    /// Degrees north of the equator, negative south.
    pub latitude: f64,

    /// Degrees east of the prime meridian, negative west.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a point from decimal degrees.
    #[inline]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint {
            latitude,
            longitude,
        }
    }
}

// =============================================================================
// Geo Location
// =============================================================================

/// A timestamped position sample from the device.
///
/// Ephemeral by design: samples drive proximity checks and telemetry but are
/// never persisted anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct GeoLocation {
    /// Where the device was.
    pub point: GeoPoint,

    /// When the sample was taken.
    #[ts(as = "String")]
    pub recorded_at: DateTime<Utc>,
}

impl GeoLocation {
    /// Creates a sample from a point and its capture time.
    #[inline]
    pub fn new(point: GeoPoint, recorded_at: DateTime<Utc>) -> Self {
        GeoLocation { point, recorded_at }
    }
}

// =============================================================================
// Great-Circle Distance
// =============================================================================

/// Haversine distance between two points, in meters.
///
/// Spherical model. The error against the true ellipsoid is well under 0.5%,
/// irrelevant next to a 100 m geofence fed by consumer GPS.
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.latitude.to_radians(), a.longitude.to_radians());
    let (lat2, lon2) = (b.latitude.to_radians(), b.longitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

// =============================================================================
// Proximity Detector
// =============================================================================

/// Latched arrival detector for the current ride target.
///
/// `observe` answers "did we just arrive?" exactly once per target:
/// strictly inside the radius fires, the boundary does not, and the latch
/// holds through any amount of jitter until [`retarget`](Self::retarget)
/// points it somewhere new.
#[derive(Debug, Clone)]
pub struct ProximityDetector {
    radius_meters: f64,
    target: Option<GeoPoint>,
    fired: bool,
}

impl ProximityDetector {
    /// Creates a detector with the given geofence radius, no target yet.
    pub fn new(radius_meters: f64) -> Self {
        ProximityDetector {
            radius_meters,
            target: None,
            fired: false,
        }
    }

    /// Points the detector at a new target, re-arming the latch.
    ///
    /// Retargeting to the point it is already watching is a no-op, so a
    /// redundant call after a snapshot merge cannot re-fire an arrival.
    pub fn retarget(&mut self, target: GeoPoint) {
        if self.target != Some(target) {
            self.target = Some(target);
            self.fired = false;
        }
    }

    /// Drops the target; nothing fires until the next retarget.
    pub fn clear_target(&mut self) {
        self.target = None;
        self.fired = false;
    }

    /// Feeds a position sample; returns `true` exactly once on arrival.
    pub fn observe(&mut self, position: GeoPoint) -> bool {
        let Some(target) = self.target else {
            return false;
        };
        if self.fired {
            return false;
        }
        if distance_meters(position, target) < self.radius_meters {
            self.fired = true;
            return true;
        }
        false
    }

    /// The point currently being watched, if any.
    #[inline]
    pub fn target(&self) -> Option<GeoPoint> {
        self.target
    }

    /// Whether the current target has already fired.
    #[inline]
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ~111.19 km per degree of latitude on the spherical model.
    const METERS_PER_DEGREE_LAT: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

    /// A point `meters` north of `base`.
    fn north_of(base: GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint::new(base.latitude + meters / METERS_PER_DEGREE_LAT, base.longitude)
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = GeoPoint::new(33.6844, 73.0479);
        assert!(distance_meters(p, p) < 1e-6);
    }

    #[test]
    fn test_distance_one_degree_longitude_at_equator() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let d = distance_meters(a, b);
        assert!((d - METERS_PER_DEGREE_LAT).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = GeoPoint::new(33.6844, 73.0479);
        let b = GeoPoint::new(33.7294, 73.0931);
        let ab = distance_meters(a, b);
        let ba = distance_meters(b, a);
        assert!((ab - ba).abs() < 1e-9);
        // Islamabad blue area to F-10 is on the order of a few kilometers.
        assert!(ab > 3_000.0 && ab < 10_000.0, "got {ab}");
    }

    #[test]
    fn test_fires_once_inside_radius() {
        let target = GeoPoint::new(33.6844, 73.0479);
        let mut detector = ProximityDetector::new(100.0);
        detector.retarget(target);

        assert!(!detector.observe(north_of(target, 150.0)));
        assert!(detector.observe(north_of(target, 50.0)));
        // Still inside: latched, no second fire.
        assert!(!detector.observe(north_of(target, 40.0)));
    }

    #[test]
    fn test_boundary_point_does_not_fire() {
        let target = GeoPoint::new(33.6844, 73.0479);
        let boundary = north_of(target, 100.0);
        // Use the measured distance as the radius so the comparison is exact.
        let radius = distance_meters(boundary, target);

        let mut detector = ProximityDetector::new(radius);
        detector.retarget(target);
        assert!(!detector.observe(boundary));
        assert!(!detector.has_fired());
    }

    #[test]
    fn test_jitter_across_boundary_does_not_refire() {
        let target = GeoPoint::new(33.6844, 73.0479);
        let mut detector = ProximityDetector::new(100.0);
        detector.retarget(target);

        assert!(detector.observe(north_of(target, 50.0)));
        assert!(!detector.observe(north_of(target, 120.0)));
        assert!(!detector.observe(north_of(target, 60.0)));
        assert!(detector.has_fired());
    }

    #[test]
    fn test_retarget_rearms_latch() {
        let pickup = GeoPoint::new(33.6844, 73.0479);
        let destination = GeoPoint::new(33.7294, 73.0931);
        let mut detector = ProximityDetector::new(100.0);

        detector.retarget(pickup);
        assert!(detector.observe(north_of(pickup, 30.0)));

        detector.retarget(destination);
        assert!(!detector.has_fired());
        assert!(detector.observe(north_of(destination, 30.0)));
    }

    #[test]
    fn test_retarget_same_point_keeps_latch() {
        let pickup = GeoPoint::new(33.6844, 73.0479);
        let mut detector = ProximityDetector::new(100.0);

        detector.retarget(pickup);
        assert!(detector.observe(north_of(pickup, 30.0)));

        detector.retarget(pickup);
        assert!(!detector.observe(north_of(pickup, 30.0)));
    }

    #[test]
    fn test_no_target_never_fires() {
        let mut detector = ProximityDetector::new(100.0);
        assert!(!detector.observe(GeoPoint::new(0.0, 0.0)));

        detector.retarget(GeoPoint::new(0.0, 0.0));
        detector.clear_target();
        assert!(!detector.observe(GeoPoint::new(0.0, 0.0)));
    }
}
