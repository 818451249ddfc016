//! # Wire Protocol
//!
//! Frame types for both push channels and the normalization step that turns
//! their different shapes into one internal event.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Channel Wire Protocol                            │
//! │                                                                         │
//! │  SESSION CHANNEL (A): commands, acks, direct pushes                    │
//! │  ───────────────────────────────────────────────────                   │
//! │  client ───► register      { requestId, workerId, authToken }          │
//! │  client ───► acceptOffer   { requestId, offerId, workerId }            │
//! │  client ───► confirmPickup { requestId, rideId }                       │
//! │  server ◄─── ack           { requestId, success, ride?, ... }          │
//! │  server ───► rideStatusChanged { ride }                                 │
//! │  server ───► offerFilled   { offerId }                                  │
//! │                                                                         │
//! │  TOPIC CHANNEL (B): broker-style pub/sub                               │
//! │  ────────────────────────────────────────                              │
//! │  client ───► subscribe     { topic: "workers/42/offers" }              │
//! │  client ───► publish       { topic, data }                             │
//! │  broker ───► event         { topic, data: { event: "newOffer", ... } } │
//! │                                                                         │
//! │  NORMALIZATION                                                         │
//! │  ─────────────                                                         │
//! │  both channels ──► ChannelEvent { OfferCreated | OfferWithdrawn |      │
//! │                                   RideChanged  | ServerNotice }        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format (JSON)
//! Frames are serialized as tagged JSON using serde's adjacently tagged enum:
//! ```json
//! { "type": "acceptOffer", "payload": { "requestId": "...", ... } }
//! ```
//!
//! The two channels disagree about everything else (delivery, ordering,
//! duplication), so everything inbound is funneled through [`normalize_session`]
//! and [`normalize_topic`] at the adapter boundary. A frame that fails to
//! parse is logged and dropped there; nothing malformed gets past this module.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drover_core::geo::{GeoLocation, GeoPoint};
use drover_core::types::{OfferId, RideId, RideOffer, RideUpdate, Worker, WorkerId};

/// Current protocol version, sent with every registration.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Session Frames (Channel A)
// =============================================================================

/// All frames on the session channel, both directions.
///
/// Uses serde's adjacently tagged enum for clean JSON serialization:
/// `{ "type": "acceptOffer", "payload": { ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionFrame {
    // =========================================================================
    // Commands (client → server), each answered by an Ack
    // =========================================================================

    /// Binds this connection to a worker. Sent first on every (re)connect.
    Register(RegisterPayload),

    /// Claim an offer. Contended: first worker wins.
    AcceptOffer(AcceptOfferPayload),

    /// Decline an offer so dispatch can stop waiting for this worker.
    RejectOffer(RejectOfferPayload),

    /// Passenger picked up.
    ConfirmPickup(ConfirmPickupPayload),

    /// Passenger dropped off.
    CompleteRide(CompleteRidePayload),

    /// Worker went online/offline.
    UpdateStatus(UpdateStatusPayload),

    /// Periodic position report.
    UpdateLocation(UpdateLocationPayload),

    // =========================================================================
    // Acknowledgement (server → client)
    // =========================================================================

    /// Verdict for one command, correlated by request id.
    Ack(AckPayload),

    // =========================================================================
    // Pushes (server → client)
    // =========================================================================

    /// A new offer is available to this worker.
    NewOffer(NewOfferPayload),

    /// Another worker claimed the offer first.
    OfferFilled(OfferFilledPayload),

    /// Dispatch revoked the offer.
    OfferWithdrawn(OfferWithdrawnPayload),

    /// The active ride changed server-side.
    RideStatusChanged(RideStatusChangedPayload),

    // =========================================================================
    // Keepalive & Errors
    // =========================================================================

    /// Ping for keepalive.
    Ping { timestamp: String },

    /// Pong response for keepalive.
    Pong { timestamp: String },

    /// Out-of-band server error.
    Error { code: String, message: String },
}

// =============================================================================
// Command Payloads
// =============================================================================

/// Registration command, the first frame after every connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Worker this connection acts for.
    pub worker_id: WorkerId,

    /// Protocol version supported by this client.
    pub protocol_version: u32,

    /// Bearer token from the last login, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Accept command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOfferPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Offer being claimed.
    pub offer_id: OfferId,

    /// Worker claiming it.
    pub worker_id: WorkerId,
}

/// Reject command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectOfferPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Offer being declined.
    pub offer_id: OfferId,

    /// Worker declining it.
    pub worker_id: WorkerId,
}

/// Pickup confirmation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPickupPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Ride the passenger boarded.
    pub ride_id: RideId,
}

/// Completion command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRidePayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Ride that finished.
    pub ride_id: RideId,

    /// Where the drop-off happened, if a recent fix exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_location: Option<GeoPoint>,
}

/// Online/offline command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Worker whose status changed.
    pub worker_id: WorkerId,

    /// True when accepting offers.
    pub online: bool,
}

/// Position report command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocationPayload {
    /// Correlation id for the ack.
    pub request_id: Uuid,

    /// Worker being located.
    pub worker_id: WorkerId,

    /// The position sample.
    pub location: GeoPoint,

    /// When the sample was taken (ISO8601).
    pub recorded_at: String,
}

// =============================================================================
// Acknowledgement Payload
// =============================================================================

/// Server verdict for one command.
///
/// Everything beyond `requestId` and `success` is optional: which fields the
/// server fills depends on the command being answered. A register ack carries
/// the worker profile, an accept ack the authoritative ride, a completion ack
/// the awarded points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Correlates this ack with its command.
    pub request_id: Uuid,

    /// Whether the command was applied server-side.
    pub success: bool,

    /// Human-readable reason when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Authoritative ride record (accept/pickup/complete acks).
    #[serde(default)]
    pub ride: Option<RideUpdate>,

    /// Points credited by a completion ack.
    #[serde(default)]
    pub awarded_points: Option<i64>,

    /// Worker profile (register acks, occasionally completion acks).
    #[serde(default)]
    pub worker: Option<Worker>,
}

// =============================================================================
// Push Payloads
// =============================================================================

/// A new offer pushed over the session channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOfferPayload {
    /// The offer.
    pub offer: RideOffer,
}

/// An offer claimed by some other worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferFilledPayload {
    /// The offer that is gone.
    pub offer_id: OfferId,
}

/// An offer revoked by dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferWithdrawnPayload {
    /// The offer that is gone.
    pub offer_id: OfferId,
}

/// A server-side ride change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusChangedPayload {
    /// Partial ride record; only the id is guaranteed present.
    pub ride: RideUpdate,
}

// =============================================================================
// Topic Frames (Channel B)
// =============================================================================

/// All frames on the topic channel, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum TopicFrame {
    /// Start receiving events for a topic.
    Subscribe { topic: String },

    /// Stop receiving events for a topic.
    Unsubscribe { topic: String },

    /// Fire-and-forget publish (telemetry).
    Publish(PublishPayload),

    /// Broker delivery for a subscribed topic.
    Event(EventPayload),

    /// Ping for keepalive.
    Ping { timestamp: String },

    /// Pong response for keepalive.
    Pong { timestamp: String },
}

/// Outbound publish body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    /// Destination topic.
    pub topic: String,

    /// Arbitrary JSON payload.
    pub data: serde_json::Value,
}

/// Inbound broker delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Topic the event was published on.
    pub topic: String,

    /// The event body; see [`TopicEvent`] for the shapes Drover consumes.
    pub data: serde_json::Value,
}

/// Event bodies carried on the offer and ride topics.
///
/// Internally tagged: `{ "event": "newOffer", "offer": { ... } }`. The topic
/// broker treats bodies as opaque JSON, so the tag travels inside the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TopicEvent {
    /// A new offer for this worker.
    #[serde(rename_all = "camelCase")]
    NewOffer { offer: RideOffer },

    /// Offer claimed by another worker.
    #[serde(rename_all = "camelCase")]
    OfferFilled { offer_id: OfferId },

    /// Offer revoked by dispatch.
    #[serde(rename_all = "camelCase")]
    OfferWithdrawn { offer_id: OfferId },

    /// The ride changed server-side.
    #[serde(rename_all = "camelCase")]
    RideStatusChanged { ride: RideUpdate },
}

// =============================================================================
// Telemetry Broadcast Bodies (topic publishes)
// =============================================================================

/// Location telemetry published on `workers/{id}/location`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBroadcast {
    /// Worker being located.
    pub worker_id: WorkerId,

    /// The position sample.
    pub location: GeoPoint,

    /// When the sample was taken (ISO8601).
    pub recorded_at: String,
}

/// Status telemetry published on `workers/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBroadcast {
    /// Worker whose status changed.
    pub worker_id: WorkerId,

    /// True when accepting offers.
    pub online: bool,
}

// =============================================================================
// Topic Names
// =============================================================================

/// Topic name builders, the single source for the naming scheme.
pub mod topics {
    use drover_core::types::{RideId, WorkerId};

    /// Offers addressed to one worker.
    pub fn worker_offers(worker: WorkerId) -> String {
        format!("workers/{worker}/offers")
    }

    /// Status and fill events for one ride.
    pub fn ride_events(ride: RideId) -> String {
        format!("rides/{ride}/events")
    }

    /// Location telemetry for one worker.
    pub fn worker_location(worker: WorkerId) -> String {
        format!("workers/{worker}/location")
    }

    /// Online/offline telemetry for one worker.
    pub fn worker_status(worker: WorkerId) -> String {
        format!("workers/{worker}/status")
    }
}

// =============================================================================
// Normalized Channel Event
// =============================================================================

/// What the engine actually consumes, regardless of source channel.
///
/// Both adapters reduce their inbound frames to this enum; past this point
/// the engine neither knows nor cares which channel delivered an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The session channel finished its register handshake.
    Registered { worker: Option<Worker> },

    /// An offer was created (new offer push, from either channel).
    OfferCreated(RideOffer),

    /// An offer is gone (filled by another worker, or revoked).
    OfferWithdrawn(OfferId),

    /// The active ride changed server-side.
    RideChanged(RideUpdate),

    /// The server reported an out-of-band error.
    ServerNotice { code: String, message: String },
}

/// Reduces an inbound session frame to a channel event.
///
/// Returns `None` for frames the adapter consumes itself (acks, keepalive)
/// and for command frames a confused server echoed back.
pub fn normalize_session(frame: SessionFrame) -> Option<ChannelEvent> {
    match frame {
        SessionFrame::NewOffer(p) => Some(ChannelEvent::OfferCreated(p.offer)),
        SessionFrame::OfferFilled(p) => Some(ChannelEvent::OfferWithdrawn(p.offer_id)),
        SessionFrame::OfferWithdrawn(p) => Some(ChannelEvent::OfferWithdrawn(p.offer_id)),
        SessionFrame::RideStatusChanged(p) => Some(ChannelEvent::RideChanged(p.ride)),
        SessionFrame::Error { code, message } => Some(ChannelEvent::ServerNotice { code, message }),
        _ => None,
    }
}

/// Reduces a topic event body to a channel event. Total: every body maps.
pub fn normalize_topic(event: TopicEvent) -> ChannelEvent {
    match event {
        TopicEvent::NewOffer { offer } => ChannelEvent::OfferCreated(offer),
        TopicEvent::OfferFilled { offer_id } => ChannelEvent::OfferWithdrawn(offer_id),
        TopicEvent::OfferWithdrawn { offer_id } => ChannelEvent::OfferWithdrawn(offer_id),
        TopicEvent::RideStatusChanged { ride } => ChannelEvent::RideChanged(ride),
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

impl SessionFrame {
    /// Returns the frame type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionFrame::Register(_) => "register",
            SessionFrame::AcceptOffer(_) => "acceptOffer",
            SessionFrame::RejectOffer(_) => "rejectOffer",
            SessionFrame::ConfirmPickup(_) => "confirmPickup",
            SessionFrame::CompleteRide(_) => "completeRide",
            SessionFrame::UpdateStatus(_) => "updateStatus",
            SessionFrame::UpdateLocation(_) => "updateLocation",
            SessionFrame::Ack(_) => "ack",
            SessionFrame::NewOffer(_) => "newOffer",
            SessionFrame::OfferFilled(_) => "offerFilled",
            SessionFrame::OfferWithdrawn(_) => "offerWithdrawn",
            SessionFrame::RideStatusChanged(_) => "rideStatusChanged",
            SessionFrame::Ping { .. } => "ping",
            SessionFrame::Pong { .. } => "pong",
            SessionFrame::Error { .. } => "error",
        }
    }

    /// Creates a register command.
    pub fn register(request_id: Uuid, worker_id: WorkerId, auth_token: Option<String>) -> Self {
        SessionFrame::Register(RegisterPayload {
            request_id,
            worker_id,
            protocol_version: PROTOCOL_VERSION,
            auth_token,
        })
    }

    /// Creates an accept command.
    pub fn accept_offer(request_id: Uuid, offer_id: OfferId, worker_id: WorkerId) -> Self {
        SessionFrame::AcceptOffer(AcceptOfferPayload {
            request_id,
            offer_id,
            worker_id,
        })
    }

    /// Creates a reject command.
    pub fn reject_offer(request_id: Uuid, offer_id: OfferId, worker_id: WorkerId) -> Self {
        SessionFrame::RejectOffer(RejectOfferPayload {
            request_id,
            offer_id,
            worker_id,
        })
    }

    /// Creates a pickup confirmation command.
    pub fn confirm_pickup(request_id: Uuid, ride_id: RideId) -> Self {
        SessionFrame::ConfirmPickup(ConfirmPickupPayload {
            request_id,
            ride_id,
        })
    }

    /// Creates a completion command.
    pub fn complete_ride(
        request_id: Uuid,
        ride_id: RideId,
        final_location: Option<GeoPoint>,
    ) -> Self {
        SessionFrame::CompleteRide(CompleteRidePayload {
            request_id,
            ride_id,
            final_location,
        })
    }

    /// Creates an online/offline command.
    pub fn update_status(request_id: Uuid, worker_id: WorkerId, online: bool) -> Self {
        SessionFrame::UpdateStatus(UpdateStatusPayload {
            request_id,
            worker_id,
            online,
        })
    }

    /// Creates a position report command.
    pub fn update_location(request_id: Uuid, worker_id: WorkerId, location: &GeoLocation) -> Self {
        SessionFrame::UpdateLocation(UpdateLocationPayload {
            request_id,
            worker_id,
            location: location.point,
            recorded_at: location.recorded_at.to_rfc3339(),
        })
    }

    /// Creates a Pong answering a server ping.
    pub fn pong(ping_timestamp: &str) -> Self {
        SessionFrame::Pong {
            timestamp: ping_timestamp.to_string(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl TopicFrame {
    /// Returns the frame type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            TopicFrame::Subscribe { .. } => "subscribe",
            TopicFrame::Unsubscribe { .. } => "unsubscribe",
            TopicFrame::Publish(_) => "publish",
            TopicFrame::Event(_) => "event",
            TopicFrame::Ping { .. } => "ping",
            TopicFrame::Pong { .. } => "pong",
        }
    }

    /// Creates a subscribe frame.
    pub fn subscribe(topic: impl Into<String>) -> Self {
        TopicFrame::Subscribe {
            topic: topic.into(),
        }
    }

    /// Creates an unsubscribe frame.
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        TopicFrame::Unsubscribe {
            topic: topic.into(),
        }
    }

    /// Creates a publish frame.
    pub fn publish(topic: impl Into<String>, data: serde_json::Value) -> Self {
        TopicFrame::Publish(PublishPayload {
            topic: topic.into(),
            data,
        })
    }

    /// Creates a Pong answering a broker ping.
    pub fn pong(ping_timestamp: &str) -> Self {
        TopicFrame::Pong {
            timestamp: ping_timestamp.to_string(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
