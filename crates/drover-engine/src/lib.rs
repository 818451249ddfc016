//! # drover-engine: Offer & Ride Synchronization for Drover
//!
//! Everything between the dispatch servers and the driver's screen: two
//! WebSocket channels, a REST fallback, and the single event loop that turns
//! their unordered, duplicated, gap-prone deliveries into one consistent
//! state snapshot.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Drover Architecture                              │
//! │                                                                         │
//! │   dispatch session (ws) ──┐                  ┌── topic broker (ws)     │
//! │   commands + acks + push  │                  │   pub/sub push          │
//! │                           ▼                  ▼                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 ★ drover-engine (THIS CRATE) ★                  │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  session  │  │   topic   │  │   rest    │  │  persist  │  │   │
//! │  │   │ channel A │  │ channel B │  │ seed/sync │  │  session  │  │   │
//! │  │   └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘  │   │
//! │  │         └───────┬──────┴───────┬──────┘              │         │   │
//! │  │                 ▼              ▼                     ▼         │   │
//! │  │           ┌──────────────────────────────────────────────┐    │   │
//! │  │           │        engine (one select! loop owns         │    │   │
//! │  │           │     OfferBoard + RideMachine + detector)     │    │   │
//! │  │           └──────────────────────┬───────────────────────┘    │   │
//! │  │                                  │ watch snapshots            │   │
//! │  │                            ┌─────▼─────┐                      │   │
//! │  │                            │   store   │                      │   │
//! │  │                            └───────────┘                      │   │
//! │  └─────────────────────────────────┬───────────────────────────────┘   │
//! │                                    │                                    │
//! │                         driver presentation layer                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - The synchronization loop, its handle, and its builder
//! - [`session`] - Channel A: registered WebSocket with request/ack commands
//! - [`topic`] - Channel B: broker-style pub/sub with subscription replay
//! - [`rest`] - REST fallback used to seed and reconcile state
//! - [`store`] - Watch-based snapshot published after every change
//! - [`persist`] - Session file so a ride survives an app restart
//! - [`protocol`] - Wire frames for both channels and their normalization
//! - [`channel`] - Connection plumbing shared by both channels
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Engine error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use drover_engine::{EngineConfig, SyncEngine};
//!
//! # async fn run() -> Result<(), drover_engine::EngineError> {
//! let config = EngineConfig::load_or_default(None);
//! let engine = SyncEngine::spawn(config)?;
//!
//! let mut snapshots = engine.subscribe();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow().clone();
//!     println!("{} offers pending", snapshot.offers.len());
//! }
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod rest;
pub mod session;
pub mod store;
pub mod topic;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use channel::{BackoffSettings, ChannelHealth, ChannelKind, ChannelState};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, EngineHandle, SyncEngine};
pub use error::{EngineError, EngineResult};
pub use persist::{SessionState, SessionStore};
pub use protocol::ChannelEvent;
pub use rest::{DispatchApi, RestClient, RestSnapshot};
pub use session::{CommandVerdict, SessionHandle};
pub use store::{Connectivity, EngineSnapshot, StateStore};
pub use topic::TopicHandle;
