//! # Session Persistence
//!
//! The session document survives restarts: a worker who kills the app mid
//! ride reopens it to the same ride, token and online flag. One small JSON
//! file in the platform data directory, written atomically.
//!
//! ```text
//! ~/.local/share/drover/session.json          (Linux)
//! ~/Library/Application Support/com.drover.drover/session.json  (macOS)
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use drover_core::types::{ActiveRide, Worker};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Session State
// =============================================================================

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Bearer token from the last login.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Last server-confirmed worker profile.
    #[serde(default)]
    pub worker: Option<Worker>,

    /// Ride in progress when the app stopped, if any.
    #[serde(default)]
    pub active_ride: Option<ActiveRide>,

    /// Whether the worker was accepting offers.
    #[serde(default)]
    pub online: bool,
}

// =============================================================================
// Session Store
// =============================================================================

/// Loads and saves the session document.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store at the platform default location.
    pub fn at_default_path() -> EngineResult<Self> {
        let dirs = directories::ProjectDirs::from("com", "drover", "drover").ok_or_else(|| {
            EngineError::SessionLoadFailed("no home directory available".into())
        })?;

        Ok(SessionStore {
            path: dirs.data_dir().join("session.json"),
        })
    }

    /// Store at an explicit path (tests, portable installs).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    /// Where the session document lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted session. A missing file is a fresh default.
    pub fn load(&self) -> EngineResult<SessionState> {
        if !self.path.exists() {
            debug!(path = ?self.path, "No session file, starting fresh");
            return Ok(SessionState::default());
        }

        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| EngineError::SessionLoadFailed(e.to_string()))?;
        let state = serde_json::from_str(&contents)
            .map_err(|e| EngineError::SessionLoadFailed(e.to_string()))?;

        debug!(path = ?self.path, "Session loaded");
        Ok(state)
    }

    /// Loads the session, starting fresh if the file is unreadable.
    pub fn load_or_default(&self) -> SessionState {
        self.load().unwrap_or_else(|e| {
            warn!("Failed to load session: {}. Starting fresh.", e);
            SessionState::default()
        })
    }

    /// Persists the session: write to a temp file, then rename over the
    /// old one, so a crash mid-write never leaves a torn document.
    pub fn save(&self, state: &SessionState) -> EngineResult<()> {
        let parent = self.path.parent().ok_or_else(|| {
            EngineError::SessionSaveFailed("session path has no parent directory".into())
        })?;
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::SessionSaveFailed(e.to_string()))?;

        let contents = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::SessionSaveFailed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .map_err(|e| EngineError::SessionSaveFailed(e.to_string()))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| EngineError::SessionSaveFailed(e.to_string()))?;

        debug!(path = ?self.path, "Session saved");
        Ok(())
    }

    /// Deletes the persisted session (logout). Idempotent.
    pub fn clear(&self) -> EngineResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = ?self.path, "Session cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::SessionSaveFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use drover_core::geo::GeoPoint;
    use drover_core::types::{OfferId, RideOffer, RideStatus, WorkerId};

    use super::*;

    fn sample_state() -> SessionState {
        let offer = RideOffer {
            offer_id: OfferId::new(7),
            pickup: GeoPoint::new(33.6844, 73.0479),
            destination: GeoPoint::new(33.7294, 73.0931),
            reward_points: 120,
            expires_at: Utc::now(),
        };
        let mut worker = Worker::new(WorkerId::new(42), "+92-300-1234567");
        worker.points_balance = 430;
        worker.online = true;

        SessionState {
            auth_token: Some("token-abc".into()),
            worker: Some(worker),
            active_ride: Some(ActiveRide::from_offer(&offer, Utc::now())),
            online: true,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("session.json"));

        let state = sample_state();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.active_ride.map(|r| r.status),
            Some(RideStatus::Accepted)
        );
    }

    #[test]
    fn test_missing_file_is_fresh_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("absent.json"));

        let loaded = store.load().unwrap();
        assert_eq!(loaded, SessionState::default());
        assert!(!loaded.online);
    }

    #[test]
    fn test_corrupt_file_errors_but_default_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = SessionStore::with_path(&path);
        assert!(matches!(
            store.load(),
            Err(EngineError::SessionLoadFailed(_))
        ));
        assert_eq!(store.load_or_default(), SessionState::default());
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("deep/nested/session.json"));

        store.save(&SessionState::default()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_overwrites_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("session.json"));

        store.save(&sample_state()).unwrap();

        let mut newer = sample_state();
        newer.online = false;
        newer.active_ride = None;
        store.save(&newer).unwrap();

        let loaded = store.load().unwrap();
        assert!(!loaded.online);
        assert!(loaded.active_ride.is_none());
        // No stray temp file left behind
        assert!(!dir.path().join("session.json.tmp").exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("session.json"));

        store.save(&sample_state()).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());

        // Clearing again is fine
        store.clear().unwrap();
    }
}
