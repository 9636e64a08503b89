//! Plex to Last.fm scrobbler library
//!
//! Reconstructs play sessions from periodic "now playing" snapshots of a
//! Plex Media Server, decides when a listen qualifies as a scrobble and
//! submits each qualifying listen to Last.fm exactly once, keeping a SQLite
//! history of everything submitted.

pub mod database;
pub mod dispatcher;
pub mod eligibility;
pub mod error;
pub mod lastfm;
pub mod monitor;
pub mod plex;
pub mod session_tracker;
pub mod snapshot;

pub use database::{Database, DatabaseStats, ScrobbleStats, StoredScrobble};
pub use dispatcher::{AuditLog, ScrobbleDispatcher, ScrobbleRecord, SubmissionOutcome, SubmissionStatus, Submitter};
pub use eligibility::EligibilityPolicy;
pub use error::{LifecycleError, SourceError, SubmitError};
pub use lastfm::LastFmClient;
pub use monitor::{MonitorSettings, ScrobbleMonitor};
pub use plex::PlexClient;
pub use session_tracker::{PlaySession, SessionState, SessionTracker, TrackerEvent};
pub use snapshot::{PlaybackSnapshot, PlaybackState, SnapshotSource};

/// Current version of the scrobbler
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default scrobble history database relative to home directory
pub const DEFAULT_DB_PATH: &str = "~/.local/share/plexfm/scrobbles.db";

/// Default configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "~/.config/plexfm";
