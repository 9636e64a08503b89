//! Error kinds that callers branch on.
//!
//! Everything else in the crate uses `anyhow` at the I/O boundaries.

use thiserror::Error;

use crate::session_tracker::SessionState;

/// An illegal move through the play session lifecycle.
///
/// The tracker and dispatcher only request legal transitions, so seeing one
/// of these means the session history is inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("session {session_id} ({track_id}) cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: u64,
        track_id: String,
        from: SessionState,
        to: SessionState,
    },
}

/// Failure to obtain a playback snapshot from the media server.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("media server responded with status {0}")]
    Status(u16),

    #[error("malformed snapshot payload: {0}")]
    Malformed(String),
}

/// Failure to submit a scrobble to the tracking service.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}
