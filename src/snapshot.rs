use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

impl PlaybackState {
    /// A player without a reported state is stopped; transient states such
    /// as buffering keep counting as playback.
    pub fn from_player_state(state: Option<&str>) -> Self {
        match state {
            None | Some("stopped") => PlaybackState::Stopped,
            Some("paused") => PlaybackState::Paused,
            Some(_) => PlaybackState::Playing,
        }
    }

    pub fn is_halted(self) -> bool {
        matches!(self, PlaybackState::Paused | PlaybackState::Stopped)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One poll's view of what the media player is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub track_id: String,
    pub track: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_artist: String,
    pub duration_secs: u64,
    pub position_secs: u64,
    pub state: PlaybackState,
}

impl PlaybackSnapshot {
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.track)
    }
}

/// Where snapshots come from.
///
/// Implementations swallow their own failures: a fetch that cannot produce a
/// usable snapshot yields `None`, which callers read as "nothing new this
/// cycle" and never as "playback stopped".
pub trait SnapshotSource {
    fn fetch_current(&self) -> impl Future<Output = Option<PlaybackSnapshot>> + Send;
}
