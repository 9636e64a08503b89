//! Plex Media Server as a snapshot source.
//!
//! Polls `/status/sessions` and turns the first music item into a
//! [`PlaybackSnapshot`].

use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::SourceError;
use crate::snapshot::{PlaybackSnapshot, PlaybackState, SnapshotSource};

const FALLBACK_ALBUM_ARTIST: &str = "Various Artists";

/// Longest duration or offset accepted from Plex, in seconds.
const MAX_MEDIA_SECS: u64 = 7 * 24 * 3600;

/// How far the reported offset may run past the track's end.
const OFFSET_SLACK_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(rename = "MediaContainer", default)]
    media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    rating_key: Option<String>,
    title: Option<String>,
    original_title: Option<String>,
    grandparent_title: Option<String>,
    parent_title: Option<String>,
    duration: Option<u64>,
    view_offset: Option<u64>,
    #[serde(rename = "Player")]
    player: Option<PlayerInfo>,
}

#[derive(Debug, Deserialize)]
struct PlayerInfo {
    state: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl MediaItem {
    fn into_snapshot(self) -> Result<PlaybackSnapshot, SourceError> {
        let track_id = non_empty(self.rating_key)
            .ok_or_else(|| SourceError::Malformed("track without ratingKey".to_string()))?;
        let track = non_empty(self.title)
            .ok_or_else(|| SourceError::Malformed(format!("track {} without title", track_id)))?;
        let grandparent = non_empty(self.grandparent_title);
        let artist = non_empty(self.original_title)
            .or_else(|| grandparent.clone())
            .ok_or_else(|| SourceError::Malformed(format!("track {} without artist", track_id)))?;

        let duration_secs = self.duration.unwrap_or(0) / 1000;
        let position_secs = self.view_offset.unwrap_or(0) / 1000;
        if duration_secs > MAX_MEDIA_SECS || position_secs > MAX_MEDIA_SECS {
            return Err(SourceError::Malformed(format!(
                "track {} has out-of-range timing ({}s of {}s)",
                track_id, position_secs, duration_secs
            )));
        }
        if duration_secs > 0 && position_secs > duration_secs + OFFSET_SLACK_SECS {
            return Err(SourceError::Malformed(format!(
                "track {} offset {}s is past its {}s duration",
                track_id, position_secs, duration_secs
            )));
        }

        Ok(PlaybackSnapshot {
            track_id,
            track,
            artist,
            album: non_empty(self.parent_title),
            album_artist: grandparent.unwrap_or_else(|| FALLBACK_ALBUM_ARTIST.to_string()),
            duration_secs,
            position_secs,
            state: PlaybackState::from_player_state(
                self.player.as_ref().and_then(|p| p.state.as_deref()),
            ),
        })
    }
}

/// Extract the current music snapshot from a `/status/sessions` payload.
///
/// `Ok(None)` means nothing musical is playing.
pub fn parse_sessions(body: &str) -> Result<Option<PlaybackSnapshot>, SourceError> {
    let response: SessionsResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::Malformed(format!("invalid JSON: {}", e)))?;

    response
        .media_container
        .metadata
        .into_iter()
        .find(|item| item.kind.as_deref() == Some("track"))
        .map(MediaItem::into_snapshot)
        .transpose()
}

pub struct PlexClient {
    server_url: String,
    token: String,
    client: Client,
}

impl PlexClient {
    pub fn new(server_url: String, token: String, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub async fn try_fetch(&self) -> Result<Option<PlaybackSnapshot>, SourceError> {
        let url = format!("{}/status/sessions", self.server_url);

        let response = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_sessions(&body)
    }
}

impl SnapshotSource for PlexClient {
    async fn fetch_current(&self) -> Option<PlaybackSnapshot> {
        match self.try_fetch().await {
            Ok(Some(snapshot)) => {
                debug!(
                    "Plex reports {} at {}s/{}s ({})",
                    snapshot.display_name(),
                    snapshot.position_secs,
                    snapshot.duration_secs,
                    snapshot.state
                );
                Some(snapshot)
            }
            Ok(None) => {
                debug!("No music playing on Plex");
                None
            }
            Err(SourceError::Status(status)) => {
                debug!("Plex responded with status {}, possibly idle", status);
                None
            }
            Err(e) => {
                warn!("Could not read Plex sessions: {}", e);
                None
            }
        }
    }
}
