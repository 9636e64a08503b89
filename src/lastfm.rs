// Last.fm scrobbling client
// API documentation: https://www.last.fm/api/scrobbling

use log::{debug, info};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::dispatcher::{ScrobbleRecord, Submitter};
use crate::error::SubmitError;
use crate::snapshot::PlaybackSnapshot;

pub const API_ROOT: &str = "https://ws.audioscrobbler.com/2.0/";

/// Compute `api_sig`: every parameter except `format` as `key+value` in key
/// order, followed by the shared secret, MD5 hashed.
pub fn sign(params: &BTreeMap<&str, String>, api_secret: &str) -> String {
    let mut payload: String = params
        .iter()
        .filter(|(key, _)| **key != "format" && **key != "api_sig")
        .map(|(key, value)| format!("{}{}", key, value))
        .collect();
    payload.push_str(api_secret);

    format!("{:x}", md5::compute(payload.as_bytes()))
}

pub struct LastFmClient {
    api_key: String,
    api_secret: String,
    session_key: String,
    api_root: String,
    client: Client,
}

impl LastFmClient {
    pub fn new(
        api_key: String,
        api_secret: String,
        session_key: String,
        timeout: Duration,
    ) -> Result<Self, SubmitError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_key,
            api_secret,
            session_key,
            api_root: API_ROOT.to_string(),
            client,
        })
    }

    /// Point the client at a different API endpoint.
    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into();
        self
    }

    fn track_params<'a>(
        &self,
        method: &str,
        artist: &str,
        track: &str,
        album: Option<&str>,
        album_artist: &str,
    ) -> BTreeMap<&'a str, String> {
        let mut params = BTreeMap::new();
        params.insert("method", method.to_string());
        params.insert("api_key", self.api_key.clone());
        params.insert("sk", self.session_key.clone());
        params.insert("artist", artist.to_string());
        params.insert("track", track.to_string());
        if let Some(album) = album.filter(|a| !a.is_empty()) {
            params.insert("album", album.to_string());
        }
        params.insert("albumArtist", album_artist.to_string());
        params
    }

    async fn call(&self, mut params: BTreeMap<&str, String>) -> Result<(), SubmitError> {
        let api_sig = sign(&params, &self.api_secret);
        params.insert("api_sig", api_sig);
        params.insert("format", "json".to_string());

        let response = self.client.post(&self.api_root).form(&params).send().await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

impl Submitter for LastFmClient {
    async fn submit(&self, scrobble: &ScrobbleRecord) -> Result<(), SubmitError> {
        debug!(
            "Scrobbling to Last.fm: {} at {}",
            scrobble.display_name(),
            scrobble.timestamp
        );

        let mut params = self.track_params(
            "track.scrobble",
            &scrobble.artist,
            &scrobble.track,
            scrobble.album.as_deref(),
            &scrobble.album_artist,
        );
        params.insert("timestamp", scrobble.timestamp.to_string());

        self.call(params).await
    }

    async fn now_playing(&self, snapshot: &PlaybackSnapshot) -> Result<(), SubmitError> {
        let params = self.track_params(
            "track.updateNowPlaying",
            &snapshot.artist,
            &snapshot.track,
            snapshot.album.as_deref(),
            &snapshot.album_artist,
        );

        self.call(params).await?;
        info!("Updated now playing: {}", snapshot.display_name());
        Ok(())
    }
}
