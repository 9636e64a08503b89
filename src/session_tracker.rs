use chrono::{DateTime, Utc};
use log::{debug, info};
use std::fmt;
use std::time::Duration;

use crate::eligibility::EligibilityPolicy;
use crate::error::LifecycleError;
use crate::snapshot::PlaybackSnapshot;

/// Lifecycle of a play session. Sessions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Tracking,
    Ready,
    Ended,
    Submitted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Tracking => "tracking",
            SessionState::Ready => "ready",
            SessionState::Ended => "ended",
            SessionState::Submitted => "submitted",
        };
        f.write_str(s)
    }
}

/// What a call to [`SessionTracker::update`] did with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Created {
        session_id: u64,
    },
    Updated {
        session_id: u64,
        became_ready: bool,
        ended: bool,
    },
    Replayed {
        session_id: u64,
    },
    SkippedLingering,
    SkippedStale,
}

#[derive(Debug, Clone)]
pub struct PlaySession {
    pub id: u64,
    pub track_id: String,
    pub track: String,
    pub artist: String,
    pub album: Option<String>,
    pub album_artist: String,
    pub duration_secs: u64,
    pub start_time: DateTime<Utc>,
    pub last_position: u64,
    pub fallback_deadline: Duration,
    state: SessionState,
    ready_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    submitted_at: Option<DateTime<Utc>>,
}

impl PlaySession {
    fn new(id: u64, snapshot: &PlaybackSnapshot, now: DateTime<Utc>, policy: &EligibilityPolicy) -> Self {
        PlaySession {
            id,
            track_id: snapshot.track_id.clone(),
            track: snapshot.track.clone(),
            artist: snapshot.artist.clone(),
            album: snapshot.album.clone(),
            album_artist: snapshot.album_artist.clone(),
            duration_secs: snapshot.duration_secs,
            start_time: start_time(now, snapshot.position_secs),
            last_position: snapshot.position_secs,
            fallback_deadline: policy.fallback_deadline(snapshot.duration_secs),
            state: SessionState::Tracking,
            ready_at: None,
            ended_at: None,
            submitted_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.ready_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn is_submitted(&self) -> bool {
        self.state == SessionState::Submitted
    }

    /// READY or ENDED and still waiting for submission.
    pub fn is_queued(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Ended)
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.track)
    }

    /// Wall-clock time since the session started, zero if the clock went backwards.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        since(self.start_time, now)
    }

    pub fn mark_ready(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, LifecycleError> {
        self.expect_state(SessionState::Tracking, SessionState::Ready)?;
        self.state = SessionState::Ready;
        self.ready_at = Some(now);
        Ok(now)
    }

    pub fn mark_ended(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, LifecycleError> {
        self.expect_state(SessionState::Ready, SessionState::Ended)?;
        let at = self.ready_at.map_or(now, |ready| now.max(ready));
        self.state = SessionState::Ended;
        self.ended_at = Some(at);
        Ok(at)
    }

    pub fn mark_submitted(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, LifecycleError> {
        self.expect_state(SessionState::Ended, SessionState::Submitted)?;
        let at = self.ended_at.map_or(now, |ended| now.max(ended));
        self.state = SessionState::Submitted;
        self.submitted_at = Some(at);
        Ok(at)
    }

    fn expect_state(&self, from: SessionState, to: SessionState) -> Result<(), LifecycleError> {
        if self.state != from {
            return Err(LifecycleError::InvalidTransition {
                session_id: self.id,
                track_id: self.track_id.clone(),
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

/// Wall-clock start of a play reported at `position_secs`. Later polls of
/// the same play converge on this value. Out-of-range positions start now.
fn start_time(now: DateTime<Utc>, position_secs: u64) -> DateTime<Utc> {
    i64::try_from(position_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|offset| now.checked_sub_signed(offset))
        .unwrap_or(now)
}

pub(crate) fn since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Ordered, append-only history of play sessions for the single "now playing" stream.
///
/// Only the newest session can absorb snapshots. Once another track has
/// been tracked, coming back to an earlier track starts a fresh session.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    sessions: Vec<PlaySession>,
    policy: EligibilityPolicy,
    next_session_id: u64,
}

impl SessionTracker {
    pub fn new(policy: EligibilityPolicy) -> Self {
        SessionTracker {
            sessions: Vec::new(),
            policy,
            next_session_id: 1,
        }
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    pub fn sessions(&self) -> &[PlaySession] {
        &self.sessions
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut [PlaySession] {
        &mut self.sessions
    }

    pub fn get_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Most recent session recorded for a track, open or not.
    pub fn latest_for_track(&self, track_id: &str) -> Option<&PlaySession> {
        self.sessions.iter().rev().find(|s| s.track_id == track_id)
    }

    pub fn queued(&self) -> Vec<&PlaySession> {
        self.sessions.iter().filter(|s| s.is_queued()).collect()
    }

    fn open_index(&self, track_id: &str) -> Option<usize> {
        match self.sessions.last() {
            Some(last) if last.track_id == track_id => Some(self.sessions.len() - 1),
            _ => None,
        }
    }

    fn start_session(&mut self, snapshot: &PlaybackSnapshot, now: DateTime<Utc>) -> u64 {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        self.sessions
            .push(PlaySession::new(session_id, snapshot, now, &self.policy));
        info!("Tracking new session {} for: {}", session_id, snapshot.display_name());
        session_id
    }

    /// Feed one snapshot into the session history.
    pub fn update(
        &mut self,
        snapshot: &PlaybackSnapshot,
        now: DateTime<Utc>,
    ) -> Result<TrackerEvent, LifecycleError> {
        let mut replayed = false;

        if let Some(idx) = self.open_index(&snapshot.track_id) {
            let previous = &self.sessions[idx];
            if self.policy.is_replay(
                previous.last_position,
                snapshot.duration_secs,
                snapshot.position_secs,
            ) {
                info!(
                    "Detected repeat: {} (position {}s -> {}s)",
                    snapshot.display_name(),
                    previous.last_position,
                    snapshot.position_secs
                );

                // The listen that just finished is complete; let the dispatcher finalize it
                if self.sessions[idx].state() == SessionState::Ready {
                    self.sessions[idx].mark_ended(now)?;
                }
                self.start_session(snapshot, now);
                replayed = true;
            }
        }

        if let Some(idx) = self.open_index(&snapshot.track_id) {
            if !self.sessions[idx].is_submitted() {
                let threshold = self.policy.min_play_threshold(snapshot.duration_secs as f64);
                let session = &mut self.sessions[idx];
                session.last_position = snapshot.position_secs;

                let mut became_ready = false;
                if session.state() == SessionState::Tracking && session.elapsed(now) >= threshold {
                    session.mark_ready(now)?;
                    became_ready = true;
                    info!("Marked track ready to scrobble: {}", session.display_name());
                }

                let mut ended = false;
                if session.state() == SessionState::Ready && snapshot.state.is_halted() {
                    session.mark_ended(now)?;
                    ended = true;
                    info!(
                        "Playback {} after eligibility: {}",
                        snapshot.state,
                        session.display_name()
                    );
                }

                let session_id = session.id;
                return Ok(if replayed {
                    TrackerEvent::Replayed { session_id }
                } else {
                    TrackerEvent::Updated {
                        session_id,
                        became_ready,
                        ended,
                    }
                });
            }

            let session = &self.sessions[idx];
            if let Some(submitted_at) = session.submitted_at() {
                if since(submitted_at, now) < self.policy.linger_window() {
                    debug!(
                        "Skipping fallback: {} already scrobbled and session is lingering",
                        session.display_name()
                    );
                    return Ok(TrackerEvent::SkippedLingering);
                }
            }

            if snapshot.position_secs < self.policy.replay_reset_secs {
                debug!(
                    "Ignoring fallback tracking: stale session detected at offset {}s",
                    snapshot.position_secs
                );
                return Ok(TrackerEvent::SkippedStale);
            }
        }

        let session_id = self.start_session(snapshot, now);
        Ok(TrackerEvent::Created { session_id })
    }

    /// Close out a track that stopped being the one playing.
    ///
    /// Every READY session of the track moves to ENDED so a listen that
    /// qualified before an abrupt switch is still submitted.
    pub fn end_track(&mut self, track_id: &str, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let mut ended = 0;

        for session in self
            .sessions
            .iter_mut()
            .filter(|s| s.track_id == track_id && s.state() == SessionState::Ready)
        {
            session.mark_ended(now)?;
            ended += 1;
            debug!(
                "Marked previous track ended due to new playback: {}",
                session.display_name()
            );
        }

        Ok(ended)
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(EligibilityPolicy::default())
    }
}
