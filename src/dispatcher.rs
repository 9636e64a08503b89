use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;

use crate::error::{LifecycleError, SubmitError};
use crate::session_tracker::{since, PlaySession, SessionState, SessionTracker};
use crate::snapshot::{PlaybackSnapshot, PlaybackState};

/// One play as it is sent to the tracking service and kept in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobbleRecord {
    pub artist: String,
    pub track: String,
    pub album: Option<String>,
    #[serde(rename = "albumArtist")]
    pub album_artist: String,
    /// Epoch seconds at which the play became eligible
    pub timestamp: i64,
}

impl ScrobbleRecord {
    fn from_session(session: &PlaySession, now: DateTime<Utc>) -> Self {
        ScrobbleRecord {
            artist: session.artist.clone(),
            track: session.track.clone(),
            album: session.album.clone(),
            album_artist: session.album_artist.clone(),
            timestamp: session.ready_at().unwrap_or(now).timestamp(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.track)
    }
}

/// Remote service that records scrobbles.
pub trait Submitter {
    fn submit(&self, scrobble: &ScrobbleRecord) -> impl Future<Output = Result<(), SubmitError>> + Send;

    /// Announce the track that just started. Services without the concept accept and ignore it.
    fn now_playing(&self, _snapshot: &PlaybackSnapshot) -> impl Future<Output = Result<(), SubmitError>> + Send {
        async { Ok(()) }
    }
}

/// Durable, append-only record of successful submissions.
pub trait AuditLog {
    fn record(&self, scrobble: &ScrobbleRecord, recorded_at: DateTime<Utc>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    Submitted {
        play_count: u32,
        /// The scrobble went through but the audit log could not be written
        audit_error: Option<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub session_id: u64,
    pub record: ScrobbleRecord,
    pub status: SubmissionStatus,
}

impl SubmissionOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self.status, SubmissionStatus::Submitted { .. })
    }
}

/// Finds finished plays in the tracker and submits each of them exactly once.
pub struct ScrobbleDispatcher<S, A> {
    submitter: S,
    audit_log: A,
    play_counts: HashMap<String, u32>,
}

impl<S: Submitter, A: AuditLog> ScrobbleDispatcher<S, A> {
    pub fn new(submitter: S, audit_log: A) -> Self {
        ScrobbleDispatcher {
            submitter,
            audit_log,
            play_counts: HashMap::new(),
        }
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    pub fn audit_log(&self) -> &A {
        &self.audit_log
    }

    /// Scrobbles recorded for "artist - track" since the process started.
    pub fn play_count(&self, artist: &str, track: &str) -> u32 {
        self.play_counts
            .get(&format!("{} - {}", artist, track))
            .copied()
            .unwrap_or(0)
    }

    /// An ENDED session is due once playback has moved on from it, the
    /// fallback deadline is zero, or the deadline has run out.
    fn is_due(session: &PlaySession, latest: Option<&PlaybackSnapshot>, now: DateTime<Utc>) -> bool {
        let Some(ended_at) = session.ended_at() else {
            return false;
        };

        let moved_on = latest.is_some_and(|snapshot| {
            snapshot.track_id != session.track_id || snapshot.state == PlaybackState::Stopped
        });

        moved_on
            || session.fallback_deadline.is_zero()
            || since(ended_at, now) >= session.fallback_deadline
    }

    /// Submit every session that is due.
    ///
    /// Only the earliest unsubmitted READY/ENDED session of a track may
    /// submit in a scan, so two sessions of one track never race. Failed
    /// submissions leave the session ENDED for the next scan.
    pub async fn scan_and_submit(
        &mut self,
        tracker: &mut SessionTracker,
        latest: Option<&PlaybackSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionOutcome>, LifecycleError> {
        let mut outcomes = Vec::new();
        let mut claimed = HashSet::new();

        for idx in 0..tracker.get_session_count() {
            let session = &tracker.sessions()[idx];
            if !session.is_queued() || !claimed.insert(session.track_id.clone()) {
                continue;
            }
            if session.state() != SessionState::Ended || !Self::is_due(session, latest, now) {
                continue;
            }

            let session_id = session.id;
            let record = ScrobbleRecord::from_session(session, now);
            debug!("Submitting session {}: {}", session_id, record.display_name());

            match self.submitter.submit(&record).await {
                Ok(()) => {
                    tracker.sessions_mut()[idx].mark_submitted(now)?;

                    let key = record.display_name();
                    let play_count = {
                        let count = self.play_counts.entry(key.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    info!("Scrobbled: {} (Play #{})", key, play_count);

                    let audit_error = match self.audit_log.record(&record, now) {
                        Ok(()) => None,
                        Err(e) => {
                            warn!("Could not write scrobble history: {:#}", e);
                            Some(format!("{:#}", e))
                        }
                    };

                    log_queue(tracker);
                    outcomes.push(SubmissionOutcome {
                        session_id,
                        record,
                        status: SubmissionStatus::Submitted {
                            play_count,
                            audit_error,
                        },
                    });
                }
                Err(e) => {
                    error!("Failed to scrobble {}: {}", record.display_name(), e);
                    outcomes.push(SubmissionOutcome {
                        session_id,
                        record,
                        status: SubmissionStatus::Failed {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }

        Ok(outcomes)
    }
}

fn log_queue(tracker: &SessionTracker) {
    let queued = tracker.queued();
    if queued.is_empty() {
        return;
    }

    info!("Queued scrobbles:");
    for session in queued {
        info!(" - {} ({})", session.display_name(), session.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::EligibilityPolicy;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSubmitter {
        calls: Mutex<Vec<ScrobbleRecord>>,
        failing: AtomicBool,
    }

    impl RecordingSubmitter {
        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Submitter for RecordingSubmitter {
        async fn submit(&self, scrobble: &ScrobbleRecord) -> Result<(), SubmitError> {
            self.calls.lock().unwrap().push(scrobble.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(SubmitError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryAuditLog {
        entries: Mutex<Vec<ScrobbleRecord>>,
    }

    impl AuditLog for MemoryAuditLog {
        fn record(&self, scrobble: &ScrobbleRecord, _recorded_at: DateTime<Utc>) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(scrobble.clone());
            Ok(())
        }
    }

    struct BrokenAuditLog;

    impl AuditLog for BrokenAuditLog {
        fn record(&self, _scrobble: &ScrobbleRecord, _recorded_at: DateTime<Utc>) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn snapshot(track_id: &str, duration: u64, position: u64, state: PlaybackState) -> PlaybackSnapshot {
        PlaybackSnapshot {
            track_id: track_id.to_string(),
            track: format!("Song {}", track_id),
            artist: "Test Artist".to_string(),
            album: Some("Test Album".to_string()),
            album_artist: "Test Artist".to_string(),
            duration_secs: duration,
            position_secs: position,
            state,
        }
    }

    fn dispatcher() -> ScrobbleDispatcher<RecordingSubmitter, MemoryAuditLog> {
        ScrobbleDispatcher::new(RecordingSubmitter::default(), MemoryAuditLog::default())
    }

    /// Plays track "1" (100s) until it is READY at t=60 and then reports `state` at t=`end`.
    fn ended_tracker(state: PlaybackState, end: i64) -> (SessionTracker, PlaybackSnapshot) {
        let mut tracker = SessionTracker::default();
        tracker
            .update(&snapshot("1", 100, 0, PlaybackState::Playing), at(0))
            .unwrap();
        tracker
            .update(&snapshot("1", 100, 60, PlaybackState::Playing), at(60))
            .unwrap();
        let last = snapshot("1", 100, 60, state);
        tracker.update(&last, at(end)).unwrap();
        (tracker, last)
    }

    #[tokio::test]
    async fn test_stopped_session_is_submitted_once() {
        let (mut tracker, latest) = ended_tracker(PlaybackState::Stopped, 70);
        let mut dispatcher = dispatcher();

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&latest), at(70))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_submitted());
        // Recorded as started when it became eligible, not when it was sent
        assert_eq!(outcomes[0].record.timestamp, at(60).timestamp());

        let session = &tracker.sessions()[0];
        assert_eq!(session.state(), SessionState::Submitted);
        assert_eq!(session.submitted_at(), Some(at(70)));
        assert_eq!(dispatcher.audit_log().entries.lock().unwrap().len(), 1);

        for secs in 71..80 {
            let outcomes = dispatcher
                .scan_and_submit(&mut tracker, Some(&latest), at(secs))
                .await
                .unwrap();
            assert!(outcomes.is_empty());
        }
        assert_eq!(dispatcher.submitter().call_count(), 1);
        assert_eq!(dispatcher.play_count("Test Artist", "Song 1"), 1);
    }

    #[tokio::test]
    async fn test_failed_submission_is_retried() {
        let (mut tracker, latest) = ended_tracker(PlaybackState::Stopped, 70);
        let mut dispatcher = dispatcher();
        dispatcher.submitter().failing.store(true, Ordering::SeqCst);

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&latest), at(70))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].status, SubmissionStatus::Failed { .. }));
        assert_eq!(tracker.sessions()[0].state(), SessionState::Ended);
        assert!(dispatcher.audit_log().entries.lock().unwrap().is_empty());

        dispatcher.submitter().failing.store(false, Ordering::SeqCst);
        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&latest), at(71))
            .await
            .unwrap();
        assert!(outcomes[0].is_submitted());
        assert_eq!(tracker.sessions()[0].state(), SessionState::Submitted);
        assert_eq!(dispatcher.submitter().call_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_deadline() {
        // 61s track: fallback deadline of 30s, READY after 30.5s
        let mut tracker = SessionTracker::default();
        tracker
            .update(&snapshot("1", 61, 0, PlaybackState::Playing), at(0))
            .unwrap();
        let paused = snapshot("1", 61, 40, PlaybackState::Paused);
        tracker.update(&paused, at(40)).unwrap();
        assert_eq!(tracker.sessions()[0].ended_at(), Some(at(40)));

        let mut dispatcher = dispatcher();

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&paused), at(69))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(dispatcher.submitter().call_count(), 0);

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&paused), at(71))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_submitted());
    }

    #[tokio::test]
    async fn test_absent_snapshot_waits_for_deadline() {
        let (mut tracker, _) = ended_tracker(PlaybackState::Paused, 70);
        let mut dispatcher = dispatcher();

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, None, at(80))
            .await
            .unwrap();
        assert!(outcomes.is_empty());

        // 100s track, 50s deadline
        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, None, at(120))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_fallback_submits_immediately() {
        let policy = EligibilityPolicy {
            fallback_override_secs: Some(0),
            ..Default::default()
        };
        let mut tracker = SessionTracker::new(policy);
        tracker
            .update(&snapshot("1", 100, 0, PlaybackState::Playing), at(0))
            .unwrap();
        let paused = snapshot("1", 100, 60, PlaybackState::Paused);
        tracker.update(&paused, at(60)).unwrap();

        let mut dispatcher = dispatcher();
        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&paused), at(60))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_track_switch_finalizes_previous_track() {
        let mut tracker = SessionTracker::default();
        tracker
            .update(&snapshot("a", 100, 0, PlaybackState::Playing), at(0))
            .unwrap();
        tracker
            .update(&snapshot("a", 100, 60, PlaybackState::Playing), at(60))
            .unwrap();
        assert_eq!(tracker.sessions()[0].state(), SessionState::Ready);

        let next = snapshot("b", 100, 0, PlaybackState::Playing);
        tracker.end_track("a", at(65)).unwrap();
        tracker.update(&next, at(65)).unwrap();

        let mut dispatcher = dispatcher();
        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&next), at(65))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].record.track, "Song a");

        let first = &tracker.sessions()[0];
        assert_eq!(first.ended_at(), Some(at(65)));
        assert_eq!(first.state(), SessionState::Submitted);
        assert_eq!(tracker.sessions()[1].state(), SessionState::Tracking);
    }

    #[tokio::test]
    async fn test_ready_session_is_not_submitted() {
        let mut tracker = SessionTracker::default();
        tracker
            .update(&snapshot("1", 100, 0, PlaybackState::Playing), at(0))
            .unwrap();
        let latest = snapshot("1", 100, 60, PlaybackState::Playing);
        tracker.update(&latest, at(60)).unwrap();

        let mut dispatcher = dispatcher();
        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&latest), at(500))
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(tracker.sessions()[0].state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_sessions_of_one_track_submit_in_order() {
        let mut tracker = SessionTracker::default();
        let track = |position, state| snapshot("1", 100, position, state);
        tracker.update(&track(0, PlaybackState::Playing), at(0)).unwrap();
        tracker.update(&track(95, PlaybackState::Playing), at(95)).unwrap();
        // Replay: the first session ends, a second one starts
        tracker.update(&track(2, PlaybackState::Playing), at(101)).unwrap();
        tracker.update(&track(51, PlaybackState::Paused), at(150)).unwrap();
        assert_eq!(tracker.queued().len(), 2);

        let stopped = track(51, PlaybackState::Stopped);
        let mut dispatcher = dispatcher();

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&stopped), at(200))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].session_id, 1);
        assert_eq!(outcomes[0].record.timestamp, at(95).timestamp());

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&stopped), at(201))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].session_id, 2);
        assert_eq!(outcomes[0].record.timestamp, at(150).timestamp());
        assert_eq!(
            outcomes[0].status,
            SubmissionStatus::Submitted { play_count: 2, audit_error: None }
        );
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_undo_submission() {
        let (mut tracker, latest) = ended_tracker(PlaybackState::Stopped, 70);
        let mut dispatcher = ScrobbleDispatcher::new(RecordingSubmitter::default(), BrokenAuditLog);

        let outcomes = dispatcher
            .scan_and_submit(&mut tracker, Some(&latest), at(70))
            .await
            .unwrap();
        match &outcomes[0].status {
            SubmissionStatus::Submitted { audit_error, .. } => {
                assert!(audit_error.as_deref().unwrap().contains("disk full"));
            }
            other => panic!("Expected submission, got {:?}", other),
        }
        assert_eq!(tracker.sessions()[0].state(), SessionState::Submitted);
    }

    #[test]
    fn test_record_serializes_like_history_file() {
        let record = ScrobbleRecord {
            artist: "Artist".to_string(),
            track: "Track".to_string(),
            album: Some("Album".to_string()),
            album_artist: "Album Artist".to_string(),
            timestamp: 1_700_000_000,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["albumArtist"], "Album Artist");
        assert_eq!(value["timestamp"], 1_700_000_000);
    }
}
