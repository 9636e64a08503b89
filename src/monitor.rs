use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{AuditLog, ScrobbleDispatcher, SubmissionOutcome, Submitter};
use crate::session_tracker::SessionTracker;
use crate::snapshot::{PlaybackSnapshot, SnapshotSource};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Pause after a failed cycle before polling again
    pub error_backoff: Duration,
    pub send_now_playing: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
            send_now_playing: false,
        }
    }
}

/// Polls the snapshot source and drives the tracker and dispatcher.
///
/// Owns the only session history, so nothing else mutates it.
pub struct ScrobbleMonitor<Src, Sub, A> {
    source: Src,
    tracker: SessionTracker,
    dispatcher: ScrobbleDispatcher<Sub, A>,
    settings: MonitorSettings,
    current_track: Option<String>,
}

impl<Src, Sub, A> ScrobbleMonitor<Src, Sub, A>
where
    Src: SnapshotSource,
    Sub: Submitter,
    A: AuditLog,
{
    pub fn new(
        source: Src,
        tracker: SessionTracker,
        dispatcher: ScrobbleDispatcher<Sub, A>,
        settings: MonitorSettings,
    ) -> Self {
        ScrobbleMonitor {
            source,
            tracker,
            dispatcher,
            settings,
            current_track: None,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &ScrobbleDispatcher<Sub, A> {
        &self.dispatcher
    }

    pub fn current_track(&self) -> Option<&str> {
        self.current_track.as_deref()
    }

    pub async fn start_monitoring(&mut self) -> Result<()> {
        info!(
            "Starting scrobble monitoring (polling every {} ms)",
            self.settings.poll_interval.as_millis()
        );

        let mut poll_interval = tokio::time::interval(self.settings.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            poll_interval.tick().await;

            if let Err(e) = self.run_cycle(Utc::now()).await {
                error!("Main loop error: {:#}", e);
                tokio::time::sleep(self.settings.error_backoff).await;
            }
        }
    }

    /// One poll: fetch a snapshot, update the sessions, then submit whatever is due.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<Vec<SubmissionOutcome>> {
        let snapshot = self.source.fetch_current().await;

        if let Some(ref snapshot) = snapshot {
            if self.current_track.as_deref() != Some(snapshot.track_id.as_str()) {
                self.handle_track_switch(snapshot, now).await?;
            }

            let event = self.tracker.update(snapshot, now)?;
            debug!("Session update for {}: {:?}", snapshot.display_name(), event);
        }

        let outcomes = self
            .dispatcher
            .scan_and_submit(&mut self.tracker, snapshot.as_ref(), now)
            .await?;
        Ok(outcomes)
    }

    async fn handle_track_switch(&mut self, snapshot: &PlaybackSnapshot, now: DateTime<Utc>) -> Result<()> {
        if let Some(previous) = self.current_track.as_deref() {
            let ended = self.tracker.end_track(previous, now)?;
            if ended > 0 {
                debug!("Ended {} session(s) of track {} on switch", ended, previous);
            }
        }

        info!("Now playing: {}", snapshot.display_name());
        info!(
            "Fallback timeout set to {} seconds for this track",
            self.tracker
                .policy()
                .fallback_deadline(snapshot.duration_secs)
                .as_secs()
        );

        if self.settings.send_now_playing {
            if let Err(e) = self.dispatcher.submitter().now_playing(snapshot).await {
                warn!("Error sending now playing update: {}", e);
            }
        }

        self.current_track = Some(snapshot.track_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::dispatcher::ScrobbleRecord;
    use crate::error::SubmitError;
    use crate::session_tracker::SessionState;
    use crate::snapshot::PlaybackState;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct ScriptedSource {
        snapshots: Mutex<VecDeque<Option<PlaybackSnapshot>>>,
    }

    impl ScriptedSource {
        fn push(&self, snapshot: Option<PlaybackSnapshot>) {
            self.snapshots.lock().unwrap().push_back(snapshot);
        }
    }

    impl SnapshotSource for ScriptedSource {
        async fn fetch_current(&self) -> Option<PlaybackSnapshot> {
            self.snapshots.lock().unwrap().pop_front().flatten()
        }
    }

    #[derive(Default)]
    struct CountingSubmitter {
        scrobbles: Mutex<Vec<ScrobbleRecord>>,
        now_playing: Mutex<Vec<String>>,
    }

    impl Submitter for CountingSubmitter {
        async fn submit(&self, scrobble: &ScrobbleRecord) -> Result<(), SubmitError> {
            self.scrobbles.lock().unwrap().push(scrobble.clone());
            Ok(())
        }

        async fn now_playing(&self, snapshot: &PlaybackSnapshot) -> Result<(), SubmitError> {
            self.now_playing.lock().unwrap().push(snapshot.track_id.clone());
            Ok(())
        }
    }

    type TestMonitor = ScrobbleMonitor<ScriptedSource, CountingSubmitter, Database>;

    fn monitor(db_file: &NamedTempFile, send_now_playing: bool) -> TestMonitor {
        let db = Database::new(db_file.path()).unwrap();
        let settings = MonitorSettings {
            send_now_playing,
            ..Default::default()
        };
        ScrobbleMonitor::new(
            ScriptedSource::default(),
            SessionTracker::default(),
            ScrobbleDispatcher::new(CountingSubmitter::default(), db),
            settings,
        )
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

    async fn step(monitor: &mut TestMonitor, snapshot: Option<PlaybackSnapshot>, now: DateTime<Utc>) -> Vec<SubmissionOutcome> {
        monitor.source.push(snapshot);
        monitor.run_cycle(now).await.unwrap()
    }

    #[tokio::test]
    async fn test_full_listen_is_scrobbled_once() {
        let db_file = NamedTempFile::new().unwrap();
        let mut monitor = monitor(&db_file, false);

        for secs in 0..200 {
            let playing = snapshot("1", 200, secs as u64, PlaybackState::Playing);
            let outcomes = step(&mut monitor, Some(playing), at(secs)).await;
            assert!(outcomes.is_empty());

            let expected = if secs < 100 { SessionState::Tracking } else { SessionState::Ready };
            assert_eq!(monitor.tracker().sessions()[0].state(), expected);
        }
        assert_eq!(monitor.tracker().get_session_count(), 1);
        assert_eq!(monitor.tracker().sessions()[0].ready_at(), Some(at(100)));

        let stopped = snapshot("1", 200, 199, PlaybackState::Stopped);
        let outcomes = step(&mut monitor, Some(stopped.clone()), at(200)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_submitted());

        let session = &monitor.tracker().sessions()[0];
        assert_eq!(session.state(), SessionState::Submitted);
        assert_eq!(session.ended_at(), Some(at(200)));
        assert_eq!(session.submitted_at(), Some(at(200)));

        let history = monitor.dispatcher().audit_log().all_scrobbles().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, at(100).timestamp());

        // The player keeps reporting the stopped track
        for secs in 201..210 {
            let outcomes = step(&mut monitor, Some(stopped.clone()), at(secs)).await;
            assert!(outcomes.is_empty());
        }
        assert_eq!(monitor.dispatcher().submitter().scrobbles.lock().unwrap().len(), 1);
        assert_eq!(monitor.tracker().get_session_count(), 1);
    }

    #[tokio::test]
    async fn test_absent_snapshot_changes_nothing() {
        let db_file = NamedTempFile::new().unwrap();
        let mut monitor = monitor(&db_file, false);

        assert!(step(&mut monitor, None, at(0)).await.is_empty());
        assert_eq!(monitor.tracker().get_session_count(), 0);
        assert_eq!(monitor.current_track(), None);

        step(&mut monitor, Some(snapshot("1", 100, 0, PlaybackState::Playing)), at(1)).await;
        step(&mut monitor, Some(snapshot("1", 100, 60, PlaybackState::Playing)), at(61)).await;
        step(&mut monitor, None, at(62)).await;

        let session = &monitor.tracker().sessions()[0];
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.last_position, 60);
        assert_eq!(monitor.current_track(), Some("1"));
    }

    #[tokio::test]
    async fn test_track_switch_submits_previous_track() {
        let db_file = NamedTempFile::new().unwrap();
        let mut monitor = monitor(&db_file, true);

        step(&mut monitor, Some(snapshot("a", 100, 0, PlaybackState::Playing)), at(0)).await;
        step(&mut monitor, Some(snapshot("a", 100, 70, PlaybackState::Playing)), at(70)).await;

        let outcomes = step(&mut monitor, Some(snapshot("b", 180, 0, PlaybackState::Playing)), at(71)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].record.track, "Song a");
        assert_eq!(outcomes[0].record.timestamp, at(70).timestamp());

        let first = &monitor.tracker().sessions()[0];
        assert_eq!(first.ended_at(), Some(at(71)));
        assert_eq!(monitor.tracker().sessions()[1].track_id, "b");
        assert_eq!(monitor.current_track(), Some("b"));

        let announced = monitor.dispatcher().submitter().now_playing.lock().unwrap().clone();
        assert_eq!(announced, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_short_listen_is_not_scrobbled() {
        let db_file = NamedTempFile::new().unwrap();
        let mut monitor = monitor(&db_file, false);

        step(&mut monitor, Some(snapshot("a", 100, 0, PlaybackState::Playing)), at(0)).await;
        step(&mut monitor, Some(snapshot("a", 100, 20, PlaybackState::Playing)), at(20)).await;
        let outcomes = step(&mut monitor, Some(snapshot("b", 100, 0, PlaybackState::Playing)), at(21)).await;

        assert!(outcomes.is_empty());
        assert_eq!(monitor.tracker().sessions()[0].state(), SessionState::Tracking);
        assert!(monitor.dispatcher().submitter().now_playing.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_track_is_scrobbled_twice() {
        let db_file = NamedTempFile::new().unwrap();
        let mut monitor = monitor(&db_file, false);

        for secs in (0..=100).step_by(5) {
            step(&mut monitor, Some(snapshot("1", 100, secs as u64, PlaybackState::Playing)), at(secs)).await;
        }
        // Player loops back to the start
        step(&mut monitor, Some(snapshot("1", 100, 1, PlaybackState::Playing)), at(101)).await;
        assert_eq!(monitor.tracker().get_session_count(), 2);

        for secs in (105..=160).step_by(5) {
            step(&mut monitor, Some(snapshot("1", 100, (secs - 100) as u64, PlaybackState::Playing)), at(secs)).await;
        }
        let outcomes = step(&mut monitor, Some(snapshot("2", 100, 0, PlaybackState::Playing)), at(161)).await;

        let history = monitor.dispatcher().audit_log().all_scrobbles().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, at(50).timestamp());
        assert_eq!(history[1].timestamp, at(150).timestamp());
        // The first play already went out on its fallback deadline
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].session_id, 2);
        assert_eq!(monitor.dispatcher().play_count("Test Artist", "Song 1"), 2);
    }
}
