//! Scrobble eligibility policy.
//!
//! Decides how long a track has to play before it counts as a listen, how
//! long a finished play may wait before it is force-submitted, and what a
//! replay looks like in a stream of position samples.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable constants of the eligibility rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    /// Fraction of the track that has to elapse before it is READY
    pub ready_fraction: f64,

    /// Lower bound of the readiness threshold in seconds
    pub ready_floor_secs: f64,

    /// Upper bound of the readiness threshold in seconds
    pub ready_cap_secs: f64,

    /// A previous position at or past this fraction of the track counts as "near the end"
    pub replay_end_fraction: f64,

    /// A position below this many seconds counts as "back at the start"
    pub replay_reset_secs: u64,

    /// How long a submitted session keeps absorbing duplicate snapshots
    pub linger_window_secs: u64,

    /// Replaces the computed fallback deadline when set; zero submits ended sessions immediately
    pub fallback_override_secs: Option<u64>,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            ready_fraction: 0.5,
            ready_floor_secs: 0.5,
            ready_cap_secs: 240.0,
            replay_end_fraction: 0.9,
            replay_reset_secs: 5,
            linger_window_secs: 300,
            fallback_override_secs: None,
        }
    }
}

impl EligibilityPolicy {
    /// Elapsed wall-clock time a session needs before it becomes READY.
    pub fn min_play_threshold(&self, duration_secs: f64) -> Duration {
        let raw = duration_secs * self.ready_fraction;
        Duration::from_secs_f64(raw.min(self.ready_cap_secs).max(self.ready_floor_secs))
    }

    /// How long an ENDED session may linger before it is submitted anyway.
    pub fn fallback_deadline(&self, duration_secs: u64) -> Duration {
        match self.fallback_override_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs((duration_secs / 2).max(1)),
        }
    }

    /// A position reset is a genuine replay only if the previous sample was near the end.
    ///
    /// Tracks without a known duration never replay; every sample would
    /// otherwise look like it came after the end.
    pub fn is_replay(&self, previous_position: u64, duration_secs: u64, position: u64) -> bool {
        duration_secs > 0
            && previous_position as f64 >= duration_secs as f64 * self.replay_end_fraction
            && position < self.replay_reset_secs
    }

    pub fn linger_window(&self) -> Duration {
        Duration::from_secs(self.linger_window_secs)
    }
}

/// Readiness threshold under the default policy.
pub fn min_play_threshold(duration_secs: f64) -> Duration {
    EligibilityPolicy::default().min_play_threshold(duration_secs)
}

/// Fallback deadline under the default policy.
pub fn fallback_deadline(duration_secs: u64) -> Duration {
    EligibilityPolicy::default().fallback_deadline(duration_secs)
}
