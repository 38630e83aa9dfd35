use std::time::Duration;

/// Tunable timing knobs for a `Peer`.
///
/// The teacher hard-codes these as module consts (`ELECTION_TIMEOUT`,
/// `HEARTBEAT_TIMEOUT`); a library crate embedded by many different
/// hosts can't assume one tuning fits all of them, so they're exposed
/// here instead, with `Config::default()` matching the teacher's values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Election timeout is chosen uniformly from this range each time a
    /// follower or candidate (re)arms its timer.
    pub election_timeout: (Duration, Duration),

    /// How often a leader sends AppendEntries to an up-to-date follower
    /// in the absence of new entries to replicate.
    pub heartbeat_interval: Duration,

    /// Divides every duration above. Integration tests that want the
    /// whole protocol to run faster than real time (without skewing the
    /// *ratio* between election timeout and heartbeat interval) set this
    /// above 1.
    pub time_scale: u32,
}

impl Config {
    /// Election timeout and heartbeat interval after dividing by
    /// `time_scale`.
    pub fn election_timeout(&self) -> (Duration, Duration) {
        let (lo, hi) = self.election_timeout;
        (lo / self.time_scale, hi / self.time_scale)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval / self.time_scale
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            election_timeout: (Duration::from_millis(150), Duration::from_millis(300)),
            heartbeat_interval: Duration::from_millis(150),
            time_scale: 1,
        }
    }
}
