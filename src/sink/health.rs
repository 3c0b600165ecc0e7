//! Failure-episode bookkeeping shared by the unreliable sinks.
//!
//! A failure episode starts at the first failure after a success (or after
//! connecting) and ends with the next success. Within one episode the owner
//! is told to restart at most once; every later failure is absorbed.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Uninitialized,
    Connected,
    Failed,
}

/// What the sink should do about a failure it just observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    Restart,
    Absorb,
}

#[derive(Clone, Debug)]
pub struct SinkHealth {
    state: SinkState,
    restart_attempted: bool,
    failures: u64,
    restarts: u64,
}

impl Default for SinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkHealth {
    pub fn new() -> Self {
        Self {
            state: SinkState::Uninitialized,
            restart_attempted: false,
            failures: 0,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn restart_attempted(&self) -> bool {
        self.restart_attempted
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Resource (re)established. Does not end a failure episode.
    pub fn mark_connected(&mut self) {
        self.state = SinkState::Connected;
    }

    /// A successful operation closes the current failure episode.
    pub fn record_success(&mut self) {
        self.state = SinkState::Connected;
        self.restart_attempted = false;
    }

    pub fn record_failure(&mut self) -> RecoveryAction {
        self.failures += 1;
        self.state = SinkState::Failed;
        if self.restart_attempted {
            RecoveryAction::Absorb
        } else {
            self.restart_attempted = true;
            self.restarts += 1;
            RecoveryAction::Restart
        }
    }

    /// Permanently failed with no restart budget (unreachable at construction).
    pub fn disable(&mut self) {
        self.state = SinkState::Failed;
        self.restart_attempted = true;
    }

    /// Back to a fresh lifecycle; counters are kept.
    pub fn reset(&mut self) {
        self.state = SinkState::Uninitialized;
        self.restart_attempted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_restart_per_episode() {
        let mut health = SinkHealth::new();
        health.mark_connected();

        assert_eq!(health.record_failure(), RecoveryAction::Restart);
        health.mark_connected();
        // restart came up but failed again before any success
        assert_eq!(health.record_failure(), RecoveryAction::Absorb);
        assert_eq!(health.record_failure(), RecoveryAction::Absorb);
        assert_eq!(health.state(), SinkState::Failed);
        assert_eq!(health.restarts(), 1);
        assert_eq!(health.failures(), 3);
    }

    #[test]
    fn success_opens_a_new_episode() {
        let mut health = SinkHealth::new();
        health.mark_connected();
        assert_eq!(health.record_failure(), RecoveryAction::Restart);
        health.record_success();
        assert!(!health.restart_attempted());
        assert_eq!(health.record_failure(), RecoveryAction::Restart);
        assert_eq!(health.restarts(), 2);
    }

    #[test]
    fn disabled_sink_never_restarts() {
        let mut health = SinkHealth::new();
        health.disable();
        assert_eq!(health.record_failure(), RecoveryAction::Absorb);
        health.reset();
        assert_eq!(health.state(), SinkState::Uninitialized);
        assert_eq!(health.record_failure(), RecoveryAction::Restart);
    }
}
