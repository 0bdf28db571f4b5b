use std::time::{Duration, Instant};

use crate::agent_engine::state::StopHandle;
use crate::config::AgentConfig;

/// Why the loop controller ended a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    StepBudget(u32),
    ConsecutiveFailures(u32),
    Timeout(u32),
    UserStop,
}

impl StopReason {
    pub fn message(&self) -> String {
        match self {
            StopReason::StepBudget(n) => format!("step budget of {n} exhausted"),
            StopReason::ConsecutiveFailures(n) => format!("{n} consecutive failed steps"),
            StopReason::Timeout(m) => format!("time limit of {m} minutes reached"),
            StopReason::UserStop => "stopped by user".to_string(),
        }
    }
}

/// Run-level limits checked at every step boundary.
pub struct LoopController {
    max_steps: u32,
    max_failures: Option<u32>,
    max_duration: Option<(u32, Duration)>,
    stop: StopHandle,
    started: Instant,
    consecutive_failures: u32,
}

impl LoopController {
    pub fn new(config: &AgentConfig, max_steps: u32, stop: StopHandle) -> Self {
        Self {
            max_steps,
            max_failures: config.max_consecutive_failures.filter(|n| *n > 0),
            max_duration: config
                .max_duration_minutes
                .map(|m| (m, Duration::from_secs(u64::from(m) * 60))),
            stop,
            started: Instant::now(),
            consecutive_failures: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `steps_taken` is the number of steps already run.
    pub fn should_stop(&self, steps_taken: u32) -> Option<StopReason> {
        if self.stop.is_stopped() {
            return Some(StopReason::UserStop);
        }
        if steps_taken >= self.max_steps {
            return Some(StopReason::StepBudget(self.max_steps));
        }
        if let Some(max) = self.max_failures {
            if self.consecutive_failures >= max {
                return Some(StopReason::ConsecutiveFailures(max));
            }
        }
        if let Some((minutes, limit)) = self.max_duration {
            if self.started.elapsed() >= limit {
                return Some(StopReason::Timeout(minutes));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_and_stop_flag() {
        let stop = StopHandle::new();
        let ctl = LoopController::new(&AgentConfig::default(), 3, stop.clone());
        assert_eq!(ctl.should_stop(2), None);
        assert_eq!(ctl.should_stop(3), Some(StopReason::StepBudget(3)));
        stop.stop();
        assert_eq!(ctl.should_stop(0), Some(StopReason::UserStop));
        assert_eq!(StopReason::UserStop.message(), "stopped by user");
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let config = AgentConfig {
            max_consecutive_failures: Some(2),
            ..AgentConfig::default()
        };
        let mut ctl = LoopController::new(&config, 10, StopHandle::new());
        ctl.record_failure();
        ctl.record_success();
        ctl.record_failure();
        assert_eq!(ctl.should_stop(1), None);
        ctl.record_failure();
        assert_eq!(ctl.should_stop(1), Some(StopReason::ConsecutiveFailures(2)));
    }

    #[test]
    fn zero_minute_limit_expires_immediately() {
        let config = AgentConfig {
            max_duration_minutes: Some(0),
            ..AgentConfig::default()
        };
        let ctl = LoopController::new(&config, 10, StopHandle::new());
        assert_eq!(ctl.should_stop(0), Some(StopReason::Timeout(0)));
    }
}
