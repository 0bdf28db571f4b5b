use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::config::RecoveryConfig;
use crate::executor::action::Action;
use crate::executor::input::InputExecutor;
use crate::perception::types::Point;
use crate::recovery::classifier::{ErrorEvent, ErrorKind};

/// Corrective pre-actions plus a retry policy for one error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStrategy {
    pub name: String,
    pub description: String,
    pub pre_actions: Vec<Action>,
    pub retry_original: bool,
    pub max_retries: u32,
}

impl RecoveryStrategy {
    pub fn new(name: &str, description: &str, pre_actions: Vec<Action>, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            pre_actions,
            retry_original: true,
            max_retries,
        }
    }
}

fn wait(ms: u64) -> Action {
    Action::Wait { duration_ms: ms }
}

/// Strategies per error kind, tried in order.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    by_kind: HashMap<ErrorKind, Vec<RecoveryStrategy>>,
    /// Used for kinds without an entry, except terminal ones.
    generic: Vec<RecoveryStrategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let s = RecoveryStrategy::new;
        let by_kind = HashMap::from([
            (
                ErrorKind::ClickMissed,
                vec![
                    s("retry_click", "Retry the click", vec![wait(500)], 2),
                    s("click_nearby", "Click a slightly different position", Vec::new(), 1),
                ],
            ),
            (
                ErrorKind::ElementNotFound,
                vec![
                    s("wait_and_retry", "Wait for the element to appear", vec![wait(1500)], 3),
                    s(
                        "scroll_down",
                        "Scroll down to reveal the element",
                        vec![Action::Scroll { amount: -3, point: None }],
                        2,
                    ),
                    s(
                        "scroll_up",
                        "Scroll up to reveal the element",
                        vec![Action::Scroll { amount: 3, point: None }],
                        2,
                    ),
                ],
            ),
            (
                ErrorKind::PopupBlocked,
                vec![
                    s("dismiss_with_escape", "Press Escape to dismiss the popup", vec![Action::hotkey("escape")], 2),
                    s(
                        "click_outside",
                        "Click outside the popup",
                        vec![Action::Click { point: Point::new(10, 10) }],
                        1,
                    ),
                ],
            ),
            (
                ErrorKind::TypingFailed,
                vec![
                    s("click_and_retype", "Focus the field and type again", Vec::new(), 2),
                    s("clear_and_retype", "Select all and type again", vec![Action::hotkey("ctrl+a")], 1),
                ],
            ),
            (
                ErrorKind::Timeout,
                vec![s("wait_longer", "Give the application more time", vec![wait(3000)], 2)],
            ),
            (
                ErrorKind::ElementMoved,
                vec![s("refresh_and_retry", "Locate the element again", vec![wait(500)], 2)],
            ),
            (
                ErrorKind::UnexpectedState,
                vec![s(
                    "escape_and_retry",
                    "Back out with Escape and retry",
                    vec![Action::hotkey("escape"), wait(500)],
                    1,
                )],
            ),
            (ErrorKind::PermissionDenied, Vec::new()),
        ]);
        Self {
            by_kind,
            generic: vec![s("wait_and_retry", "Wait and retry the action", vec![wait(1000)], 2)],
        }
    }
}

impl StrategyTable {
    pub fn strategies(&self, kind: ErrorKind) -> &[RecoveryStrategy] {
        match self.by_kind.get(&kind) {
            Some(list) => list.as_slice(),
            None => self.generic.as_slice(),
        }
    }

    pub fn set(&mut self, kind: ErrorKind, strategies: Vec<RecoveryStrategy>) {
        self.by_kind.insert(kind, strategies);
    }
}

/// Totals over an error history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub recovery_attempts: usize,
    pub recovery_successes: usize,
    pub recovery_rate: f64,
}

/// Picks recovery strategies and tracks how often each has been used.
pub struct RecoveryPlanner {
    table: StrategyTable,
    max_attempts: u32,
    enabled: Vec<String>,
    used: HashMap<(ErrorKind, String), u32>,
}

impl RecoveryPlanner {
    pub fn new(table: StrategyTable, config: &RecoveryConfig) -> Self {
        Self {
            table,
            max_attempts: config.max_attempts,
            enabled: config.enabled_strategies.clone(),
            used: HashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Next usable strategy for `kind`, starting at `attempt mod n` and
    /// walking the list cyclically past exhausted entries. The returned
    /// strategy's use counter is incremented.
    pub fn get_recovery_strategy(
        &mut self,
        kind: ErrorKind,
        action: &Action,
        attempt: u32,
    ) -> Option<RecoveryStrategy> {
        let candidates: Vec<&RecoveryStrategy> = self
            .table
            .strategies(kind)
            .iter()
            .filter(|s| self.enabled.is_empty() || self.enabled.contains(&s.name))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let n = candidates.len();
        let start = attempt as usize % n;
        for offset in 0..n {
            let strategy = candidates[(start + offset) % n];
            let key = (kind, strategy.name.clone());
            let count = self.used.get(&key).copied().unwrap_or(0);
            if count < strategy.max_retries {
                let chosen = strategy.clone();
                self.used.insert(key, count + 1);
                tracing::info!(strategy = %chosen.name, kind = %kind, action = %action, "selected recovery strategy");
                return Some(chosen);
            }
        }
        tracing::warn!(kind = %kind, "all recovery strategies exhausted");
        None
    }

    /// False once `total_attempts` reaches the ceiling, and always for
    /// terminal kinds.
    pub fn can_recover(&self, kind: ErrorKind, total_attempts: u32) -> bool {
        if total_attempts >= self.max_attempts {
            tracing::warn!(max = self.max_attempts, "recovery ceiling reached");
            return false;
        }
        !kind.is_terminal()
    }

    /// Runs the strategy's pre-actions. Failures are logged and skipped.
    /// Returns how many pre-actions reported success.
    pub async fn execute_recovery(&self, strategy: &RecoveryStrategy, executor: &dyn InputExecutor) -> usize {
        tracing::info!(strategy = %strategy.name, "executing recovery");
        let mut ok = 0;
        for pre in &strategy.pre_actions {
            match executor.execute(pre).await {
                Ok(true) => ok += 1,
                Ok(false) => tracing::warn!(action = %pre, "recovery pre-action reported failure"),
                Err(e) => tracing::warn!(action = %pre, error = %e, "recovery pre-action failed"),
            }
        }
        ok
    }

    pub fn reset_attempt_counts(&mut self) {
        self.used.clear();
    }

    pub fn summarize(errors: &[ErrorEvent]) -> ErrorSummary {
        let mut summary = ErrorSummary {
            total_errors: errors.len(),
            ..ErrorSummary::default()
        };
        for e in errors {
            *summary.by_kind.entry(e.kind).or_default() += 1;
            if e.recovery_attempted {
                summary.recovery_attempts += 1;
                if e.recovery_succeeded {
                    summary.recovery_successes += 1;
                }
            }
        }
        if summary.recovery_attempts > 0 {
            summary.recovery_rate = summary.recovery_successes as f64 / summary.recovery_attempts as f64;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::{PilotError, PilotResult};

    fn planner() -> RecoveryPlanner {
        RecoveryPlanner::new(StrategyTable::default(), &RecoveryConfig::default())
    }

    fn click() -> Action {
        Action::Click { point: Point::new(1, 1) }
    }

    #[test]
    fn popup_starts_with_escape() {
        let mut p = planner();
        let s = p.get_recovery_strategy(ErrorKind::PopupBlocked, &click(), 0).unwrap();
        assert_eq!(s.name, "dismiss_with_escape");
        assert_eq!(s.pre_actions, vec![Action::hotkey("escape")]);
    }

    #[test]
    fn cycles_and_skips_exhausted() {
        let mut p = planner();
        let kind = ErrorKind::ClickMissed;
        let names: Vec<Option<String>> = (0..5)
            .map(|i| p.get_recovery_strategy(kind, &click(), i).map(|s| s.name))
            .collect();
        // retry_click allows 2, click_nearby allows 1
        assert_eq!(
            names,
            vec![
                Some("retry_click".into()),
                Some("click_nearby".into()),
                Some("retry_click".into()),
                None,
                None,
            ]
        );
        p.reset_attempt_counts();
        assert!(p.get_recovery_strategy(kind, &click(), 1).is_some());
    }

    #[test]
    fn ceiling_and_terminal_kinds() {
        let p = planner();
        assert!(p.can_recover(ErrorKind::Unknown, 2));
        assert!(!p.can_recover(ErrorKind::Unknown, 3));
        assert!(!p.can_recover(ErrorKind::PermissionDenied, 0));
        let mut p = planner();
        assert!(p.get_recovery_strategy(ErrorKind::PermissionDenied, &click(), 0).is_none());
    }

    #[test]
    fn unknown_uses_generic_wait() {
        let mut p = planner();
        let s = p.get_recovery_strategy(ErrorKind::Unknown, &click(), 7).unwrap();
        assert_eq!(s.name, "wait_and_retry");
        assert_eq!(s.pre_actions, vec![Action::Wait { duration_ms: 1000 }]);
    }

    #[test]
    fn allow_list_filters() {
        let cfg = RecoveryConfig {
            enabled_strategies: vec!["scroll_up".into()],
            ..RecoveryConfig::default()
        };
        let mut p = RecoveryPlanner::new(StrategyTable::default(), &cfg);
        let s = p.get_recovery_strategy(ErrorKind::ElementNotFound, &click(), 0).unwrap();
        assert_eq!(s.name, "scroll_up");
        assert!(p.get_recovery_strategy(ErrorKind::PopupBlocked, &click(), 0).is_none());
    }

    struct Flaky {
        seen: Mutex<Vec<Action>>,
    }

    #[async_trait]
    impl InputExecutor for Flaky {
        async fn execute(&self, action: &Action) -> PilotResult<bool> {
            self.seen.lock().unwrap().push(action.clone());
            match action {
                Action::Hotkey { .. } => Err(PilotError::Executor("no keyboard".into())),
                _ => Ok(true),
            }
        }
    }

    #[tokio::test]
    async fn pre_action_failure_does_not_abort() {
        let p = planner();
        let exec = Flaky { seen: Mutex::new(Vec::new()) };
        let strategy = RecoveryStrategy::new("mixed", "", vec![Action::hotkey("escape"), wait(1)], 1);
        assert_eq!(p.execute_recovery(&strategy, &exec).await, 1);
        assert_eq!(exec.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn summary_counts() {
        let mut a = ErrorEvent::new(ErrorKind::Timeout, "wait");
        a.recovery_attempted = true;
        a.recovery_succeeded = true;
        let mut b = ErrorEvent::new(ErrorKind::Timeout, "wait");
        b.recovery_attempted = true;
        let c = ErrorEvent::new(ErrorKind::Unknown, "click");
        let s = RecoveryPlanner::summarize(&[a, b, c]);
        assert_eq!(s.total_errors, 3);
        assert_eq!(s.by_kind[&ErrorKind::Timeout], 2);
        assert!((s.recovery_rate - 0.5).abs() < 1e-9);
    }
}
