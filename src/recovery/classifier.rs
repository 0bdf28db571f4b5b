use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_engine::verifier::Verification;
use crate::executor::action::Action;

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClickMissed,
    ElementNotFound,
    ElementMoved,
    PopupBlocked,
    TypingFailed,
    Timeout,
    PermissionDenied,
    UnexpectedState,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::ClickMissed,
        ErrorKind::ElementNotFound,
        ErrorKind::ElementMoved,
        ErrorKind::PopupBlocked,
        ErrorKind::TypingFailed,
        ErrorKind::Timeout,
        ErrorKind::PermissionDenied,
        ErrorKind::UnexpectedState,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClickMissed => "click_missed",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::ElementMoved => "element_moved",
            ErrorKind::PopupBlocked => "popup_blocked",
            ErrorKind::TypingFailed => "typing_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::UnexpectedState => "unexpected_state",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Accepts snake_case names as well as spaced or dashed forms.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::PermissionDenied)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checked in this order; the first kind with a matching keyword wins.
const KEYWORDS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::ClickMissed,
        &["didn't click", "missed", "wrong position", "not clicked", "click failed", "未点击", "点击失败"],
    ),
    (
        ErrorKind::ElementNotFound,
        &["not found", "doesn't exist", "cannot find", "no element", "not visible", "找不到", "不存在", "未找到"],
    ),
    (
        ErrorKind::PopupBlocked,
        &["popup", "dialog", "modal", "blocked", "overlay", "弹窗", "对话框", "遮挡"],
    ),
    (
        ErrorKind::TypingFailed,
        &["typing failed", "text not entered", "input failed", "输入失败", "未输入"],
    ),
    (
        ErrorKind::Timeout,
        &["timeout", "too slow", "not responding", "超时", "无响应"],
    ),
    (
        ErrorKind::ElementMoved,
        &["moved", "position changed", "relocated", "位置变化", "移动"],
    ),
];

/// Classifies a failed step. An explicit error signal from the verifier
/// wins; permission and unexpected-state errors are only reachable that way.
pub fn analyze_error(action: &Action, verification: &Verification) -> ErrorKind {
    if let Some(kind) = verification.error_signal.as_deref().and_then(ErrorKind::from_name) {
        tracing::debug!(kind = %kind, "error classified from explicit signal");
        return kind;
    }

    let text = format!(
        "{} {}",
        verification.issues.as_deref().unwrap_or_default(),
        verification.observation
    )
    .to_lowercase();

    for (kind, words) in KEYWORDS {
        if words.iter().any(|w| text.contains(w)) {
            tracing::debug!(kind = %kind, "error classified via keywords");
            return *kind;
        }
    }

    if action.is_click() && text.contains("not") && (text.contains("click") || text.contains("open")) {
        return ErrorKind::ClickMissed;
    }
    if matches!(action, Action::Type { .. })
        && text.contains("not")
        && (text.contains("type") || text.contains("enter") || text.contains("input"))
    {
        return ErrorKind::TypingFailed;
    }

    tracing::debug!(text = %text.chars().take(100).collect::<String>(), "error unclassified");
    ErrorKind::Unknown
}

/// One recorded failure and what was done about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    /// Display form of the action the failure is attached to.
    pub action: String,
    pub recovery_attempted: bool,
    pub recovery_succeeded: bool,
    pub strategy: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, action: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            recovery_attempted: false,
            recovery_succeeded: false,
            strategy: None,
            timestamp: Utc::now(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}
