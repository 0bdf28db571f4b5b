use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};
use crate::perception::types::Point;

/// A concrete input operation with resolved screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { point: Point },
    DoubleClick { point: Point },
    RightClick { point: Point },
    Type { text: String },
    /// Keys pressed together, modifiers first, e.g. `["ctrl", "a"]`.
    Hotkey { keys: Vec<String> },
    /// Positive scrolls up, negative scrolls down. With a point, the pointer
    /// moves there first.
    Scroll { amount: i32, point: Option<Point> },
    Move { point: Point },
    Wait { duration_ms: u64 },
    Done,
}

impl Action {
    pub fn hotkey(combo: &str) -> Self {
        Action::Hotkey { keys: split_hotkey(combo) }
    }

    /// Actions that can change what is on screen, and so invalidate marks.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Action::Click { .. }
                | Action::DoubleClick { .. }
                | Action::RightClick { .. }
                | Action::Type { .. }
                | Action::Hotkey { .. }
                | Action::Scroll { .. }
        )
    }

    pub fn is_click(&self) -> bool {
        matches!(self, Action::Click { .. } | Action::DoubleClick { .. } | Action::RightClick { .. })
    }

    pub fn point(&self) -> Option<Point> {
        match self {
            Action::Click { point }
            | Action::DoubleClick { point }
            | Action::RightClick { point }
            | Action::Move { point } => Some(*point),
            Action::Scroll { point, .. } => *point,
            _ => None,
        }
    }

    /// Same action aimed at `point`; actions without a target are unchanged.
    pub fn retargeted(&self, point: Point) -> Action {
        match self {
            Action::Click { .. } => Action::Click { point },
            Action::DoubleClick { .. } => Action::DoubleClick { point },
            Action::RightClick { .. } => Action::RightClick { point },
            Action::Move { .. } => Action::Move { point },
            Action::Scroll { amount, .. } => Action::Scroll {
                amount: *amount,
                point: Some(point),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { point } => write!(f, "click at {point}"),
            Action::DoubleClick { point } => write!(f, "double_click at {point}"),
            Action::RightClick { point } => write!(f, "right_click at {point}"),
            Action::Type { text } => write!(f, "type \"{text}\""),
            Action::Hotkey { keys } => write!(f, "hotkey {}", keys.join("+")),
            Action::Scroll { amount, point: Some(p) } => write!(f, "scroll {amount} at {p}"),
            Action::Scroll { amount, point: None } => write!(f, "scroll {amount}"),
            Action::Move { point } => write!(f, "move to {point}"),
            Action::Wait { duration_ms } => write!(f, "wait {duration_ms}ms"),
            Action::Done => f.write_str("done"),
        }
    }
}

/// `"Ctrl + Shift+S"` -> `["ctrl", "shift", "s"]`.
pub fn split_hotkey(combo: &str) -> Vec<String> {
    combo
        .split('+')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Key names understood by the input backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Char(char),
    Enter,
    Tab,
    Space,
    Backspace,
    Delete,
    Escape,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    Control,
    Alt,
    Shift,
    Meta,
    F(u8),
}

impl KeyCode {
    pub fn parse(name: &str) -> PilotResult<Self> {
        let lowered = name.trim().to_lowercase();
        let key = match lowered.as_str() {
            "enter" | "return" => KeyCode::Enter,
            "tab" => KeyCode::Tab,
            "space" => KeyCode::Space,
            "backspace" => KeyCode::Backspace,
            "delete" | "del" => KeyCode::Delete,
            "escape" | "esc" => KeyCode::Escape,
            "home" => KeyCode::Home,
            "end" => KeyCode::End,
            "pageup" | "page_up" => KeyCode::PageUp,
            "pagedown" | "page_down" => KeyCode::PageDown,
            "up" => KeyCode::Up,
            "down" => KeyCode::Down,
            "left" => KeyCode::Left,
            "right" => KeyCode::Right,
            "ctrl" | "control" => KeyCode::Control,
            "alt" | "option" => KeyCode::Alt,
            "shift" => KeyCode::Shift,
            "meta" | "cmd" | "command" | "win" | "super" => KeyCode::Meta,
            f if f.len() > 1 && f.starts_with('f') && f[1..].parse::<u8>().is_ok_and(|n| (1..=12).contains(&n)) => {
                KeyCode::F(f[1..].parse().unwrap_or(1))
            }
            s => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => KeyCode::Char(c),
                    _ => return Err(PilotError::Executor(format!("unknown key '{name}'"))),
                }
            }
        };
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changing_kinds() {
        let p = Point::new(1, 2);
        assert!(Action::Click { point: p }.is_state_changing());
        assert!(Action::Type { text: "x".into() }.is_state_changing());
        assert!(Action::hotkey("escape").is_state_changing());
        assert!(Action::Scroll { amount: -3, point: None }.is_state_changing());
        assert!(!Action::Move { point: p }.is_state_changing());
        assert!(!Action::Wait { duration_ms: 10 }.is_state_changing());
        assert!(!Action::Done.is_state_changing());
    }

    #[test]
    fn hotkey_splitting_and_display() {
        assert_eq!(split_hotkey("Ctrl + Shift+S"), vec!["ctrl", "shift", "s"]);
        assert_eq!(Action::hotkey("ctrl+a").to_string(), "hotkey ctrl+a");
    }

    #[test]
    fn retarget_keeps_kind() {
        let moved = Action::DoubleClick { point: Point::new(0, 0) }.retargeted(Point::new(5, 6));
        assert_eq!(moved, Action::DoubleClick { point: Point::new(5, 6) });
        let typed = Action::Type { text: "a".into() };
        assert_eq!(typed.retargeted(Point::new(5, 6)), typed);
    }

    #[test]
    fn serde_uses_type_tag() {
        let json = serde_json::to_value(Action::Click { point: Point::new(3, 4) }).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["point"]["x"], 3);
    }

    #[test]
    fn key_names() {
        assert_eq!(KeyCode::parse("Esc").unwrap(), KeyCode::Escape);
        assert_eq!(KeyCode::parse("f5").unwrap(), KeyCode::F(5));
        assert_eq!(KeyCode::parse("a").unwrap(), KeyCode::Char('a'));
        assert_eq!(KeyCode::parse("f").unwrap(), KeyCode::Char('f'));
        assert!(KeyCode::parse("hyper").is_err());
    }
}
