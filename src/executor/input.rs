use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::executor::action::Action;

/// Input-injection collaborator. `Ok(false)` means the backend ran but
/// reports the action did not take effect.
#[async_trait]
pub trait InputExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> PilotResult<bool>;
}

#[cfg(feature = "desktop")]
pub use desktop::EnigoExecutor;

#[cfg(feature = "desktop")]
mod desktop {
    use std::thread;
    use std::time::Duration;

    use async_trait::async_trait;
    use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

    use super::InputExecutor;
    use crate::errors::{PilotError, PilotResult};
    use crate::executor::action::{Action, KeyCode};
    use crate::perception::types::Point;

    fn to_enigo(key: KeyCode) -> Key {
        match key {
            KeyCode::Char(c) => Key::Unicode(c),
            KeyCode::Enter => Key::Return,
            KeyCode::Tab => Key::Tab,
            KeyCode::Space => Key::Space,
            KeyCode::Backspace => Key::Backspace,
            KeyCode::Delete => Key::Delete,
            KeyCode::Escape => Key::Escape,
            KeyCode::Home => Key::Home,
            KeyCode::End => Key::End,
            KeyCode::PageUp => Key::PageUp,
            KeyCode::PageDown => Key::PageDown,
            KeyCode::Up => Key::UpArrow,
            KeyCode::Down => Key::DownArrow,
            KeyCode::Left => Key::LeftArrow,
            KeyCode::Right => Key::RightArrow,
            KeyCode::Control => Key::Control,
            KeyCode::Alt => Key::Alt,
            KeyCode::Shift => Key::Shift,
            KeyCode::Meta => Key::Meta,
            KeyCode::F(n) => match n {
                1 => Key::F1,
                2 => Key::F2,
                3 => Key::F3,
                4 => Key::F4,
                5 => Key::F5,
                6 => Key::F6,
                7 => Key::F7,
                8 => Key::F8,
                9 => Key::F9,
                10 => Key::F10,
                11 => Key::F11,
                _ => Key::F12,
            },
        }
    }

    fn io<E: std::fmt::Display>(e: E) -> PilotError {
        PilotError::Executor(e.to_string())
    }

    fn move_to(enigo: &mut Enigo, p: Point) -> PilotResult<()> {
        enigo.move_mouse(p.x, p.y, Coordinate::Abs).map_err(io)
    }

    fn click(enigo: &mut Enigo, p: Point, button: Button, times: u32) -> PilotResult<()> {
        move_to(enigo, p)?;
        for i in 0..times {
            if i > 0 {
                thread::sleep(Duration::from_millis(50));
            }
            enigo.button(button, Direction::Click).map_err(io)?;
        }
        Ok(())
    }

    fn hotkey(enigo: &mut Enigo, keys: &[String]) -> PilotResult<()> {
        let codes = keys
            .iter()
            .map(|k| KeyCode::parse(k).map(to_enigo))
            .collect::<PilotResult<Vec<_>>>()?;
        let Some((last, modifiers)) = codes.split_last() else {
            return Err(PilotError::Executor("empty hotkey".into()));
        };
        for m in modifiers {
            enigo.key(*m, Direction::Press).map_err(io)?;
        }
        let pressed = enigo.key(*last, Direction::Click).map_err(io);
        for m in modifiers.iter().rev() {
            if let Err(e) = enigo.key(*m, Direction::Release) {
                tracing::warn!(error = %e, "modifier release failed");
            }
        }
        pressed
    }

    fn run(action: &Action) -> PilotResult<()> {
        let mut enigo = Enigo::new(&Settings::default()).map_err(io)?;
        match action {
            Action::Click { point } => click(&mut enigo, *point, Button::Left, 1),
            Action::DoubleClick { point } => click(&mut enigo, *point, Button::Left, 2),
            Action::RightClick { point } => click(&mut enigo, *point, Button::Right, 1),
            Action::Type { text } => enigo.text(text).map_err(io),
            Action::Hotkey { keys } => hotkey(&mut enigo, keys),
            Action::Scroll { amount, point } => {
                if let Some(p) = point {
                    move_to(&mut enigo, *p)?;
                }
                // enigo scrolls down for positive values
                enigo.scroll(-amount, Axis::Vertical).map_err(io)
            }
            Action::Move { point } => move_to(&mut enigo, *point),
            Action::Wait { duration_ms } => {
                thread::sleep(Duration::from_millis(*duration_ms));
                Ok(())
            }
            Action::Done => Ok(()),
        }
    }

    /// Injects input through `enigo` on a blocking thread.
    #[derive(Debug, Default)]
    pub struct EnigoExecutor;

    #[async_trait]
    impl InputExecutor for EnigoExecutor {
        async fn execute(&self, action: &Action) -> PilotResult<bool> {
            let owned = action.clone();
            tracing::debug!(action = %owned, "dispatching input");
            tokio::task::spawn_blocking(move || run(&owned))
                .await
                .map_err(|e| PilotError::Executor(format!("join: {e}")))??;
            Ok(true)
        }
    }
}
