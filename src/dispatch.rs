use crate::action::{truncate, Action, MouseButton, Proposed, ScrollDirection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Scroll size used when the model asks for the `wheel` button.
pub const WHEEL_CLICKS: i32 = 3;

#[derive(Debug, Error)]
#[error("input injection failed: {0}")]
pub struct InputError(pub String);

/// Concrete input events. Implementations receive canonical key names and
/// coordinates that are already inside the display.
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn move_to(&self, x: i32, y: i32) -> Result<(), InputError>;
    /// `button` is always left, right or middle here.
    async fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> Result<(), InputError>;
    /// Positive clicks scroll up, negative scroll down.
    async fn scroll(&self, x: i32, y: i32, clicks: i32) -> Result<(), InputError>;
    async fn drag(&self, from: (i32, i32), to: (i32, i32)) -> Result<(), InputError>;
    async fn type_text(&self, text: &str) -> Result<(), InputError>;
    /// Press every key in order, then release in reverse.
    async fn key_chord(&self, keys: &[String]) -> Result<(), InputError>;
}

#[async_trait]
impl<T: InputDriver + ?Sized> InputDriver for Arc<T> {
    async fn move_to(&self, x: i32, y: i32) -> Result<(), InputError> {
        (**self).move_to(x, y).await
    }
    async fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> Result<(), InputError> {
        (**self).click(x, y, button, count).await
    }
    async fn scroll(&self, x: i32, y: i32, clicks: i32) -> Result<(), InputError> {
        (**self).scroll(x, y, clicks).await
    }
    async fn drag(&self, from: (i32, i32), to: (i32, i32)) -> Result<(), InputError> {
        (**self).drag(from, to).await
    }
    async fn type_text(&self, text: &str) -> Result<(), InputError> {
        (**self).type_text(text).await
    }
    async fn key_chord(&self, keys: &[String]) -> Result<(), InputError> {
        (**self).key_chord(keys).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    UnknownAction,
    Capture,
    Transport,
    Protocol,
}

/// `{ok, message, error}` result of one turn's execution. Dispatch failures
/// are reported here rather than raised so the loop can keep going.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into(), error: None }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into(), error: Some(kind) }
    }
}

// ========================= Key names =========================

const KEY_TABLE: &[(&str, &str)] = &[
    ("/", "slash"),
    ("\\", "backslash"),
    ("alt", "alt"),
    ("arrowdown", "down"),
    ("arrowleft", "left"),
    ("arrowright", "right"),
    ("arrowup", "up"),
    ("backspace", "backspace"),
    ("ctrl", "ctrl"),
    ("control", "ctrl"),
    ("delete", "delete"),
    ("enter", "enter"),
    ("return", "enter"),
    ("esc", "escape"),
    ("escape", "escape"),
    ("shift", "shift"),
    ("space", "space"),
    ("tab", "tab"),
    ("win", "win"),
    ("cmd", "win"),
    ("super", "win"),
    ("meta", "win"),
    ("option", "alt"),
];

/// Map a symbolic key name to its canonical name. Unmapped names pass
/// through lower-cased.
pub fn normalize_key(key: &str) -> String {
    let lower = key.trim().to_lowercase();
    KEY_TABLE
        .iter()
        .find(|(from, _)| *from == lower)
        .map(|(_, to)| to.to_string())
        .unwrap_or(lower)
}

// ========================= Dispatcher =========================

pub struct ActionDispatcher<I: InputDriver> {
    input: I,
    width: u32,
    height: u32,
}

impl<I: InputDriver> ActionDispatcher<I> {
    pub fn new(input: I, width: u32, height: u32) -> Self {
        info!("action dispatcher bounds {}x{}", width, height);
        Self { input, width: width.max(1), height: height.max(1) }
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Clamp each axis into the display. Never fails.
    pub fn validate(&self, x: i32, y: i32) -> (i32, i32) {
        let max_x = (self.width - 1).min(i32::MAX as u32) as i32;
        let max_y = (self.height - 1).min(i32::MAX as u32) as i32;
        let cx = x.clamp(0, max_x);
        let cy = y.clamp(0, max_y);
        if cx != x || cy != y {
            warn!(x, y, clamped_x = cx, clamped_y = cy, "coordinates clamped to display bounds");
        }
        (cx, cy)
    }

    /// Run one proposal. Unknown kinds come back as a non-fatal failure.
    pub async fn dispatch(&self, proposed: &Proposed) -> Outcome {
        match proposed {
            Proposed::Known { action, .. } => self.execute(action).await,
            Proposed::Unknown { kind, .. } => {
                warn!(kind = %kind, "unrecognized action type");
                Outcome::failure(
                    ErrorKind::UnknownAction,
                    format!("Unknown action: {}", kind),
                )
            }
        }
    }

    pub async fn execute(&self, action: &Action) -> Outcome {
        info!(action = %action, "executing action");
        match self.run(action).await {
            Ok(message) => Outcome::success(message),
            Err(e) => {
                warn!(action = %action, error = %e, "action failed");
                Outcome::failure(ErrorKind::Input, format!("Error: {}", e.0))
            }
        }
    }

    async fn run(&self, action: &Action) -> Result<String, InputError> {
        match action {
            Action::Click { x, y, button, click_count } => {
                let (x, y) = self.validate(*x, *y);
                match button {
                    MouseButton::Back => {
                        self.chord(&["alt", "left"]).await?;
                        Ok("Navigated back (alt+left)".to_string())
                    }
                    MouseButton::Forward => {
                        self.chord(&["alt", "right"]).await?;
                        Ok("Navigated forward (alt+right)".to_string())
                    }
                    MouseButton::Wheel => {
                        self.input.move_to(x, y).await?;
                        self.input.scroll(x, y, -WHEEL_CLICKS).await?;
                        Ok(format!("Scrolled down {} at ({}, {})", WHEEL_CLICKS, x, y))
                    }
                    b => {
                        let count = (*click_count).max(1);
                        self.input.click(x, y, *b, count).await?;
                        let prefix = match b {
                            MouseButton::Right => "Right-clicked",
                            MouseButton::Middle => "Middle-clicked",
                            _ => "Clicked",
                        };
                        if count > 1 {
                            Ok(format!("{} at ({}, {}) x{}", prefix, x, y, count))
                        } else {
                            Ok(format!("{} at ({}, {})", prefix, x, y))
                        }
                    }
                }
            }
            Action::DoubleClick { x, y } => {
                let (x, y) = self.validate(*x, *y);
                self.input.click(x, y, MouseButton::Left, 2).await?;
                Ok(format!("Double-clicked at ({}, {})", x, y))
            }
            Action::TypeText { text } => {
                self.input.type_text(text).await?;
                Ok(format!("Typed: {}", truncate(text, 50)))
            }
            Action::PressKey { key } => {
                let key = normalize_key(key);
                self.input.key_chord(std::slice::from_ref(&key)).await?;
                Ok(format!("Pressed: {}", key))
            }
            Action::Hotkey { keys } => {
                if keys.is_empty() {
                    return Err(InputError("hotkey with no keys".into()));
                }
                let keys: Vec<String> = keys.iter().map(|k| normalize_key(k)).collect();
                self.input.key_chord(&keys).await?;
                Ok(format!("Hotkey: {}", keys.join("+")))
            }
            Action::Scroll { x, y, direction, amount } => {
                let (x, y) = self.validate(*x, *y);
                let clicks = (*amount).min(i32::MAX as u32) as i32;
                let signed = match direction {
                    ScrollDirection::Up => clicks,
                    ScrollDirection::Down => -clicks,
                };
                self.input.move_to(x, y).await?;
                self.input.scroll(x, y, signed).await?;
                Ok(format!("Scrolled {} {} at ({}, {})", direction, amount, x, y))
            }
            Action::Drag { start_x, start_y, end_x, end_y } => {
                let from = self.validate(*start_x, *start_y);
                let to = self.validate(*end_x, *end_y);
                self.input.drag(from, to).await?;
                Ok(format!("Dragged from ({}, {}) to ({}, {})", from.0, from.1, to.0, to.1))
            }
            Action::Wait { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Ok(format!("Waited {}ms", duration_ms))
            }
            Action::TaskComplete { summary } => Ok(format!("Complete: {}", summary)),
        }
    }

    async fn chord(&self, keys: &[&str]) -> Result<(), InputError> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.input.key_chord(&keys).await
    }
}
