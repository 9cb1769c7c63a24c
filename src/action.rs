use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

// ========================= Action =========================

/// A single abstract input operation proposed by the model.
///
/// Serialized as `{"type": "<kind>", ...}` so a recorded action and a
/// tool-call payload share one shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_click_count")]
        click_count: u32,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    TypeText {
        text: String,
    },
    PressKey {
        key: String,
    },
    Hotkey {
        keys: Vec<String>,
    },
    Scroll {
        x: i32,
        y: i32,
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount", alias = "clicks")]
        amount: u32,
    },
    Drag {
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
    },
    Wait {
        #[serde(default = "default_wait_ms", alias = "ms", alias = "milliseconds")]
        duration_ms: u64,
    },
    TaskComplete {
        #[serde(default)]
        summary: String,
    },
}

fn default_click_count() -> u32 {
    1
}

fn default_scroll_amount() -> u32 {
    3
}

fn default_wait_ms() -> u64 {
    1000
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Click { .. } => ActionKind::Click,
            Action::DoubleClick { .. } => ActionKind::DoubleClick,
            Action::TypeText { .. } => ActionKind::TypeText,
            Action::PressKey { .. } => ActionKind::PressKey,
            Action::Hotkey { .. } => ActionKind::Hotkey,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::Drag { .. } => ActionKind::Drag,
            Action::Wait { .. } => ActionKind::Wait,
            Action::TaskComplete { .. } => ActionKind::TaskComplete,
        }
    }

    /// The primary point this action lands on, if it has one.
    pub fn point(&self) -> Option<(i32, i32)> {
        match self {
            Action::Click { x, y, .. } | Action::DoubleClick { x, y } | Action::Scroll { x, y, .. } => {
                Some((*x, *y))
            }
            Action::Drag { start_x, start_y, .. } => Some((*start_x, *start_y)),
            _ => None,
        }
    }

    /// Decode a tool call `(name, arguments)` into an action.
    ///
    /// `Ok(None)` means the name is outside the vocabulary; an error means the
    /// name is known but the arguments do not fit its schema.
    pub fn from_tool_call(name: &str, arguments: &Value) -> Result<Option<Action>, serde_json::Error> {
        let Some(kind) = ActionKind::from_name(name) else {
            return Ok(None);
        };
        let mut obj = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "arguments for {} must be an object, got {}",
                    kind, other
                )))
            }
        };
        obj.insert("type".into(), Value::String(kind.name().to_string()));
        serde_json::from_value(Value::Object(obj)).map(Some)
    }

    /// Arguments object for echoing this action back as a tool call.
    pub fn arguments(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = v.as_object_mut() {
            obj.remove("type");
        }
        v
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { x, y, button, click_count } => {
                write!(f, "click {} at ({}, {}) x{}", button, x, y, click_count)
            }
            Action::DoubleClick { x, y } => write!(f, "double_click at ({}, {})", x, y),
            Action::TypeText { text } => write!(f, "type {:?}", truncate(text, 50)),
            Action::PressKey { key } => write!(f, "press {}", key),
            Action::Hotkey { keys } => write!(f, "hotkey {}", keys.join("+")),
            Action::Scroll { x, y, direction, amount } => {
                write!(f, "scroll {} {} at ({}, {})", direction, amount, x, y)
            }
            Action::Drag { start_x, start_y, end_x, end_y } => {
                write!(f, "drag ({}, {}) -> ({}, {})", start_x, start_y, end_x, end_y)
            }
            Action::Wait { duration_ms } => write!(f, "wait {}ms", duration_ms),
            Action::TaskComplete { summary } => write!(f, "task_complete: {}", summary),
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

// ========================= Buttons & Directions =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
    /// Browser-style history navigation, sent as a hotkey.
    Back,
    Forward,
    /// Sent as a fixed-size scroll.
    Wheel,
}

impl MouseButton {
    /// Case-insensitive; unrecognised names fall back to `Left`.
    pub fn normalize(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" => MouseButton::Left,
            "right" => MouseButton::Right,
            "middle" => MouseButton::Middle,
            "back" => MouseButton::Back,
            "forward" => MouseButton::Forward,
            "wheel" => MouseButton::Wheel,
            other => {
                warn!(button = %other, "unknown mouse button, using left");
                MouseButton::Left
            }
        }
    }
}

impl<'de> Deserialize<'de> for MouseButton {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MouseButton::normalize(&s))
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
            MouseButton::Back => "back",
            MouseButton::Forward => "forward",
            MouseButton::Wheel => "wheel",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        })
    }
}

// ========================= Proposals & Safety =========================

/// Advisory flag the model attaches to a proposed action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for SafetyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.id, self.code, self.message)
    }
}

/// One tool call from a model response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Proposed {
    Known { call_id: String, action: Action },
    Unknown { call_id: String, kind: String, arguments: Value },
}

impl Proposed {
    pub fn call_id(&self) -> &str {
        match self {
            Proposed::Known { call_id, .. } | Proposed::Unknown { call_id, .. } => call_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Proposed::Known { action, .. } => action.kind().name(),
            Proposed::Unknown { kind, .. } => kind,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            Proposed::Known { action, .. } => Some(action),
            Proposed::Unknown { .. } => None,
        }
    }
}

// ========================= Vocabulary =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    DoubleClick,
    TypeText,
    PressKey,
    Hotkey,
    Scroll,
    Drag,
    Wait,
    TaskComplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    String,
    StringList,
    Enum(&'static [&'static str]),
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
}

const fn param(name: &'static str, ty: ParamType, required: bool, description: &'static str) -> ParamSpec {
    ParamSpec { name, ty, required, description }
}

const X: ParamSpec = param("x", ParamType::Integer, true, "X coordinate (pixels from left)");
const Y: ParamSpec = param("y", ParamType::Integer, true, "Y coordinate (pixels from top)");

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::Click,
        ActionKind::DoubleClick,
        ActionKind::TypeText,
        ActionKind::PressKey,
        ActionKind::Hotkey,
        ActionKind::Scroll,
        ActionKind::Drag,
        ActionKind::Wait,
        ActionKind::TaskComplete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::TypeText => "type_text",
            ActionKind::PressKey => "press_key",
            ActionKind::Hotkey => "hotkey",
            ActionKind::Scroll => "scroll",
            ActionKind::Drag => "drag",
            ActionKind::Wait => "wait",
            ActionKind::TaskComplete => "task_complete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ActionKind::Click => "Click at x,y coordinates on the screen",
            ActionKind::DoubleClick => "Double-click at x,y coordinates, e.g. to open a list item",
            ActionKind::TypeText => "Type text using the keyboard",
            ActionKind::PressKey => "Press a single keyboard key (enter, tab, escape, ...)",
            ActionKind::Hotkey => "Press a keyboard shortcut like ctrl+s, win+r, alt+f4",
            ActionKind::Scroll => "Scroll the mouse wheel at x,y",
            ActionKind::Drag => "Drag with the left button from one point to another",
            ActionKind::Wait => "Wait for the UI to settle",
            ActionKind::TaskComplete => "Signal that the task has been completed",
        }
    }

    pub fn params(self) -> &'static [ParamSpec] {
        const BUTTONS: &[&str] = &["left", "right", "middle", "back", "forward", "wheel"];
        const DIRECTIONS: &[&str] = &["up", "down"];
        const CLICK: &[ParamSpec] = &[
            X,
            Y,
            param("button", ParamType::Enum(BUTTONS), false, "Mouse button, default left"),
            param("click_count", ParamType::Integer, false, "Number of clicks, default 1"),
        ];
        const DOUBLE_CLICK: &[ParamSpec] = &[X, Y];
        const TYPE_TEXT: &[ParamSpec] = &[param("text", ParamType::String, true, "The text to type")];
        const PRESS_KEY: &[ParamSpec] = &[param("key", ParamType::String, true, "Key to press")];
        const HOTKEY: &[ParamSpec] = &[param(
            "keys",
            ParamType::StringList,
            true,
            "Keys to press together, e.g. [\"ctrl\", \"s\"]",
        )];
        const SCROLL: &[ParamSpec] = &[
            X,
            Y,
            param("direction", ParamType::Enum(DIRECTIONS), false, "Scroll direction, default down"),
            param("amount", ParamType::Integer, false, "Number of wheel clicks, default 3"),
        ];
        const DRAG: &[ParamSpec] = &[
            param("start_x", ParamType::Integer, true, "Start X coordinate"),
            param("start_y", ParamType::Integer, true, "Start Y coordinate"),
            param("end_x", ParamType::Integer, true, "End X coordinate"),
            param("end_y", ParamType::Integer, true, "End Y coordinate"),
        ];
        const WAIT: &[ParamSpec] = &[param("duration_ms", ParamType::Integer, false, "Time to wait in milliseconds, default 1000")];
        const TASK_COMPLETE: &[ParamSpec] =
            &[param("summary", ParamType::String, true, "What was accomplished")];

        match self {
            ActionKind::Click => CLICK,
            ActionKind::DoubleClick => DOUBLE_CLICK,
            ActionKind::TypeText => TYPE_TEXT,
            ActionKind::PressKey => PRESS_KEY,
            ActionKind::Hotkey => HOTKEY,
            ActionKind::Scroll => SCROLL,
            ActionKind::Drag => DRAG,
            ActionKind::Wait => WAIT,
            ActionKind::TaskComplete => TASK_COMPLETE,
        }
    }

    /// JSON schema of this kind's parameters.
    pub fn parameters_schema(self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in self.params() {
            let schema = match p.ty {
                ParamType::Integer => json!({ "type": "integer", "description": p.description }),
                ParamType::String => json!({ "type": "string", "description": p.description }),
                ParamType::StringList => json!({
                    "type": "array",
                    "items": { "type": "string" },
                    "description": p.description
                }),
                ParamType::Enum(values) => json!({
                    "type": "string",
                    "enum": values,
                    "description": p.description
                }),
            };
            properties.insert(p.name.to_string(), schema);
            if p.required {
                required.push(p.name);
            }
        }
        json!({ "type": "object", "properties": properties, "required": required })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The fixed set of action kinds the model may propose.
#[derive(Clone, Debug)]
pub struct ActionVocabulary {
    kinds: Vec<ActionKind>,
}

impl ActionVocabulary {
    pub fn standard() -> Self {
        Self { kinds: ActionKind::ALL.to_vec() }
    }

    pub fn kinds(&self) -> &[ActionKind] {
        &self.kinds
    }

    pub fn contains(&self, name: &str) -> bool {
        ActionKind::from_name(name).map_or(false, |k| self.kinds.contains(&k))
    }

    /// Function-tool definitions in Responses API shape.
    pub fn to_tools(&self) -> Value {
        Value::Array(
            self.kinds
                .iter()
                .map(|k| {
                    json!({
                        "type": "function",
                        "name": k.name(),
                        "description": k.description(),
                        "parameters": k.parameters_schema(),
                    })
                })
                .collect(),
        )
    }
}

impl Default for ActionVocabulary {
    fn default() -> Self {
        Self::standard()
    }
}
