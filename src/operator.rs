use crate::action::{Action, MouseButton, ScrollDirection};
use async_trait::async_trait;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

/// What the human operator decided for one proposal.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Approve,
    Reject { note: Option<String> },
    /// Run this instead of the model's action, for this turn only.
    Override(Action),
}

#[async_trait]
pub trait Operator: Send + Sync {
    async fn review(&self, iteration: u32, action: &Action, reasoning: Option<&str>) -> Decision;
}

/// Asks on the terminal before every dispatch.
pub struct StdinOperator {
    lines: Mutex<BufReader<Stdin>>,
}

impl StdinOperator {
    pub fn new() -> Self {
        Self { lines: Mutex::new(BufReader::new(tokio::io::stdin())) }
    }
}

impl Default for StdinOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for StdinOperator {
    async fn review(&self, iteration: u32, action: &Action, reasoning: Option<&str>) -> Decision {
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "\n[{}] Proposed: {}", iteration, action);
        if let Some(r) = reasoning {
            let _ = writeln!(stderr, "    Reasoning: {}", r);
        }
        let _ = write!(stderr, "    Execute? (y/n/<command>/<note>): ");
        let _ = stderr.flush();

        let mut line = String::new();
        let mut reader = self.lines.lock().await;
        match reader.read_line(&mut line).await {
            // stdin closed: nobody is there to approve
            Ok(0) | Err(_) => Decision::Reject { note: Some("operator unavailable".into()) },
            Ok(_) => parse_reply(&line),
        }
    }
}

/// Interpret one operator reply.
pub fn parse_reply(line: &str) -> Decision {
    let trimmed = line.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Decision::Approve,
        "n" | "no" => Decision::Reject { note: None },
        _ => match parse_direct_command(trimmed) {
            Some(action) => Decision::Override(action),
            None => Decision::Reject { note: Some(trimmed.to_string()) },
        },
    }
}

/// Parse a direct command like `click 160 677 right` or `hotkey ctrl+s`.
pub fn parse_direct_command(input: &str) -> Option<Action> {
    let mut parts = input.split_whitespace();
    let cmd = parts.next()?.to_ascii_lowercase();
    let rest: Vec<&str> = parts.collect();
    let int = |i: usize| rest.get(i).and_then(|s| s.parse::<i32>().ok());

    match cmd.as_str() {
        "click" => {
            let (x, y) = (int(0)?, int(1)?);
            let button = rest.get(2).map(|b| MouseButton::normalize(b)).unwrap_or_default();
            Some(Action::Click { x, y, button, click_count: 1 })
        }
        "double_click" | "doubleclick" => Some(Action::DoubleClick { x: int(0)?, y: int(1)? }),
        "type" | "type_text" if !rest.is_empty() => {
            // keep the operator's spacing after the command word
            let text = input.trim_start()[cmd.len()..].trim_start().to_string();
            Some(Action::TypeText { text })
        }
        "key" | "press" | "press_key" if rest.len() == 1 => Some(Action::PressKey { key: rest[0].to_string() }),
        "hotkey" if !rest.is_empty() => {
            let keys: Vec<String> = rest
                .iter()
                .flat_map(|s| s.split('+'))
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            (!keys.is_empty()).then_some(Action::Hotkey { keys })
        }
        "scroll" => {
            let (x, y) = (int(0)?, int(1)?);
            let direction = match rest.get(2).map(|s| s.to_ascii_lowercase()) {
                None => ScrollDirection::Down,
                Some(d) if d == "up" => ScrollDirection::Up,
                Some(d) if d == "down" => ScrollDirection::Down,
                Some(_) => return None,
            };
            let amount = match rest.get(3) {
                Some(s) => s.parse().ok()?,
                None => 3,
            };
            Some(Action::Scroll { x, y, direction, amount })
        }
        "drag" => Some(Action::Drag { start_x: int(0)?, start_y: int(1)?, end_x: int(2)?, end_y: int(3)? }),
        "wait" => Some(Action::Wait { duration_ms: rest.first()?.parse().ok()? }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approvals_and_rejections() {
        assert_eq!(parse_reply("\n"), Decision::Approve);
        assert_eq!(parse_reply("Y"), Decision::Approve);
        assert_eq!(parse_reply("no"), Decision::Reject { note: None });
        assert_eq!(
            parse_reply("the button is lower"),
            Decision::Reject { note: Some("the button is lower".into()) }
        );
    }

    #[test]
    fn direct_commands_override() {
        assert_eq!(
            parse_reply("click 160 677 right"),
            Decision::Override(Action::Click { x: 160, y: 677, button: MouseButton::Right, click_count: 1 })
        );
        assert_eq!(parse_direct_command("double_click 350 187"), Some(Action::DoubleClick { x: 350, y: 187 }));
        assert_eq!(
            parse_direct_command("hotkey ctrl+shift+s"),
            Some(Action::Hotkey { keys: vec!["ctrl".into(), "shift".into(), "s".into()] })
        );
        assert_eq!(
            parse_direct_command("type  hello world"),
            Some(Action::TypeText { text: "hello world".into() })
        );
        assert_eq!(
            parse_direct_command("scroll 10 20 up 5"),
            Some(Action::Scroll { x: 10, y: 20, direction: ScrollDirection::Up, amount: 5 })
        );
        assert_eq!(parse_direct_command("wait 250"), Some(Action::Wait { duration_ms: 250 }));
    }

    #[test]
    fn malformed_commands_are_not_overrides() {
        assert_eq!(parse_direct_command("click here"), None);
        assert_eq!(parse_direct_command("scroll 1 2 sideways"), None);
        assert_eq!(parse_direct_command("hotkey"), None);
        assert!(matches!(parse_reply("click on New Note"), Decision::Reject { .. }));
    }
}
