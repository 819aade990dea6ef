//! Keyboard, mouse and timing primitives.
//!
//! Input is synthesised with `xdotool` on Linux, `osascript` on macOS and
//! PowerShell on Windows.

use std::time::Duration;

use async_trait::async_trait;

use super::terminal::run_helper;
use super::{int_arg, num_arg, opt_str_arg, str_arg, text_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const INPUT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_WAIT_SECONDS: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            None | Some("") | Some("left") => Ok(MouseButton::Left),
            Some("right") => Ok(MouseButton::Right),
            Some("middle") => Ok(MouseButton::Middle),
            Some(other) => Err(anyhow::anyhow!("Unknown mouse button '{}'", other)),
        }
    }

    fn xdotool_code(self) -> &'static str {
        match self {
            MouseButton::Left => "1",
            MouseButton::Middle => "2",
            MouseButton::Right => "3",
        }
    }
}

/// Split `"ctrl+shift+s"` or `"ctrl, c"` into lower-case key names.
pub fn parse_keys(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == '+' || c == ',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn xdotool_key(key: &str) -> String {
    match key {
        "ctrl" | "control" => "ctrl".to_string(),
        "alt" => "alt".to_string(),
        "shift" => "shift".to_string(),
        "win" | "super" | "cmd" | "command" | "meta" => "super".to_string(),
        "enter" | "return" => "Return".to_string(),
        "esc" | "escape" => "Escape".to_string(),
        "tab" => "Tab".to_string(),
        "space" => "space".to_string(),
        "backspace" => "BackSpace".to_string(),
        "delete" | "del" => "Delete".to_string(),
        "up" => "Up".to_string(),
        "down" => "Down".to_string(),
        "left" => "Left".to_string(),
        "right" => "Right".to_string(),
        "home" => "Home".to_string(),
        "end" => "End".to_string(),
        "pageup" => "Prior".to_string(),
        "pagedown" => "Next".to_string(),
        k if k.len() > 1 && k.starts_with('f') && k[1..].parse::<u8>().is_ok() => k.to_uppercase(),
        k => k.to_string(),
    }
}

/// SendKeys notation, e.g. `^+s` for ctrl+shift+s.
fn sendkeys_chord(keys: &[String]) -> String {
    let mut chord = String::new();
    for key in keys {
        let part = match key.as_str() {
            "ctrl" | "control" => "^".to_string(),
            "alt" => "%".to_string(),
            "shift" => "+".to_string(),
            "enter" | "return" => "{ENTER}".to_string(),
            "esc" | "escape" => "{ESC}".to_string(),
            "tab" => "{TAB}".to_string(),
            "backspace" => "{BACKSPACE}".to_string(),
            "delete" | "del" => "{DELETE}".to_string(),
            "up" | "down" | "left" | "right" | "home" | "end" => format!("{{{}}}", key.to_uppercase()),
            k if k.len() > 1 && k.starts_with('f') && k[1..].parse::<u8>().is_ok() => {
                format!("{{{}}}", k.to_uppercase())
            }
            k => k.to_string(),
        };
        chord.push_str(&part);
    }
    chord
}

fn sendkeys_escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '+' | '^' | '%' | '~' | '(' | ')' | '{' | '}' | '[' | ']' => format!("{{{}}}", c),
            '\n' => "{ENTER}".to_string(),
            c => c.to_string(),
        })
        .collect()
}

fn applescript_string(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

async fn powershell(script: &str) -> anyhow::Result<String> {
    run_helper("powershell", &["-NoProfile", "-Command", script], INPUT_TIMEOUT).await
}

/// Click at screen coordinates.
pub struct MouseClick;

#[async_trait]
impl Tool for MouseClick {
    fn name(&self) -> ToolName {
        ToolName::MouseClick
    }

    async fn execute(&self, args: &Arguments, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let x = int_arg(args, "x")?;
        let y = int_arg(args, "y")?;
        let button = MouseButton::parse(opt_str_arg(args, "button"))?;

        if cfg!(target_os = "windows") {
            let (down, up) = match button {
                MouseButton::Left => (0x02, 0x04),
                MouseButton::Right => (0x08, 0x10),
                MouseButton::Middle => (0x20, 0x40),
            };
            let script = format!(
                "Add-Type -MemberDefinition '[DllImport(\"user32.dll\")] public static extern bool SetCursorPos(int x, int y); \
                 [DllImport(\"user32.dll\")] public static extern void mouse_event(int f, int x, int y, int d, int e);' -Name U -Namespace W; \
                 [W.U]::SetCursorPos({x}, {y}); [W.U]::mouse_event({down}, 0, 0, 0, 0); [W.U]::mouse_event({up}, 0, 0, 0, 0)",
                x = x,
                y = y,
                down = down,
                up = up
            );
            powershell(&script).await?;
        } else if cfg!(target_os = "macos") {
            let action = match button {
                MouseButton::Right => "rc",
                _ => "c",
            };
            run_helper("cliclick", &[format!("{}:{},{}", action, x, y).as_str()], INPUT_TIMEOUT).await?;
        } else {
            run_helper(
                "xdotool",
                &["mousemove", &x.to_string(), &y.to_string(), "click", button.xdotool_code()],
                INPUT_TIMEOUT,
            )
            .await?;
        }

        Ok(ToolOutput::new(format!("Clicked {:?} at ({}, {})", button, x, y)))
    }
}

/// Type text at the current focus.
pub struct TypeText;

#[async_trait]
impl Tool for TypeText {
    fn name(&self) -> ToolName {
        ToolName::TypeText
    }

    async fn execute(&self, args: &Arguments, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let text = text_arg(args, "text")?;

        if cfg!(target_os = "windows") {
            let script = format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                sendkeys_escape(&text).replace('\'', "''")
            );
            powershell(&script).await?;
        } else if cfg!(target_os = "macos") {
            let script = format!(
                "tell application \"System Events\" to keystroke {}",
                applescript_string(&text)
            );
            run_helper("osascript", &["-e", &script], INPUT_TIMEOUT).await?;
        } else {
            run_helper("xdotool", &["type", "--delay", "20", "--", &text], INPUT_TIMEOUT).await?;
        }

        Ok(ToolOutput::new(format!("Typed {} characters", text.chars().count())))
    }
}

/// Press a key combination.
pub struct Hotkey;

#[async_trait]
impl Tool for Hotkey {
    fn name(&self) -> ToolName {
        ToolName::Hotkey
    }

    async fn execute(&self, args: &Arguments, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let keys = parse_keys(str_arg(args, "keys")?);
        if keys.is_empty() {
            return Err(anyhow::anyhow!("Missing 'keys' argument"));
        }

        if cfg!(target_os = "windows") {
            let script = format!(
                "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{}')",
                sendkeys_chord(&keys).replace('\'', "''")
            );
            powershell(&script).await?;
        } else if cfg!(target_os = "macos") {
            let (modifiers, key): (Vec<&String>, Option<&String>) = match keys.split_last() {
                Some((last, rest)) => (rest.iter().collect(), Some(last)),
                None => (Vec::new(), None),
            };
            let using: Vec<String> = modifiers
                .iter()
                .map(|m| match m.as_str() {
                    "ctrl" | "control" => "control down".to_string(),
                    "alt" | "option" => "option down".to_string(),
                    "shift" => "shift down".to_string(),
                    _ => "command down".to_string(),
                })
                .collect();
            let mut script = format!(
                "tell application \"System Events\" to keystroke {}",
                applescript_string(key.map(String::as_str).unwrap_or_default())
            );
            if !using.is_empty() {
                script.push_str(&format!(" using {{{}}}", using.join(", ")));
            }
            run_helper("osascript", &["-e", &script], INPUT_TIMEOUT).await?;
        } else {
            let chord = keys.iter().map(|k| xdotool_key(k)).collect::<Vec<_>>().join("+");
            run_helper("xdotool", &["key", &chord], INPUT_TIMEOUT).await?;
        }

        Ok(ToolOutput::new(format!("Pressed {}", keys.join("+"))))
    }
}

/// Sleep for a number of seconds.
pub struct WaitSeconds;

#[async_trait]
impl Tool for WaitSeconds {
    fn name(&self) -> ToolName {
        ToolName::WaitSeconds
    }

    async fn execute(&self, args: &Arguments, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let seconds = num_arg(args, "seconds")?;
        if !(0.0..=MAX_WAIT_SECONDS).contains(&seconds) {
            return Err(anyhow::anyhow!(
                "'seconds' must be between 0 and {}",
                MAX_WAIT_SECONDS
            ));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(ToolOutput::new(format!("Waited {}s", seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{args, context};
    use serde_json::json;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_parse_keys() {
        assert_eq!(parse_keys("Ctrl+Shift+S"), vec!["ctrl", "shift", "s"]);
        assert_eq!(parse_keys("alt, f4"), vec!["alt", "f4"]);
        assert!(parse_keys(" + ").is_empty());
    }

    #[test]
    fn test_key_translation() {
        let keys = parse_keys("ctrl+alt+delete");
        assert_eq!(sendkeys_chord(&keys), "^%{DELETE}");
        assert_eq!(xdotool_key("enter"), "Return");
        assert_eq!(xdotool_key("f11"), "F11");
        assert_eq!(xdotool_key("win"), "super");
        assert_eq!(sendkeys_escape("a+b\n"), "a{+}b{ENTER}");
    }

    #[test]
    fn test_mouse_button() {
        assert_eq!(MouseButton::parse(None).unwrap(), MouseButton::Left);
        assert_eq!(MouseButton::parse(Some("RIGHT")).unwrap(), MouseButton::Right);
        assert!(MouseButton::parse(Some("back")).is_err());
    }

    #[tokio::test]
    async fn test_wait_seconds() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());

        let started = Instant::now();
        let out = WaitSeconds
            .execute(&args(json!({"seconds": "0.05"})), &ctx)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(out.message, "Waited 0.05s");

        assert!(WaitSeconds
            .execute(&args(json!({"seconds": -1})), &ctx)
            .await
            .is_err());
    }
}
