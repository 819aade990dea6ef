//! Screen capture through the platform's capture utility.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::terminal::run_helper;
use super::{int_arg, opt_str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(20);

/// Screen rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Target file inside the screenshots folder. Only the file name of
/// `requested` is kept, so captures cannot be written elsewhere.
fn capture_path(dir: &Path, requested: Option<&str>, prefix: &str) -> PathBuf {
    let name = requested
        .and_then(|r| Path::new(r.trim()).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty());

    let name = match name {
        Some(n) if Path::new(&n).extension().is_some() => n,
        Some(n) => format!("{}.png", n),
        None => format!("{}_{}.png", prefix, chrono::Local::now().format("%Y%m%d_%H%M%S")),
    };
    dir.join(name)
}

/// Candidate (program, args) pairs, tried in order until one succeeds.
fn capture_commands(path: &str, region: Option<Region>) -> Vec<(&'static str, Vec<String>)> {
    let s = |v: &str| v.to_string();

    if cfg!(target_os = "windows") {
        let (x, y, w, h) = match region {
            Some(r) => (r.x.to_string(), r.y.to_string(), r.width.to_string(), r.height.to_string()),
            None => (
                s("$b.X"),
                s("$b.Y"),
                s("$b.Width"),
                s("$b.Height"),
            ),
        };
        let script = format!(
            "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
             $b = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds; \
             $bmp = New-Object System.Drawing.Bitmap {w}, {h}; \
             $g = [System.Drawing.Graphics]::FromImage($bmp); \
             $g.CopyFromScreen({x}, {y}, 0, 0, $bmp.Size); \
             $bmp.Save('{p}', [System.Drawing.Imaging.ImageFormat]::Png)",
            x = x,
            y = y,
            w = w,
            h = h,
            p = path.replace('\'', "''")
        );
        return vec![("powershell", vec![s("-NoProfile"), s("-Command"), script])];
    }

    if cfg!(target_os = "macos") {
        return match region {
            Some(r) => vec![(
                "screencapture",
                vec![s("-x"), format!("-R{},{},{},{}", r.x, r.y, r.width, r.height), s(path)],
            )],
            None => vec![("screencapture", vec![s("-x"), s(path)])],
        };
    }

    match region {
        Some(r) => vec![
            (
                "grim",
                vec![s("-g"), format!("{},{} {}x{}", r.x, r.y, r.width, r.height), s(path)],
            ),
            (
                "import",
                vec![
                    s("-window"),
                    s("root"),
                    s("-crop"),
                    format!("{}x{}+{}+{}", r.width, r.height, r.x, r.y),
                    s(path),
                ],
            ),
            (
                "scrot",
                vec![s("-a"), format!("{},{},{},{}", r.x, r.y, r.width, r.height), s(path)],
            ),
        ],
        None => vec![
            ("grim", vec![s(path)]),
            ("gnome-screenshot", vec![s("-f"), s(path)]),
            ("import", vec![s("-window"), s("root"), s(path)]),
            ("scrot", vec![s(path)]),
        ],
    }
}

async fn capture(path: &Path, region: Option<Region>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let target = path.to_string_lossy();

    let mut failures = Vec::new();
    for (program, args) in capture_commands(&target, region) {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match run_helper(program, &args, CAPTURE_TIMEOUT).await {
            Ok(_) if path.exists() => return Ok(()),
            Ok(_) => failures.push(format!("{}: no file written", program)),
            Err(e) => failures.push(e.to_string()),
        }
    }
    Err(anyhow::anyhow!("Screen capture failed: {}", failures.join("; ")))
}

/// Capture the whole screen.
pub struct TakeScreenshot;

#[async_trait]
impl Tool for TakeScreenshot {
    fn name(&self) -> ToolName {
        ToolName::TakeScreenshot
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = capture_path(&ctx.config.screenshots_dir, opt_str_arg(args, "filename"), "screen");
        capture(&path, None).await?;
        Ok(ToolOutput::new(format!("Screenshot saved: {}", path.display())).with_file(path))
    }
}

/// Capture a rectangle of the screen.
pub struct ScreenshotRegion;

#[async_trait]
impl Tool for ScreenshotRegion {
    fn name(&self) -> ToolName {
        ToolName::ScreenshotRegion
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let region = Region {
            x: int_arg(args, "x")?,
            y: int_arg(args, "y")?,
            width: int_arg(args, "width")?,
            height: int_arg(args, "height")?,
        };
        if region.width <= 0 || region.height <= 0 || region.x < 0 || region.y < 0 {
            return Err(anyhow::anyhow!(
                "Invalid region {}x{} at ({}, {})",
                region.width,
                region.height,
                region.x,
                region.y
            ));
        }

        let path = capture_path(&ctx.config.screenshots_dir, opt_str_arg(args, "filename"), "region");
        capture(&path, Some(region)).await?;
        Ok(ToolOutput::new(format!("Region screenshot saved: {}", path.display()))
            .with_data(json!({"x": region.x, "y": region.y, "width": region.width, "height": region.height}))
            .with_file(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{args, context};
    use tempfile::tempdir;

    #[test]
    fn test_capture_path_keeps_file_name_only() {
        let dir = Path::new("/shots");
        assert_eq!(capture_path(dir, Some("../../etc/evil.png"), "screen"), dir.join("evil.png"));
        assert_eq!(capture_path(dir, Some("desk"), "screen"), dir.join("desk.png"));

        let generated = capture_path(dir, None, "region");
        let name = generated.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("region_") && name.ends_with(".png"));
        assert_eq!(name.len(), "region_20250101_120000.png".len());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_region_commands() {
        let region = Region { x: 10, y: 20, width: 300, height: 200 };
        let commands = capture_commands("/tmp/r.png", Some(region));
        assert_eq!(commands[0].0, "grim");
        assert_eq!(commands[0].1[1], "10,20 300x200");
        assert_eq!(commands[1].1[3], "300x200+10+20");
    }

    #[tokio::test]
    async fn test_region_must_be_positive() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path());
        let err = ScreenshotRegion
            .execute(&args(json!({"x": 0, "y": 0, "width": 0, "height": 10})), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid region"));
    }
}
