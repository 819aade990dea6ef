//! File operation tools.
//!
//! Path arguments arrive absolute (the engine resolves and checks them before
//! dispatch); `ctx.path_arg` only expands aliases for direct callers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{str_arg, text_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const MAX_SEARCH_RESULTS: usize = 500;

async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn require_exists(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Not found: {}", path.display()))
    }
}

/// Create or overwrite a text file.
pub struct CreateTextFile;

#[async_trait]
impl Tool for CreateTextFile {
    fn name(&self) -> ToolName {
        ToolName::CreateTextFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        let content = text_arg(args, "content")?;

        ensure_parent(&path).await?;
        tokio::fs::write(&path, &content).await?;

        // Verify write by reading back
        let written = tokio::fs::metadata(&path).await?.len();
        if written != content.len() as u64 {
            return Err(anyhow::anyhow!(
                "Write verification failed: expected {} bytes, got {}",
                content.len(),
                written
            ));
        }

        Ok(ToolOutput::new(format!("Created {}", path.display())).with_file(path))
    }
}

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> ToolName {
        ToolName::ReadFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        require_exists(&path)?;

        let content = tokio::fs::read_to_string(&path).await?;
        Ok(ToolOutput::new(format!("Read {} chars", content.chars().count()))
            .with_data(Value::String(content)))
    }
}

/// Replace every occurrence of a text inside a file.
pub struct EditFile;

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> ToolName {
        ToolName::EditFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        let old_text = text_arg(args, "old_text")?;
        let new_text = text_arg(args, "new_text")?;
        require_exists(&path)?;

        if old_text.is_empty() {
            return Err(anyhow::anyhow!("'old_text' must not be empty"));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let occurrences = content.matches(old_text.as_str()).count();
        if occurrences == 0 {
            return Err(anyhow::anyhow!("Text not found in file"));
        }

        tokio::fs::write(&path, content.replace(old_text.as_str(), &new_text)).await?;
        Ok(ToolOutput::new(format!(
            "Edited {} ({} replacement{})",
            path.display(),
            occurrences,
            if occurrences == 1 { "" } else { "s" }
        )))
    }
}

/// Delete a file.
pub struct DeleteFile;

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> ToolName {
        ToolName::DeleteFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        require_exists(&path)?;

        if path.is_dir() {
            return Err(anyhow::anyhow!(
                "{} is a directory; only files can be deleted",
                path.display()
            ));
        }

        tokio::fs::remove_file(&path).await?;
        Ok(ToolOutput::new(format!("Deleted {}", path.display())))
    }
}

/// List a directory. Defaults to the working directory.
pub struct ListFiles;

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> ToolName {
        ToolName::ListFiles
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let dir = match args.get("directory").and_then(Value::as_str) {
            Some(raw) if !raw.trim().is_empty() => ctx.resolver.expand(raw)?,
            _ => ctx.config.working_dir.clone(),
        };
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("Directory not found: {}", dir.display()));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push((name, meta.is_dir(), meta.len()));
        }
        entries.sort();

        let items: Vec<Value> = entries
            .iter()
            .map(|(name, is_dir, size)| {
                if *is_dir {
                    json!({"name": name, "type": "directory"})
                } else {
                    json!({"name": name, "type": "file", "size": size})
                }
            })
            .collect();

        Ok(
            ToolOutput::new(format!("{} items in {}", items.len(), dir.display()))
                .with_data(Value::Array(items)),
        )
    }
}

/// Create a directory and its parents.
pub struct CreateDirectory;

#[async_trait]
impl Tool for CreateDirectory {
    fn name(&self) -> ToolName {
        ToolName::CreateDirectory
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = ctx.path_arg(args, "path")?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(ToolOutput::new(format!("Directory created: {}", path.display())))
    }
}

/// Target path for a copy or move: into `destination` when it is a directory.
fn destination_for(source: &Path, destination: PathBuf) -> PathBuf {
    match source.file_name() {
        Some(name) if destination.is_dir() => destination.join(name),
        _ => destination,
    }
}

/// Copy a file.
pub struct CopyFile;

#[async_trait]
impl Tool for CopyFile {
    fn name(&self) -> ToolName {
        ToolName::CopyFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let source = ctx.path_arg(args, "source")?;
        require_exists(&source)?;
        let destination = destination_for(&source, ctx.path_arg(args, "destination")?);

        ensure_parent(&destination).await?;
        let bytes = tokio::fs::copy(&source, &destination).await?;

        Ok(ToolOutput::new(format!(
            "Copied {} -> {} ({} bytes)",
            source.display(),
            destination.display(),
            bytes
        ))
        .with_file(destination))
    }
}

/// Move or rename a file.
pub struct MoveFile;

#[async_trait]
impl Tool for MoveFile {
    fn name(&self) -> ToolName {
        ToolName::MoveFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let source = ctx.path_arg(args, "source")?;
        require_exists(&source)?;
        let destination = destination_for(&source, ctx.path_arg(args, "destination")?);

        ensure_parent(&destination).await?;
        if tokio::fs::rename(&source, &destination).await.is_err() {
            // Cross-device moves fall back to copy + delete.
            tokio::fs::copy(&source, &destination).await?;
            tokio::fs::remove_file(&source).await?;
        }

        Ok(ToolOutput::new(format!(
            "Moved {} -> {}",
            source.display(),
            destination.display()
        )))
    }
}

/// Translate a shell glob (`*`, `?`, `[..]`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> anyhow::Result<Regex> {
    let mut re = String::from("(?i)^");
    let mut in_class = false;
    for c in pattern.chars() {
        match c {
            '*' if !in_class => re.push_str(".*"),
            '?' if !in_class => re.push('.'),
            '[' if !in_class => {
                in_class = true;
                re.push('[');
            }
            ']' if in_class => {
                in_class = false;
                re.push(']');
            }
            '!' if in_class && re.ends_with('[') => re.push('^'),
            c if in_class => re.push(c),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| anyhow::anyhow!("Invalid pattern '{}': {}", pattern, e))
}

/// Recursive glob search by file name.
pub struct SearchFiles;

#[async_trait]
impl Tool for SearchFiles {
    fn name(&self) -> ToolName {
        ToolName::SearchFiles
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let dir = ctx.path_arg(args, "directory")?;
        let pattern = str_arg(args, "pattern")?;
        if !dir.is_dir() {
            return Err(anyhow::anyhow!("Directory not found: {}", dir.display()));
        }

        // "**/*.txt" and "*.txt" mean the same thing in a recursive search.
        let name_pattern = pattern.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(pattern);
        let matcher = glob_to_regex(name_pattern)?;

        let mut found = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&dir).min_depth(1).into_iter().filter_map(Result::ok) {
            if matcher.is_match(&entry.file_name().to_string_lossy()) {
                if found.len() == MAX_SEARCH_RESULTS {
                    truncated = true;
                    break;
                }
                found.push(Value::String(entry.path().display().to_string()));
            }
        }

        let mut message = format!("Found {} files", found.len());
        if truncated {
            message.push_str(&format!(" (stopped at {})", MAX_SEARCH_RESULTS));
        }
        Ok(ToolOutput::new(message).with_data(Value::Array(found)))
    }
}

/// Append text to a file, creating it when missing.
pub struct AppendToFile;

#[async_trait]
impl Tool for AppendToFile {
    fn name(&self) -> ToolName {
        ToolName::AppendToFile
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        use tokio::io::AsyncWriteExt;

        let path = ctx.path_arg(args, "path")?;
        let content = text_arg(args, "content")?;

        ensure_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        Ok(ToolOutput::new(format!("Appended to {}", path.display())))
    }
}
