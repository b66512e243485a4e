//! Command batch files consumed by `runs`.
//!
//! One command per line. Lines starting with `#`, `//` or `%` are comments; comments and blank
//! lines are kept in place and never dispatched.

use crate::core::error::ValidationError;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

const COMMENT_PREFIXES: [&str; 3] = ["#", "//", "%"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Command,
    Comment,
    Blank,
}

pub fn classify(line: &str) -> LineKind {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        LineKind::Blank
    } else if COMMENT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        LineKind::Comment
    } else {
        LineKind::Command
    }
}

/// A command waiting in the file, with the index of the line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub line: usize,
    pub command: String,
}

/// In-memory copy of a command file.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    path: PathBuf,
    lines: Vec<String>,
    line_ending: &'static str,
}

impl CommandQueue {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read command file {}", path.display()))?;
        Ok(Self::from_text(path, &content))
    }

    pub fn from_text(path: impl Into<PathBuf>, content: &str) -> Self {
        Self {
            path: path.into(),
            lines: content.lines().map(str::to_string).collect(),
            line_ending: if content.contains("\r\n") { "\r\n" } else { "\n" },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every command of the file, in file order.
    pub fn pending(&self) -> Vec<PendingCommand> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| classify(line) == LineKind::Command)
            .map(|(line, text)| PendingCommand {
                line,
                command: text.trim().to_string(),
            })
            .collect()
    }

    /// Reject the file if any command brings its own background modifier.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.pending().into_iter().find(|p| p.command.ends_with('&')) {
            Some(p) => Err(ValidationError::BackgroundModifier(p.command)),
            None => Ok(()),
        }
    }

    /// Split the file into issued command lines and everything that stays.
    pub fn partition(&self, issued: &BTreeSet<usize>) -> (Vec<String>, Vec<String>) {
        let mut processed = Vec::new();
        let mut remaining = Vec::new();
        for (index, line) in self.lines.iter().enumerate() {
            if issued.contains(&index) && classify(line) == LineKind::Command {
                processed.push(line.clone());
            } else {
                remaining.push(line.clone());
            }
        }
        (processed, remaining)
    }

    /// Drop the issued lines from the backing file with a single atomic replace.
    ///
    /// The replacement keeps the permissions and line endings of the file. Returns the
    /// removed lines.
    pub fn commit(&self, issued: &BTreeSet<usize>) -> Result<Vec<String>> {
        let (processed, remaining) = self.partition(issued);
        if processed.is_empty() {
            return Ok(processed);
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
        for line in &remaining {
            write!(file, "{line}{}", self.line_ending)?;
        }
        let permissions = std::fs::metadata(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?
            .permissions();
        file.as_file().set_permissions(permissions)?;
        file.as_file().sync_all()?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        tracing::debug!(
            "Removed {} dispatched line(s) from {}",
            processed.len(),
            self.path.display()
        );
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "# sweep\n./sim -N 1\n\n// later\n./sim -N 2\n% matlab style\n./sim -N 3\n";

    #[test]
    fn test_classify() {
        assert_eq!(classify("   "), LineKind::Blank);
        assert_eq!(classify("  # x"), LineKind::Comment);
        assert_eq!(classify("// x"), LineKind::Comment);
        assert_eq!(classify("%x"), LineKind::Comment);
        assert_eq!(classify("python a.py # trailing"), LineKind::Command);
    }

    #[test]
    fn test_pending_skips_comments_and_blanks() {
        let queue = CommandQueue::from_text("cmds.txt", FILE);
        let pending = queue.pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].line, 1);
        assert_eq!(pending[2].command, "./sim -N 3");
    }

    #[test]
    fn test_partition_keeps_comments() {
        let queue = CommandQueue::from_text("cmds.txt", FILE);
        let issued: BTreeSet<usize> = [0, 1, 4].into_iter().collect();
        let (processed, remaining) = queue.partition(&issued);
        assert_eq!(processed, vec!["./sim -N 1", "./sim -N 2"]);
        assert_eq!(
            remaining,
            vec!["# sweep", "", "// later", "% matlab style", "./sim -N 3"]
        );
    }

    #[test]
    fn test_validate_rejects_background_modifier() {
        let queue = CommandQueue::from_text("cmds.txt", "./a\n./b &\n");
        assert_eq!(
            queue.validate(),
            Err(ValidationError::BackgroundModifier("./b &".to_string()))
        );
    }

    #[test]
    fn test_commit_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, FILE).unwrap();

        let queue = CommandQueue::load(&path).unwrap();
        let removed = queue.commit(&[1].into_iter().collect()).unwrap();
        assert_eq!(removed, vec!["./sim -N 1"]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "# sweep\n\n// later\n./sim -N 2\n% matlab style\n./sim -N 3\n"
        );
    }

    #[test]
    fn test_commit_keeps_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "# sweep\r\n./a\r\n./b\r\n").unwrap();

        let queue = CommandQueue::load(&path).unwrap();
        assert_eq!(queue.pending()[0].command, "./a");
        queue.commit(&[1].into_iter().collect()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# sweep\r\n./b\r\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "./a\n./b\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let queue = CommandQueue::load(&path).unwrap();
        queue.commit(&[0].into_iter().collect()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "./b\n");
    }

    #[test]
    fn test_commit_nothing_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "./a").unwrap();

        let queue = CommandQueue::load(&path).unwrap();
        assert!(queue.commit(&BTreeSet::new()).unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "./a");
    }
}
