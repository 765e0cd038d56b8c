//! In-process, read-only filesystem tools scoped to a workspace root.
//!
//! Paths from the model are treated as hostile: everything is resolved
//! relative to the root and parent-directory components are rejected before
//! any IO happens.

use std::path::{Component, Path, PathBuf};

use sp_domain::error::{Error, Result};

/// Hard cap on bytes returned from a single read, so one giant file can't
/// blow out the model context.
const MAX_READ_BYTES: usize = 256 * 1024;

/// Cap on grep matches returned.
const MAX_GREP_MATCHES: usize = 200;

pub struct WorkspaceFs {
    root: PathBuf,
}

impl WorkspaceFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied path inside the root.
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let rel = Path::new(raw);
        if rel.is_absolute() {
            return Err(Error::PermissionDenied(format!(
                "absolute paths are not allowed: {raw}"
            )));
        }
        for component in rel.components() {
            if matches!(component, Component::ParentDir) {
                return Err(Error::PermissionDenied(format!(
                    "path escapes the workspace: {raw}"
                )));
            }
        }
        Ok(self.root.join(rel))
    }

    pub fn read_file(&self, raw_path: &str) -> Result<String> {
        let path = self.resolve(raw_path)?;
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::NotFound(format!("{raw_path}: {e}")))?;
        let truncated = bytes.len() > MAX_READ_BYTES;
        let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_READ_BYTES)]).into_owned();
        if truncated {
            Ok(format!("{text}\n[truncated at {MAX_READ_BYTES} bytes]"))
        } else {
            Ok(text)
        }
    }

    pub fn list_dir(&self, raw_path: &str, recursive: bool) -> Result<String> {
        let path = self.resolve(raw_path)?;
        let mut lines = Vec::new();
        self.walk(&path, &path, recursive, &mut lines)?;
        lines.sort();
        if lines.is_empty() {
            Ok("(empty)".into())
        } else {
            Ok(lines.join("\n"))
        }
    }

    fn walk(
        &self,
        base: &Path,
        dir: &Path,
        recursive: bool,
        lines: &mut Vec<String>,
    ) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::NotFound(format!("{}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let rel = path.strip_prefix(base).unwrap_or(&path);
            let display = rel.display();
            if path.is_dir() {
                lines.push(format!("{display}/"));
                if recursive {
                    self.walk(base, &path, true, lines)?;
                }
            } else {
                lines.push(display.to_string());
            }
        }
        Ok(())
    }

    /// Line-oriented regex search. Output mirrors `grep -rn`.
    pub fn grep(&self, pattern: &str, raw_path: &str, case_sensitive: bool) -> Result<String> {
        let re = regex::RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| Error::Other(format!("invalid pattern: {e}")))?;

        let base = self.resolve(raw_path)?;
        let mut matches = Vec::new();
        self.grep_walk(&base, &base, &re, &mut matches)?;

        if matches.is_empty() {
            Ok("no matches".into())
        } else {
            let capped = matches.len() > MAX_GREP_MATCHES;
            matches.truncate(MAX_GREP_MATCHES);
            let mut out = matches.join("\n");
            if capped {
                out.push_str(&format!("\n[capped at {MAX_GREP_MATCHES} matches]"));
            }
            Ok(out)
        }
    }

    fn grep_walk(
        &self,
        base: &Path,
        dir: &Path,
        re: &regex::Regex,
        matches: &mut Vec<String>,
    ) -> Result<()> {
        if matches.len() > MAX_GREP_MATCHES {
            return Ok(());
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::NotFound(format!("{}: {e}", dir.display())))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.grep_walk(base, &path, re, matches)?;
            } else if let Ok(content) = std::fs::read_to_string(&path) {
                let rel = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
                for (lineno, line) in content.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(format!("{}:{}:{}", rel.display(), lineno + 1, line));
                        if matches.len() > MAX_GREP_MATCHES {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, WorkspaceFs) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello sandbox\nsecond line").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n// TODO later").unwrap();
        let fs = WorkspaceFs::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn read_file_within_root() {
        let (_dir, fs) = workspace();
        let text = fs.read_file("notes.txt").unwrap();
        assert!(text.contains("hello sandbox"));
    }

    #[test]
    fn rejects_escape_attempts() {
        let (_dir, fs) = workspace();
        assert!(matches!(
            fs.read_file("../etc/passwd").unwrap_err(),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            fs.read_file("/etc/passwd").unwrap_err(),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            fs.read_file("src/../../escape").unwrap_err(),
            Error::PermissionDenied(_)
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, fs) = workspace();
        assert!(matches!(
            fs.read_file("ghost.txt").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn list_dir_flat_and_recursive() {
        let (_dir, fs) = workspace();
        let flat = fs.list_dir("", false).unwrap();
        assert!(flat.contains("notes.txt"));
        assert!(flat.contains("src/"));
        assert!(!flat.contains("main.rs"));

        let deep = fs.list_dir("", true).unwrap();
        assert!(deep.contains("src/main.rs"));
    }

    #[test]
    fn grep_finds_lines_with_numbers() {
        let (_dir, fs) = workspace();
        let out = fs.grep("TODO", "", true).unwrap();
        assert!(out.contains("src/main.rs:2:"));

        assert_eq!(fs.grep("nothing-here", "", true).unwrap(), "no matches");
    }

    #[test]
    fn grep_case_insensitive() {
        let (_dir, fs) = workspace();
        let out = fs.grep("HELLO", "", false).unwrap();
        assert!(out.contains("notes.txt:1:"));
    }

    #[test]
    fn grep_invalid_pattern_is_error() {
        let (_dir, fs) = workspace();
        assert!(fs.grep("(unclosed", "", true).is_err());
    }
}
