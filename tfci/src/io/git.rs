//! Git adapter for the checkout.
//!
//! The daemon only ever reads the checkout's version-control state, so we keep
//! a small, explicit wrapper around `git` subprocess calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    /// Full SHA of HEAD.
    pub fn head_revision(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Path of the working directory relative to the repository root, e.g. `infra/`.
    pub fn show_prefix(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--show-prefix"])?;
        Ok(out.trim().to_string())
    }

    /// Status entries (including untracked) under the working directory.
    ///
    /// Paths are relative to the working directory, not the repository root.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let prefix = self.show_prefix()?;
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall", "--", "."])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let mut entry = parse_status_line(line)?;
            if let Some(rest) = entry.path.strip_prefix(prefix.as_str()) {
                entry.path = rest.to_string();
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Blob ids of the given working-directory files, keyed by path.
    pub fn hash_objects(&self, paths: &[&str]) -> Result<HashMap<String, String>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args = vec!["hash-object", "--"];
        args.extend_from_slice(paths);
        let out = self.run_capture(&args)?;
        let hashes: Vec<&str> = out.lines().map(str::trim).collect();
        if hashes.len() != paths.len() {
            return Err(anyhow!(
                "git hash-object returned {} ids for {} paths",
                hashes.len(),
                paths.len()
            ));
        }
        Ok(paths
            .iter()
            .zip(hashes)
            .map(|(path, hash)| ((*path).to_string(), hash.to_string()))
            .collect())
    }

    /// Summarize HEAD plus uncommitted changes, skipping paths under `ignored_prefixes`.
    ///
    /// Dirty files that still exist contribute their content hash, so a second
    /// edit to an already modified file changes the fingerprint. Two calls
    /// return the same string iff nothing relevant changed in between.
    #[instrument(skip_all)]
    pub fn fingerprint(&self, ignored_prefixes: &[String]) -> Result<String> {
        let head = self.head_revision()?;
        let entries: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !ignored_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix.as_str()))
            })
            .collect();
        let present: Vec<&str> = entries
            .iter()
            .filter(|entry| self.workdir.join(&entry.path).is_file())
            .map(|entry| entry.path.as_str())
            .collect();
        let hashes = self.hash_objects(&present)?;

        let mut changed: Vec<String> = entries
            .iter()
            .map(|entry| match hashes.get(&entry.path) {
                Some(hash) => format!("{} {} {hash}", entry.code, entry.path),
                None => format!("{} {}", entry.code, entry.path),
            })
            .collect();
        changed.sort();
        debug!(head = %head, changed = changed.len(), "computed checkout fingerprint");

        let mut fingerprint = head;
        for line in changed {
            fingerprint.push('\n');
            fingerprint.push_str(&line);
        }
        Ok(fingerprint)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
