//! Per-instance working directories.
//!
//! Every job instance gets a fresh, empty directory, like a newly provisioned
//! runner. `actions/checkout` fills it with a copy of the source workspace.
//! The directory is removed when the instance finishes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Repository of the action that populates an instance directory.
pub const CHECKOUT_ACTION: &str = "actions/checkout";

/// Scratch directory owned by one job instance.
#[derive(Debug)]
pub struct InstanceWorkspace {
    dir: TempDir,
}

impl InstanceWorkspace {
    /// Create an empty directory whose name starts with a slug of `label`.
    pub fn create(label: &str) -> io::Result<Self> {
        let prefix = format!("wfgraph-{}-", slug(label));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// `Unit-Test (py310)` -> `unit-test-py310`.
fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Copy `source` into `dest`, leaving out any path in `skip`. Symlinks are
/// recreated rather than followed. Returns the number of files copied.
pub fn checkout(source: &Path, dest: &Path, skip: &[PathBuf]) -> io::Result<u64> {
    let source = source.canonicalize()?;
    // Skip entries are compared against paths under the canonical source.
    let mut skip: Vec<PathBuf> = skip.iter().filter_map(|p| p.canonicalize().ok()).collect();
    if let Ok(dest) = dest.canonicalize() {
        skip.push(dest);
    }
    copy_tree(&source, dest, &skip)
}

fn copy_tree(from: &Path, to: &Path, skip: &[PathBuf]) -> io::Result<u64> {
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        if skip.contains(&path) {
            continue;
        }
        let target = to.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
            copied += copy_tree(&path, &target, skip)?;
        } else if kind.is_file() {
            fs::copy(&path, &target)?;
            copied += 1;
        } else if kind.is_symlink() {
            link(&fs::read_link(&path)?, &target)?;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn link(original: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, target)
}

#[cfg(not(unix))]
fn link(_original: &Path, _target: &Path) -> io::Result<()> {
    Ok(())
}
