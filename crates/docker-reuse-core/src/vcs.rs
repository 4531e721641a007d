//! Version-control introspection for the identity resolver.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::identity::ResolutionError;
use crate::paths;

/// What the repository knows about the subtree rooted at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeState {
    /// Most recent change touching the subtree, if it has any history.
    pub change_id: Option<String>,
    /// No staged, unstaged or untracked changes under the subtree.
    pub clean: bool,
}

/// A contract for repository clients queried by the identity resolver.
pub trait VersionControl: std::fmt::Debug {
    /// Inspects the subtree rooted at `path`.
    ///
    /// # Errors
    /// Fails when `path` is not inside a repository, or when the subtree
    /// cannot be expressed relative to the repository root.
    fn subtree_state(&self, path: &Path) -> Result<SubtreeState, ResolutionError>;
}

/// Repository client backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--literal-pathspecs").arg("-C").arg(dir);
        cmd
    }

    fn run<I, S>(&self, dir: &Path, args: I) -> Result<std::process::Output, ResolutionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(dir)
            .args(args)
            .output()
            .map_err(ResolutionError::GitUnavailable)
    }

    fn toplevel(&self, abs: &Path) -> Result<PathBuf, ResolutionError> {
        let workdir = if abs.is_dir() {
            abs
        } else {
            abs.parent().unwrap_or(abs)
        };

        let output = self.run(workdir, ["rev-parse", "--show-toplevel"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not a git repository") {
                return Err(ResolutionError::NotARepository {
                    path: abs.to_path_buf(),
                });
            }
            return Err(ResolutionError::Git {
                command: "rev-parse --show-toplevel".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(PathBuf::from(root))
    }
}

impl VersionControl for GitCli {
    fn subtree_state(&self, path: &Path) -> Result<SubtreeState, ResolutionError> {
        let abs = paths::absolute(path).map_err(|source| ResolutionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = self.toplevel(&abs)?;
        let scope = scope_within(&root, &abs)?;
        debug!("git: scoping '{}' as '{}' in {}", abs.display(), scope.display(), root.display());

        let status = self.run(
            &root,
            [
                OsStr::new("status"),
                OsStr::new("--porcelain"),
                OsStr::new("--"),
                scope.as_os_str(),
            ],
        )?;
        if !status.status.success() {
            return Err(ResolutionError::Git {
                command: "status --porcelain".to_string(),
                stderr: String::from_utf8_lossy(&status.stderr).trim().to_string(),
            });
        }
        let clean = status.stdout.iter().all(u8::is_ascii_whitespace);

        let log = self.run(
            &root,
            [
                OsStr::new("log"),
                OsStr::new("-1"),
                OsStr::new("--format=%H"),
                OsStr::new("--"),
                scope.as_os_str(),
            ],
        )?;
        if !log.status.success() {
            let stderr = String::from_utf8_lossy(&log.stderr);
            // A fresh repository has no HEAD yet.
            if stderr.contains("does not have any commits") {
                return Ok(SubtreeState {
                    change_id: None,
                    clean,
                });
            }
            return Err(ResolutionError::Git {
                command: "log -1".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let change = String::from_utf8_lossy(&log.stdout).trim().to_string();
        Ok(SubtreeState {
            change_id: (!change.is_empty()).then_some(change),
            clean,
        })
    }
}

/// Expresses `abs` relative to the worktree `root`, as a pathspec.
///
/// Symlinked worktrees can report a root that is not a lexical prefix of
/// `abs`; both sides are canonicalized before giving up.
fn scope_within(root: &Path, abs: &Path) -> Result<PathBuf, ResolutionError> {
    let relative = match abs.strip_prefix(root) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => {
            let canonical_root = root.canonicalize().ok();
            let canonical_abs = abs.canonicalize().ok();
            match (canonical_root, canonical_abs) {
                (Some(r), Some(a)) => a
                    .strip_prefix(&r)
                    .map(Path::to_path_buf)
                    .map_err(|_| ResolutionError::UnscopedPath {
                        path: abs.to_path_buf(),
                        root: root.to_path_buf(),
                    })?,
                _ => {
                    return Err(ResolutionError::UnscopedPath {
                        path: abs.to_path_buf(),
                        root: root.to_path_buf(),
                    })
                }
            }
        }
    };

    if relative.as_os_str().is_empty() {
        Ok(PathBuf::from("."))
    } else {
        Ok(relative)
    }
}
