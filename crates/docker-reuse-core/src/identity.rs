//! Per-source identity tokens and the strategies that produce them.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::vcs::{GitCli, VersionControl};

/// How a path's identity was established. Part of every token's serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    VersionControl,
    ContentDigest,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionControl => "version-control",
            Self::ContentDigest => "content-digest",
        }
    }
}

/// Strategy-qualified identity of one source path.
///
/// Two tokens with the same hex value but different methods are different
/// tokens, and render differently in the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken {
    method: Method,
    value: String,
}

impl IdentityToken {
    pub fn version_control(change_id: &str) -> Self {
        Self {
            method: Method::VersionControl,
            value: change_id.trim().to_ascii_lowercase(),
        }
    }

    pub fn content_digest(hasher: Sha1) -> Self {
        Self {
            method: Method::ContentDigest,
            value: hex::encode(hasher.finalize()),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for IdentityToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.method.as_str(), self.value)
    }
}

/// Identity strategy, chosen once from configuration.
///
/// Config files, flags and the environment all parse through [`FromStr`], so
/// they accept the same names and aliases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum Strategy {
    /// Version control first, content digest when that fails.
    #[default]
    Auto,
    VersionControl,
    ContentDigest,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::VersionControl => "version-control",
            Self::ContentDigest => "content-digest",
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown identity strategy '{0}' (expected auto, version-control or content-digest)")]
pub struct StrategyParseError(String);

impl FromStr for Strategy {
    type Err = StrategyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "version-control" | "commit" | "git" => Ok(Self::VersionControl),
            "content-digest" | "content" | "sha1" => Ok(Self::ContentDigest),
            _ => Err(StrategyParseError(value.to_string())),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = StrategyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("'{}' is not inside a git repository", path.display())]
    NotARepository { path: PathBuf },
    #[error("local modifications detected under '{}'", path.display())]
    LocalModifications { path: PathBuf },
    #[error("no commit history for '{}'", path.display())]
    NoHistory { path: PathBuf },
    #[error("cannot scope '{}' to repository root '{}'", path.display(), root.display())]
    UnscopedPath { path: PathBuf, root: PathBuf },
    #[error("failed to run git: {0}")]
    GitUnavailable(#[source] std::io::Error),
    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("failed to read '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk '{}'", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Resolves source paths to identity tokens with the configured strategy.
#[derive(Debug)]
pub struct IdentityResolver {
    strategy: Strategy,
    vcs: Box<dyn VersionControl>,
}

impl IdentityResolver {
    /// Creates a resolver backed by the `git` executable on `PATH`.
    pub fn new(strategy: Strategy) -> Self {
        Self::with_vcs(strategy, Box::new(GitCli::default()))
    }

    pub fn with_vcs(strategy: Strategy, vcs: Box<dyn VersionControl>) -> Self {
        Self { strategy, vcs }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the identity token for `path`.
    ///
    /// # Errors
    /// Version-control failures surface only under [`Strategy::VersionControl`];
    /// [`Strategy::Auto`] logs them and falls back to the content digest.
    #[instrument(skip(self), fields(strategy = %self.strategy))]
    pub fn resolve(&self, path: &Path) -> Result<IdentityToken, ResolutionError> {
        match self.strategy {
            Strategy::VersionControl => self.last_change(path),
            Strategy::ContentDigest => content_digest(path),
            Strategy::Auto => match self.last_change(path) {
                Ok(token) => Ok(token),
                Err(e) => {
                    warn!(
                        "unable to use git commit hash for '{}': {}; falling back to file content hashing",
                        path.display(),
                        e
                    );
                    content_digest(path)
                }
            },
        }
    }

    fn last_change(&self, path: &Path) -> Result<IdentityToken, ResolutionError> {
        let state = self.vcs.subtree_state(path)?;
        if !state.clean {
            return Err(ResolutionError::LocalModifications {
                path: path.to_path_buf(),
            });
        }
        let change_id = state.change_id.ok_or_else(|| ResolutionError::NoHistory {
            path: path.to_path_buf(),
        })?;
        Ok(IdentityToken::version_control(&change_id))
    }
}

/// Digests every regular file under `path` into one SHA-1, in lexical walk order.
///
/// Hidden directories below `path` are skipped, as are symlinks and other
/// non-regular entries. `path` itself may be a file, a directory or a symlink
/// to either.
pub fn content_digest(path: &Path) -> Result<IdentityToken, ResolutionError> {
    let mut hasher = Sha1::new();

    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden_dir(entry));

    for entry in walker {
        let entry = entry.map_err(|source| ResolutionError::Walk {
            path: path.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let mut file = File::open(entry.path()).map_err(|source| ResolutionError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        let bytes = std::io::copy(&mut file, &mut hasher).map_err(|source| ResolutionError::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        debug!("content digest: mixed {} ({} bytes)", entry.path().display(), bytes);
    }

    Ok(IdentityToken::content_digest(hasher))
}

/// Digests an in-memory buffer, used for the recipe itself.
pub fn digest_bytes(bytes: &[u8]) -> IdentityToken {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    IdentityToken::content_digest(hasher)
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_string_lossy().starts_with('.')
}
