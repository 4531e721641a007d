//! Core logic for docker-reuse.
//!
//! This crate computes the content fingerprint of a container build (recipe,
//! copied sources and build arguments), resolves per-source identities through
//! git or content hashing, and rewrites image references in template files.

pub mod build_arg;
pub mod config;
pub mod constants;
pub mod fingerprint;
pub mod identity;
pub mod paths;
pub mod recipe;
pub mod template;
pub mod vcs;

pub use build_arg::{BuildArg, ParameterError};
pub use config::{ConfigError, ReuseConfig};
pub use fingerprint::{compute_fingerprint, Contributor, Fingerprint, FingerprintError};
pub use identity::{IdentityResolver, IdentityToken, Method, ResolutionError, Strategy};
pub use recipe::{extract_sources, ParseError};
pub use template::{apply_tag, Placeholder, Template, TemplateError};
pub use vcs::{GitCli, SubtreeState, VersionControl};
