use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::build_arg::{self, BuildArg, ParameterError};
use crate::constants::{DEFAULT_RECIPE, RECIPE_CONTRIBUTOR};
use crate::identity::{self, IdentityResolver, IdentityToken, ResolutionError};
use crate::paths;
use crate::recipe::{self, ParseError};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error("invalid build context '{}'", path.display())]
    Context {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read recipe '{}'", path.display())]
    RecipeRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("source '{declared}' not found: '{}' does not exist", path.display())]
    PathNotFound { declared: String, path: PathBuf },
    #[error("failed to inspect '{}'", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid pattern '{pattern}'")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to expand pattern '{pattern}'")]
    Glob {
        pattern: String,
        #[source]
        source: glob::GlobError,
    },
    #[error("unable to fingerprint '{name}'")]
    Resolution {
        name: String,
        #[source]
        source: ResolutionError,
    },
}

/// One named source line of the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    pub name: String,
    pub token: IdentityToken,
}

impl Contributor {
    pub fn fingerprint_line(&self) -> String {
        format!("{}@{}\n", self.name, self.token)
    }
}

/// The aggregate fingerprint of a build: recipe, sources and build parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    digest: String,
    contributors: Vec<Contributor>,
    build_args: Vec<BuildArg>,
}

impl Fingerprint {
    /// Folds the contributors and build parameters, in order, into one digest.
    pub fn from_parts(contributors: Vec<Contributor>, build_args: Vec<BuildArg>) -> Self {
        let mut hasher = Sha1::new();
        for contributor in &contributors {
            hasher.update(contributor.fingerprint_line().as_bytes());
        }
        for arg in &build_args {
            hasher.update(arg.fingerprint_line().as_bytes());
        }

        Self {
            digest: hex::encode(hasher.finalize()),
            contributors,
            build_args,
        }
    }

    /// Lowercase hex SHA-1, usable as an image tag.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The recipe first, then every resolved source in discovery order.
    pub fn contributors(&self) -> &[Contributor] {
        &self.contributors
    }

    pub fn build_args(&self) -> &[BuildArg] {
        &self.build_args
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Computes the fingerprint of the build described by `recipe` in `context_dir`.
///
/// Build arguments are resolved before anything is read or hashed. The recipe
/// defaults to `context_dir/Dockerfile`; its own line is always a content digest.
/// Every source it copies is resolved with `resolver`, and sources that do not
/// exist literally are expanded as glob patterns.
///
/// # Errors
/// Any failure aborts the whole computation; no partial fingerprint is produced.
#[instrument(skip(resolver, build_args))]
pub fn compute_fingerprint<S: AsRef<str>>(
    context_dir: &Path,
    recipe: Option<&Path>,
    build_args: &[S],
    resolver: &IdentityResolver,
) -> Result<Fingerprint, FingerprintError> {
    let build_args = build_arg::resolve_all(build_args)?;

    let context = paths::absolute(context_dir).map_err(|source| FingerprintError::Context {
        path: context_dir.to_path_buf(),
        source,
    })?;
    let recipe_path = match recipe {
        Some(path) => path.to_path_buf(),
        None => context.join(DEFAULT_RECIPE),
    };

    let recipe_bytes =
        std::fs::read(&recipe_path).map_err(|source| FingerprintError::RecipeRead {
            path: recipe_path.clone(),
            source,
        })?;
    let sources =
        recipe::extract_sources(&recipe_bytes).map_err(|source| FingerprintError::Parse {
            path: recipe_path.clone(),
            source,
        })?;
    debug!("recipe {} declares {} sources", recipe_path.display(), sources.len());

    let mut contributors = vec![Contributor {
        name: RECIPE_CONTRIBUTOR.to_string(),
        token: identity::digest_bytes(&recipe_bytes),
    }];

    for declared in &sources {
        for path in resolve_matches(&context, declared)? {
            let name = paths::contributor_name(&context, &path);
            let token = resolver
                .resolve(&path)
                .map_err(|source| FingerprintError::Resolution {
                    name: name.clone(),
                    source,
                })?;
            contributors.push(Contributor { name, token });
        }
    }

    let fingerprint = Fingerprint::from_parts(contributors, build_args);
    for contributor in fingerprint.contributors() {
        info!(target: "docker-reuse", "{}", contributor.fingerprint_line().trim_end());
    }
    for arg in fingerprint.build_args() {
        info!(target: "docker-reuse", "{}", arg);
    }

    Ok(fingerprint)
}

/// The filesystem paths a declared source stands for.
///
/// A path that exists is used as is. Otherwise the declaration is treated as a
/// glob pattern below the context; no match surfaces the not-found error.
fn resolve_matches(context: &Path, declared: &str) -> Result<Vec<PathBuf>, FingerprintError> {
    let path = paths::join_source(context, declared);

    match std::fs::metadata(&path) {
        Ok(_) => return Ok(vec![path]),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => return Err(FingerprintError::Stat { path, source }),
    }

    let not_found = || FingerprintError::PathNotFound {
        declared: declared.to_string(),
        path: path.clone(),
    };

    let relative = paths::context_relative(declared);
    let (Some(context_text), Some(relative_text)) = (context.to_str(), relative.to_str()) else {
        return Err(not_found());
    };
    let pattern = format!(
        "{}/{}",
        Pattern::escape(context_text).trim_end_matches('/'),
        relative_text
    );

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let entries =
        glob::glob_with(&pattern, options).map_err(|source| FingerprintError::Pattern {
            pattern: declared.to_string(),
            source,
        })?;

    let matches = entries
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| FingerprintError::Glob {
            pattern: declared.to_string(),
            source,
        })?;

    if matches.is_empty() {
        return Err(not_found());
    }
    debug!("pattern {} expanded to {} paths", declared, matches.len());

    Ok(matches.iter().map(|m| paths::clean(m)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Strategy;
    use std::fs;

    const RECIPE: &str = "FROM python:3\nCOPY app.py /app/\nCOPY lib/ /app/lib/\n";

    fn sha1_hex(bytes: &[u8]) -> String {
        hex::encode(Sha1::digest(bytes))
    }

    fn workspace(recipe: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), recipe).unwrap();
        fs::write(dir.path().join("app.py"), b"a").unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/util.py"), b"b").unwrap();
        dir
    }

    fn digest_of(dir: &Path, build_args: &[&str]) -> Result<Fingerprint, FingerprintError> {
        let resolver = IdentityResolver::new(Strategy::ContentDigest);
        compute_fingerprint(dir, None, build_args, &resolver)
    }

    #[test]
    fn directory_source_is_one_line_named_by_its_path() {
        let dir = workspace(RECIPE);
        let fp = digest_of(dir.path(), &[]).unwrap();

        let expected_stream = format!(
            "Dockerfile@content-digest:{}\napp.py@content-digest:{}\nlib@content-digest:{}\n",
            sha1_hex(RECIPE.as_bytes()),
            sha1_hex(b"a"),
            sha1_hex(b"b"),
        );
        assert_eq!(fp.digest(), sha1_hex(expected_stream.as_bytes()));
        assert_eq!(fp.digest().len(), 40);

        let names: Vec<&str> = fp.contributors().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dockerfile", "app.py", "lib"]);
    }

    #[test]
    fn parent_sources_resolve_inside_context() {
        let outer = tempfile::tempdir().unwrap();
        let context = outer.path().join("ctx");
        fs::create_dir_all(&context).unwrap();
        fs::write(outer.path().join("secret"), b"outside").unwrap();
        fs::write(context.join("secret"), b"inside").unwrap();
        fs::write(context.join("Dockerfile"), "FROM scratch\nCOPY ../secret /x\n").unwrap();

        let fp = digest_of(&context, &[]).unwrap();
        let names: Vec<&str> = fp.contributors().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dockerfile", "secret"]);
        assert_eq!(fp.contributors()[1].token, identity::digest_bytes(b"inside"));
    }

    #[test]
    fn parent_globs_resolve_inside_context() {
        let outer = tempfile::tempdir().unwrap();
        let context = outer.path().join("ctx");
        fs::create_dir_all(&context).unwrap();
        fs::write(outer.path().join("leak.txt"), b"outside").unwrap();
        fs::write(context.join("Dockerfile"), "FROM scratch\nCOPY ../*.txt /x/\n").unwrap();

        let err = digest_of(&context, &[]).expect_err("nothing inside the context matches");
        assert!(matches!(err, FingerprintError::PathNotFound { .. }));

        fs::write(context.join("keep.txt"), b"inside").unwrap();
        let fp = digest_of(&context, &[]).unwrap();
        assert_eq!(fp.contributors()[1].name, "keep.txt");
    }

    #[test]
    fn calculates_deterministic_hash() {
        let dir = workspace(RECIPE);

        let first = digest_of(dir.path(), &["A=1"]).unwrap();
        let second = digest_of(dir.path(), &["A=1"]).unwrap();
        assert_eq!(first, second);

        fs::write(dir.path().join("lib/util.py"), b"b2").unwrap();
        let mutated = digest_of(dir.path(), &["A=1"]).unwrap();
        assert_ne!(first.digest(), mutated.digest());
    }

    #[test]
    fn source_order_matters() {
        let forward = workspace("FROM scratch\nCOPY app.py lib /x/\n");
        let reverse = workspace("FROM scratch\nCOPY lib app.py /x/\n");

        let a = digest_of(forward.path(), &[]).unwrap();
        let b = digest_of(reverse.path(), &[]).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn line_order_matters_for_identical_recipes() {
        let one = Contributor {
            name: "a".to_string(),
            token: identity::digest_bytes(b"1"),
        };
        let two = Contributor {
            name: "b".to_string(),
            token: identity::digest_bytes(b"2"),
        };
        let forward = Fingerprint::from_parts(vec![one.clone(), two.clone()], Vec::new());
        let reverse = Fingerprint::from_parts(vec![two, one], Vec::new());
        assert_ne!(forward.digest(), reverse.digest());
    }

    #[test]
    fn build_args_are_folded_in_order() {
        let dir = workspace(RECIPE);
        let none = digest_of(dir.path(), &[]).unwrap();
        let ab = digest_of(dir.path(), &["A=1", "B=2"]).unwrap();
        let ba = digest_of(dir.path(), &["B=2", "A=1"]).unwrap();

        assert_ne!(none.digest(), ab.digest());
        assert_ne!(ab.digest(), ba.digest());
        assert_eq!(ab.build_args()[0].to_string(), "A=1");
    }

    #[test]
    fn missing_build_arg_fails_before_reading_anything() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest_of(
            &dir.path().join("no-such-context"),
            &["DOCKER_REUSE_TEST_SURELY_UNSET_VARIABLE"],
        )
        .expect_err("must fail");
        assert!(matches!(err, FingerprintError::Parameter(ParameterError::Missing { .. })));
    }

    #[test]
    fn expands_globs_when_literal_path_is_missing() {
        let dir = workspace("FROM scratch\nCOPY conf/*.yml /etc/app/\n");
        fs::create_dir_all(dir.path().join("conf")).unwrap();
        fs::write(dir.path().join("conf/b.yml"), b"b").unwrap();
        fs::write(dir.path().join("conf/a.yml"), b"a").unwrap();
        fs::write(dir.path().join("conf/skip.txt"), b"-").unwrap();

        let fp = digest_of(dir.path(), &[]).unwrap();
        let names: Vec<&str> = fp.contributors().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dockerfile", "conf/a.yml", "conf/b.yml"]);
    }

    #[test]
    fn literal_path_wins_over_pattern() {
        let dir = workspace("FROM scratch\nCOPY [ab].txt /x/\n");
        fs::write(dir.path().join("[ab].txt"), b"literal").unwrap();
        fs::write(dir.path().join("a.txt"), b"glob").unwrap();

        let fp = digest_of(dir.path(), &[]).unwrap();
        assert_eq!(fp.contributors().len(), 2);
        assert_eq!(fp.contributors()[1].name, "[ab].txt");
        assert_eq!(fp.contributors()[1].token, identity::digest_bytes(b"literal"));
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = workspace("FROM scratch\nCOPY absent.txt /x/\n");
        let err = digest_of(dir.path(), &[]).expect_err("must fail");
        assert!(matches!(err, FingerprintError::PathNotFound { ref declared, .. } if declared == "absent.txt"));
    }

    #[test]
    fn empty_glob_is_not_found() {
        let dir = workspace("FROM scratch\nCOPY *.none /x/\n");
        let err = digest_of(dir.path(), &[]).expect_err("must fail");
        assert!(matches!(err, FingerprintError::PathNotFound { .. }));
    }

    #[test]
    fn declared_paths_are_normalized() {
        let dir = workspace("FROM scratch\nCOPY ./app.py /x/\nCOPY /lib/../app.py /y/\n");
        let fp = digest_of(dir.path(), &[]).unwrap();
        let names: Vec<&str> = fp.contributors().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Dockerfile", "app.py", "app.py"]);
    }

    #[test]
    fn whole_context_copy_is_named_dot() {
        let dir = workspace("FROM scratch\nCOPY . /src/\n");
        let fp = digest_of(dir.path(), &[]).unwrap();
        assert_eq!(fp.contributors()[1].name, ".");
    }

    #[test]
    fn explicit_recipe_keeps_dockerfile_line_name() {
        let dir = workspace(RECIPE);
        let custom = dir.path().join("build.Dockerfile");
        fs::write(&custom, "FROM scratch\nCOPY app.py /\n").unwrap();

        let resolver = IdentityResolver::new(Strategy::ContentDigest);
        let fp = compute_fingerprint(dir.path(), Some(&custom), &[] as &[&str], &resolver).unwrap();
        assert_eq!(fp.contributors()[0].name, "Dockerfile");
        assert_eq!(fp.contributors().len(), 2);
    }

    #[test]
    fn relative_and_absolute_contexts_agree() {
        let dir = workspace(RECIPE);
        let absolute = digest_of(dir.path(), &[]).unwrap();
        let dotted = digest_of(&dir.path().join("lib/.."), &[]).unwrap();
        assert_eq!(absolute, dotted);
    }

    #[test]
    fn missing_recipe_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest_of(dir.path(), &[]).expect_err("must fail");
        assert!(matches!(err, FingerprintError::RecipeRead { .. }));
    }

    #[test]
    fn malformed_recipe_is_a_parse_error() {
        let dir = workspace("FROM scratch\nCOPY only-one\n");
        let err = digest_of(dir.path(), &[]).expect_err("must fail");
        assert!(matches!(err, FingerprintError::Parse { .. }));
    }
}
