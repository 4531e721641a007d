//! Placeholder validation and tag substitution in a template file.

use std::path::{Path, PathBuf};

use regex::bytes::{NoExpand, Regex};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write template '{}'", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{}' does not contain '{placeholder}'", path.display())]
    MissingPlaceholder { path: PathBuf, placeholder: String },
    #[error("'{}' does not contain references to '{image}'", path.display())]
    NoReferences { path: PathBuf, image: String },
    #[error("'{}' contains inconsistent references to '{image}'", path.display())]
    InconsistentReferences { path: PathBuf, image: String },
    #[error("invalid placeholder '{placeholder}'")]
    InvalidPlaceholder {
        placeholder: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid image name '{image}'")]
    InvalidImage {
        image: String,
        #[source]
        source: regex::Error,
    },
}

/// The exact bytes in a template that stand for the image reference.
#[derive(Debug, Clone)]
pub struct Placeholder {
    bytes: Vec<u8>,
    literal: Regex,
}

impl Placeholder {
    fn new(bytes: &[u8]) -> Result<Self, TemplateError> {
        let text = String::from_utf8_lossy(bytes);
        let literal = Regex::new(&regex::escape(&text)).map_err(|source| {
            TemplateError::InvalidPlaceholder {
                placeholder: text.to_string(),
                source,
            }
        })?;
        Ok(Self {
            bytes: bytes.to_vec(),
            literal,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for Placeholder {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Placeholder {}

impl std::fmt::Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

/// A template file held in memory until the new tag is written back.
#[derive(Debug, Clone)]
pub struct Template {
    path: PathBuf,
    contents: Vec<u8>,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let contents = std::fs::read(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(path, contents))
    }

    pub fn from_bytes(path: &Path, contents: Vec<u8>) -> Self {
        Self {
            path: path.to_path_buf(),
            contents,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Finds the placeholder to replace.
    ///
    /// An explicit placeholder must occur verbatim. Otherwise every reference to
    /// `image`, with or without a tag, must be byte-identical, and the first one is
    /// the placeholder.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn locate(&self, explicit: Option<&str>, image: &str) -> Result<Placeholder, TemplateError> {
        if let Some(explicit) = explicit {
            let missing = || TemplateError::MissingPlaceholder {
                path: self.path.clone(),
                placeholder: explicit.to_string(),
            };
            if explicit.is_empty() {
                return Err(missing());
            }
            let placeholder = Placeholder::new(explicit.as_bytes())?;
            if !placeholder.literal.is_match(&self.contents) {
                return Err(missing());
            }
            return Ok(placeholder);
        }

        let pattern = image_reference_pattern(image)?;
        let mut references = pattern.find_iter(&self.contents).map(|m| m.as_bytes());

        let first = references.next().ok_or_else(|| TemplateError::NoReferences {
            path: self.path.clone(),
            image: image.to_string(),
        })?;

        if references.any(|other| other != first) {
            return Err(TemplateError::InconsistentReferences {
                path: self.path.clone(),
                image: image.to_string(),
            });
        }

        debug!("located placeholder {}", String::from_utf8_lossy(first));
        Placeholder::new(first)
    }

    /// Replaces the placeholder with `tagged_image` and writes the file back.
    ///
    /// Returns `false` without touching the file when nothing would change.
    pub fn write_tag(&mut self, placeholder: &Placeholder, tagged_image: &str) -> Result<bool, TemplateError> {
        let (updated, changed) = apply_tag(&self.contents, placeholder, tagged_image);
        if !changed {
            return Ok(false);
        }

        std::fs::write(&self.path, &updated).map_err(|source| TemplateError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.contents = updated;
        Ok(true)
    }
}

/// Substitutes every occurrence of `placeholder` with `tagged_image`.
///
/// When the placeholder already is `tagged_image` the input comes back
/// unchanged with `changed == false`.
pub fn apply_tag(contents: &[u8], placeholder: &Placeholder, tagged_image: &str) -> (Vec<u8>, bool) {
    let replacement = tagged_image.as_bytes();
    if placeholder.as_bytes() == replacement || placeholder.as_bytes().is_empty() {
        return (contents.to_vec(), false);
    }

    let out = placeholder
        .literal
        .replace_all(contents, NoExpand(replacement))
        .into_owned();
    let changed = out != contents;
    (out, changed)
}

/// `image` optionally followed by `:tag`, where a tag is letters, digits, `.`, `_` or `-`.
fn image_reference_pattern(image: &str) -> Result<Regex, TemplateError> {
    Regex::new(&format!("{}(?::[-.A-Za-z0-9_]+)?", regex::escape(image))).map_err(|source| {
        TemplateError::InvalidImage {
            image: image.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(text: &str) -> Template {
        Template::from_bytes(Path::new("deploy.yaml"), text.as_bytes().to_vec())
    }

    #[test]
    fn locates_consistent_references() {
        let t = template("image: registry/app:v1\n---\nimage: registry/app:v1\n");
        let placeholder = t.locate(None, "registry/app").unwrap();
        assert_eq!(placeholder.as_bytes(), b"registry/app:v1");
    }

    #[test]
    fn untagged_reference_is_a_placeholder() {
        let t = template("image: myimage\n");
        let placeholder = t.locate(None, "myimage").unwrap();
        assert_eq!(placeholder.to_string(), "myimage");
    }

    #[test]
    fn rejects_inconsistent_references() {
        let t = template("a: myimage:v1\nb: myimage:v2\n");
        let err = t.locate(None, "myimage").expect_err("must fail");
        assert!(matches!(err, TemplateError::InconsistentReferences { .. }));
        assert!(err.to_string().contains("deploy.yaml"));
    }

    #[test]
    fn tagged_and_untagged_references_are_inconsistent() {
        let t = template("a: myimage\nb: myimage:v1\n");
        assert!(t.locate(None, "myimage").is_err());
    }

    #[test]
    fn rejects_template_without_references() {
        let t = template("image: other\n");
        let err = t.locate(None, "myimage").expect_err("must fail");
        assert!(matches!(err, TemplateError::NoReferences { .. }));
    }

    #[test]
    fn image_name_is_matched_literally() {
        let t = template("image: registryXapp:v1\n");
        assert!(t.locate(None, "registry.app").is_err());
    }

    #[test]
    fn explicit_placeholder_must_be_present() {
        let t = template("image: __IMAGE__\n");
        assert_eq!(
            t.locate(Some("__IMAGE__"), "ignored").unwrap().as_bytes(),
            b"__IMAGE__"
        );

        let err = t.locate(Some("{{image}}"), "ignored").expect_err("must fail");
        assert!(matches!(err, TemplateError::MissingPlaceholder { .. }));
    }

    #[test]
    fn explicit_placeholder_skips_consistency_check() {
        let t = template("a: myimage:v1\nb: myimage:v2\n");
        let placeholder = t.locate(Some("myimage:v2"), "myimage").unwrap();
        let (out, changed) = apply_tag(t.contents(), &placeholder, "myimage:abc");
        assert!(changed);
        assert_eq!(out, b"a: myimage:v1\nb: myimage:abc\n");
    }

    #[test]
    fn replaces_every_occurrence() {
        let t = template("x: app:old y: app:old\n");
        let placeholder = t.locate(None, "app").unwrap();
        let (out, changed) = apply_tag(t.contents(), &placeholder, "app:new");
        assert!(changed);
        assert_eq!(out, b"x: app:new y: app:new\n");
    }

    #[test]
    fn applying_the_same_tag_twice_is_a_no_op() {
        let t = template("image: app:old\n");
        let placeholder = t.locate(None, "app").unwrap();
        let (once, _) = apply_tag(t.contents(), &placeholder, "app:new");

        let again = template(std::str::from_utf8(&once).unwrap());
        let placeholder = again.locate(None, "app").unwrap();
        let (twice, changed) = apply_tag(again.contents(), &placeholder, "app:new");
        assert!(!changed);
        assert_eq!(twice, once);
    }

    #[test]
    fn placeholder_metacharacters_are_literal() {
        let t = template("a: {{ .Image }}\nb: {{ xImage }}\nc: $1.*\n");
        let placeholder = t.locate(Some("{{ .Image }}"), "ignored").unwrap();
        let (out, changed) = apply_tag(t.contents(), &placeholder, "app:$1");
        assert!(changed);
        assert_eq!(out, b"a: app:$1\nb: {{ xImage }}\nc: $1.*\n");

        let err = t.locate(Some("Im.ge"), "ignored").expect_err("must fail");
        assert!(matches!(err, TemplateError::MissingPlaceholder { .. }));
    }

    #[test]
    fn replaces_occurrences_in_large_templates() {
        let mut text = "filler line without the image\n".repeat(20_000);
        text.push_str("image: app:old\n");
        text.push_str(&"more filler\n".repeat(20_000));
        text.push_str("image: app:old\n");
        let t = template(&text);

        let placeholder = t.locate(None, "app").unwrap();
        let (out, changed) = apply_tag(t.contents(), &placeholder, "app:new");
        assert!(changed);
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("image: app:new\n").count(), 2);
        assert!(!out.contains("app:old"));
    }

    #[test]
    fn write_tag_only_touches_file_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        std::fs::write(&path, b"image: app:old\n").unwrap();

        let mut t = Template::load(&path).unwrap();
        let placeholder = t.locate(None, "app").unwrap();
        assert!(t.write_tag(&placeholder, "app:new").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"image: app:new\n");

        std::fs::write(&path, b"image: app:new\n# sentinel\n").unwrap();
        let mut t = Template::load(&path).unwrap();
        let placeholder = t.locate(None, "app").unwrap();
        assert!(!t.write_tag(&placeholder, "app:new").unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"image: app:new\n# sentinel\n");
    }
}
