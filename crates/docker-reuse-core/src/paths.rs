//! Lexical path normalization shared by the aggregator and the resolvers.

use std::path::{Component, Path, PathBuf};

/// Cleans `.` and `..` components without touching the filesystem.
///
/// `..` directly below the root is dropped; leading `..` of a relative path
/// are kept. An empty result becomes `.`.
pub fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }

    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Cleans a declared recipe source as if the context were the filesystem root.
///
/// A leading `/` is dropped and `..` never climbs above the context, so the
/// result is always `.` or a path below it.
pub fn context_relative(declared: &str) -> PathBuf {
    let rooted = clean(&Path::new("/").join(declared.trim_start_matches('/')));
    match rooted.strip_prefix("/") {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Interprets a declared recipe source relative to the build context.
pub fn join_source(context: &Path, declared: &str) -> PathBuf {
    clean(&context.join(context_relative(declared)))
}

/// Returns `path` relative to `context` with `/` separators, the form used as a
/// fingerprint line name. Paths outside the context keep their cleaned form.
pub fn contributor_name(context: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(context).unwrap_or(path);
    let parts: Vec<String> = clean(relative)
        .components()
        .map(|c| match c {
            Component::RootDir => String::new(),
            other => other.as_os_str().to_string_lossy().into_owned(),
        })
        .collect();
    parts.join("/")
}

/// Makes `path` absolute against the current directory, then cleans it.
pub fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean(path));
    }
    Ok(clean(&std::env::current_dir()?.join(path)))
}
