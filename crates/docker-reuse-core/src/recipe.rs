//! Dockerfile tokenizer and build-context source extraction.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

/// One logical recipe instruction, after line continuations are joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Lowercased instruction keyword, e.g. `copy`.
    pub verb: String,
    /// Leading `--name[=value]` flags. Only parsed for `copy` and `add`.
    pub flags: Vec<String>,
    pub args: Vec<String>,
    /// 1-based line the instruction starts on.
    pub line: usize,
}

impl Instruction {
    /// True for `copy`/`add` instructions that read from the build context
    /// rather than from another stage.
    pub fn copies_from_context(&self) -> bool {
        matches!(self.verb.as_str(), "copy" | "add")
            && !self.flags.iter().any(|flag| flag.starts_with("--from"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("recipe is not valid UTF-8")]
    InvalidUtf8,
    #[error("file with no instructions")]
    Empty,
    #[error("line {line}: expected an instruction, found '{text}'")]
    MissingVerb { line: usize, text: String },
    #[error("line {line}: {verb} requires at least two arguments")]
    MissingArguments { line: usize, verb: String },
    #[error("line {line}: unterminated heredoc '{marker}'")]
    UnterminatedHeredoc { line: usize, marker: String },
    #[error("invalid escape token '{0}': must be a backslash or a backtick")]
    InvalidEscape(String),
}

/// Returns the local paths copied into the build context, in first-seen order.
///
/// Cross-stage copies (`--from=...`) are skipped entirely and the last argument of
/// every instruction is its destination, never a source. Remote `ADD` sources and
/// heredocs are not local paths and are left out.
pub fn extract_sources(recipe: &[u8]) -> Result<Vec<String>, ParseError> {
    let instructions = parse(recipe)?;

    let mut seen = HashSet::new();
    let mut sources = Vec::new();

    for instruction in instructions.iter().filter(|i| i.copies_from_context()) {
        let Some((_destination, candidates)) = instruction.args.split_last() else {
            continue;
        };

        for source in candidates {
            if heredoc_marker(source).is_some() {
                continue;
            }
            if is_remote(source) {
                debug!("recipe line {}: skipping remote source {}", instruction.line, source);
                continue;
            }
            if seen.insert(source.as_str()) {
                sources.push(source.clone());
            }
        }
    }

    Ok(sources)
}

/// Tokenizes a recipe into its instructions.
pub fn parse(recipe: &[u8]) -> Result<Vec<Instruction>, ParseError> {
    let text = std::str::from_utf8(recipe).map_err(|_| ParseError::InvalidUtf8)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));
    let mut escape = '\\';
    let mut reading_directives = true;
    let mut instructions = Vec::new();

    while let Some((number, raw)) = lines.next() {
        let trimmed = raw.trim();

        if reading_directives {
            if let Some((key, value)) = parse_directive(trimmed) {
                if key == "escape" {
                    escape = parse_escape(&value)?;
                }
                continue;
            }
            reading_directives = false;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut logical = String::new();
        let mut current = raw;
        loop {
            match strip_continuation(current, escape) {
                Some(head) => {
                    logical.push_str(head);
                    match next_content_line(&mut lines) {
                        Some(next) => current = next,
                        None => break,
                    }
                }
                None => {
                    logical.push_str(current);
                    break;
                }
            }
        }

        let instruction = tokenize(number, &logical)?;

        if matches!(instruction.verb.as_str(), "copy" | "add" | "run") {
            for marker in instruction.args.iter().filter_map(|a| heredoc_marker(a)) {
                skip_heredoc_body(&mut lines, number, &marker)?;
            }
        }

        instructions.push(instruction);
    }

    if instructions.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(instructions)
}

fn tokenize(line: usize, logical: &str) -> Result<Instruction, ParseError> {
    let body = logical.trim();
    let (verb, rest) = match body.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim_start()),
        None => (body, ""),
    };

    if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ParseError::MissingVerb {
            line,
            text: body.to_string(),
        });
    }

    let verb = verb.to_ascii_lowercase();
    if !matches!(verb.as_str(), "copy" | "add") {
        return Ok(Instruction {
            verb,
            flags: Vec::new(),
            args: split_arguments(rest),
            line,
        });
    }

    let (flags, rest) = split_flags(rest);
    let args = split_arguments(rest);
    if args.len() < 2 {
        return Err(ParseError::MissingArguments {
            line,
            verb: verb.to_ascii_uppercase(),
        });
    }

    Ok(Instruction {
        verb,
        flags,
        args,
        line,
    })
}

/// Peels `--flag` words off the front of `rest`. A bare `--` ends the flags.
fn split_flags(mut rest: &str) -> (Vec<String>, &str) {
    let mut flags = Vec::new();
    while rest.starts_with("--") {
        let (word, tail) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));
        rest = tail.trim_start();
        if word == "--" {
            break;
        }
        flags.push(word.to_string());
    }
    (flags, rest)
}

/// Exec form (JSON array) when it parses as one, shell form otherwise.
fn split_arguments(rest: &str) -> Vec<String> {
    if rest.starts_with('[') {
        if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
            return args;
        }
    }
    rest.split_whitespace().map(ToOwned::to_owned).collect()
}

fn parse_directive(line: &str) -> Option<(String, String)> {
    let body = line.strip_prefix('#')?;
    let (key, value) = body.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim().to_string()))
}

fn parse_escape(value: &str) -> Result<char, ParseError> {
    match value {
        "\\" => Ok('\\'),
        "`" => Ok('`'),
        other => Err(ParseError::InvalidEscape(other.to_string())),
    }
}

fn strip_continuation(line: &str, escape: char) -> Option<&str> {
    line.trim_end().strip_suffix(escape)
}

/// Next line of a continuation. Blank and comment lines inside it are dropped.
fn next_content_line<'a, I>(lines: &mut I) -> Option<&'a str>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    for (_, line) in lines.by_ref() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        return Some(line);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeredocMarker {
    name: String,
    strip_tabs: bool,
}

fn heredoc_marker(token: &str) -> Option<HeredocMarker> {
    let rest = token.strip_prefix("<<")?;
    let (strip_tabs, rest) = match rest.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let name = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .unwrap_or(rest);

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some(HeredocMarker {
        name: name.to_string(),
        strip_tabs,
    })
}

fn skip_heredoc_body<'a, I>(
    lines: &mut I,
    line: usize,
    marker: &HeredocMarker,
) -> Result<(), ParseError>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    for (_, body) in lines.by_ref() {
        let candidate = if marker.strip_tabs {
            body.trim_start_matches('\t')
        } else {
            body
        };
        if candidate == marker.name {
            return Ok(());
        }
    }
    Err(ParseError::UnterminatedHeredoc {
        line,
        marker: marker.name.clone(),
    })
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://") || source.starts_with("git@")
}
