use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::versioning::{VersionTuple, strip_version, try_extract_version};

/// File extensions users tend to paste along with package names.
pub const KNOWN_EXTENSIONS: [&str; 6] = [".var", ".json", ".txt", ".zip", ".rar", ".7z"];

const MARKUP_CHARS: &[char] = &['-', '*', '+', '•', '·', '>', '#', '|', '"', '\'', '`'];
const TRAILING_CHARS: &[char] = &['.', '"', '\'', '`'];
const SEPARATORS: &[char] = &[',', ';', '\t'];

// Creator.PackageName followed by one or more version segments
static PACKAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9][A-Za-z0-9_\-]*\.[A-Za-z0-9_\-\[\]\(\)& ]+?(?:\.(?:\d+|latest))+\b")
        .expect("package pattern is valid")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackageVersion {
    Unspecified,
    Latest,
    Exact(VersionTuple),
}

/// A package name split into `Creator.PackageName` and its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageIdentity {
    pub base_name: String,
    pub version: PackageVersion,
}

impl PackageIdentity {
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if let Some(base) = name
            .strip_suffix(".latest")
            .or_else(|| name.strip_suffix(".LATEST"))
        {
            return PackageIdentity {
                base_name: strip_version(base).to_string(),
                version: PackageVersion::Latest,
            };
        }
        let base_name = strip_version(name).to_string();
        let version = if base_name.len() == name.len() {
            PackageVersion::Unspecified
        } else {
            match try_extract_version(name) {
                Some(version) => PackageVersion::Exact(version),
                None => PackageVersion::Unspecified,
            }
        };
        PackageIdentity { base_name, version }
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self.version, PackageVersion::Exact(_))
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            PackageVersion::Unspecified => write!(f, "{}", self.base_name),
            PackageVersion::Latest => write!(f, "{}.latest", self.base_name),
            PackageVersion::Exact(version) => write!(f, "{}.{version}", self.base_name),
        }
    }
}

// Case-insensitive set that keeps the first spelling and insertion order
#[derive(Default)]
struct NameSet {
    seen: HashSet<String>,
    names: Vec<String>,
}

impl NameSet {
    fn insert(&mut self, name: &str) {
        if self.seen.insert(name.to_lowercase()) {
            self.names.push(name.to_string());
        }
    }
}

/// Turns pasted text into a deduplicated list of candidate package names.
///
/// Parsing is best-effort: anything that does not look like a package name
/// is dropped without an error. The output re-parses to itself when joined
/// with newlines.
pub fn parse(input: &str) -> Vec<String> {
    let mut names = NameSet::default();
    for line in input.lines() {
        let line = strip_markup(line);
        if line.is_empty() {
            continue;
        }
        if line.contains("://") {
            let token = line.split_whitespace().next().unwrap_or_default();
            let token = if token.contains("://") {
                url_tail(token)
            } else {
                token.to_string()
            };
            for part in token.split(SEPARATORS) {
                collect(part, &mut names);
            }
        } else {
            for part in line.split(SEPARATORS) {
                collect(part, &mut names);
            }
        }
    }
    names.names
}

fn strip_markup(text: &str) -> &str {
    text.trim()
        .trim_start_matches(|c: char| MARKUP_CHARS.contains(&c) || c.is_whitespace())
}

fn strip_extension(text: &str) -> &str {
    let lower = text.to_ascii_lowercase();
    for extension in KNOWN_EXTENSIONS {
        if lower.ends_with(extension) && text.len() > extension.len() {
            return &text[..text.len() - extension.len()];
        }
    }
    text
}

fn clean_candidate(candidate: &str) -> &str {
    let mut current = candidate;
    loop {
        let next = strip_markup(current)
            .trim_end_matches(|c: char| TRAILING_CHARS.contains(&c) || c.is_whitespace());
        let next = strip_extension(next)
            .trim_end_matches(|c: char| TRAILING_CHARS.contains(&c) || c.is_whitespace());
        if next == current {
            return next;
        }
        current = next;
    }
}

fn collect(candidate: &str, names: &mut NameSet) {
    let candidate = clean_candidate(candidate);
    if candidate.is_empty() {
        return;
    }
    let mut matched = false;
    for found in PACKAGE_PATTERN.find_iter(candidate) {
        names.insert(found.as_str());
        matched = true;
    }
    if !matched && candidate.contains('.') {
        names.insert(candidate);
    }
}

// Last path segment of a URL, percent-decoded
fn url_tail(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let decoded = match urlencoding::decode(segment) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => segment.to_string(),
    };
    // Decoded text must not carry a scheme or a line break
    if decoded.is_empty() || decoded.contains(':') || decoded.chars().any(char::is_control) {
        return String::new();
    }
    decoded
}
