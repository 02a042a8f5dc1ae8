use std::cmp::Ordering;
use std::fmt;

/// Dot-separated numeric version taken from the tail of a package name.
///
/// Comparison pads the shorter tuple with zeros, so `12.0 == 12`.
#[derive(Debug, Clone, Default)]
pub struct VersionTuple(Vec<u64>);

impl VersionTuple {
    pub fn new(parts: Vec<u64>) -> Self {
        VersionTuple(parts)
    }

    pub fn zero() -> Self {
        VersionTuple(Vec::new())
    }

    pub fn parts(&self) -> &[u64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|part| *part == 0)
    }
}

impl PartialEq for VersionTuple {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionTuple {}

impl PartialOrd for VersionTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialEq<u64> for VersionTuple {
    fn eq(&self, other: &u64) -> bool {
        *self == VersionTuple(vec![*other])
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "0");
        }
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

// Trailing run of numeric segments, in reading order. Returns None when a
// numeric segment overflows u64.
fn trailing_numeric(full_name: &str) -> Option<(usize, Vec<u64>)> {
    let segments: Vec<&str> = full_name.split('.').collect();
    let numeric = segments
        .iter()
        .rev()
        .take_while(|segment| is_numeric(segment))
        .count();
    // A bare number is a name, not a version
    let numeric = numeric.min(segments.len().saturating_sub(1));
    let start = segments.len() - numeric;
    let mut parts = Vec::with_capacity(numeric);
    for segment in &segments[start..] {
        parts.push(segment.parse::<u64>().ok()?);
    }
    Some((start, parts))
}

/// Extracts the version from a full package name such as `Creator.Pack.14`.
///
/// The maximal run of purely numeric trailing dot-segments is the version;
/// a name without one yields the zero tuple.
pub fn extract_version(full_name: &str) -> VersionTuple {
    try_extract_version(full_name).unwrap_or_default()
}

/// Like [`extract_version`], but reports numeric segments that do not fit
/// in 64 bits as `None` instead of falling back to zero.
pub fn try_extract_version(full_name: &str) -> Option<VersionTuple> {
    trailing_numeric(full_name.trim()).map(|(_, parts)| VersionTuple(parts))
}

/// Removes the trailing numeric run, leaving `Creator.PackageName`.
pub fn strip_version(full_name: &str) -> &str {
    let full_name = full_name.trim();
    let numeric = full_name
        .rsplit('.')
        .take_while(|segment| is_numeric(segment))
        .count();
    let segments = full_name.split('.').count();
    let numeric = numeric.min(segments.saturating_sub(1));
    let mut end = full_name.len();
    for _ in 0..numeric {
        end = full_name[..end].rfind('.').unwrap_or(0);
    }
    &full_name[..end]
}

/// Component-wise comparison with right zero-padding.
pub fn compare(a: &VersionTuple, b: &VersionTuple) -> Ordering {
    let len = a.0.len().max(b.0.len());
    for i in 0..len {
        let left = a.0.get(i).copied().unwrap_or(0);
        let right = b.0.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True when `remote_name` carries a strictly higher version than
/// `local_name`. Any unparsable version means "no update".
pub fn is_newer(remote_name: &str, local_name: &str) -> bool {
    match (
        try_extract_version(remote_name),
        try_extract_version(local_name),
    ) {
        (Some(remote), Some(local)) => compare(&remote, &local) == Ordering::Greater,
        _ => false,
    }
}
