//! Slash-delimited location identifiers
//!
//! A [`Path`] is stored in normalized form: segments joined by a single `/`
//! with no leading or trailing separator. The root is the empty string.
//! Equality and ordering are those of the normalized string.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Segment separator
pub const SEPARATOR: char = '/';

/// Immutable, normalized location in the database tree
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    path: String,
}

impl Path {
    /// Build a path, dropping empty segments.
    pub fn new(path: impl AsRef<str>) -> Self {
        let mut normalized = String::with_capacity(path.as_ref().len());
        for segment in path.as_ref().split(SEPARATOR).filter(|s| !s.is_empty()) {
            if !normalized.is_empty() {
                normalized.push(SEPARATOR);
            }
            normalized.push_str(segment);
        }
        Path { path: normalized }
    }

    /// Build a path from individual segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = Path::root();
        for segment in segments {
            result = result.child(segment.as_ref());
        }
        result
    }

    /// The empty path.
    pub fn root() -> Self {
        Path::default()
    }

    /// Normalized string form.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// True for the root path.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Iterate over segments from the root down.
    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.path.split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Segments as owned strings.
    pub fn directories(&self) -> Vec<String> {
        self.segments().map(str::to_string).collect()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments().count()
    }

    /// Append a child. `key` may itself contain separators.
    pub fn child(&self, key: impl AsRef<str>) -> Path {
        let key = key.as_ref();
        if self.is_empty() {
            return Path::new(key);
        }
        let suffix = Path::new(key);
        if suffix.is_empty() {
            return self.clone();
        }
        Path {
            path: format!("{}{}{}", self.path, SEPARATOR, suffix.path),
        }
    }

    /// Append another path.
    pub fn child_path(&self, other: &Path) -> Path {
        self.child(other.as_str())
    }

    /// Parent path. The root is its own parent.
    pub fn parent(&self) -> Path {
        match self.path.rfind(SEPARATOR) {
            Some(idx) => Path {
                path: self.path[..idx].to_string(),
            },
            None => Path::root(),
        }
    }

    /// Last segment, or `""` for the root.
    pub fn base_name(&self) -> &str {
        match self.path.rfind(SEPARATOR) {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }

    /// First segment, if any.
    pub fn front_directory(&self) -> Option<&str> {
        self.segments().next()
    }

    /// Path without its first segment.
    pub fn pop_front_directory(&self) -> Path {
        match self.path.find(SEPARATOR) {
            Some(idx) => Path {
                path: self.path[idx + 1..].to_string(),
            },
            None => Path::root(),
        }
    }

    /// True if `self` is `other` or one of its ancestors, comparing by
    /// whole segments.
    pub fn is_parent(&self, other: &Path) -> bool {
        if self.is_empty() {
            return true;
        }
        match other.path.strip_prefix(self.path.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    /// Remainder of `to` below `from`, or `None` when `from` is not a
    /// segment-prefix of `to`.
    pub fn relative(from: &Path, to: &Path) -> Option<Path> {
        if !from.is_parent(to) {
            return None;
        }
        if from.is_empty() {
            return Some(to.clone());
        }
        let rest = &to.path[from.path.len()..];
        Some(Path {
            path: rest.trim_start_matches(SEPARATOR).to_string(),
        })
    }

    /// Every ancestor from the root down to, but excluding, `self`.
    pub fn ancestors(&self) -> Vec<Path> {
        let mut result = Vec::new();
        let mut current = Path::root();
        for segment in self.segments() {
            result.push(current.clone());
            current = current.child(segment);
        }
        result
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::new(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path::new(s)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Path::new(raw))
    }
}
