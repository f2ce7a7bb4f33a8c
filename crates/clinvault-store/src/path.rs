//! Dot-separated document paths, e.g. `instruments.psqi.q1` or `imaging.series.0`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("path {0:?} has an empty segment")]
    EmptySegment(String),
}

/// A validated, non-empty sequence of non-empty segments.
///
/// Numeric segments address array elements when the parent is an array and
/// are plain object keys otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Build from pre-split segments. Segments may contain `.`; such a path
    /// displays ambiguously but resolves exactly.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment(segments.join(".")));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment (the domain sub-tree, e.g. `patient`).
    pub fn root(&self) -> &str {
        &self.segments[0]
    }
}

impl FromStr for KeyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        if s.split('.').any(str::is_empty) {
            return Err(PathError::EmptySegment(s.to_string()));
        }
        Ok(Self {
            segments: s.split('.').map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn display_parse_roundtrip(segments in prop::collection::vec("[a-zA-Z0-9_]{1,10}", 1..6)) {
            let path = KeyPath::from_segments(segments.clone()).unwrap();
            let reparsed: KeyPath = path.to_string().parse().unwrap();
            prop_assert_eq!(reparsed.segments(), segments.as_slice());
        }
    }
}
