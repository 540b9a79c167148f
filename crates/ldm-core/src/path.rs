//! Parameter paths
//!
//! Checkpoint keys are dot-separated segments. A segment is either an
//! identifier (`[A-Za-z_][A-Za-z0-9_]*`) naming a child, or a decimal
//! integer indexing into a sequence:
//!
//! ```text
//! encoder.down.0.block.1.conv1.weight
//! └─name─┘└name┘│└name─┘│└name┘└name┘
//!               index   index
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Path parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Empty segment at position {position} in `{path}`")]
    EmptySegment { path: String, position: usize },

    #[error("Invalid segment `{segment}` in `{path}`")]
    InvalidSegment { path: String, segment: String },
}

/// One step of a parameter path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Named child (struct field, map key)
    Name(String),
    /// Position in an ordered sequence
    Index(usize),
}

impl Segment {
    /// Create a named segment
    pub fn named(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// The name, if this is a named segment
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Index(_) => None,
        }
    }

    /// The index, if this is an index segment
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Name(_) => None,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let mut chars = raw.chars();
        let first = chars.next()?;

        if first.is_ascii_digit() {
            if !raw.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            return raw.parse().ok().map(Self::Index);
        }

        if (first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Some(Self::Name(raw.to_string()));
        }

        None
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{}", index),
        }
    }
}

/// A parsed, non-empty parameter path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamPath {
    segments: Vec<Segment>,
}

impl ParamPath {
    /// Parse a dotted path
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }

        let segments = path
            .split('.')
            .enumerate()
            .map(|(position, raw)| {
                if raw.is_empty() {
                    return Err(PathError::EmptySegment {
                        path: path.to_string(),
                        position,
                    });
                }
                Segment::parse(raw).ok_or_else(|| PathError::InvalidSegment {
                    path: path.to_string(),
                    segment: raw.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    /// Build a path from segments; `None` if there are none
    pub fn from_segments(segments: Vec<Segment>) -> Option<Self> {
        if segments.is_empty() {
            None
        } else {
            Some(Self { segments })
        }
    }

    /// All segments, root first
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment (the leaf name)
    pub fn leaf(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    /// Path extended by one segment
    pub fn join(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl FromStr for ParamPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}
