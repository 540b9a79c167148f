//! Name-path weight binding
//!
//! One pass over a [`Checkpoint`] in stored order. Each entry ends in one of
//! three states:
//!
//! - **bound**: the key resolved to a leaf of equal shape and the tensor was
//!   assigned
//! - **skipped**: the key did not resolve; recorded and ignored
//! - **fatal**: malformed key or shape mismatch; the pass stops and nothing
//!   after the offending entry is touched

use candle_core::Shape;
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, Entry};
use crate::path::{ParamPath, PathError};
use crate::resolve::{resolve, ResolveError};
use crate::tree::Composite;

/// Fatal binding errors
#[derive(Debug, Error)]
pub enum BindError {
    #[error("Malformed checkpoint key `{key}`: {source}")]
    MalformedPath {
        key: String,
        #[source]
        source: PathError,
    },

    #[error("Shape mismatch for `{key}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("Checkpoint key `{key}` has no destination: {source}")]
    Unbound {
        key: String,
        #[source]
        source: ResolveError,
    },

    #[error("Failed to assign `{key}`: {source}")]
    Assign {
        key: String,
        #[source]
        source: candle_core::Error,
    },
}

impl BindError {
    /// The checkpoint key that caused the failure
    pub fn key(&self) -> &str {
        match self {
            Self::MalformedPath { key, .. }
            | Self::ShapeMismatch { key, .. }
            | Self::Unbound { key, .. }
            | Self::Assign { key, .. } => key,
        }
    }
}

/// A fatal error together with everything processed before it
#[derive(Debug, Error)]
#[error("Bind pass aborted after {} bound, {} skipped: {error}", .report.bound(), .report.skipped())]
pub struct BindFailure {
    #[source]
    pub error: BindError,
    pub report: BindReport,
}

/// Outcome of one checkpoint entry
#[derive(Debug, Clone, PartialEq)]
pub struct BindRecord {
    /// Checkpoint key, as stored
    pub key: String,
    /// Whether the key resolved to a leaf of matching shape
    pub matched: bool,
    /// Shape of the destination leaf, when one was found
    pub destination: Option<Shape>,
    /// Whether tensor data was written (header-only entries are not)
    pub assigned: bool,
}

impl BindRecord {
    fn bound(key: &str, destination: Shape, assigned: bool) -> Self {
        Self {
            key: key.to_string(),
            matched: true,
            destination: Some(destination),
            assigned,
        }
    }

    fn skipped(key: &str) -> Self {
        Self {
            key: key.to_string(),
            matched: false,
            destination: None,
            assigned: false,
        }
    }
}

/// Per-key results of a bind pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindReport {
    records: Vec<BindRecord>,
}

impl BindReport {
    /// All records in checkpoint order
    pub fn records(&self) -> &[BindRecord] {
        &self.records
    }

    /// Number of entries that matched a leaf
    pub fn bound(&self) -> usize {
        self.records.iter().filter(|r| r.matched).count()
    }

    /// Number of entries with no destination
    pub fn skipped(&self) -> usize {
        self.records.len() - self.bound()
    }

    /// Number of entries whose data was written
    pub fn assigned(&self) -> usize {
        self.records.iter().filter(|r| r.assigned).count()
    }

    /// Keys that had no destination
    pub fn skipped_keys(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| !r.matched)
            .map(|r| r.key.as_str())
    }

    fn push(&mut self, record: BindRecord) {
        debug!(
            matched = record.matched,
            shape = ?record.destination,
            key = %record.key,
            "bind"
        );
        self.records.push(record);
    }
}

/// Configurable weight binder
#[derive(Debug, Clone, Default)]
pub struct Binder {
    /// Key prefix stripped before resolution
    prefix: Option<String>,
    /// Treat unresolvable keys as fatal
    strict: bool,
}

impl Binder {
    /// Create a lenient binder with no prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Only bind keys starting with `prefix`, resolved with the prefix removed.
    ///
    /// Keys without the prefix are skipped.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Fail on the first key that does not resolve
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bind every checkpoint entry onto `root`
    pub fn bind(
        &self,
        root: &mut dyn Composite,
        checkpoint: &Checkpoint,
    ) -> Result<BindReport, BindFailure> {
        let mut report = BindReport::default();

        for entry in checkpoint.iter() {
            match self.bind_entry(root, entry) {
                Ok(record) => report.push(record),
                Err(error) => return Err(BindFailure { error, report }),
            }
        }

        info!(
            bound = report.bound(),
            skipped = report.skipped(),
            assigned = report.assigned(),
            "Bind pass completed"
        );

        Ok(report)
    }

    fn bind_entry(&self, root: &mut dyn Composite, entry: &Entry) -> Result<BindRecord, BindError> {
        let key = entry.key();

        let local = match &self.prefix {
            Some(prefix) => match key.strip_prefix(prefix.as_str()) {
                Some(rest) => rest,
                None => return Ok(BindRecord::skipped(key)),
            },
            None => key,
        };

        let path = ParamPath::parse(local).map_err(|source| BindError::MalformedPath {
            key: key.to_string(),
            source,
        })?;

        let param = match resolve(root, &path) {
            Ok(param) => param,
            Err(source) if self.strict => {
                return Err(BindError::Unbound {
                    key: key.to_string(),
                    source,
                })
            }
            Err(_) => return Ok(BindRecord::skipped(key)),
        };

        if param.shape() != entry.shape() {
            return Err(BindError::ShapeMismatch {
                key: key.to_string(),
                expected: param.shape().clone(),
                actual: entry.shape().clone(),
            });
        }

        let assigned = match entry.tensor() {
            Some(tensor) => {
                param.assign(tensor).map_err(|source| BindError::Assign {
                    key: key.to_string(),
                    source,
                })?;
                true
            }
            None => false,
        };

        Ok(BindRecord::bound(key, param.shape().clone(), assigned))
    }
}

/// Bind with the default lenient binder
pub fn bind(root: &mut dyn Composite, checkpoint: &Checkpoint) -> Result<BindReport, BindFailure> {
    Binder::new().bind(root, checkpoint)
}
