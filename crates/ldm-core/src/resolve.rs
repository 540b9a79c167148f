//! Path resolution
//!
//! Walks a [`ParamPath`] from the root composite down to a leaf. Pure lookup:
//! nothing in the tree is touched.

use std::fmt;
use thiserror::Error;

use crate::param::Param;
use crate::path::{ParamPath, Segment};
use crate::tree::{Composite, Node};

/// Kind of tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Composite,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf => f.write_str("leaf"),
            Self::Composite => f.write_str("composite"),
        }
    }
}

/// Resolution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("`{path}`: no child `{segment}` at segment {depth}")]
    NotFound {
        path: String,
        segment: Segment,
        depth: usize,
    },

    #[error("`{path}`: expected {expected} at `{segment}` (segment {depth}), found {found}")]
    WrongKind {
        path: String,
        segment: Segment,
        depth: usize,
        expected: NodeKind,
        found: NodeKind,
    },
}

/// Resolve `path` to the leaf it names.
///
/// Every segment but the last must land on a composite; the last must land
/// on a leaf.
pub fn resolve<'a>(
    root: &'a mut dyn Composite,
    path: &ParamPath,
) -> Result<&'a mut Param, ResolveError> {
    let last = path.len() - 1;
    let mut current = root;

    for (depth, segment) in path.segments().iter().enumerate() {
        let wrong_kind = |expected, found| ResolveError::WrongKind {
            path: path.to_string(),
            segment: segment.clone(),
            depth,
            expected,
            found,
        };

        match current.child_mut(segment) {
            None => {
                return Err(ResolveError::NotFound {
                    path: path.to_string(),
                    segment: segment.clone(),
                    depth,
                })
            }
            Some(Node::Leaf(param)) if depth == last => return Ok(param),
            Some(Node::Leaf(_)) => return Err(wrong_kind(NodeKind::Composite, NodeKind::Leaf)),
            Some(Node::Composite(_)) if depth == last => {
                return Err(wrong_kind(NodeKind::Leaf, NodeKind::Composite))
            }
            Some(Node::Composite(child)) => current = child,
        }
    }

    // `ParamPath` is never empty, so the loop always returns.
    Err(ResolveError::NotFound {
        path: path.to_string(),
        segment: path.leaf().clone(),
        depth: last,
    })
}
