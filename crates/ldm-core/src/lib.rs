//! LDM Core - Parameter trees and weight binding
//!
//! A model is a rooted tree of named nodes. Leaves are [`Param`]s (one
//! learnable tensor each); every other node is a [`Composite`] whose children
//! are addressed by name (struct fields) or by index (sequences).
//!
//! # Binding
//!
//! ```text
//! Checkpoint (ordered key → tensor)
//!        │  "encoder.down.0.block.1.conv1.weight"
//!        ▼
//!   ParamPath ──► resolve(root) ──► &mut Param ──► shape check ──► assign
//!                     │
//!                     └─ not found / wrong kind ──► skipped
//! ```
//!
//! Unresolvable keys are expected (a checkpoint may cover sub-trees that were
//! never assembled) and are recorded as skipped. A shape mismatch or a
//! malformed key aborts the pass.
//!
//! # Tensor library
//!
//! All tensor storage and numerics come from `candle-core`. This crate only
//! declares shapes, walks the tree and moves tensors into leaves.

pub mod binder;
pub mod checkpoint;
pub mod loader;
pub mod param;
pub mod path;
pub mod resolve;
pub mod tree;

// Re-export commonly used types
pub use binder::{bind, BindError, BindFailure, BindRecord, BindReport, Binder};
pub use checkpoint::{Checkpoint, Entry};
pub use loader::{CheckpointError, CheckpointFormat, CheckpointLoader, LoaderConfig};
pub use param::{Init, Param};
pub use path::{ParamPath, PathError, Segment};
pub use resolve::{resolve, NodeKind, ResolveError};
pub use tree::{
    materialize, parameter_count, parameters, unbound_parameters, Child, Composite, Node, NodeRef,
};
