//! Model trees
//!
//! Two node kinds: [`Param`] leaves and [`Composite`] nodes. Layer structs
//! become composites through the [`composite!`](crate::composite) macro, which
//! maps each listed field name to a child:
//!
//! ```rust,ignore
//! pub struct Conv2d { weight: Param, bias: Option<Param>, stride: usize }
//! ldm_core::composite!(Conv2d { weight, bias });
//! ```
//!
//! `Vec<T>` is the indexed composite, `Option<T>` an optional child.

use candle_core::{Device, Result};

use crate::param::{Init, Param};
use crate::path::{ParamPath, Segment};

/// Mutable view of a tree node
pub enum Node<'a> {
    Leaf(&'a mut Param),
    Composite(&'a mut dyn Composite),
}

/// Shared view of a tree node
pub enum NodeRef<'a> {
    Leaf(&'a Param),
    Composite(&'a dyn Composite),
}

/// A node with named or indexed children
pub trait Composite {
    /// The child addressed by `segment`, if present
    fn child_mut(&mut self, segment: &Segment) -> Option<Node<'_>>;

    /// All present children, in declaration order
    fn children(&self) -> Vec<(Segment, NodeRef<'_>)>;
}

/// Anything that can sit in a composite's child slot
pub trait Child {
    fn as_node_mut(&mut self) -> Option<Node<'_>>;
    fn as_node(&self) -> Option<NodeRef<'_>>;
}

impl Child for Param {
    fn as_node_mut(&mut self) -> Option<Node<'_>> {
        Some(Node::Leaf(self))
    }

    fn as_node(&self) -> Option<NodeRef<'_>> {
        Some(NodeRef::Leaf(self))
    }
}

impl<T: Child> Child for Option<T> {
    fn as_node_mut(&mut self) -> Option<Node<'_>> {
        self.as_mut().and_then(Child::as_node_mut)
    }

    fn as_node(&self) -> Option<NodeRef<'_>> {
        self.as_ref().and_then(Child::as_node)
    }
}

impl<T: Child> Composite for Vec<T> {
    fn child_mut(&mut self, segment: &Segment) -> Option<Node<'_>> {
        let index = segment.as_index()?;
        self.get_mut(index)?.as_node_mut()
    }

    fn children(&self) -> Vec<(Segment, NodeRef<'_>)> {
        self.iter()
            .enumerate()
            .filter_map(|(i, child)| child.as_node().map(|node| (Segment::Index(i), node)))
            .collect()
    }
}

impl<T: Child> Child for Vec<T> {
    fn as_node_mut(&mut self) -> Option<Node<'_>> {
        Some(Node::Composite(self))
    }

    fn as_node(&self) -> Option<NodeRef<'_>> {
        Some(NodeRef::Composite(self))
    }
}

/// Implement [`Composite`] and [`Child`] for a struct whose listed fields are
/// its named children. Field names are the path segments.
#[macro_export]
macro_rules! composite {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::Composite for $ty {
            fn child_mut(
                &mut self,
                segment: &$crate::Segment,
            ) -> ::std::option::Option<$crate::Node<'_>> {
                match segment.as_name()? {
                    $(stringify!($field) => $crate::Child::as_node_mut(&mut self.$field),)+
                    _ => None,
                }
            }

            fn children(&self) -> ::std::vec::Vec<($crate::Segment, $crate::NodeRef<'_>)> {
                let mut children = ::std::vec::Vec::new();
                $(
                    if let Some(node) = $crate::Child::as_node(&self.$field) {
                        children.push(($crate::Segment::named(stringify!($field)), node));
                    }
                )+
                children
            }
        }

        impl $crate::Child for $ty {
            fn as_node_mut(&mut self) -> ::std::option::Option<$crate::Node<'_>> {
                Some($crate::Node::Composite(self))
            }

            fn as_node(&self) -> ::std::option::Option<$crate::NodeRef<'_>> {
                Some($crate::NodeRef::Composite(self))
            }
        }
    };
}

/// Every leaf with its full path, depth-first in declaration order
pub fn parameters(root: &dyn Composite) -> Vec<(ParamPath, &Param)> {
    let mut out = Vec::new();
    collect(root, &mut Vec::new(), &mut out);
    out
}

fn collect<'a>(
    node: &'a dyn Composite,
    prefix: &mut Vec<Segment>,
    out: &mut Vec<(ParamPath, &'a Param)>,
) {
    for (segment, child) in node.children() {
        prefix.push(segment);
        match child {
            NodeRef::Leaf(param) => {
                if let Some(path) = ParamPath::from_segments(prefix.clone()) {
                    out.push((path, param));
                }
            }
            NodeRef::Composite(inner) => collect(inner, prefix, out),
        }
        prefix.pop();
    }
}

/// Paths of leaves that hold no value
pub fn unbound_parameters(root: &dyn Composite) -> Vec<ParamPath> {
    parameters(root)
        .into_iter()
        .filter(|(_, param)| !param.is_bound())
        .map(|(path, _)| path)
        .collect()
}

/// Total number of scalar elements across all leaves
pub fn parameter_count(root: &dyn Composite) -> usize {
    parameters(root)
        .iter()
        .map(|(_, param)| param.elem_count())
        .sum()
}

/// Fill every unbound leaf with a placeholder value.
///
/// Returns the number of leaves that were filled.
pub fn materialize(root: &mut dyn Composite, init: Init, device: &Device) -> Result<usize> {
    let mut filled = 0;
    visit_mut(root, &mut |param: &mut Param| {
        if param.materialize(init, device)? {
            filled += 1;
        }
        Ok(())
    })?;
    Ok(filled)
}

fn visit_mut(
    node: &mut dyn Composite,
    f: &mut dyn FnMut(&mut Param) -> Result<()>,
) -> Result<()> {
    let segments: Vec<Segment> = node
        .children()
        .into_iter()
        .map(|(segment, _)| segment)
        .collect();

    for segment in segments {
        match node.child_mut(&segment) {
            Some(Node::Leaf(param)) => f(param)?,
            Some(Node::Composite(inner)) => visit_mut(inner, f)?,
            None => {}
        }
    }
    Ok(())
}
