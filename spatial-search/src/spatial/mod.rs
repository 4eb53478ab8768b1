//! Spatial indices for fast nearest neighbor and range queries.
//!
//! This module contains the bounding volume hierarchy, the traversal engine walking it and the
//! query types answered by the engine.

mod batching;
mod bvh;
pub mod morton;
mod query;
mod traversal;

pub use batching::*;
pub use bvh::*;
pub use query::*;
pub use traversal::*;

use nalgebra_glm::Vec3;

use crate::math::AABB;

/// A hierarchical spatial index that spatially sorts objects into a binary tree structure.
pub trait HierarchicalIndex {
    type Node: HierarchicalNode;

    /// Returns the nodes of the hierarchical index.
    /// The nodes are stored in a flat array, where the internal nodes are stored first followed
    /// by the leaf nodes in the order of the spatially sorted objects.
    /// NOTE: The first node is the root node.
    fn nodes(&self) -> &[Self::Node];

    /// Returns the indices of the objects in the order of the leaf nodes.
    fn object_indices(&self) -> &[usize];

    /// Returns the index of the root node or None if the index is empty.
    #[inline]
    fn root(&self) -> Option<usize> {
        if self.nodes().is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

pub trait HierarchicalNode: Sized {
    /// Returns the node indices of the two children or None for leaf nodes.
    fn children(&self) -> Option<[usize; 2]>;

    /// Returns the index of the object stored in the node or None for internal nodes.
    fn object(&self) -> Option<usize>;

    /// Returns the bounding volume of the node.
    fn bounding_volume(&self) -> &AABB;

    #[inline]
    fn is_leaf(&self) -> bool {
        self.object().is_some()
    }
}

/// A geometric object that can be stored in a hierarchical index.
pub trait Primitive {
    /// Returns the axis aligned bounding volume of the object.
    fn bounding_volume(&self) -> AABB;
}

impl Primitive for Vec3 {
    #[inline]
    fn bounding_volume(&self) -> AABB {
        AABB::from_point(self)
    }
}

impl Primitive for AABB {
    #[inline]
    fn bounding_volume(&self) -> AABB {
        *self
    }
}
