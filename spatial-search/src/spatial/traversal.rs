use log::trace;

use crate::math::AABB;

use super::{HierarchicalIndex, HierarchicalNode};

/// Initial capacity of the traversal stack. Morton codes with index tie-break keep the
/// hierarchies shallow, such that the stack rarely grows beyond this.
const STACK_CAPACITY: usize = 64;

/// A visitor that steers the traversal of a hierarchical index and accumulates its result.
pub trait TreeVisitor {
    /// The accumulated result of the traversal.
    type Output;

    /// Returns true if the subtree of the given node needs to be explored.
    ///
    /// # Arguments
    /// * `node` - The index of the node within the nodes of the hierarchical index.
    /// * `volume` - The bounding volume of the node.
    fn should_explore(&mut self, node: usize, volume: &AABB) -> bool;

    /// Processes a leaf node that passed `should_explore`.
    ///
    /// # Arguments
    /// * `node` - The index of the leaf node.
    /// * `object` - The index of the object stored in the leaf.
    /// * `volume` - The bounding volume of the leaf.
    fn visit(&mut self, node: usize, object: usize, volume: &AABB);

    /// Returns the distance between the query and the given volume if the visitor has a notion
    /// of distance. Children are then visited nearest first.
    #[inline]
    fn distance_hint(&self, _volume: &AABB) -> Option<f32> {
        None
    }

    /// Returns the current pruning distance. Stacked nodes whose distance hint exceeds it are
    /// skipped when they are popped.
    #[inline]
    fn bound(&self) -> f32 {
        f32::INFINITY
    }

    /// Finishes the traversal and returns the accumulated result.
    fn finish(self) -> Self::Output;
}

/// The states of the iterative depth-first traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Start,
    Descending,
    Backtracking,
    Done,
}

/// Traverses the given hierarchical index depth-first without recursion and returns the result
/// accumulated by the visitor.
///
/// # Arguments
/// * `index` - The hierarchical index to traverse.
/// * `visitor` - The visitor deciding which nodes are explored and processing the leaves.
pub fn traverse<I, V>(index: &I, mut visitor: V) -> V::Output
where
    I: HierarchicalIndex,
    V: TreeVisitor,
{
    let nodes = index.nodes();
    let mut stack: Vec<(usize, f32)> = Vec::with_capacity(STACK_CAPACITY);
    let mut state = TraversalState::Start;

    loop {
        state = match state {
            TraversalState::Start => match index.root() {
                Some(root) if visitor.should_explore(root, nodes[root].bounding_volume()) => {
                    stack.push((root, 0f32));
                    TraversalState::Descending
                }
                _ => TraversalState::Done,
            },
            TraversalState::Descending => match stack.pop() {
                None => TraversalState::Done,
                Some((node_index, hint)) if hint > visitor.bound() => {
                    trace!("Pruning node {} on pop", node_index);
                    TraversalState::Backtracking
                }
                Some((node_index, _)) => {
                    let node = &nodes[node_index];
                    match node.children() {
                        Some(children) => {
                            if push_children(nodes, children, &mut visitor, &mut stack) {
                                TraversalState::Descending
                            } else {
                                TraversalState::Backtracking
                            }
                        }
                        None => {
                            if let Some(object) = node.object() {
                                visitor.visit(node_index, object, node.bounding_volume());
                            }

                            TraversalState::Backtracking
                        }
                    }
                }
            },
            TraversalState::Backtracking => {
                if stack.is_empty() {
                    TraversalState::Done
                } else {
                    TraversalState::Descending
                }
            }
            TraversalState::Done => break,
        };
    }

    visitor.finish()
}

/// Pushes the children that pass `should_explore`, the farther one first such that the nearer
/// one is popped next. Returns true if at least one child has been pushed.
#[inline]
fn push_children<N, V>(
    nodes: &[N],
    children: [usize; 2],
    visitor: &mut V,
    stack: &mut Vec<(usize, f32)>,
) -> bool
where
    N: HierarchicalNode,
    V: TreeVisitor,
{
    let mut accepted = [(0usize, 0f32); 2];
    let mut count = 0;

    for child in children {
        let volume = nodes[child].bounding_volume();
        if visitor.should_explore(child, volume) {
            let hint = visitor.distance_hint(volume).unwrap_or(0f32);
            accepted[count] = (child, hint);
            count += 1;
        }
    }

    if count == 2 && accepted[0].1 < accepted[1].1 {
        accepted.swap(0, 1);
    }

    stack.extend_from_slice(&accepted[..count]);

    count > 0
}

#[cfg(test)]
mod test {
    use nalgebra_glm::{vec3, Vec3};

    use super::*;
    use crate::spatial::BVH;

    /// Records every decision of the engine.
    #[derive(Default)]
    struct RecordingVisitor {
        explored: Vec<usize>,
        visited_objects: Vec<usize>,
    }

    impl TreeVisitor for RecordingVisitor {
        type Output = Self;

        fn should_explore(&mut self, node: usize, _volume: &AABB) -> bool {
            self.explored.push(node);
            true
        }

        fn visit(&mut self, _node: usize, object: usize, _volume: &AABB) {
            self.visited_objects.push(object);
        }

        fn finish(self) -> Self::Output {
            self
        }
    }

    /// Only explores nodes whose volume contains the given point.
    struct ContainingVisitor {
        point: Vec3,
        objects: Vec<usize>,
    }

    impl TreeVisitor for ContainingVisitor {
        type Output = Vec<usize>;

        fn should_explore(&mut self, _node: usize, volume: &AABB) -> bool {
            volume.contains_point(&self.point)
        }

        fn visit(&mut self, _node: usize, object: usize, _volume: &AABB) {
            self.objects.push(object);
        }

        fn finish(mut self) -> Self::Output {
            self.objects.sort();
            self.objects
        }
    }

    #[test]
    fn test_visits_every_node_once() {
        let points: Vec<Vec3> = (0..100).map(|i| vec3(i as f32, 0.0, 0.0)).collect();
        let bvh = BVH::new(&points);

        let r = traverse(&bvh, RecordingVisitor::default());

        let mut explored = r.explored.clone();
        explored.sort();
        assert_eq!(explored, (0..bvh.nodes().len()).collect::<Vec<_>>());

        let mut objects = r.visited_objects.clone();
        objects.sort();
        assert_eq!(objects, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_index() {
        let bvh = BVH::new::<Vec3>(&[]);
        let r = traverse(&bvh, RecordingVisitor::default());

        assert!(r.explored.is_empty());
        assert!(r.visited_objects.is_empty());
    }

    #[test]
    fn test_pruning() {
        let boxes: Vec<AABB> = (0..10)
            .map(|i| AABB::new_cube(&vec3(i as f32 * 2.0, 0.0, 0.0), 1.0))
            .collect();
        let bvh = BVH::new(&boxes);

        let objects = traverse(
            &bvh,
            ContainingVisitor {
                point: vec3(6.2, 0.1, -0.3),
                objects: Vec::new(),
            },
        );
        assert_eq!(objects, vec![3]);

        let objects = traverse(
            &bvh,
            ContainingVisitor {
                point: vec3(100.0, 0.0, 0.0),
                objects: Vec::new(),
            },
        );
        assert!(objects.is_empty());
    }
}
