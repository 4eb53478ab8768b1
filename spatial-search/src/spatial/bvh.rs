use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use log::{debug, error, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    math::AABB,
    spatial::morton::{morton_code, sort_codes, MortonCode},
    Error, Result, StatsNode, StatsNodeTrait, TimeRecording,
};

use super::{HierarchicalIndex, HierarchicalNode, Primitive};

/// Linear Bounding Volume Hierarchy with one object per leaf.
///
/// For N objects the hierarchy has N-1 internal nodes followed by N leaf nodes. The hierarchy over
/// zero objects has no nodes at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BVH {
    /// The nodes of the BVH.
    nodes: Vec<Node>,

    /// The object indices in the order of the leaf nodes.
    objects: Vec<usize>,

    /// The bounding volume of all objects.
    bounds: AABB,
}

impl HierarchicalIndex for BVH {
    type Node = Node;

    #[inline]
    fn nodes(&self) -> &[Self::Node] {
        &self.nodes
    }

    #[inline]
    fn object_indices(&self) -> &[usize] {
        self.objects.as_slice()
    }
}

impl BVH {
    /// Builds the BVH over the given primitives with the default builder.
    ///
    /// # Arguments
    /// * `primitives` - The primitives to build the BVH from.
    pub fn new<P: Primitive + Sync>(primitives: &[P]) -> Self {
        Builder::new().build(primitives)
    }

    /// Returns the hierarchy over zero objects.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            objects: Vec::new(),
            bounds: AABB::new(),
        }
    }

    /// Returns the number of indexed objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns the bounding volume of all indexed objects. Empty for the empty hierarchy.
    #[inline]
    pub fn bounds(&self) -> &AABB {
        &self.bounds
    }

    /// Returns the number of nodes on the longest path from the root to a leaf.
    pub fn height(&self) -> usize {
        let mut height = 0;
        let mut stack: Vec<(usize, usize)> = self.root().map(|r| (r, 1)).into_iter().collect();

        while let Some((node, depth)) = stack.pop() {
            height = height.max(depth);
            if let Some(children) = self.nodes[node].children() {
                stack.extend(children.iter().map(|&c| (c, depth + 1)));
            }
        }

        height
    }

    /// Checks the structural invariants of the hierarchy, i.e., the node counts, that every
    /// node except the root has exactly one parent, that every object is referenced by exactly
    /// one leaf and that every node volume contains the volumes of its children.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let n = self.objects.len();
        if n == 0 {
            return if self.nodes.is_empty() {
                Ok(())
            } else {
                Err("empty hierarchy with nodes".to_owned())
            };
        }

        if self.nodes.len() != 2 * n - 1 {
            return Err(format!(
                "{} nodes for {} objects, expected {}",
                self.nodes.len(),
                n,
                2 * n - 1
            ));
        }

        let mut num_parents = vec![0u32; self.nodes.len()];
        let mut num_leaves_per_object = vec![0u32; n];
        for (i, node) in self.nodes.iter().enumerate() {
            match node.kind {
                NodeKind::Internal { left, right } => {
                    if i >= n - 1 {
                        return Err(format!("internal node {} in the leaf range", i));
                    }

                    for c in [left as usize, right as usize] {
                        if c == 0 || c >= self.nodes.len() {
                            return Err(format!("node {} has invalid child {}", i, c));
                        }

                        num_parents[c] += 1;
                        if !node.volume.contains_aabb(&self.nodes[c].volume) {
                            return Err(format!("node {} does not contain child {}", i, c));
                        }
                    }
                }
                NodeKind::Leaf { object } => {
                    if i < n - 1 {
                        return Err(format!("leaf node {} in the internal range", i));
                    }

                    let object = object as usize;
                    if object >= n || self.objects[i - (n - 1)] != object {
                        return Err(format!("leaf {} references invalid object {}", i, object));
                    }

                    num_leaves_per_object[object] += 1;
                }
            }
        }

        if num_parents.iter().skip(1).any(|&p| p != 1) || num_parents[0] != 0 {
            return Err("the nodes do not form a tree".to_owned());
        }

        // every node has a single parent, so the walk from the root terminates
        let mut num_reached = 0;
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            num_reached += 1;
            if let Some(children) = self.nodes[node].children() {
                stack.extend(children);
            }
        }

        if num_reached != self.nodes.len() {
            return Err("not all nodes are reachable from the root".to_owned());
        }

        if num_leaves_per_object.iter().any(|&c| c != 1) {
            return Err("the leaves do not reference every object once".to_owned());
        }

        Ok(())
    }

    /// Writes the hierarchy to the given writer.
    ///
    /// # Arguments
    /// * `writer` - The writer to write the hierarchy to.
    pub fn write<W: std::io::Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self).map_err(|e| Error::SerializationError(Box::new(e)))
    }

    /// Reads a hierarchy from the given reader and validates it.
    ///
    /// # Arguments
    /// * `reader` - The reader to read the hierarchy from.
    pub fn read_from<R: std::io::Read>(reader: R) -> Result<Self> {
        let bvh: Self = bincode::deserialize_from(reader)
            .map_err(|e| Error::DeserializationError(Box::new(e)))?;

        bvh.validate().map_err(|msg| {
            error!("Read an invalid hierarchy: {}", msg);
            Error::InvalidHierarchy(msg)
        })?;

        Ok(bvh)
    }
}

/// The topology of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// An internal node with exactly two children.
    Internal { left: u32, right: u32 },

    /// A leaf node holding a single object index.
    Leaf { object: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// The bounding volume of the node.
    volume: AABB,

    kind: NodeKind,
}

impl Node {
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

impl HierarchicalNode for Node {
    #[inline]
    fn children(&self) -> Option<[usize; 2]> {
        match self.kind {
            NodeKind::Internal { left, right } => Some([left as usize, right as usize]),
            NodeKind::Leaf { .. } => None,
        }
    }

    #[inline]
    fn object(&self) -> Option<usize> {
        match self.kind {
            NodeKind::Internal { .. } => None,
            NodeKind::Leaf { object } => Some(object as usize),
        }
    }

    #[inline]
    fn bounding_volume(&self) -> &AABB {
        &self.volume
    }
}

/// A bounding volume that can be written and read from several threads.
struct AtomicVolume([AtomicU32; 6]);

impl AtomicVolume {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU32::new(0)))
    }

    #[inline]
    fn store(&self, volume: &AABB) {
        for i in 0..3 {
            self.0[i].store(volume.min[i].to_bits(), Ordering::Relaxed);
            self.0[i + 3].store(volume.max[i].to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    fn load(&self) -> AABB {
        let c = |i: usize| f32::from_bits(self.0[i].load(Ordering::Relaxed));

        AABB::from_corners(
            nalgebra_glm::vec3(c(0), c(1), c(2)),
            nalgebra_glm::vec3(c(3), c(4), c(5)),
        )
    }
}

pub struct Builder {
    stats: Option<StatsNode>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a new BVH builder.
    pub fn new() -> Self {
        Self { stats: None }
    }

    /// Registers the timings of the individual build stages in the given stats node.
    ///
    /// # Arguments
    /// * `stats` - The stats node for the build timings.
    pub fn with_stats(mut self, stats: StatsNode) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Builds the BVH from the provided primitives.
    ///
    /// # Arguments
    /// * `primitives` - The primitives to build the BVH from.
    pub fn build<P: Primitive + Sync>(self, primitives: &[P]) -> BVH {
        self.build_with(primitives, |p: &P| p.bounding_volume())
    }

    /// Builds the BVH from the provided objects using the given accessor for their bounding
    /// volumes. The index of an object in the slice identifies it in the hierarchy.
    ///
    /// # Arguments
    /// * `objects` - The objects to build the BVH from.
    /// * `volume_of` - Returns the bounding volume of an object.
    pub fn build_with<T, F>(self, objects: &[T], volume_of: F) -> BVH
    where
        T: Sync,
        F: Fn(&T) -> AABB + Sync,
    {
        let n = objects.len();
        let _t = self.stage("total");
        info!("Building BVH over {} objects...", n);

        if n == 0 {
            debug!("No objects, returning the empty hierarchy");
            return BVH::empty();
        }

        debug_assert!(n <= u32::MAX as usize);

        let volumes: Vec<AABB> = {
            let _t = self.stage("volumes");
            objects.par_iter().map(&volume_of).collect()
        };

        let bounds = volumes
            .par_iter()
            .copied()
            .reduce(AABB::new, |a, b| a.union(&b));
        debug!("Scene bounds: {}", bounds);

        let codes: Vec<MortonCode> = {
            let _t = self.stage("morton_codes");
            volumes
                .par_iter()
                .map(|v| morton_code(&bounds, &v.get_center()))
                .collect()
        };

        let order = {
            let _t = self.stage("sort");
            sort_codes(&codes)
        };
        let sorted_codes: Vec<MortonCode> = order.iter().map(|&i| codes[i]).collect();

        let num_internal = n - 1;
        let children: Vec<[u32; 2]> = {
            let _t = self.stage("hierarchy");
            (0..num_internal)
                .into_par_iter()
                .map(|i| internal_children(&sorted_codes, i))
                .collect()
        };

        let nodes = {
            let _t = self.stage("volumes_bottom_up");
            Self::compute_node_volumes(&volumes, &order, &children)
        };

        info!("Building BVH over {} objects...DONE", n);

        BVH {
            nodes,
            objects: order,
            bounds,
        }
    }

    /// Computes the node volumes bottom-up. Every leaf walks towards the root and every internal
    /// node counts the arriving children. Only the second arriving child proceeds, such that both
    /// child volumes are final when the union is computed.
    fn compute_node_volumes(volumes: &[AABB], order: &[usize], children: &[[u32; 2]]) -> Vec<Node> {
        let n = order.len();
        let num_internal = n - 1;
        let num_nodes = 2 * n - 1;

        let mut parents = vec![0u32; num_nodes];
        for (i, c) in children.iter().enumerate() {
            parents[c[0] as usize] = i as u32;
            parents[c[1] as usize] = i as u32;
        }

        let slots: Vec<AtomicVolume> = (0..num_nodes).map(|_| AtomicVolume::new()).collect();
        let arrivals: Vec<AtomicU8> = (0..num_internal).map(|_| AtomicU8::new(0)).collect();

        (0..n).into_par_iter().for_each(|j| {
            let mut node = num_internal + j;
            slots[node].store(&volumes[order[j]]);

            // the root is always the first node
            while node != 0 {
                let parent = parents[node] as usize;
                if arrivals[parent].fetch_add(1, Ordering::AcqRel) == 0 {
                    return;
                }

                let [left, right] = children[parent];
                let volume = slots[left as usize]
                    .load()
                    .union(&slots[right as usize].load());
                slots[parent].store(&volume);

                node = parent;
            }
        });

        (0..num_nodes)
            .into_par_iter()
            .map(|k| {
                let volume = slots[k].load();
                let kind = if k < num_internal {
                    let [left, right] = children[k];
                    NodeKind::Internal { left, right }
                } else {
                    NodeKind::Leaf {
                        object: order[k - num_internal] as u32,
                    }
                };

                Node { volume, kind }
            })
            .collect()
    }

    #[inline]
    fn stage(&self, name: &str) -> Option<TimeRecording> {
        self.stats
            .as_ref()
            .map(|s| s.get_child(name).register_timing())
    }
}

/// Returns the length of the common prefix of the sorted codes at the positions i and j, where
/// equal codes are distinguished by their positions. Returns -1 if j is out of range.
#[inline]
fn common_prefix(codes: &[MortonCode], i: usize, j: i64) -> i32 {
    if j < 0 || j as usize >= codes.len() {
        return -1;
    }

    let j = j as usize;
    let (a, b) = (codes[i], codes[j]);
    if a == b {
        64 + ((i as u64) ^ (j as u64)).leading_zeros() as i32
    } else {
        (a ^ b).leading_zeros() as i32
    }
}

/// Determines the two children of the internal node i from the sorted codes, following Karras,
/// "Maximizing parallelism in the construction of BVHs, octrees, and k-d trees" (2012).
/// Internal nodes are numbered 0..n-1, leaf j of the sorted order is node n-1+j.
fn internal_children(codes: &[MortonCode], i: usize) -> [u32; 2] {
    let num_internal = (codes.len() - 1) as i64;
    let ii = i as i64;

    // direction of the range covered by node i
    let d: i64 = if common_prefix(codes, i, ii + 1) >= common_prefix(codes, i, ii - 1) {
        1
    } else {
        -1
    };

    // upper bound for the length of the range
    let delta_min = common_prefix(codes, i, ii - d);
    let mut l_max: i64 = 2;
    while common_prefix(codes, i, ii + l_max * d) > delta_min {
        l_max *= 2;
    }

    // binary search for the other end of the range
    let mut l: i64 = 0;
    let mut t = l_max / 2;
    while t >= 1 {
        if common_prefix(codes, i, ii + (l + t) * d) > delta_min {
            l += t;
        }
        t /= 2;
    }
    let j = ii + l * d;

    // binary search for the split position, i.e., the highest differing bit
    let delta_node = common_prefix(codes, i, j);
    let mut s: i64 = 0;
    let mut t = l;
    loop {
        t = (t + 1) / 2;
        if common_prefix(codes, i, ii + (s + t) * d) > delta_node {
            s += t;
        }

        if t <= 1 {
            break;
        }
    }
    let gamma = ii + s * d + d.min(0);

    let left = if ii.min(j) == gamma {
        num_internal + gamma
    } else {
        gamma
    };
    let right = if ii.max(j) == gamma + 1 {
        num_internal + gamma + 1
    } else {
        gamma + 1
    };

    [left as u32, right as u32]
}

#[cfg(test)]
mod test {
    use nalgebra_glm::{vec3, Vec3};
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn gen_random_points(rng: &mut ChaCha8Rng, n: usize) -> Vec<Vec3> {
        (0..n)
            .map(|_| {
                vec3(
                    rng.random_range(-10f32..10f32),
                    rng.random_range(-10f32..10f32),
                    rng.random_range(-10f32..10f32),
                )
            })
            .collect()
    }

    /// Recursively checks the node volumes and returns the volume of all objects of the subtree.
    fn check_subtree(bvh: &BVH, node: usize, volumes: &[AABB]) -> AABB {
        let n = &bvh.nodes()[node];
        let expected = match n.children() {
            Some([left, right]) => {
                check_subtree(bvh, left, volumes).union(&check_subtree(bvh, right, volumes))
            }
            None => volumes[n.object().unwrap()],
        };

        assert!(n.bounding_volume().contains_aabb(&expected));
        assert_eq!(*n.bounding_volume(), expected);

        expected
    }

    #[test]
    fn test_node_counts_and_volumes() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for n in [1, 2, 3, 7, 64, 1000] {
            let points = gen_random_points(&mut rng, n);
            let bvh = BVH::new(&points);

            assert_eq!(bvh.len(), n);
            let num_leaves = bvh.nodes().iter().filter(|n| n.is_leaf()).count();
            let num_internal = bvh.nodes().iter().filter(|n| !n.is_leaf()).count();
            assert_eq!(num_leaves, n);
            assert_eq!(num_internal, n - 1);

            let volumes: Vec<AABB> = points.iter().map(|p| p.bounding_volume()).collect();
            let root_volume = check_subtree(&bvh, bvh.root().unwrap(), &volumes);
            assert_eq!(root_volume, *bvh.bounds());
            assert!(bvh.is_valid());
        }
    }

    #[test]
    fn test_empty() {
        let points: Vec<Vec3> = Vec::new();
        let bvh = BVH::new(&points);

        assert!(bvh.is_empty());
        assert!(bvh.root().is_none());
        assert!(bvh.nodes().is_empty());
        assert!(bvh.bounds().is_empty());
        assert_eq!(bvh.height(), 0);
        assert!(bvh.is_valid());
    }

    #[test]
    fn test_single_object() {
        let bvh = BVH::new(&[vec3(1.0, 2.0, 3.0)]);

        assert_eq!(bvh.nodes().len(), 1);
        assert_eq!(bvh.nodes()[0].object(), Some(0));
        assert_eq!(bvh.nodes()[0].kind(), NodeKind::Leaf { object: 0 });
        assert_eq!(bvh.height(), 1);

        let bvh = BVH::new(&[vec3(1.0, 2.0, 3.0), vec3(-1.0, 0.0, 0.0)]);
        assert_eq!(
            bvh.nodes()[0].kind(),
            NodeKind::Internal { left: 1, right: 2 }
        );
        assert!(bvh.nodes()[1..]
            .iter()
            .all(|n| matches!(n.kind(), NodeKind::Leaf { .. })));
    }

    #[test]
    fn test_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let points = gen_random_points(&mut rng, 5000);

        let bvh0 = BVH::new(&points);
        let bvh1 = BVH::new(&points);

        assert_eq!(bvh0, bvh1);
    }

    #[test]
    fn test_duplicated_points() {
        let points = vec![vec3(0.5, 0.5, 0.5); 1024];
        let bvh = BVH::new(&points);

        assert!(bvh.is_valid());

        // the index tie-break yields a perfectly balanced tree over 1024 equal codes
        assert_eq!(bvh.height(), 11);
        assert_eq!(bvh.object_indices(), (0..1024).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_boxes_with_accessor() {
        let boxes: Vec<(f32, f32)> = vec![(0.0, 1.0), (5.0, 6.0), (2.0, 2.5)];
        let bvh = Builder::new()
            .with_stats(crate::Stats::detached())
            .build_with(&boxes, |&(a, b)| {
                AABB::from_corners(vec3(a, a, a), vec3(b, b, b))
            });

        assert!(bvh.is_valid());
        assert_eq!(bvh.bounds().min, vec3(0.0, 0.0, 0.0));
        assert_eq!(bvh.bounds().max, vec3(6.0, 6.0, 6.0));
    }

    #[test]
    fn test_write_and_read() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let bvh = BVH::new(&gen_random_points(&mut rng, 100));

        let mut buffer = Vec::new();
        bvh.write(&mut buffer).unwrap();
        let bvh2 = BVH::read_from(&buffer[..]).unwrap();

        assert_eq!(bvh, bvh2);
    }

    #[test]
    fn test_read_rejects_invalid_hierarchy() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut bvh = BVH::new(&gen_random_points(&mut rng, 10));

        // let the root reference itself
        bvh.nodes[0].kind = NodeKind::Internal { left: 0, right: 1 };

        let mut buffer = Vec::new();
        bvh.write(&mut buffer).unwrap();

        assert!(matches!(
            BVH::read_from(&buffer[..]),
            Err(Error::InvalidHierarchy(_))
        ));
    }
}
