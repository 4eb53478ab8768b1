use std::fmt;
use std::fmt::Display;

use nalgebra_glm as glm;
use serde::{Deserialize, Serialize};

/// An AABB bounding volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AABB {
    /// the corner with the lower coordinates
    pub min: glm::Vec3,
    /// the corner with the upper coordinates
    pub max: glm::Vec3,
}

impl AABB {
    /// Creates a new empty bounding volume
    pub fn new() -> Self {
        let min = glm::vec3(f32::MAX, f32::MAX, f32::MAX);
        let max = glm::vec3(f32::MIN, f32::MIN, f32::MIN);

        AABB { min, max }
    }

    /// Creates a new bounding volume spanned by the two given corners.
    ///
    /// # Arguments
    /// * `min` - The corner with the lower coordinates.
    /// * `max` - The corner with the upper coordinates.
    #[inline]
    pub fn from_corners(min: glm::Vec3, max: glm::Vec3) -> Self {
        AABB { min, max }
    }

    /// Creates a degenerated bounding volume that only contains the given point.
    #[inline]
    pub fn from_point(p: &glm::Vec3) -> Self {
        AABB { min: *p, max: *p }
    }

    /// Creates a new cubic bounding volume with the specified center and size.
    ///
    /// # Arguments
    /// * `center` - The center of the AABB bounding volume.
    /// * `size` - The edge length of the cubic bounding volume.
    pub fn new_cube(center: &glm::Vec3, size: f32) -> Self {
        let half_size = size / 2f32;

        let mut result = AABB::new();
        result.min = *center - glm::vec3(half_size, half_size, half_size);
        result.max = *center + glm::vec3(half_size, half_size, half_size);

        result
    }

    /// Returns true if the bbox is empty and false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Extends the bounding volume with the given position
    ///
    ///* `p` - The position about which the volume is extended
    pub fn extend_pos(&mut self, p: &glm::Vec3) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.min.z = self.min.z.min(p.z);

        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
        self.max.z = self.max.z.max(p.z);
    }

    /// Extends the bounding volume with the given position
    ///
    ///* `rhs` - The right-hand-side bounding volume about which the volume is extended
    pub fn extend_bbox(&mut self, rhs: &Self) {
        self.min.x = self.min.x.min(rhs.min.x);
        self.min.y = self.min.y.min(rhs.min.y);
        self.min.z = self.min.z.min(rhs.min.z);

        self.max.x = self.max.x.max(rhs.max.x);
        self.max.y = self.max.y.max(rhs.max.y);
        self.max.z = self.max.z.max(rhs.max.z);
    }

    /// Returns the union of both bounding volumes.
    #[inline]
    pub fn union(&self, rhs: &Self) -> Self {
        let mut result = *self;
        result.extend_bbox(rhs);
        result
    }

    /// Computes and returns the bounding box center
    #[inline]
    pub fn get_center(&self) -> glm::Vec3 {
        (self.min + self.max) / 2.0
    }

    /// Returns a reference onto the minimum
    #[inline]
    pub fn get_min(&self) -> &glm::Vec3 {
        &self.min
    }

    /// Returns a reference onto the maximum
    #[inline]
    pub fn get_max(&self) -> &glm::Vec3 {
        &self.max
    }

    #[inline]
    pub fn contains_point(&self, p: &glm::Vec3) -> bool {
        self.min[0] <= p[0]
            && p[0] <= self.max[0]
            && self.min[1] <= p[1]
            && p[1] <= self.max[1]
            && self.min[2] <= p[2]
            && p[2] <= self.max[2]
    }

    #[inline]
    pub fn contains_aabb(&self, aabb: &AABB) -> bool {
        self.min[0] <= aabb.min[0]
            && aabb.max[0] <= self.max[0]
            && self.min[1] <= aabb.min[1]
            && aabb.max[1] <= self.max[1]
            && self.min[2] <= aabb.min[2]
            && aabb.max[2] <= self.max[2]
    }

    /// Returns true if both bounding volumes overlap, touching boundaries included.
    /// Empty volumes never intersect anything.
    #[inline]
    pub fn intersects(&self, rhs: &AABB) -> bool {
        !self.is_empty()
            && !rhs.is_empty()
            && self.min[0] <= rhs.max[0]
            && rhs.min[0] <= self.max[0]
            && self.min[1] <= rhs.max[1]
            && rhs.min[1] <= self.max[1]
            && self.min[2] <= rhs.max[2]
            && rhs.min[2] <= self.max[2]
    }

    /// Returns the euclidean distance between the AABB and the given point.
    /// The distance to an empty AABB is infinite.
    ///
    /// # Arguments
    /// * `point` - The point to compute the distance to.
    pub fn point_distance(&self, point: &glm::Vec3) -> f32 {
        self.point_distance_squared(point).sqrt()
    }

    /// Returns the squared euclidean distance between the AABB and the given point.
    ///
    /// # Arguments
    /// * `point` - The point to compute the squared distance to.
    pub fn point_distance_squared(&self, point: &glm::Vec3) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }

        let mut distance_squared = 0.0;

        for i in 0..3 {
            let v = point[i];

            if v < self.min[i] {
                distance_squared += (self.min[i] - v) * (self.min[i] - v);
            } else if v > self.max[i] {
                distance_squared += (v - self.max[i]) * (v - self.max[i]);
            }
        }

        distance_squared
    }

    /// Returns the euclidean distance between the closest points of both AABBs, i.e., zero if
    /// they overlap.
    ///
    /// # Arguments
    /// * `rhs` - The other bounding volume.
    pub fn aabb_distance(&self, rhs: &AABB) -> f32 {
        if self.is_empty() || rhs.is_empty() {
            return f32::INFINITY;
        }

        let mut distance_squared = 0.0;

        for i in 0..3 {
            let gap = (rhs.min[i] - self.max[i]).max(self.min[i] - rhs.max[i]);
            if gap > 0.0 {
                distance_squared += gap * gap;
            }
        }

        distance_squared.sqrt()
    }
}

impl Default for AABB {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

fn vec3_to_string(f: &mut fmt::Formatter<'_>, v: &glm::Vec3) -> fmt::Result {
    write!(f, "({}, {}, {})", v[0], v[1], v[2])
}

impl Display for AABB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        vec3_to_string(f, &self.min)?;
        write!(f, "-")?;
        vec3_to_string(f, &self.max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_point_distance() {
        let mut aabb = AABB::new();
        aabb.extend_pos(&glm::vec3(0.0, 0.0, 0.0));
        aabb.extend_pos(&glm::vec3(1.0, 1.0, 1.0));

        assert_eq!(aabb.point_distance(&glm::vec3(0.0, 0.0, 0.0)), 0.0);
        assert_eq!(aabb.point_distance(&glm::vec3(-1.0, 0.0, 0.0)), 1.0);
        assert_eq!(aabb.point_distance(&glm::vec3(2.0, 0.0, 0.0)), 1.0);
        assert_eq!(
            aabb.point_distance(&glm::vec3(-1.0, 2.0, 0.0)),
            2.0f32.sqrt()
        );
    }

    #[test]
    fn test_empty_volume() {
        let empty = AABB::new();
        assert!(empty.is_empty());
        assert_eq!(
            empty.point_distance(&glm::vec3(0.0, 0.0, 0.0)),
            f32::INFINITY
        );

        let unit = AABB::from_corners(glm::vec3(0.0, 0.0, 0.0), glm::vec3(1.0, 1.0, 1.0));
        assert!(!empty.intersects(&unit));
        assert_eq!(empty.union(&unit), unit);
    }

    #[test]
    fn test_intersects_and_distance() {
        let a = AABB::from_corners(glm::vec3(0.0, 0.0, 0.0), glm::vec3(1.0, 1.0, 1.0));
        let b = AABB::from_corners(glm::vec3(1.0, 0.5, 0.5), glm::vec3(2.0, 2.0, 2.0));
        let c = AABB::from_corners(glm::vec3(4.0, 0.0, 0.0), glm::vec3(5.0, 1.0, 1.0));

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));

        assert_eq!(a.aabb_distance(&b), 0.0);
        assert_eq!(a.aabb_distance(&c), 3.0);
        assert_eq!(c.aabb_distance(&a), 3.0);
    }

    #[test]
    fn test_union_contains_both() {
        let a = AABB::from_corners(glm::vec3(0.0, 0.0, 0.0), glm::vec3(1.0, 1.0, 1.0));
        let b = AABB::from_corners(glm::vec3(-1.0, 2.0, 0.5), glm::vec3(0.5, 3.0, 0.7));
        let u = a.union(&b);

        assert!(u.contains_aabb(&a));
        assert!(u.contains_aabb(&b));
        assert_eq!(u.min, glm::vec3(-1.0, 0.0, 0.0));
        assert_eq!(u.max, glm::vec3(1.0, 3.0, 1.0));
    }
}
