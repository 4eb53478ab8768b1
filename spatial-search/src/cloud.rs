use nalgebra_glm::{vec3, Vec3};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The shape of a generated point cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum PointCloudShape {
    /// Points uniformly distributed in the cube [-a,a]^3.
    FilledBox,

    /// Points uniformly distributed on the surface of the cube [-a,a]^3.
    HollowBox,

    /// Points uniformly distributed in the ball of radius a.
    FilledSphere,

    /// Points uniformly distributed on the sphere of radius a.
    HollowSphere,
}

/// Generates a point cloud with the given shape.
///
/// # Arguments
/// * `shape` - The shape of the point cloud.
/// * `a` - The half edge length of the box or the radius of the sphere.
/// * `n` - The number of points to generate.
/// * `rng` - The random number generator.
pub fn generate_point_cloud<R: Rng>(
    shape: PointCloudShape,
    a: f32,
    n: usize,
    rng: &mut R,
) -> Vec<Vec3> {
    (0..n)
        .map(|_| match shape {
            PointCloudShape::FilledBox => random_in_cube(rng) * a,
            PointCloudShape::HollowBox => {
                // pick a face and a point on it
                let mut p = random_in_cube(rng);
                let axis = rng.random_range(0..3);
                p[axis] = if rng.random_bool(0.5) { 1f32 } else { -1f32 };
                p * a
            }
            PointCloudShape::FilledSphere => loop {
                let p = random_in_cube(rng);
                if p.norm_squared() <= 1f32 {
                    break p * a;
                }
            },
            PointCloudShape::HollowSphere => loop {
                let p = random_in_cube(rng);
                let norm = p.norm();
                if norm > 1e-3 && norm <= 1f32 {
                    break p / norm * a;
                }
            },
        })
        .collect()
}

#[inline]
fn random_in_cube<R: Rng>(rng: &mut R) -> Vec3 {
    vec3(
        rng.random_range(-1f32..=1f32),
        rng.random_range(-1f32..=1f32),
        rng.random_range(-1f32..=1f32),
    )
}
