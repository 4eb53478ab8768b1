mod aabb;

pub use aabb::*;

use nalgebra_glm::Vec3;

/// Constraint a value to lie between two further values
///
/// # Arguments
/// * `x` - The value to constraint.
/// * `min_value` - The lower bound for the value constraint.
/// * `max_value` - The upper bound for the value constraint.
#[inline]
pub fn clamp<T>(x: T, min_value: T, max_value: T) -> T
where
    T: PartialOrd,
{
    if x < min_value {
        min_value
    } else if x > max_value {
        max_value
    } else {
        x
    }
}

/// Maps the given position into the unit cube spanned by the given bounding volume. Positions
/// outside of the volume are clamped onto its boundary. Flat dimensions of the volume map to 0.
///
/// # Arguments
/// * `bounds` - The bounding volume that defines the unit cube.
/// * `p` - The position to normalize.
#[inline]
pub fn normalize_in_volume(bounds: &AABB, p: &Vec3) -> Vec3 {
    let mut result = Vec3::zeros();

    for i in 0..3 {
        let extent = bounds.max[i] - bounds.min[i];
        if extent > 0f32 {
            result[i] = clamp((p[i] - bounds.min[i]) / extent, 0f32, 1f32);
        }
    }

    result
}

#[cfg(test)]
mod test {
    use nalgebra_glm::vec3;

    use super::*;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(3, 0, 10), 3);
        assert_eq!(clamp(-2, 0, 10), 0);
        assert_eq!(clamp(11, 0, 10), 10);
    }

    #[test]
    fn test_normalize_in_volume() {
        let bounds = AABB::from_corners(vec3(0.0, -2.0, 5.0), vec3(4.0, 2.0, 5.0));

        assert_eq!(
            normalize_in_volume(&bounds, &vec3(2.0, 0.0, 5.0)),
            vec3(0.5, 0.5, 0.0)
        );
        assert_eq!(
            normalize_in_volume(&bounds, &vec3(-3.0, 9.0, 1.0)),
            vec3(0.0, 1.0, 0.0)
        );
    }
}
