//! Morton codes, i.e., keys along the Z-order space filling curve.

use nalgebra_glm::Vec3;

use crate::math::{normalize_in_volume, AABB};

/// The number of bits used per dimension.
pub const MORTON_BITS_PER_DIM: u32 = 21;

/// A 64bit Morton code with 21 bits per dimension.
pub type MortonCode = u64;

const MAX_COORD: u64 = (1u64 << MORTON_BITS_PER_DIM) - 1;

/// Spreads the lower 21 bits of the given value such that two zero bits are inserted between
/// each pair of consecutive bits.
#[inline]
fn expand_bits(v: u64) -> u64 {
    let mut x = v & MAX_COORD;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

/// Quantizes a value in [0,1] onto the integer grid of a single dimension.
#[inline]
fn quantize(v: f32) -> u64 {
    let scaled = (v as f64 * (1u64 << MORTON_BITS_PER_DIM) as f64) as u64;
    scaled.min(MAX_COORD)
}

/// Computes the Morton code of a position given in unit cube coordinates.
///
/// # Arguments
/// * `p` - The position with all coordinates in [0,1].
#[inline]
pub fn morton_code_unit(p: &Vec3) -> MortonCode {
    (expand_bits(quantize(p[0])) << 2)
        | (expand_bits(quantize(p[1])) << 1)
        | expand_bits(quantize(p[2]))
}

/// Computes the Morton code of the given position normalized into the given bounding volume.
///
/// # Arguments
/// * `bounds` - The bounding volume of the scene.
/// * `p` - The position to encode.
#[inline]
pub fn morton_code(bounds: &AABB, p: &Vec3) -> MortonCode {
    morton_code_unit(&normalize_in_volume(bounds, p))
}

/// Returns the permutation that sorts the given codes ascending, where equal codes are ordered
/// by their index.
pub fn sort_codes(codes: &[MortonCode]) -> Vec<usize> {
    use rayon::prelude::*;

    let mut order: Vec<usize> = (0..codes.len()).collect();
    order.par_sort_unstable_by_key(|&i| (codes[i], i));

    order
}

#[cfg(test)]
mod test {
    use nalgebra_glm::vec3;

    use super::*;

    #[test]
    fn test_expand_bits() {
        assert_eq!(expand_bits(0), 0);
        assert_eq!(expand_bits(1), 1);
        assert_eq!(expand_bits(0b11), 0b1001);
        assert_eq!(expand_bits(0b101), 0b1000001);
        assert_eq!(expand_bits(MAX_COORD).count_ones(), MORTON_BITS_PER_DIM);
    }

    #[test]
    fn test_corners() {
        assert_eq!(morton_code_unit(&vec3(0.0, 0.0, 0.0)), 0);
        assert_eq!(morton_code_unit(&vec3(1.0, 1.0, 1.0)), (1u64 << 63) - 1);

        // x occupies the most significant bit of each triplet
        assert!(morton_code_unit(&vec3(1.0, 0.0, 0.0)) > morton_code_unit(&vec3(0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_normalized_code() {
        let bounds = AABB::from_corners(vec3(-1.0, -1.0, -1.0), vec3(1.0, 1.0, 1.0));

        assert_eq!(morton_code(&bounds, &vec3(-1.0, -1.0, -1.0)), 0);
        assert_eq!(
            morton_code(&bounds, &vec3(10.0, 10.0, 10.0)),
            morton_code_unit(&vec3(1.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_sort_codes_breaks_ties_by_index() {
        let codes = vec![5, 3, 5, 0, 3];
        assert_eq!(sort_codes(&codes), vec![3, 1, 4, 0, 2]);
    }
}
