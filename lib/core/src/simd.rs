// Distance kernels shared by fingerprints and feature vectors.
// AVX2 paths are taken when available and the input is long enough to amortise the dispatch.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "x86_64")]
const MIN_DIM_SIZE_AVX: usize = 32;

/// Number of differing bits between two equally long word slices.
#[inline]
pub fn hamming_words(a: &[u64], b: &[u64]) -> u32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("popcnt") {
            return unsafe { hamming_popcnt(a, b) };
        }
    }

    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "popcnt")]
#[inline]
unsafe fn hamming_popcnt(a: &[u64], b: &[u64]) -> u32 {
    let mut total = 0u32;
    for (x, y) in a.iter().zip(b) {
        total += _popcnt64((x ^ y) as i64) as u32;
    }
    total
}

/// Dot product; 0.0 for mismatched lengths.
#[inline]
pub fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
            && a.len() >= MIN_DIM_SIZE_AVX
        {
            return unsafe { dot_product_avx2(a, b) };
        }
    }

    dot_product_scalar(a, b)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    let dim = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= dim {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        sum = _mm256_fmadd_ps(va, vb, sum);
        i += 8;
    }

    let mut dot = horizontal_sum(sum);
    while i < dim {
        dot += a[i] * b[i];
        i += 1;
    }
    dot
}

/// Squared Euclidean distance; infinity for mismatched lengths.
#[inline]
pub fn l2_squared_simd(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
            && a.len() >= MIN_DIM_SIZE_AVX
        {
            return unsafe { l2_squared_avx2(a, b) };
        }
    }

    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[inline]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    let dim = a.len();
    let mut i = 0;
    let mut sum = _mm256_setzero_ps();

    while i + 8 <= dim {
        let diff = _mm256_sub_ps(
            _mm256_loadu_ps(a.as_ptr().add(i)),
            _mm256_loadu_ps(b.as_ptr().add(i)),
        );
        sum = _mm256_fmadd_ps(diff, diff, sum);
        i += 8;
    }

    let mut total = horizontal_sum(sum);
    while i < dim {
        let d = a[i] - b[i];
        total += d * d;
        i += 1;
    }
    total
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn horizontal_sum(v: __m256) -> f32 {
    let high = _mm256_extractf128_ps(v, 1);
    let low = _mm256_castps256_ps128(v);
    let mut s = _mm_add_ps(high, low);
    s = _mm_hadd_ps(s, s);
    s = _mm_hadd_ps(s, s);
    _mm_cvtss_f32(s)
}

#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut dot0 = 0.0f32;
    let mut dot1 = 0.0f32;

    let chunks = a.chunks_exact(4);
    let remainder = chunks.remainder();
    for (x, y) in chunks.zip(b.chunks_exact(4)) {
        dot0 += x[0] * y[0] + x[1] * y[1];
        dot1 += x[2] * y[2] + x[3] * y[3];
    }
    let tail = a.len() - remainder.len();
    for i in tail..a.len() {
        dot0 += a[i] * b[i];
    }
    dot0 + dot1
}

#[inline]
pub fn norm_simd(v: &[f32]) -> f32 {
    dot_product_simd(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_words() {
        assert_eq!(hamming_words(&[0, 0], &[0, 0]), 0);
        assert_eq!(hamming_words(&[0b1011, u64::MAX], &[0b0001, 0]), 66);
    }

    #[test]
    fn test_dot_and_l2_match_scalar_on_long_input() {
        let a: Vec<f32> = (0..67).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..67).map(|i| 1.0 - i as f32 * 0.25).collect();

        let expected_dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot_product_simd(&a, &b) - expected_dot).abs() < 1e-2);

        let expected_l2: f32 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
        assert!((l2_squared_simd(&a, &b) - expected_l2).abs() < 1e-1);
    }

    #[test]
    fn test_mismatched_lengths() {
        assert_eq!(dot_product_simd(&[1.0], &[1.0, 2.0]), 0.0);
        assert!(l2_squared_simd(&[1.0], &[1.0, 2.0]).is_infinite());
    }
}
