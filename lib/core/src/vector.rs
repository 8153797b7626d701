use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Dense learned embedding of an image, tagged with the model that produced it.
/// Vectors from different model versions are never compared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    data: Vec<f32>,
    model_version: String,
}

impl FeatureVector {
    #[inline]
    #[must_use]
    pub fn new(data: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            data,
            model_version: model_version.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn into_parts(self) -> (Vec<f32>, String) {
        (self.data, self.model_version)
    }

    /// Fails unless both vectors come from the same model and have equal length.
    pub fn check_compatible(&self, other: &FeatureVector) -> Result<()> {
        if self.model_version != other.model_version || self.dim() != other.dim() {
            return Err(Error::IncompatibleFeatures {
                left: format!("{}[{}]", self.model_version, self.dim()),
                right: format!("{}[{}]", other.model_version, other.dim()),
            });
        }
        Ok(())
    }

    /// Cosine similarity in [-1, 1]; 0 when either side has zero norm.
    #[inline]
    pub fn cosine_similarity(&self, other: &FeatureVector) -> Result<f32> {
        self.check_compatible(other)?;
        let dot = crate::simd::dot_product_simd(&self.data, &other.data);
        let norm_a = crate::simd::norm_simd(&self.data);
        let norm_b = crate::simd::norm_simd(&other.data);
        if norm_a == 0.0 || norm_b == 0.0 {
            return Ok(0.0);
        }
        Ok((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
    }

    /// `1 - cosine_similarity`, in [0, 2].
    #[inline]
    pub fn cosine_distance(&self, other: &FeatureVector) -> Result<f32> {
        Ok(1.0 - self.cosine_similarity(other)?)
    }

    #[inline]
    pub fn l2_distance(&self, other: &FeatureVector) -> Result<f32> {
        self.check_compatible(other)?;
        Ok(crate::simd::l2_squared_simd(&self.data, &other.data).sqrt())
    }

    /// Scales to unit length in place; near-zero vectors are left untouched.
    #[inline]
    pub fn normalize(&mut self) {
        let norm = crate::simd::norm_simd(&self.data);
        if norm > f32::EPSILON {
            let inv_norm = 1.0 / norm;
            for x in &mut self.data {
                *x *= inv_norm;
            }
        }
    }
}
