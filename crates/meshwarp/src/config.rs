use serde::{Deserialize, Serialize};

use crate::error::MeshWarpError;

/// Tikhonov term added to the diagonal of the homography system before inversion.
pub const DEFAULT_REGULARIZATION: f32 = 1e-4;

/// Magnitude of the signed epsilon added to the homogeneous coordinate before division.
pub const HOMOGENEOUS_EPSILON: f32 = 1e-8;

/// 1-norm condition number above which a homography system is reported.
pub const DEFAULT_CONDITION_WARN_THRESHOLD: f64 = 1e7;

/// How normalized `[-1, 1]` coordinates are rescaled to pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingConvention {
    /// `-1` and `1` land on the outer image extent: `x' = (x + 1) * W / 2`.
    #[default]
    Extent,
    /// `-1` and `1` land on the centres of the first and last pixels:
    /// `x' = (x + 1) * (W - 1) / 2`.
    AlignCorners,
}

impl SamplingConvention {
    /// Returns the factor `s` in `x' = (x + 1) * s` for an axis of `size` pixels.
    #[inline]
    pub fn scale(&self, size: usize) -> f32 {
        match self {
            SamplingConvention::Extent => size as f32 / 2.0,
            SamplingConvention::AlignCorners => (size as f32 - 1.0) / 2.0,
        }
    }
}

fn default_regularization() -> f32 {
    DEFAULT_REGULARIZATION
}

fn default_homogeneous_epsilon() -> f32 {
    HOMOGENEOUS_EPSILON
}

fn default_condition_warn_threshold() -> f64 {
    DEFAULT_CONDITION_WARN_THRESHOLD
}

/// Static configuration of a mesh warp.
///
/// The grid resolution and the output size are fixed per model and threaded through
/// every component explicitly.
///
/// # Example
///
/// ```
/// use meshwarp::config::{MeshWarpConfig, SamplingConvention};
///
/// let config = MeshWarpConfig::from_json_str(
///     r#"{ "grid_h": 4, "grid_w": 4, "height": 288, "width": 512 }"#,
/// ).unwrap();
///
/// assert_eq!(config.regularization, 1e-4);
/// assert_eq!(config.sampling, SamplingConvention::Extent);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshWarpConfig {
    /// Number of mesh cells along the vertical axis.
    pub grid_h: usize,
    /// Number of mesh cells along the horizontal axis.
    pub grid_w: usize,
    /// Output image height in pixels.
    pub height: usize,
    /// Output image width in pixels.
    pub width: usize,
    /// Value added to the diagonal of each homography system.
    #[serde(default = "default_regularization")]
    pub regularization: f32,
    /// Signed epsilon added to the homogeneous coordinate before division.
    #[serde(default = "default_homogeneous_epsilon")]
    pub homogeneous_epsilon: f32,
    /// Coordinate rescaling used by the bilinear sampler.
    #[serde(default)]
    pub sampling: SamplingConvention,
    /// Condition number above which the homography solver logs a warning.
    #[serde(default = "default_condition_warn_threshold")]
    pub condition_warn_threshold: f64,
}

impl MeshWarpConfig {
    /// Create a configuration with the default numeric settings.
    ///
    /// # Arguments
    ///
    /// * `grid_h` - Number of mesh cells along the vertical axis.
    /// * `grid_w` - Number of mesh cells along the horizontal axis.
    /// * `height` - Output height in pixels.
    /// * `width` - Output width in pixels.
    pub fn new(grid_h: usize, grid_w: usize, height: usize, width: usize) -> Self {
        Self {
            grid_h,
            grid_w,
            height,
            width,
            regularization: DEFAULT_REGULARIZATION,
            homogeneous_epsilon: HOMOGENEOUS_EPSILON,
            sampling: SamplingConvention::default(),
            condition_warn_threshold: DEFAULT_CONDITION_WARN_THRESHOLD,
        }
    }

    /// Override the regularization term of the homography solver.
    pub fn with_regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }

    /// Override the sampling convention.
    pub fn with_sampling(mut self, sampling: SamplingConvention) -> Self {
        self.sampling = sampling;
        self
    }

    /// Parse and validate a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or the configuration is invalid.
    pub fn from_json_str(json: &str) -> Result<Self, MeshWarpError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of mesh vertices along each axis, `(grid_h + 1, grid_w + 1)`.
    pub fn mesh_size(&self) -> (usize, usize) {
        (self.grid_h + 1, self.grid_w + 1)
    }

    /// Check that the configuration describes a usable mesh.
    ///
    /// # Errors
    ///
    /// * The grid and output sizes must be positive.
    /// * The output must have at least one pixel per cell on each axis.
    /// * The numeric settings must be finite; the epsilon must be positive.
    pub fn validate(&self) -> Result<(), MeshWarpError> {
        if self.grid_h == 0 || self.grid_w == 0 {
            return Err(MeshWarpError::InvalidConfig(format!(
                "grid size must be positive, got {}x{}",
                self.grid_h, self.grid_w
            )));
        }

        if self.height < self.grid_h || self.width < self.grid_w {
            return Err(MeshWarpError::InvalidConfig(format!(
                "output size {}x{} is smaller than the grid {}x{}",
                self.height, self.width, self.grid_h, self.grid_w
            )));
        }

        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(MeshWarpError::InvalidConfig(format!(
                "regularization must be finite and non-negative, got {}",
                self.regularization
            )));
        }

        if !self.homogeneous_epsilon.is_finite() || self.homogeneous_epsilon <= 0.0 {
            return Err(MeshWarpError::InvalidConfig(format!(
                "homogeneous epsilon must be finite and positive, got {}",
                self.homogeneous_epsilon
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_sizes() {
        assert!(MeshWarpConfig::new(2, 3, 8, 9).validate().is_ok());
        assert!(MeshWarpConfig::new(1, 1, 1, 1).validate().is_ok());

        assert!(MeshWarpConfig::new(0, 1, 4, 4).validate().is_err());
        assert!(MeshWarpConfig::new(5, 1, 4, 4).validate().is_err());
        assert!(MeshWarpConfig::new(1, 5, 4, 4).validate().is_err());
    }

    #[test]
    fn validate_numeric_settings() {
        let config = MeshWarpConfig::new(1, 1, 4, 4);
        assert!(config.clone().with_regularization(0.0).validate().is_ok());
        assert!(config.clone().with_regularization(-1.0).validate().is_err());
        assert!(config
            .clone()
            .with_regularization(f32::NAN)
            .validate()
            .is_err());

        let mut config = config;
        config.homogeneous_epsilon = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_overrides() -> Result<(), MeshWarpError> {
        let config = MeshWarpConfig::from_json_str(
            r#"{
                "grid_h": 2, "grid_w": 2, "height": 16, "width": 16,
                "regularization": 0.0, "sampling": "align_corners"
            }"#,
        )?;
        assert_eq!(config.regularization, 0.0);
        assert_eq!(config.sampling, SamplingConvention::AlignCorners);
        assert_eq!(config.homogeneous_epsilon, HOMOGENEOUS_EPSILON);
        assert_eq!(config.mesh_size(), (3, 3));

        let invalid = MeshWarpConfig::from_json_str(r#"{ "grid_h": 2 }"#);
        assert!(matches!(invalid, Err(MeshWarpError::Config(_))));

        let too_small =
            MeshWarpConfig::from_json_str(r#"{ "grid_h": 8, "grid_w": 8, "height": 4, "width": 4 }"#);
        assert!(matches!(too_small, Err(MeshWarpError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn defaults_rescale_to_the_image_extent() {
        let config = MeshWarpConfig::new(1, 1, 4, 4);
        assert_eq!(config.sampling, SamplingConvention::Extent);
        assert_eq!(config.sampling.scale(4), 2.0);
    }

    #[test]
    fn sampling_scale() {
        assert_eq!(SamplingConvention::AlignCorners.scale(5), 2.0);
        assert_eq!(SamplingConvention::Extent.scale(5), 2.5);
    }
}
