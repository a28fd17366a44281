#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! A `(grid_h + 1) x (grid_w + 1)` mesh of predicted control points defines one
//! homography per grid cell. The cell homographies are stitched into a dense sampling
//! grid, the source image is resampled bilinearly and a mask marks the output pixels
//! whose source coordinate fell outside the image. Every stage has a reverse-mode
//! counterpart so the warp can sit inside a learning pipeline.
//!
//! ```rust
//! use meshwarp::{canonical_mesh, MeshWarp, MeshWarpConfig};
//! use meshwarp_tensor::{CpuBackend, Tensor4};
//!
//! let config = MeshWarpConfig::new(4, 4, 16, 16);
//! let warp = MeshWarp::new(CpuBackend::new(), config.clone()).unwrap();
//!
//! let image = Tensor4::from_shape_val([2, 32, 32, 3], 1.0f32);
//! let out = warp.transform(&image, &canonical_mesh(2, &config)).unwrap();
//!
//! assert_eq!(out.image.shape, [2, 16, 16, 3]);
//! assert_eq!(out.mask.shape, [2, 16, 16]);
//! ```

/// warp configuration module.
pub mod config;

/// error types for the mesh warp.
pub mod error;

/// piecewise sampling grid module.
pub mod grid;

/// 4-point homography solver module.
pub mod homography;

/// validity mask module.
pub mod mask;

/// control-point mesh and cell homographies module.
pub mod mesh;

/// bilinear sampling module.
pub mod sampler;

/// end-to-end warp module.
pub mod transform;

pub use crate::config::{MeshWarpConfig, SamplingConvention};
pub use crate::error::MeshWarpError;
pub use crate::grid::{CellGrid, CoordinateMaps};
pub use crate::mask::mask_to_float;
pub use crate::mesh::canonical_mesh;
pub use crate::sampler::interpolate;
pub use crate::transform::{transform, MeshWarp, WarpGradients, WarpOutput, WarpTape};
