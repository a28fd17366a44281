//! End-to-end mesh warp: theta -> cell homographies -> sampling grid -> resampled image.

use meshwarp_tensor::{Backend, CpuBackend, Tensor2, Tensor3, Tensor4, Tensor5};

use crate::config::MeshWarpConfig;
use crate::error::MeshWarpError;
use crate::grid::{build_sampling_grid, sampling_grid_backward, CoordinateMaps};
use crate::mask::validity_mask;
use crate::mesh::{
    assemble_homographies, assemble_homographies_backward, check_theta, MeshHomographies,
};
use crate::sampler::{bilinear_sample, bilinear_sample_backward};

/// The result of a mesh warp.
#[derive(Debug, Clone)]
pub struct WarpOutput {
    /// The warped image `[batch, height, width, channels]`.
    pub image: Tensor4<f32>,
    /// `true` where the sampled coordinate fell outside the source image, `[batch, height, width]`.
    pub mask: Tensor3<bool>,
    /// The sampling coordinates `[batch, height, width, 2]`, `x` first.
    pub coords: Tensor4<f32>,
}

/// Forward intermediates kept for [`MeshWarp::backward`].
#[derive(Debug, Clone)]
pub struct WarpTape {
    /// The source image of the forward pass.
    pub image: Tensor4<f32>,
    /// The cell homographies and their solver state.
    pub mesh: MeshHomographies,
    /// The sampling coordinates.
    pub maps: CoordinateMaps,
}

/// Cotangents of the inputs of a mesh warp.
#[derive(Debug, Clone)]
pub struct WarpGradients {
    /// Cotangent of the source image `[batch, src_height, src_width, channels]`.
    pub image: Tensor4<f32>,
    /// Cotangent of the control points `[batch, grid_h + 1, grid_w + 1, 2]`.
    pub theta: Tensor4<f32>,
}

/// Mesh-based image warper.
///
/// Holds a compute backend and a validated configuration.
///
/// # Example
///
/// ```
/// use meshwarp::{config::MeshWarpConfig, mesh::canonical_mesh, transform::MeshWarp};
/// use meshwarp_tensor::{CpuBackend, Tensor4};
///
/// let config = MeshWarpConfig::new(2, 2, 8, 8);
/// let warp = MeshWarp::new(CpuBackend::new(), config.clone()).unwrap();
///
/// let image = Tensor4::from_shape_val([1, 8, 8, 3], 0.5f32);
/// let theta = canonical_mesh(1, &config);
///
/// let out = warp.transform(&image, &theta).unwrap();
/// assert_eq!(out.image.shape, [1, 8, 8, 3]);
/// assert_eq!(out.coords.shape, [1, 8, 8, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct MeshWarp<B: Backend = CpuBackend> {
    backend: B,
    config: MeshWarpConfig,
}

impl<B: Backend> MeshWarp<B> {
    /// Create a warper.
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::InvalidConfig`] if the configuration is invalid.
    pub fn new(backend: B, config: MeshWarpConfig) -> Result<Self, MeshWarpError> {
        config.validate()?;
        log::debug!(
            "mesh warp {}x{} cells, {}x{} output, backend {}",
            config.grid_h,
            config.grid_w,
            config.height,
            config.width,
            backend.name()
        );
        Ok(Self { backend, config })
    }

    /// The warp configuration.
    pub fn config(&self) -> &MeshWarpConfig {
        &self.config
    }

    /// Warp a batch of images with a batch of control-point grids.
    ///
    /// # Arguments
    ///
    /// * `image` - Source images `[batch, src_height, src_width, channels]`.
    /// * `theta` - Control points `[batch, grid_h + 1, grid_w + 1, 2]`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::ShapeMismatch`] if the inputs disagree with each other
    /// or with the configuration.
    pub fn transform(
        &self,
        image: &Tensor4<f32>,
        theta: &Tensor4<f32>,
    ) -> Result<WarpOutput, MeshWarpError> {
        self.transform_with_tape(image, theta).map(|(out, _)| out)
    }

    /// Warp and keep the intermediates needed by [`Self::backward`].
    ///
    /// # Errors
    ///
    /// See [`Self::transform`].
    pub fn transform_with_tape(
        &self,
        image: &Tensor4<f32>,
        theta: &Tensor4<f32>,
    ) -> Result<(WarpOutput, WarpTape), MeshWarpError> {
        check_inputs(image, theta, &self.config)?;

        let mesh = assemble_homographies(&self.backend, theta, &self.config)?;
        let maps = build_sampling_grid(&self.backend, &mesh.homographies, &self.config)?;
        let output = sample_maps(&self.backend, image, &maps, &self.config)?;

        let tape = WarpTape {
            image: image.clone(),
            mesh,
            maps,
        };
        Ok((output, tape))
    }

    /// Propagate cotangents of a warp back to its image and control points.
    ///
    /// # Arguments
    ///
    /// * `tape` - The intermediates of [`Self::transform_with_tape`].
    /// * `grad_output` - Cotangent of the warped image `[batch, height, width, channels]`.
    /// * `grad_coords` - Optional cotangent of the coordinates `[batch, height, width, 2]`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::ShapeMismatch`] if a cotangent does not match the forward
    /// outputs.
    pub fn backward(
        &self,
        tape: &WarpTape,
        grad_output: &Tensor4<f32>,
        grad_coords: Option<&Tensor4<f32>>,
    ) -> Result<WarpGradients, MeshWarpError> {
        let [batch, height, width] = tape.maps.x_map.shape;
        let channels = tape.image.shape[3];

        let expected = [batch, height, width, channels];
        if grad_output.shape != expected {
            return Err(MeshWarpError::shape_mismatch(
                "grad_output",
                &expected,
                &grad_output.shape,
            ));
        }

        let grads = bilinear_sample_backward(
            &self.backend,
            &tape.image,
            tape.maps.x_map.as_slice(),
            tape.maps.y_map.as_slice(),
            [height, width],
            self.config.sampling,
            &Tensor2::from_shape_slice([batch * height * width, channels], grad_output.as_slice())?,
        )?;

        let (mut grad_x, mut grad_y) = (grads.x, grads.y);
        if let Some(grad_coords) = grad_coords {
            let expected = [batch, height, width, 2];
            if grad_coords.shape != expected {
                return Err(MeshWarpError::shape_mismatch(
                    "grad_coords",
                    &expected,
                    &grad_coords.shape,
                ));
            }
            for (p, xy) in grad_coords.as_slice().chunks_exact(2).enumerate() {
                grad_x[p] += xy[0];
                grad_y[p] += xy[1];
            }
        }

        let grad_x = Tensor3::from_shape_vec([batch, height, width], grad_x)?;
        let grad_y = Tensor3::from_shape_vec([batch, height, width], grad_y)?;

        let grad_homographies = sampling_grid_backward(
            &self.backend,
            &tape.mesh.homographies,
            &grad_x,
            &grad_y,
            &self.config,
        )?;
        let grad_theta = assemble_homographies_backward(
            &self.backend,
            &tape.mesh,
            &grad_homographies,
            &self.config,
        )?;

        log::debug!("backward through {batch}x{height}x{width} warp");

        Ok(WarpGradients {
            image: grads.image,
            theta: grad_theta,
        })
    }

    /// Warp every source image with several control-point grids.
    ///
    /// Image `b` is replicated `num_transforms` times; output `b * num_transforms + t`
    /// is image `b` warped by `thetas[b, t]`.
    ///
    /// # Arguments
    ///
    /// * `image` - Source images `[batch, src_height, src_width, channels]`.
    /// * `thetas` - Control points `[batch, num_transforms, grid_h + 1, grid_w + 1, 2]`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::ShapeMismatch`] if the batch sizes differ or the grids
    /// do not match the configuration.
    pub fn batch_transform(
        &self,
        image: &Tensor4<f32>,
        thetas: &Tensor5<f32>,
    ) -> Result<WarpOutput, MeshWarpError> {
        let [batch, num_transforms, rows, cols, two] = thetas.shape;
        if batch != image.shape[0] {
            return Err(MeshWarpError::shape_mismatch(
                "thetas",
                &[image.shape[0], num_transforms, rows, cols, two],
                &thetas.shape,
            ));
        }

        let [_, src_h, src_w, channels] = image.shape;
        let plane = src_h * src_w * channels;
        let indices: Vec<usize> = (0..batch)
            .flat_map(|b| std::iter::repeat(b).take(num_transforms))
            .collect();

        let images = Tensor2::from_shape_slice([batch, plane], image.as_slice())?;
        let replicated = self
            .backend
            .gather(&images, &indices)?
            .reshape([batch * num_transforms, src_h, src_w, channels])?;
        let theta = thetas
            .clone()
            .reshape([batch * num_transforms, rows, cols, two])?;

        self.transform(&replicated, &theta)
    }
}

/// Warp `image` with `theta` on `backend`.
///
/// Stateless counterpart of [`MeshWarp::transform`].
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the inputs do not match it.
pub fn transform<B: Backend>(
    backend: &B,
    image: &Tensor4<f32>,
    theta: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<WarpOutput, MeshWarpError> {
    config.validate()?;
    check_inputs(image, theta, config)?;

    let mesh = assemble_homographies(backend, theta, config)?;
    let maps = build_sampling_grid(backend, &mesh.homographies, config)?;
    sample_maps(backend, image, &maps, config)
}

fn check_inputs(
    image: &Tensor4<f32>,
    theta: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<(), MeshWarpError> {
    if image.shape.iter().any(|&d| d == 0) {
        return Err(MeshWarpError::shape_mismatch(
            "image",
            &image.shape.map(|d| d.max(1)),
            &image.shape,
        ));
    }

    let batch = check_theta(theta, config)?;
    if batch != image.shape[0] {
        let (rows, cols) = config.mesh_size();
        return Err(MeshWarpError::shape_mismatch(
            "theta",
            &[image.shape[0], rows, cols, 2],
            &theta.shape,
        ));
    }
    Ok(())
}

fn sample_maps<B: Backend>(
    backend: &B,
    image: &Tensor4<f32>,
    maps: &CoordinateMaps,
    config: &MeshWarpConfig,
) -> Result<WarpOutput, MeshWarpError> {
    let [batch, height, width] = maps.x_map.shape;
    let channels = image.shape[3];

    let samples = bilinear_sample(
        backend,
        image,
        maps.x_map.as_slice(),
        maps.y_map.as_slice(),
        [height, width],
        config.sampling,
    )?;

    let mask = validity_mask(&maps.x_map, &maps.y_map)?;
    let invalid = mask.iter().filter(|&&m| m).count();
    if invalid > 0 {
        log::debug!("{invalid} of {} samples fall outside the source image", mask.numel());
    }

    Ok(WarpOutput {
        image: samples.reshape([batch, height, width, channels])?,
        mask,
        coords: maps.stacked(),
    })
}
