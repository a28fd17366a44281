//! Differentiable bilinear sampling.
//!
//! Queries are normalized `[-1, 1]` coordinates. Each query blends the four integer
//! neighbours of its rescaled position; neighbour indices are clamped to the image so
//! that queries outside the image replicate the edge pixels.

use meshwarp_tensor::{ops, Backend, Tensor2, Tensor3, Tensor4};
use rayon::prelude::*;

use crate::config::SamplingConvention;
use crate::error::MeshWarpError;

/// Neighbour rows and blending weights of a single query.
///
/// The neighbours are ordered `(x0, y0)`, `(x0, y1)`, `(x1, y0)`, `(x1, y1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Neighbours {
    rows: [usize; 4],
    weights: [f32; 4],
    fx: f32,
    fy: f32,
}

impl Neighbours {
    fn new(
        x: f32,
        y: f32,
        base: usize,
        height: usize,
        width: usize,
        convention: SamplingConvention,
    ) -> Self {
        let xs = (x + 1.0) * convention.scale(width);
        let ys = (y + 1.0) * convention.scale(height);

        let (xf, yf) = (xs.floor(), ys.floor());
        let (fx, fy) = (xs - xf, ys - yf);

        // negative and NaN saturate to zero
        let clamp = |v: f32, size: usize| (v.max(0.0) as usize).min(size - 1);
        let (x0, x1) = (clamp(xf, width), clamp(xf + 1.0, width));
        let (y0, y1) = (clamp(yf, height), clamp(yf + 1.0, height));

        Self {
            rows: [
                base + y0 * width + x0,
                base + y1 * width + x0,
                base + y0 * width + x1,
                base + y1 * width + x1,
            ],
            weights: [
                (1.0 - fx) * (1.0 - fy),
                (1.0 - fx) * fy,
                fx * (1.0 - fy),
                fx * fy,
            ],
            fx,
            fy,
        }
    }
}

/// Cotangents produced by [`bilinear_sample_backward`].
#[derive(Debug, Clone)]
pub struct SamplerGrads {
    /// Cotangent of the source image `[batch, height, width, channels]`.
    pub image: Tensor4<f32>,
    /// Cotangent of the horizontal query coordinates.
    pub x: Vec<f32>,
    /// Cotangent of the vertical query coordinates.
    pub y: Vec<f32>,
}

fn image_rows(image: &Tensor4<f32>) -> Result<Tensor2<f32>, MeshWarpError> {
    let [b, h, w, c] = image.shape;
    Ok(Tensor2::from_shape_slice([b * h * w, c], image.as_slice())?)
}

fn neighbours(
    image: &Tensor4<f32>,
    x: &[f32],
    y: &[f32],
    out_size: [usize; 2],
    convention: SamplingConvention,
) -> Result<Vec<Neighbours>, MeshWarpError> {
    let [batch, height, width, channels] = image.shape;
    if batch == 0 || height == 0 || width == 0 || channels == 0 {
        return Err(MeshWarpError::shape_mismatch(
            "image",
            &[batch.max(1), height.max(1), width.max(1), channels.max(1)],
            &image.shape,
        ));
    }

    let num_queries = batch * out_size[0] * out_size[1];
    if x.len() != num_queries {
        return Err(MeshWarpError::shape_mismatch("x", &[num_queries], &[x.len()]));
    }
    if y.len() != num_queries {
        return Err(MeshWarpError::shape_mismatch("y", &[num_queries], &[y.len()]));
    }

    let per_batch = (out_size[0] * out_size[1]).max(1);
    Ok(x.par_iter()
        .zip(y.par_iter())
        .enumerate()
        .map(|(q, (&xq, &yq))| {
            let base = (q / per_batch) * height * width;
            Neighbours::new(xq, yq, base, height, width, convention)
        })
        .collect())
}

/// Sample `image` at normalized coordinates.
///
/// # Arguments
///
/// * `backend` - The compute backend used for the neighbour gathers.
/// * `image` - The source image `[batch, height, width, channels]`.
/// * `x` - Horizontal query coordinates, `batch * out_h * out_w` values.
/// * `y` - Vertical query coordinates, `batch * out_h * out_w` values.
/// * `out_size` - The output size `[out_h, out_w]`.
/// * `convention` - How `[-1, 1]` is rescaled to pixel coordinates.
///
/// # Returns
///
/// The sampled pixels `[batch * out_h * out_w, channels]`.
///
/// # Errors
///
/// Returns [`MeshWarpError::ShapeMismatch`] if the image is empty or the number of
/// queries does not match `batch * out_h * out_w`.
pub fn bilinear_sample<B: Backend>(
    backend: &B,
    image: &Tensor4<f32>,
    x: &[f32],
    y: &[f32],
    out_size: [usize; 2],
    convention: SamplingConvention,
) -> Result<Tensor2<f32>, MeshWarpError> {
    let queries = neighbours(image, x, y, out_size, convention)?;
    let channels = image.shape[3];
    let src = image_rows(image)?;

    let mut out = Tensor2::<f32>::zeros([queries.len(), channels]);
    for k in 0..4 {
        let rows: Vec<usize> = queries.iter().map(|n| n.rows[k]).collect();
        let gathered = backend.gather(&src, &rows)?;

        out.as_slice_mut()
            .par_chunks_exact_mut(channels)
            .zip(gathered.as_slice().par_chunks_exact(channels))
            .zip(queries.par_iter())
            .for_each(|((dst, px), n)| {
                let w = n.weights[k];
                dst.iter_mut().zip(px).for_each(|(d, &p)| *d += w * p);
            });
    }

    Ok(out)
}

/// Propagate a cotangent of the sampled pixels back to the image and the coordinates.
///
/// The image cotangent scatters the weighted output cotangent onto the four gathered
/// rows. The coordinate cotangents follow the weight derivatives and vanish where the
/// neighbours are clamped together.
///
/// # Arguments
///
/// * `backend` - The compute backend.
/// * `image` - The source image of the forward call.
/// * `x` - Horizontal query coordinates of the forward call.
/// * `y` - Vertical query coordinates of the forward call.
/// * `out_size` - The output size `[out_h, out_w]`.
/// * `convention` - The convention of the forward call.
/// * `grad_output` - Cotangent of the samples `[batch * out_h * out_w, channels]`.
///
/// # Errors
///
/// Returns an error if any shape disagrees with the forward call.
pub fn bilinear_sample_backward<B: Backend>(
    backend: &B,
    image: &Tensor4<f32>,
    x: &[f32],
    y: &[f32],
    out_size: [usize; 2],
    convention: SamplingConvention,
    grad_output: &Tensor2<f32>,
) -> Result<SamplerGrads, MeshWarpError> {
    let queries = neighbours(image, x, y, out_size, convention)?;
    let [batch, height, width, channels] = image.shape;
    let expected = [queries.len(), channels];
    if grad_output.shape != expected {
        return Err(MeshWarpError::shape_mismatch(
            "grad_output",
            &expected,
            &grad_output.shape,
        ));
    }

    let src = image_rows(image)?;
    let num_rows = batch * height * width;
    let g = grad_output.as_slice();

    let mut grad_image = Tensor2::<f32>::zeros([num_rows, channels]);
    let mut pixels = Vec::with_capacity(4);
    for k in 0..4 {
        let rows: Vec<usize> = queries.iter().map(|n| n.rows[k]).collect();
        let weighted = Tensor2::from_shape_fn(expected, |[q, c]| {
            queries[q].weights[k] * g[q * channels + c]
        });
        let scattered = backend.scatter_add(&weighted, &rows, num_rows)?;
        ops::add_inplace(&mut grad_image, &scattered)?;
        pixels.push(backend.gather(&src, &rows)?);
    }

    let (sx, sy) = (convention.scale(width), convention.scale(height));
    let (grad_x, grad_y): (Vec<f32>, Vec<f32>) = queries
        .par_iter()
        .enumerate()
        .map(|(q, n)| {
            let range = q * channels..(q + 1) * channels;
            let [pa, pb, pc, pd] = [0, 1, 2, 3].map(|k| &pixels[k].as_slice()[range.clone()]);
            let (mut gx, mut gy) = (0.0f32, 0.0f32);
            for c in 0..channels {
                let dfx = (1.0 - n.fy) * (pc[c] - pa[c]) + n.fy * (pd[c] - pb[c]);
                let dfy = (1.0 - n.fx) * (pb[c] - pa[c]) + n.fx * (pd[c] - pc[c]);
                gx += g[q * channels + c] * dfx;
                gy += g[q * channels + c] * dfy;
            }
            (gx * sx, gy * sy)
        })
        .unzip();

    Ok(SamplerGrads {
        image: grad_image.reshape([batch, height, width, channels])?,
        x: grad_x,
        y: grad_y,
    })
}

/// Sample `image` at the coordinate maps and restore the spatial layout.
///
/// # Arguments
///
/// * `backend` - The compute backend.
/// * `image` - The source image `[batch, height, width, channels]`.
/// * `x_map` - Horizontal coordinates `[batch, out_h, out_w]`.
/// * `y_map` - Vertical coordinates `[batch, out_h, out_w]`.
/// * `convention` - How `[-1, 1]` is rescaled to pixel coordinates.
///
/// # Returns
///
/// The resampled image `[batch, out_h, out_w, channels]`.
///
/// # Errors
///
/// Returns an error if the maps disagree with each other or with the image batch.
///
/// # Example
///
/// ```
/// use meshwarp::{config::SamplingConvention, sampler::interpolate};
/// use meshwarp_tensor::{CpuBackend, Tensor3, Tensor4};
///
/// let image = Tensor4::from_shape_vec([1, 1, 2, 1], vec![0.0f32, 10.0]).unwrap();
/// let x = Tensor3::from_shape_vec([1, 1, 3], vec![-1.0f32, 0.0, 1.0]).unwrap();
/// let y = Tensor3::from_shape_vec([1, 1, 3], vec![0.0f32; 3]).unwrap();
///
/// let out = interpolate(&CpuBackend::new(), &image, &x, &y, SamplingConvention::AlignCorners)
///     .unwrap();
/// assert_eq!(out.shape, [1, 1, 3, 1]);
/// assert_eq!(out.as_slice(), &[0.0, 5.0, 10.0]);
/// ```
pub fn interpolate<B: Backend>(
    backend: &B,
    image: &Tensor4<f32>,
    x_map: &Tensor3<f32>,
    y_map: &Tensor3<f32>,
    convention: SamplingConvention,
) -> Result<Tensor4<f32>, MeshWarpError> {
    if x_map.shape != y_map.shape {
        return Err(MeshWarpError::shape_mismatch(
            "y_map",
            &x_map.shape,
            &y_map.shape,
        ));
    }

    let [batch, out_h, out_w] = x_map.shape;
    if batch != image.shape[0] {
        return Err(MeshWarpError::shape_mismatch(
            "x_map",
            &[image.shape[0], out_h, out_w],
            &x_map.shape,
        ));
    }

    let samples = bilinear_sample(
        backend,
        image,
        x_map.as_slice(),
        y_map.as_slice(),
        [out_h, out_w],
        convention,
    )?;

    Ok(samples.reshape([batch, out_h, out_w, image.shape[3]])?)
}
