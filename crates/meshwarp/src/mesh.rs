//! Mesh of control points and the per-cell homographies it induces.
//!
//! The mesh has `(grid_h + 1) x (grid_w + 1)` vertices. Cell `(i, j)` is bounded by
//! the vertices `(i, j)`, `(i, j + 1)`, `(i + 1, j)` and `(i + 1, j + 1)`, in that order.

use meshwarp_tensor::{Backend, Tensor2, Tensor4};

use crate::config::MeshWarpConfig;
use crate::error::MeshWarpError;
use crate::homography::{HomographyBatch, HomographySolver};

/// Offsets `(di, dj)` of the four vertices of a cell, in correspondence order.
const CORNER_OFFSETS: [(usize, usize); 4] = [(0, 0), (0, 1), (1, 0), (1, 1)];

/// The homographies of every mesh cell together with what their backward pass needs.
#[derive(Debug, Clone)]
pub struct MeshHomographies {
    /// Per-cell homographies `[batch, grid_h, grid_w, 9]`.
    pub homographies: Tensor4<f32>,
    /// Canonical source corners `[batch * grid_h * grid_w, 8]`.
    pub src: Tensor2<f32>,
    /// Predicted target corners `[batch * grid_h * grid_w, 8]`.
    pub dst: Tensor2<f32>,
    /// The solver output, including the regularized inverses.
    pub solution: HomographyBatch,
}

/// Canonical corners `[x0, y0, x1, y1, x2, y2, x3, y3]` of cell `(i, j)`.
///
/// The cell spans `2 / grid_w` horizontally and `2 / grid_h` vertically in normalized
/// coordinates, starting from `(-1, -1)`.
pub fn canonical_corners(i: usize, j: usize, grid_h: usize, grid_w: usize) -> [f32; 8] {
    let h = 2.0 / grid_h as f32;
    let w = 2.0 / grid_w as f32;
    let hh = i as f32 * h - 1.0;
    let ww = j as f32 * w - 1.0;
    [ww, hh, ww + w, hh, ww, hh + h, ww + w, hh + h]
}

/// Build the undisplaced control-point grid `[batch, grid_h + 1, grid_w + 1, 2]`.
///
/// Vertex `(i, j)` sits at `(j * 2 / grid_w - 1, i * 2 / grid_h - 1)`, so the mesh
/// describes the identity warp.
///
/// # Example
///
/// ```
/// use meshwarp::{config::MeshWarpConfig, mesh::canonical_mesh};
///
/// let theta = canonical_mesh(1, &MeshWarpConfig::new(1, 2, 8, 8));
/// assert_eq!(theta.shape, [1, 2, 3, 2]);
/// assert_eq!(theta.as_slice()[..6], [-1.0, -1.0, 0.0, -1.0, 1.0, -1.0]);
/// ```
pub fn canonical_mesh(batch: usize, config: &MeshWarpConfig) -> Tensor4<f32> {
    let (rows, cols) = config.mesh_size();
    let (gh, gw) = (config.grid_h as f32, config.grid_w as f32);
    Tensor4::from_shape_fn([batch, rows, cols, 2], |[_, i, j, c]| match c {
        0 => j as f32 * 2.0 / gw - 1.0,
        _ => i as f32 * 2.0 / gh - 1.0,
    })
}

/// Check that `theta` is `[batch, grid_h + 1, grid_w + 1, 2]` and return the batch size.
pub fn check_theta(theta: &Tensor4<f32>, config: &MeshWarpConfig) -> Result<usize, MeshWarpError> {
    let (rows, cols) = config.mesh_size();
    let batch = theta.shape[0];
    if theta.shape[1..] != [rows, cols, 2] {
        return Err(MeshWarpError::shape_mismatch(
            "theta",
            &[batch, rows, cols, 2],
            &theta.shape,
        ));
    }
    Ok(batch)
}

#[inline]
fn vertex_offset(b: usize, i: usize, j: usize, rows: usize, cols: usize) -> usize {
    ((b * rows + i) * cols + j) * 2
}

/// Derive the correspondences of every `(batch, cell)` pair and solve their homographies.
///
/// Systems are ordered `(b, i, j)` row-major so the solver output reshapes directly to
/// `[batch, grid_h, grid_w, 9]`.
///
/// # Arguments
///
/// * `backend` - The compute backend.
/// * `theta` - Predicted control points `[batch, grid_h + 1, grid_w + 1, 2]`.
/// * `config` - The warp configuration.
///
/// # Errors
///
/// Returns [`MeshWarpError::ShapeMismatch`] if `theta` does not match the mesh.
pub fn assemble_homographies<B: Backend>(
    backend: &B,
    theta: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<MeshHomographies, MeshWarpError> {
    let batch = check_theta(theta, config)?;
    let (gh, gw) = (config.grid_h, config.grid_w);
    let (rows, cols) = config.mesh_size();
    let n = batch * gh * gw;

    let points = theta.as_slice();
    let mut src = Vec::with_capacity(n * 8);
    let mut dst = Vec::with_capacity(n * 8);

    for b in 0..batch {
        for i in 0..gh {
            for j in 0..gw {
                src.extend_from_slice(&canonical_corners(i, j, gh, gw));
                for (di, dj) in CORNER_OFFSETS {
                    let offset = vertex_offset(b, i + di, j + dj, rows, cols);
                    dst.extend_from_slice(&points[offset..offset + 2]);
                }
            }
        }
    }

    let src = Tensor2::from_shape_vec([n, 8], src)?;
    let dst = Tensor2::from_shape_vec([n, 8], dst)?;

    log::debug!("solving {n} cell homographies ({batch} x {gh}x{gw})");
    let solution = HomographySolver::from_config(config).solve(backend, &src, &dst)?;
    let homographies = solution.homographies.clone().reshape([batch, gh, gw, 9])?;

    Ok(MeshHomographies {
        homographies,
        src,
        dst,
        solution,
    })
}

/// Propagate a cotangent of the cell homographies back to the control points.
///
/// Interior vertices are shared by up to four cells; their contributions are summed.
///
/// # Arguments
///
/// * `backend` - The compute backend.
/// * `mesh` - The forward result of [`assemble_homographies`].
/// * `grad_homographies` - Cotangent `[batch, grid_h, grid_w, 9]`.
/// * `config` - The warp configuration.
///
/// # Returns
///
/// The cotangent of `theta`, `[batch, grid_h + 1, grid_w + 1, 2]`.
///
/// # Errors
///
/// Returns an error if the cotangent shape does not match the forward homographies.
pub fn assemble_homographies_backward<B: Backend>(
    backend: &B,
    mesh: &MeshHomographies,
    grad_homographies: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<Tensor4<f32>, MeshWarpError> {
    if grad_homographies.shape != mesh.homographies.shape {
        return Err(MeshWarpError::shape_mismatch(
            "grad_homographies",
            &mesh.homographies.shape,
            &grad_homographies.shape,
        ));
    }

    let [batch, gh, gw, _] = mesh.homographies.shape;
    if [gh, gw] != [config.grid_h, config.grid_w] {
        return Err(MeshWarpError::shape_mismatch(
            "mesh.homographies",
            &[batch, config.grid_h, config.grid_w, 9],
            &mesh.homographies.shape,
        ));
    }

    let (rows, cols) = config.mesh_size();
    let n = batch * gh * gw;
    for (name, cells) in [("mesh.src", &mesh.src), ("mesh.dst", &mesh.dst)] {
        if cells.shape != [n, 8] {
            return Err(MeshWarpError::shape_mismatch(name, &[n, 8], &cells.shape));
        }
    }

    let grad = grad_homographies.clone().reshape([n, 9])?;
    let (_, grad_dst) = HomographySolver::from_config(config).backward(
        backend,
        &mesh.solution,
        &mesh.src,
        &mesh.dst,
        &grad,
    )?;

    let mut grad_theta = Tensor4::<f32>::zeros([batch, rows, cols, 2]);
    let out = grad_theta.as_slice_mut();
    let mut cells = grad_dst.as_slice().chunks_exact(8);

    for b in 0..batch {
        for i in 0..gh {
            for j in 0..gw {
                let Some(cell) = cells.next() else {
                    return Err(MeshWarpError::shape_mismatch(
                        "grad_dst",
                        &[n, 8],
                        &grad_dst.shape,
                    ));
                };
                for (corner, (di, dj)) in CORNER_OFFSETS.into_iter().enumerate() {
                    let offset = vertex_offset(b, i + di, j + dj, rows, cols);
                    out[offset] += cell[2 * corner];
                    out[offset + 1] += cell[2 * corner + 1];
                }
            }
        }
    }

    Ok(grad_theta)
}
