//! Piecewise sampling grid.
//!
//! The output image is split into `grid_h x grid_w` pixel rectangles. Every rectangle is
//! mapped by the homography of its mesh cell; the results are stitched into dense
//! `x_map` / `y_map` coordinate maps in normalized `[-1, 1]` units.

use meshwarp_tensor::{Backend, Tensor2, Tensor3, Tensor4};

use crate::config::MeshWarpConfig;
use crate::error::MeshWarpError;

/// Inclusive pixel rectangle covered by one mesh cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    /// First pixel row.
    pub row_start: usize,
    /// Last pixel row, inclusive.
    pub row_end: usize,
    /// First pixel column.
    pub col_start: usize,
    /// Last pixel column, inclusive.
    pub col_end: usize,
}

impl CellRect {
    /// Number of pixel rows.
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start + 1
    }

    /// Number of pixel columns.
    pub fn cols(&self) -> usize {
        self.col_end - self.col_start + 1
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.rows() * self.cols()
    }

    /// Always false, a cell covers at least one pixel.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the `(row, col)` pixels of the rectangle in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (self.row_start..=self.row_end)
            .flat_map(move |r| (self.col_start..=self.col_end).map(move |c| (r, c)))
    }
}

/// Arena of the pixel rectangles of all cells, indexed by `(i, j)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGrid {
    grid_h: usize,
    grid_w: usize,
    cells: Vec<CellRect>,
}

impl CellGrid {
    /// Partition a `height x width` image into `grid_h x grid_w` cells.
    ///
    /// Bands are `floor(height / grid_h)` rows and `floor(width / grid_w)` columns
    /// tall; the last band on each axis absorbs the remainder.
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::InvalidConfig`] if a band would be empty.
    pub fn new(
        height: usize,
        width: usize,
        grid_h: usize,
        grid_w: usize,
    ) -> Result<Self, MeshWarpError> {
        if grid_h == 0 || grid_w == 0 || height < grid_h || width < grid_w {
            return Err(MeshWarpError::InvalidConfig(format!(
                "cannot split a {height}x{width} image into {grid_h}x{grid_w} cells"
            )));
        }

        let band_h = height / grid_h;
        let band_w = width / grid_w;

        let mut cells = Vec::with_capacity(grid_h * grid_w);
        for i in 0..grid_h {
            let row_end = if i + 1 == grid_h {
                height - 1
            } else {
                (i + 1) * band_h - 1
            };
            for j in 0..grid_w {
                let col_end = if j + 1 == grid_w {
                    width - 1
                } else {
                    (j + 1) * band_w - 1
                };
                cells.push(CellRect {
                    row_start: i * band_h,
                    row_end,
                    col_start: j * band_w,
                    col_end,
                });
            }
        }

        Ok(Self {
            grid_h,
            grid_w,
            cells,
        })
    }

    /// Partition the configured output size.
    pub fn from_config(config: &MeshWarpConfig) -> Result<Self, MeshWarpError> {
        Self::new(config.height, config.width, config.grid_h, config.grid_w)
    }

    /// The rectangle of cell `(i, j)`, if it exists.
    pub fn cell(&self, i: usize, j: usize) -> Option<&CellRect> {
        if i >= self.grid_h || j >= self.grid_w {
            return None;
        }
        self.cells.get(i * self.grid_w + j)
    }

    /// Iterate `((i, j), rect)` in row-major cell order.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &CellRect)> {
        let grid_w = self.grid_w;
        self.cells
            .iter()
            .enumerate()
            .map(move |(k, rect)| ((k / grid_w, k % grid_w), rect))
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the arena holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// `num` evenly spaced samples over `[start, end]`.
///
/// The last sample is set to `end` exactly; a single sample yields `[start]`.
pub fn linspace(start: f32, end: f32, num: usize) -> Vec<f32> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f32;
            let mut values: Vec<f32> = (0..num).map(|k| start + step * k as f32).collect();
            values[num - 1] = end;
            values
        }
    }
}

/// Homogeneous normalized coordinates `[3, n]` of the pixels of `rect`.
///
/// The samples come from `linspace(-1, 1, width)` and `linspace(-1, 1, height)` over the
/// full image and are sliced to the rectangle without renormalization. Rows are `x`,
/// `y` and ones, pixels are in row-major order.
///
/// # Errors
///
/// Returns an error if the buffer does not fill the `[3, n]` tensor.
pub fn homogeneous_cell_grid(
    height: usize,
    width: usize,
    rect: &CellRect,
) -> Result<Tensor2<f32>, MeshWarpError> {
    let xs = linspace(-1.0, 1.0, width);
    let ys = linspace(-1.0, 1.0, height);
    let n = rect.len();

    let mut data = vec![1.0f32; 3 * n];
    for (p, (r, c)) in rect.pixels().enumerate() {
        data[p] = xs[c];
        data[n + p] = ys[r];
    }

    Ok(Tensor2::from_shape_vec([3, n], data)?)
}

/// Divide `(xs, ys)` by the homogeneous coordinate `z` shifted away from zero.
///
/// Returns `(x, y, z')` with `z' = z + sign(z) * epsilon` and `sign(0) = 1`.
#[inline]
pub fn normalize_homogeneous(xs: f32, ys: f32, z: f32, epsilon: f32) -> (f32, f32, f32) {
    let sign = if z >= 0.0 { 1.0 } else { -1.0 };
    let z = z + sign * epsilon;
    (xs / z, ys / z, z)
}

/// Dense sampling coordinates of a batch of warps.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateMaps {
    /// Normalized horizontal sampling coordinates `[batch, height, width]`.
    pub x_map: Tensor3<f32>,
    /// Normalized vertical sampling coordinates `[batch, height, width]`.
    pub y_map: Tensor3<f32>,
}

impl CoordinateMaps {
    /// Stack the maps into `[batch, height, width, 2]`, `x` first.
    pub fn stacked(&self) -> Tensor4<f32> {
        let [b, h, w] = self.x_map.shape;
        let (xs, ys) = (self.x_map.as_slice(), self.y_map.as_slice());
        Tensor4::from_shape_fn([b, h, w, 2], |[bi, r, c, k]| {
            let idx = (bi * h + r) * w + c;
            if k == 0 {
                xs[idx]
            } else {
                ys[idx]
            }
        })
    }
}

fn check_homographies(
    homographies: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<usize, MeshWarpError> {
    let batch = homographies.shape[0];
    let expected = [batch, config.grid_h, config.grid_w, 9];
    if homographies.shape != expected {
        return Err(MeshWarpError::shape_mismatch(
            "homographies",
            &expected,
            &homographies.shape,
        ));
    }
    Ok(batch)
}

/// The `[batch, 3, 3]` homographies of cell `(i, j)`.
fn cell_homographies(homographies: &Tensor4<f32>, i: usize, j: usize) -> Tensor3<f32> {
    let [batch, gh, gw, _] = homographies.shape;
    let data = homographies.as_slice();
    Tensor3::from_shape_fn([batch, 3, 3], |[b, r, c]| {
        data[((b * gh + i) * gw + j) * 9 + r * 3 + c]
    })
}

/// Map every output pixel through the homography of its cell.
///
/// # Arguments
///
/// * `backend` - The compute backend used for the per-cell matrix products.
/// * `homographies` - Cell homographies `[batch, grid_h, grid_w, 9]`.
/// * `config` - The warp configuration providing the output size.
///
/// # Returns
///
/// The normalized sampling coordinates of every output pixel.
///
/// # Errors
///
/// Returns an error if the homographies do not match the configured mesh.
pub fn build_sampling_grid<B: Backend>(
    backend: &B,
    homographies: &Tensor4<f32>,
    config: &MeshWarpConfig,
) -> Result<CoordinateMaps, MeshWarpError> {
    let batch = check_homographies(homographies, config)?;
    let cells = CellGrid::from_config(config)?;
    let (height, width) = (config.height, config.width);
    let plane = height * width;

    let mut x_map = Tensor3::<f32>::zeros([batch, height, width]);
    let mut y_map = Tensor3::<f32>::zeros([batch, height, width]);

    for ((i, j), rect) in cells.iter() {
        let n = rect.len();
        let grid = homogeneous_cell_grid(height, width, rect)?.reshape([1, 3, n])?;
        let projected = backend.matmul(&cell_homographies(homographies, i, j), &grid)?;
        let t = projected.as_slice();

        let (xm, ym) = (x_map.as_slice_mut(), y_map.as_slice_mut());
        for b in 0..batch {
            let t = &t[b * 3 * n..(b + 1) * 3 * n];
            for (p, (r, c)) in rect.pixels().enumerate() {
                let (x, y, _) =
                    normalize_homogeneous(t[p], t[n + p], t[2 * n + p], config.homogeneous_epsilon);
                xm[b * plane + r * width + c] = x;
                ym[b * plane + r * width + c] = y;
            }
        }
    }

    log::debug!(
        "built {batch}x{height}x{width} sampling grid from {} cells",
        cells.len()
    );

    Ok(CoordinateMaps { x_map, y_map })
}

/// Propagate cotangents of the coordinate maps back to the cell homographies.
///
/// The sign of `z` is piecewise constant, so `∂z'/∂z = 1` and
/// `∂x/∂z = -x_s / z'^2` (same for `y`).
///
/// # Arguments
///
/// * `backend` - The compute backend.
/// * `homographies` - Cell homographies `[batch, grid_h, grid_w, 9]` of the forward pass.
/// * `grad_x` - Cotangent of `x_map`, `[batch, height, width]`.
/// * `grad_y` - Cotangent of `y_map`, `[batch, height, width]`.
/// * `config` - The warp configuration.
///
/// # Returns
///
/// The cotangent of the homographies, `[batch, grid_h, grid_w, 9]`.
///
/// # Errors
///
/// Returns an error if any shape disagrees with the configuration.
pub fn sampling_grid_backward<B: Backend>(
    backend: &B,
    homographies: &Tensor4<f32>,
    grad_x: &Tensor3<f32>,
    grad_y: &Tensor3<f32>,
    config: &MeshWarpConfig,
) -> Result<Tensor4<f32>, MeshWarpError> {
    let batch = check_homographies(homographies, config)?;
    let (height, width) = (config.height, config.width);
    let expected = [batch, height, width];
    if grad_x.shape != expected {
        return Err(MeshWarpError::shape_mismatch("grad_x", &expected, &grad_x.shape));
    }
    if grad_y.shape != expected {
        return Err(MeshWarpError::shape_mismatch("grad_y", &expected, &grad_y.shape));
    }

    let cells = CellGrid::from_config(config)?;
    let plane = height * width;
    let (gx, gy) = (grad_x.as_slice(), grad_y.as_slice());
    let [_, gh, gw, _] = homographies.shape;
    let mut grad_h = Tensor4::<f32>::zeros([batch, gh, gw, 9]);

    for ((i, j), rect) in cells.iter() {
        let n = rect.len();
        let grid = homogeneous_cell_grid(height, width, rect)?.reshape([1, 3, n])?;
        let projected = backend.matmul(&cell_homographies(homographies, i, j), &grid)?;
        let t = projected.as_slice();

        let mut grad_t = vec![0.0f32; batch * 3 * n];
        for b in 0..batch {
            let t = &t[b * 3 * n..(b + 1) * 3 * n];
            let g = &mut grad_t[b * 3 * n..(b + 1) * 3 * n];
            for (p, (r, c)) in rect.pixels().enumerate() {
                let (xs, ys) = (t[p], t[n + p]);
                let (_, _, z) =
                    normalize_homogeneous(xs, ys, t[2 * n + p], config.homogeneous_epsilon);
                let idx = b * plane + r * width + c;
                let (dx, dy) = (gx[idx], gy[idx]);

                g[p] = dx / z;
                g[n + p] = dy / z;
                g[2 * n + p] = -(dx * xs + dy * ys) / (z * z);
            }
        }

        // dL/dH = dL/dT · gridᵀ
        let grad_t = Tensor3::from_shape_vec([batch, 3, n], grad_t)?;
        let grid_t = meshwarp_tensor::ops::batched_transpose(&grid);
        let grad_cell = backend.matmul(&grad_t, &grid_t)?;

        let out = grad_h.as_slice_mut();
        for (b, cell) in grad_cell.as_slice().chunks_exact(9).enumerate() {
            let offset = ((b * gh + i) * gw + j) * 9;
            out[offset..offset + 9].copy_from_slice(cell);
        }
    }

    Ok(grad_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use meshwarp_tensor::CpuBackend;

    fn identity_homographies(batch: usize, config: &MeshWarpConfig) -> Tensor4<f32> {
        Tensor4::from_shape_fn(
            [batch, config.grid_h, config.grid_w, 9],
            |[_, _, _, k]| match k {
                0 | 4 | 8 => 1.0,
                _ => 0.0,
            },
        )
    }

    #[test]
    fn linspace_endpoints() {
        assert_eq!(linspace(-1.0, 1.0, 0), Vec::<f32>::new());
        assert_eq!(linspace(-1.0, 1.0, 1), vec![-1.0]);
        assert_eq!(linspace(-1.0, 1.0, 5), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(linspace(-1.0, 1.0, 7)[6], 1.0);
    }

    #[test]
    fn cells_partition_the_image() -> Result<(), MeshWarpError> {
        for (height, width, grid_h, grid_w) in [(7, 10, 3, 4), (8, 8, 8, 8), (5, 9, 1, 2)] {
            let cells = CellGrid::new(height, width, grid_h, grid_w)?;
            assert_eq!(cells.len(), grid_h * grid_w);

            let mut hits = vec![0usize; height * width];
            for (_, rect) in cells.iter() {
                for (r, c) in rect.pixels() {
                    hits[r * width + c] += 1;
                }
            }
            assert!(hits.iter().all(|&h| h == 1));
        }
        Ok(())
    }

    #[test]
    fn last_band_absorbs_remainder() -> Result<(), MeshWarpError> {
        let cells = CellGrid::new(7, 10, 3, 4)?;
        assert_eq!(
            cells.cell(0, 0),
            Some(&CellRect {
                row_start: 0,
                row_end: 1,
                col_start: 0,
                col_end: 1
            })
        );
        assert_eq!(
            cells.cell(2, 3),
            Some(&CellRect {
                row_start: 4,
                row_end: 6,
                col_start: 6,
                col_end: 9
            })
        );
        assert_eq!(cells.cell(3, 0), None);
        assert!(CellGrid::new(2, 8, 3, 1).is_err());
        Ok(())
    }

    #[test]
    fn cell_grid_is_sliced_not_renormalized() -> Result<(), MeshWarpError> {
        let cells = CellGrid::new(5, 5, 2, 2)?;
        let rect = cells.cell(1, 1).unwrap();
        let grid = homogeneous_cell_grid(5, 5, rect)?;

        // rows 2..=4, cols 2..=4 of linspace(-1, 1, 5)
        assert_eq!(grid.shape, [3, 9]);
        assert_eq!(&grid.as_slice()[..3], &[0.0, 0.5, 1.0]);
        assert_eq!(grid.get([1, 0]), Some(&0.0));
        assert_eq!(grid.get([1, 8]), Some(&1.0));
        assert!(grid.as_slice()[18..].iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn normalize_keeps_sign_of_zero() {
        let (x, y, z) = normalize_homogeneous(1e-9, -1e-9, 0.0, 1e-8);
        assert!(z > 0.0);
        assert!(x.is_finite() && y.is_finite());
        assert_relative_eq!(x, 0.1, epsilon = 1e-6);

        let (x, _, z) = normalize_homogeneous(1e-9, 0.0, -0.0, 1e-8);
        // -0.0 >= 0.0, the positive branch is taken
        assert!(z > 0.0);
        assert!(x > 0.0);

        let (x, _, z) = normalize_homogeneous(1.0, 0.0, -1e-12, 1e-8);
        assert!(z < 0.0);
        assert!(x.is_finite() && x < 0.0);
    }

    #[test]
    fn identity_homographies_reproduce_linspace() -> Result<(), MeshWarpError> {
        let config = MeshWarpConfig::new(2, 3, 6, 7);
        let maps = build_sampling_grid(
            &CpuBackend::new(),
            &identity_homographies(2, &config),
            &config,
        )?;

        let xs = linspace(-1.0, 1.0, 7);
        let ys = linspace(-1.0, 1.0, 6);
        for b in 0..2 {
            for r in 0..6 {
                for c in 0..7 {
                    assert_relative_eq!(maps.x_map.as_slice()[(b * 6 + r) * 7 + c], xs[c]);
                    assert_relative_eq!(maps.y_map.as_slice()[(b * 6 + r) * 7 + c], ys[r]);
                }
            }
        }

        let stacked = maps.stacked();
        assert_eq!(stacked.shape, [2, 6, 7, 2]);
        assert_eq!(stacked.get([1, 5, 6, 0]), Some(&1.0));
        assert_eq!(stacked.get([1, 5, 6, 1]), Some(&1.0));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_homographies() {
        let config = MeshWarpConfig::new(2, 2, 4, 4);
        let hs = Tensor4::<f32>::zeros([1, 2, 3, 9]);
        assert!(build_sampling_grid(&CpuBackend::new(), &hs, &config).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() -> Result<(), MeshWarpError> {
        let backend = CpuBackend::new();
        let config = MeshWarpConfig::new(2, 2, 5, 6);

        let mut hs = identity_homographies(1, &config);
        for (k, v) in hs.as_slice_mut().iter_mut().enumerate() {
            // small perspective perturbation per cell
            *v += 0.05 * ((k * 7 % 11) as f32 / 11.0 - 0.5);
        }

        let weights_x = Tensor3::from_shape_fn([1, 5, 6], |[_, r, c]| (r as f32 - c as f32) * 0.1);
        let weights_y = Tensor3::from_shape_fn([1, 5, 6], |[_, r, c]| ((r * c) % 3) as f32 * 0.2);

        let loss = |hs: &Tensor4<f32>| -> Result<f64, MeshWarpError> {
            let maps = build_sampling_grid(&backend, hs, &config)?;
            let lx: f64 = maps
                .x_map
                .iter()
                .zip(weights_x.iter())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum();
            let ly: f64 = maps
                .y_map
                .iter()
                .zip(weights_y.iter())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum();
            Ok(lx + ly)
        };

        let grad = sampling_grid_backward(&backend, &hs, &weights_x, &weights_y, &config)?;

        let step = 1e-3f32;
        for k in 0..hs.numel() {
            let mut plus = hs.clone();
            let mut minus = hs.clone();
            plus.as_slice_mut()[k] += step;
            minus.as_slice_mut()[k] -= step;
            let numeric = ((loss(&plus)? - loss(&minus)?) / (2.0 * step as f64)) as f32;
            assert_relative_eq!(
                grad.as_slice()[k],
                numeric,
                epsilon = 5e-2,
                max_relative = 5e-2
            );
        }
        Ok(())
    }
}
