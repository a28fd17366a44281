//! Regularized 4-point homography solver.
//!
//! Each system maps four source points `(x_i, y_i)` onto four target points
//! `(u_i, v_i)`. The 8x8 direct linear transform matrix `A` is shifted by `λ·I` before
//! inversion so that degenerate quads still produce a (biased) finite solution.

use meshwarp_tensor::{ops::batched_transpose, Backend, Tensor2, Tensor3};

use crate::config::{MeshWarpConfig, DEFAULT_CONDITION_WARN_THRESHOLD, DEFAULT_REGULARIZATION};
use crate::error::MeshWarpError;

/// Number of unknowns of a homography with its last entry fixed to one.
pub const HOMOGRAPHY_DOF: usize = 8;

/// The solved homographies of a batch of correspondence sets.
#[derive(Debug, Clone)]
pub struct HomographyBatch {
    /// Row-major 3x3 homographies `[n, 9]` with the last entry set to one.
    pub homographies: Tensor2<f32>,
    /// Inverses of the regularized systems `(A + λI)^-1`, `[n, 8, 8]`.
    pub inverses: Tensor3<f32>,
}

impl HomographyBatch {
    /// Number of solved systems.
    pub fn len(&self) -> usize {
        self.homographies.shape[0]
    }

    /// Whether the batch holds no systems.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Solver for batches of 4-point homography systems.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomographySolver {
    /// Value added to the diagonal of every system before inversion.
    pub regularization: f32,
    /// 1-norm condition number above which a system is reported as ill-conditioned.
    pub condition_warn_threshold: f64,
}

impl Default for HomographySolver {
    fn default() -> Self {
        Self::new(DEFAULT_REGULARIZATION)
    }
}

impl HomographySolver {
    /// Create a solver with the given regularization and the default warning threshold.
    pub fn new(regularization: f32) -> Self {
        Self {
            regularization,
            condition_warn_threshold: DEFAULT_CONDITION_WARN_THRESHOLD,
        }
    }

    /// Create a solver with the numeric settings of a warp configuration.
    pub fn from_config(config: &MeshWarpConfig) -> Self {
        Self {
            regularization: config.regularization,
            condition_warn_threshold: config.condition_warn_threshold,
        }
    }

    /// Solve `(A + λI)·h = b` for every correspondence set.
    ///
    /// # Arguments
    ///
    /// * `backend` - The compute backend used for the batched inverse and product.
    /// * `src` - Source points `[n, 8]` laid out as `[x0, y0, x1, y1, x2, y2, x3, y3]`.
    /// * `dst` - Target points `[n, 8]` with the same layout.
    ///
    /// # Returns
    ///
    /// The homographies `[n, 9]` together with the inverses needed by [`Self::backward`].
    ///
    /// # Errors
    ///
    /// Returns [`MeshWarpError::ShapeMismatch`] if the inputs are not `[n, 8]` with a
    /// common `n`.
    pub fn solve<B: Backend>(
        &self,
        backend: &B,
        src: &Tensor2<f32>,
        dst: &Tensor2<f32>,
    ) -> Result<HomographyBatch, MeshWarpError> {
        let n = check_correspondences(src, dst)?;

        let (system, rhs) = build_systems(src, dst, self.regularization)?;
        let inverses = backend.inverse(&system)?;
        self.report_conditioning(&system, &inverses);

        let solution = backend.matmul(&inverses, &rhs)?;

        let mut homographies = Vec::with_capacity(n * 9);
        for h in solution.as_slice().chunks_exact(HOMOGRAPHY_DOF) {
            homographies.extend_from_slice(h);
            homographies.push(1.0);
        }

        Ok(HomographyBatch {
            homographies: Tensor2::from_shape_vec([n, 9], homographies)?,
            inverses,
        })
    }

    /// Propagate a cotangent of the homographies back to the correspondences.
    ///
    /// With `M = A + λI` and `h = M^-1 b`, the adjoint `w = M^-T ∂L/∂h` gives
    /// `∂L/∂b = w` and `∂L/∂A = -w hᵀ`, which are folded back onto the points that
    /// generated `A` and `b`.
    ///
    /// # Arguments
    ///
    /// * `backend` - The compute backend.
    /// * `batch` - The forward solution.
    /// * `src` - Source points `[n, 8]` of the forward call.
    /// * `dst` - Target points `[n, 8]` of the forward call.
    /// * `grad_homographies` - Cotangent `[n, 9]`; the fixed last entry is ignored.
    ///
    /// # Returns
    ///
    /// The cotangents of `src` and `dst`, both `[n, 8]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes disagree with the forward call.
    pub fn backward<B: Backend>(
        &self,
        backend: &B,
        batch: &HomographyBatch,
        src: &Tensor2<f32>,
        dst: &Tensor2<f32>,
        grad_homographies: &Tensor2<f32>,
    ) -> Result<(Tensor2<f32>, Tensor2<f32>), MeshWarpError> {
        let n = check_correspondences(src, dst)?;
        if grad_homographies.shape != [n, 9] || batch.homographies.shape != [n, 9] {
            return Err(MeshWarpError::shape_mismatch(
                "grad_homographies",
                &[n, 9],
                &grad_homographies.shape,
            ));
        }

        let grad_h8 = Tensor3::from_shape_fn([n, HOMOGRAPHY_DOF, 1], |[k, r, _]| {
            grad_homographies.as_slice()[k * 9 + r]
        });
        let adjoint = backend.matmul(&batched_transpose(&batch.inverses), &grad_h8)?;

        let mut grad_src = vec![0.0f32; n * 8];
        let mut grad_dst = vec![0.0f32; n * 8];

        let h_all = batch.homographies.as_slice();
        let w_all = adjoint.as_slice();

        for k in 0..n {
            let h = &h_all[k * 9..(k + 1) * 9];
            let w = &w_all[k * 8..(k + 1) * 8];
            let s = &src.as_slice()[k * 8..(k + 1) * 8];
            let d = &dst.as_slice()[k * 8..(k + 1) * 8];
            let gs = &mut grad_src[k * 8..(k + 1) * 8];
            let gd = &mut grad_dst[k * 8..(k + 1) * 8];

            for i in 0..4 {
                let (x, y) = (s[2 * i], s[2 * i + 1]);
                let (u, v) = (d[2 * i], d[2 * i + 1]);
                let (wu, wv) = (w[i], w[4 + i]);
                let denom = 1.0 + h[6] * x + h[7] * y;

                gd[2 * i] = wu * denom;
                gd[2 * i + 1] = wv * denom;

                gs[2 * i] = -wu * h[0] + wu * h[6] * u - wv * h[3] + wv * h[6] * v;
                gs[2 * i + 1] = -wu * h[1] + wu * h[7] * u - wv * h[4] + wv * h[7] * v;
            }
        }

        Ok((
            Tensor2::from_shape_vec([n, 8], grad_src)?,
            Tensor2::from_shape_vec([n, 8], grad_dst)?,
        ))
    }

    fn report_conditioning(&self, system: &Tensor3<f32>, inverses: &Tensor3<f32>) {
        let dim = HOMOGRAPHY_DOF * HOMOGRAPHY_DOF;
        let systems = system.as_slice().chunks_exact(dim);
        let inverses = inverses.as_slice().chunks_exact(dim);

        for (k, (m, m_inv)) in systems.zip(inverses).enumerate() {
            let cond = norm_1(m) * norm_1(m_inv);
            if !cond.is_finite() || cond > self.condition_warn_threshold {
                log::warn!(
                    "homography system {k} is ill-conditioned (cond_1 = {cond:e}, lambda = {})",
                    self.regularization
                );
            }
        }
    }
}

/// Solve a batch of homographies with the default condition warning threshold.
///
/// See [`HomographySolver::solve`].
///
/// # Example
///
/// ```
/// use meshwarp::homography::solve_homographies;
/// use meshwarp_tensor::{CpuBackend, Tensor2};
///
/// let quad = vec![-1.0f32, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
/// let src = Tensor2::from_shape_vec([1, 8], quad.clone()).unwrap();
/// let dst = Tensor2::from_shape_vec([1, 8], quad).unwrap();
///
/// let batch = solve_homographies(&CpuBackend::new(), &src, &dst, 0.0).unwrap();
/// assert_eq!(batch.homographies.shape, [1, 9]);
/// assert_eq!(batch.homographies.as_slice()[8], 1.0);
/// ```
pub fn solve_homographies<B: Backend>(
    backend: &B,
    src: &Tensor2<f32>,
    dst: &Tensor2<f32>,
    regularization: f32,
) -> Result<HomographyBatch, MeshWarpError> {
    HomographySolver::new(regularization).solve(backend, src, dst)
}

fn check_correspondences(src: &Tensor2<f32>, dst: &Tensor2<f32>) -> Result<usize, MeshWarpError> {
    let n = src.shape[0];
    if src.shape[1] != 8 {
        return Err(MeshWarpError::shape_mismatch("src", &[n, 8], &src.shape));
    }
    if dst.shape != [n, 8] {
        return Err(MeshWarpError::shape_mismatch("dst", &[n, 8], &dst.shape));
    }
    Ok(n)
}

/// Assemble the regularized systems `A + λI` `[n, 8, 8]` and right-hand sides `b` `[n, 8, 1]`.
fn build_systems(
    src: &Tensor2<f32>,
    dst: &Tensor2<f32>,
    regularization: f32,
) -> Result<(Tensor3<f32>, Tensor3<f32>), MeshWarpError> {
    let n = src.shape[0];
    let mut system = vec![0.0f32; n * 64];
    let mut rhs = vec![0.0f32; n * 8];

    for k in 0..n {
        let s = &src.as_slice()[k * 8..(k + 1) * 8];
        let d = &dst.as_slice()[k * 8..(k + 1) * 8];
        let a = &mut system[k * 64..(k + 1) * 64];
        let b = &mut rhs[k * 8..(k + 1) * 8];

        for i in 0..4 {
            let (x, y) = (s[2 * i], s[2 * i + 1]);
            let (u, v) = (d[2 * i], d[2 * i + 1]);

            a[i * 8..(i + 1) * 8].copy_from_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u]);
            a[(4 + i) * 8..(5 + i) * 8]
                .copy_from_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v]);

            b[i] = u;
            b[4 + i] = v;
        }

        for r in 0..8 {
            a[r * 8 + r] += regularization;
        }
    }

    Ok((
        Tensor3::from_shape_vec([n, 8, 8], system)?,
        Tensor3::from_shape_vec([n, 8, 1], rhs)?,
    ))
}

/// Maximum absolute column sum of a row-major 8x8 matrix.
fn norm_1(m: &[f32]) -> f64 {
    (0..HOMOGRAPHY_DOF)
        .map(|c| {
            (0..HOMOGRAPHY_DOF)
                .map(|r| (m[r * HOMOGRAPHY_DOF + c] as f64).abs())
                .sum::<f64>()
        })
        .fold(0.0, f64::max)
}
