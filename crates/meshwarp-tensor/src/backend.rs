//! Backend abstraction for the numeric kernels.
//!
//! The warping core only needs a handful of batched primitives. They are collected in
//! the [`Backend`] trait so that both the forward pass and its reverse-mode
//! counterpart can run on any conforming implementation.

use rayon::prelude::*;
use faer::prelude::SolverCore;

use crate::{Tensor2, Tensor3, TensorError};

/// Backend trait defining the batched numeric primitives.
///
/// Matrices are stored row-major in `[batch, rows, cols]` tensors.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow safe usage across threads.
pub trait Backend: Send + Sync {
    /// Returns a short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Batched matrix product `[b, m, k] x [b, k, n] -> [b, m, n]`.
    ///
    /// A batch size of one on either side is broadcast against the other.
    ///
    /// # Errors
    ///
    /// Returns an error if the inner dimensions or the batch sizes are incompatible.
    fn matmul(&self, lhs: &Tensor3<f32>, rhs: &Tensor3<f32>) -> Result<Tensor3<f32>, TensorError>;

    /// Batched inverse of square matrices `[b, n, n] -> [b, n, n]`.
    ///
    /// Singular inputs are not rejected; their inverse contains non-finite values.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrices are not square.
    fn inverse(&self, mats: &Tensor3<f32>) -> Result<Tensor3<f32>, TensorError>;

    /// Gathers rows of `src` `[rows, cols]` into `[indices.len(), cols]`.
    ///
    /// # Errors
    ///
    /// Returns an error if any index is out of bounds.
    fn gather(&self, src: &Tensor2<f32>, indices: &[usize]) -> Result<Tensor2<f32>, TensorError>;

    /// Adjoint of [`Backend::gather`]: accumulates row `k` of `src` into row
    /// `indices[k]` of a zeroed `[num_rows, cols]` tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the number of rows of `src` differs from `indices.len()`
    /// or any index is out of bounds.
    fn scatter_add(
        &self,
        src: &Tensor2<f32>,
        indices: &[usize],
        num_rows: usize,
    ) -> Result<Tensor2<f32>, TensorError>;
}

/// CPU backend implementation.
///
/// Batched kernels are parallelized over the batch with `rayon`; matrix inversion is
/// delegated to `faer` in double precision.
#[derive(Clone, Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    /// Creates a new CPU backend.
    pub fn new() -> Self {
        Self
    }
}

fn broadcast_batch(lhs: usize, rhs: usize) -> Option<usize> {
    match (lhs, rhs) {
        (a, b) if a == b => Some(a),
        (1, b) => Some(b),
        (a, 1) => Some(a),
        _ => None,
    }
}

fn check_indices(indices: &[usize], num_rows: usize) -> Result<(), TensorError> {
    match indices.iter().find(|&&idx| idx >= num_rows) {
        Some(&idx) => Err(TensorError::index_out_of_bounds(idx, num_rows)),
        None => Ok(()),
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn matmul(&self, lhs: &Tensor3<f32>, rhs: &Tensor3<f32>) -> Result<Tensor3<f32>, TensorError> {
        let [lb, m, k] = lhs.shape;
        let [rb, k2, n] = rhs.shape;

        if k != k2 {
            return Err(TensorError::dimension_mismatch(
                "Matrix product requires matching inner dimensions",
                &[lb, m, k],
                &[rb, k2, n],
            ));
        }

        let batch = broadcast_batch(lb, rb).ok_or_else(|| {
            TensorError::dimension_mismatch(
                "Matrix product requires broadcastable batch sizes",
                &lhs.shape,
                &rhs.shape,
            )
        })?;

        let (a, b) = (lhs.as_slice(), rhs.as_slice());
        let mut out = vec![0.0f32; batch * m * n];

        if m * n > 0 {
            out.par_chunks_exact_mut(m * n)
                .enumerate()
                .for_each(|(bi, dst)| {
                    let a = &a[(if lb == 1 { 0 } else { bi }) * m * k..][..m * k];
                    let b = &b[(if rb == 1 { 0 } else { bi }) * k * n..][..k * n];
                    for i in 0..m {
                        let row = &mut dst[i * n..(i + 1) * n];
                        for p in 0..k {
                            let a_ip = a[i * k + p];
                            row.iter_mut()
                                .zip(&b[p * n..(p + 1) * n])
                                .for_each(|(o, &b_pj)| *o += a_ip * b_pj);
                        }
                    }
                });
        }

        Tensor3::from_shape_vec([batch, m, n], out)
    }

    fn inverse(&self, mats: &Tensor3<f32>) -> Result<Tensor3<f32>, TensorError> {
        let [batch, rows, cols] = mats.shape;
        if rows != cols {
            return Err(TensorError::dimension_mismatch(
                "Matrix inverse requires square matrices",
                &[batch, rows, rows],
                &mats.shape,
            ));
        }

        let n = rows;
        let mut out = vec![0.0f32; batch * n * n];

        if n > 0 {
            out.par_chunks_exact_mut(n * n)
                .zip(mats.as_slice().par_chunks_exact(n * n))
                .for_each(|(dst, src)| {
                    let mat = faer::Mat::<f64>::from_fn(n, n, |i, j| src[i * n + j] as f64);
                    let inv = mat.partial_piv_lu().inverse();
                    for i in 0..n {
                        for j in 0..n {
                            dst[i * n + j] = inv.read(i, j) as f32;
                        }
                    }
                });
        }

        Tensor3::from_shape_vec([batch, n, n], out)
    }

    fn gather(&self, src: &Tensor2<f32>, indices: &[usize]) -> Result<Tensor2<f32>, TensorError> {
        let [num_rows, cols] = src.shape;
        check_indices(indices, num_rows)?;

        let data = src.as_slice();
        let mut out = vec![0.0f32; indices.len() * cols];

        if cols > 0 {
            out.par_chunks_exact_mut(cols)
                .zip(indices.par_iter())
                .for_each(|(dst, &idx)| {
                    dst.copy_from_slice(&data[idx * cols..(idx + 1) * cols]);
                });
        }

        Tensor2::from_shape_vec([indices.len(), cols], out)
    }

    fn scatter_add(
        &self,
        src: &Tensor2<f32>,
        indices: &[usize],
        num_rows: usize,
    ) -> Result<Tensor2<f32>, TensorError> {
        let [rows, cols] = src.shape;
        if rows != indices.len() {
            return Err(TensorError::dimension_mismatch(
                "Scatter requires one index per source row",
                &[indices.len(), cols],
                &src.shape,
            ));
        }
        check_indices(indices, num_rows)?;

        // rows may collide, so the accumulation stays sequential
        let mut out = Tensor2::<f32>::zeros([num_rows, cols]);
        let dst = out.as_slice_mut();
        for (row, &idx) in src.as_slice().chunks_exact(cols.max(1)).zip(indices) {
            dst[idx * cols..(idx + 1) * cols]
                .iter_mut()
                .zip(row)
                .for_each(|(d, s)| *d += s);
        }

        Ok(out)
    }
}
