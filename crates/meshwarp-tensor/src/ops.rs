//! Operations for tensors.
//!
//! In-place accumulation and the batched transposition used by the reverse passes.

use crate::{
    tensor::{Tensor, TensorError},
    Tensor3,
};

/// Add `rhs` into `lhs` in place.
///
/// # Errors
///
/// If the shapes differ, an error is returned.
pub fn add_inplace<T, const N: usize>(
    lhs: &mut Tensor<T, N>,
    rhs: &Tensor<T, N>,
) -> Result<(), TensorError>
where
    T: std::ops::AddAssign + Copy,
{
    if lhs.shape != rhs.shape {
        return Err(TensorError::dimension_mismatch(
            "In-place addition requires equal shapes",
            &lhs.shape,
            &rhs.shape,
        ));
    }
    lhs.as_slice_mut()
        .iter_mut()
        .zip(rhs.as_slice())
        .for_each(|(a, b)| *a += *b);
    Ok(())
}

/// Transpose the two trailing dimensions of a batch of matrices.
///
/// `[b, m, n]` becomes `[b, n, m]`.
pub fn batched_transpose<T: Copy>(mats: &Tensor3<T>) -> Tensor3<T> {
    let [batch, rows, cols] = mats.shape;
    let src = mats.as_slice();
    Tensor3::from_shape_fn([batch, cols, rows], |[b, i, j]| {
        src[(b * rows + j) * cols + i]
    })
}
