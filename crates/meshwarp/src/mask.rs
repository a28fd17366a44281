use meshwarp_tensor::Tensor3;

use crate::error::MeshWarpError;

/// Flag the pixels whose sampling coordinate lies strictly outside `[-1, 1]`.
///
/// A NaN coordinate is not ordered against the bounds and is left unflagged.
///
/// # Arguments
///
/// * `x_map` - Normalized horizontal sampling coordinates `[batch, height, width]`.
/// * `y_map` - Normalized vertical sampling coordinates `[batch, height, width]`.
///
/// # Returns
///
/// `true` where the output pixel has no valid source pixel.
///
/// # Errors
///
/// Returns [`MeshWarpError::ShapeMismatch`] if the maps have different shapes.
///
/// # Example
///
/// ```
/// use meshwarp::mask::validity_mask;
/// use meshwarp_tensor::Tensor3;
///
/// let x = Tensor3::from_shape_vec([1, 1, 3], vec![-1.0f32, 1.0, 1.5]).unwrap();
/// let y = Tensor3::from_shape_vec([1, 1, 3], vec![0.0f32, 1.0, 0.0]).unwrap();
///
/// let mask = validity_mask(&x, &y).unwrap();
/// assert_eq!(mask.as_slice(), &[false, false, true]);
/// ```
pub fn validity_mask(
    x_map: &Tensor3<f32>,
    y_map: &Tensor3<f32>,
) -> Result<Tensor3<bool>, MeshWarpError> {
    if x_map.shape != y_map.shape {
        return Err(MeshWarpError::shape_mismatch(
            "y_map",
            &x_map.shape,
            &y_map.shape,
        ));
    }

    // NaN compares false on both sides and is not flagged
    let outside = |v: f32| v < -1.0 || v > 1.0;
    Ok(x_map.element_wise_op(y_map, |&x, &y| outside(x) || outside(y))?)
}

/// Convert a validity mask to `1.0` (invalid) / `0.0` (valid).
pub fn mask_to_float(mask: &Tensor3<bool>) -> Tensor3<f32> {
    mask.map(|&invalid| if invalid { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_strictly_outside() -> Result<(), MeshWarpError> {
        let x = Tensor3::from_shape_vec(
            [1, 2, 4],
            vec![-1.0, 1.0, 1.000001, -1.5, 0.0, 0.0, 0.3, f32::NAN],
        )?;
        let y = Tensor3::from_shape_vec(
            [1, 2, 4],
            vec![1.0, -1.0, 0.0, 0.0, -1.0001, 2.0, 0.3, 0.0],
        )?;

        let mask = validity_mask(&x, &y)?;
        assert_eq!(
            mask.as_slice(),
            &[false, false, true, true, true, true, false, false]
        );
        assert_eq!(
            mask_to_float(&mask).as_slice(),
            &[0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn rejects_mismatched_maps() {
        let x = Tensor3::<f32>::zeros([1, 2, 2]);
        let y = Tensor3::<f32>::zeros([1, 2, 3]);
        assert!(matches!(
            validity_mask(&x, &y),
            Err(MeshWarpError::ShapeMismatch { name: "y_map", .. })
        ));
    }
}
