#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `meshwarp-tensor` provides the numeric plumbing the warping core is written against:
//!
//! - **Tensor**: an owned, row-major n-dimensional array with const-generic rank
//! - **TensorStorage**: the contiguous buffer behind a tensor
//! - **Backend**: the compute interface (batched matmul, batched inverse, gather,
//!   scatter-add) used by the forward and the reverse passes
//! - **CpuBackend**: a `rayon` + `faer` implementation of [`Backend`]
//!
//! # Quick Start
//!
//! ```rust
//! use meshwarp_tensor::{Backend, CpuBackend, Tensor3};
//!
//! let lhs = Tensor3::from_shape_vec([1, 2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let rhs = Tensor3::from_shape_vec([1, 2, 1], vec![1.0f32, 1.0]).unwrap();
//!
//! let out = CpuBackend::new().matmul(&lhs, &rhs).unwrap();
//! assert_eq!(out.shape, [1, 2, 1]);
//! assert_eq!(out.as_slice(), &[3.0, 7.0]);
//! ```

/// backend module containing the compute abstraction and the cpu implementation.
pub mod backend;

/// element-wise and layout operations on tensors.
pub mod ops;

/// Storage module containing the contiguous tensor buffer.
pub mod storage;

/// Tensor module containing the main tensor implementation and error types.
pub mod tensor;

pub use crate::backend::{Backend, CpuBackend};
pub use crate::tensor::{Tensor, TensorError};

/// Type alias for a 1-dimensional tensor.
pub type Tensor1<T> = Tensor<T, 1>;

/// Type alias for a 2-dimensional tensor.
pub type Tensor2<T> = Tensor<T, 2>;

/// Type alias for a 3-dimensional tensor.
pub type Tensor3<T> = Tensor<T, 3>;

/// Type alias for a 4-dimensional tensor.
pub type Tensor4<T> = Tensor<T, 4>;

/// Type alias for a 5-dimensional tensor.
pub type Tensor5<T> = Tensor<T, 5>;
