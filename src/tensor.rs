//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

pub mod error;
pub mod storage;
pub mod view;

pub use error::TensorOpError;
pub use storage::Storage;
pub use view::{
	View, broadcast_shapes, checked_numel, compute_broadcast_strides, compute_strides,
	linear_index,
};

pub const INLINE_DIMS: usize = 5;

/// Sizes or strides of a view. Most tensors have few dimensions, so they are kept inline.
pub type DimVec = SmallVec<[usize; INLINE_DIMS]>;

//--------------------------------------------------------------------------------------------------
