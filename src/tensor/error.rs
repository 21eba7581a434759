//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::collections::TryReserveError;

use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TensorOpError {
	/// A buffer request cannot be satisfied.
	Allocation,

	/// Incompatible shapes in broadcast, reshape, cat or an elementwise operation.
	Shape,

	/// Unknown operation name, or an operation recorded with the wrong inputs.
	UnsupportedOperation,

	/// The backward traversal found a cycle.
	CyclicGraph,

	/// NaN/Inf fed into an operation that forbids it, or a value outside the domain.
	InvalidValue,

	/// Graph state contradicts the autograd invariants.
	InconsistentGraph,

	/// A tensor saved for backward was modified in place after it was saved.
	SavedTensorModified,

	/// A scalar was required.
	NotScalar,
}

impl From<TryReserveError> for ErrPack<TensorOpError> {
	#[cold]
	#[inline(never)]
	fn from(err: TryReserveError) -> Self {
		Self {
			code: TensorOpError::Allocation,
			extra: Some(Box::new(ErrExtra {
				message: Cow::from("cannot allocate storage"),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------
