//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::smallvec;

use crate::ErrPack;
use crate::tensor::{DimVec, TensorOpError, View};

use super::function::{Op, OpAttrs, SavedTensor};
use super::node::Node;
use super::ops::{Saved, record};

//--------------------------------------------------------------------------------------------------

/// Records a view-producing op and links the result to its base when no copy was made.
fn record_view(
	op: Op,
	base: &Node,
	value: View,
	saved: impl FnOnce() -> Saved,
	attrs: OpAttrs,
) -> Result<Node, ErrPack<TensorOpError>> {
	let shares = value.shares_storage(&base.value());
	let result = record(op, &[base], value, saved, attrs)?;
	if shares {
		result.set_base(base);
	}
	Ok(result)
}

/// Same elements, new shape. Copies only if `a` is not contiguous.
pub fn reshape(a: &Node, shape: &[usize]) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().reshape(shape)?;
	record_view(Op::View, a, value, Saved::new, OpAttrs::None)
}

/// Like `reshape()`, but fails instead of copying.
pub fn view(a: &Node, shape: &[usize]) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().view(shape)?;
	record_view(Op::View, a, value, Saved::new, OpAttrs::None)
}

/// Broadcasts `a` to `shape`. Expanded axes have stride 0; nothing is copied.
pub fn expand(a: &Node, shape: &[usize]) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().expand(shape)?;
	record_view(Op::Expand, a, value, Saved::new, OpAttrs::None)
}

/// Broadcasts `a` to the shape of `like`.
pub fn broadcast_to(a: &Node, like: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	expand(a, &like.shape())
}

/// View with arbitrary geometry over the storage of `a`. `offset` is absolute.
pub fn as_strided(
	a: &Node,
	sizes: &[usize],
	strides: &[usize],
	offset: usize,
) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().as_strided(sizes, strides, offset)?;
	let attrs = OpAttrs::Strided {
		sizes: DimVec::from(sizes),
		strides: DimVec::from(strides),
		offset,
	};
	record_view(Op::AsStrided, a, value, || smallvec![SavedTensor::input(0, a)], attrs)
}

/// Contiguous version of `a`. If `a` already is contiguous, it is returned unchanged.
pub fn contiguous(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value();
	if value.is_contiguous() {
		return Ok(a.clone());
	}
	let value = value.materialize()?;
	record(Op::Contiguous, &[a], value, Saved::new, OpAttrs::None)
}

pub fn transpose(a: &Node, d0: usize, d1: usize) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().transpose(d0, d1)?;
	record_view(Op::Transpose, a, value, Saved::new, OpAttrs::Transpose(d0, d1))
}

/// Concatenates `nodes` along `dim` into a fresh storage.
#[allow(clippy::indexing_slicing)]
pub fn cat(nodes: &[&Node], dim: usize) -> Result<Node, ErrPack<TensorOpError>> {
	let values: Vec<View> = nodes.iter().map(|n| n.value()).collect();
	let value = View::cat(&values, dim)?;
	let sizes = values.iter().map(|v| v.shape()[dim]).collect();
	record(Op::Cat, nodes, value, Saved::new, OpAttrs::Cat { dim, sizes })
}

//--------------------------------------------------------------------------------------------------
