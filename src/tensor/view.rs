//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use smallvec::{SmallVec, smallvec};

use crate::ErrPack;

use super::{DimVec, INLINE_DIMS, Storage, TensorOpError};

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn shape_error(message: String) -> ErrPack<TensorOpError> {
	ErrPack::new(TensorOpError::Shape, message)
}

/// Number of elements for `sizes`. Fails if the product doesn't fit in `usize`.
pub fn checked_numel(sizes: &[usize]) -> Result<usize, ErrPack<TensorOpError>> {
	sizes.iter().try_fold(1_usize, |acc, &size| acc.checked_mul(size)).ok_or_else(|| {
		ErrPack::new(TensorOpError::Allocation, format!("too many elements for shape {sizes:?}"))
	})
}

/// Row-major (C-order) strides. The last dimension is the fastest.
pub fn compute_strides(sizes: &[usize]) -> DimVec {
	let mut strides: DimVec = smallvec![0; sizes.len()];
	let mut elems = 1;
	for (stride, &size) in strides.iter_mut().zip(sizes).rev() {
		*stride = elems;
		elems *= size;
	}
	strides
}

/// Strides that let a view of `src_sizes` be read as if it had `dst_sizes`.
///
/// Dimensions are aligned from the end. A source dimension of size 1 and a missing
/// leading dimension both become broadcast axes with stride 0.
#[allow(clippy::indexing_slicing)]
pub fn compute_broadcast_strides(
	src_sizes: &[usize],
	src_strides: &[usize],
	dst_sizes: &[usize],
) -> Result<DimVec, ErrPack<TensorOpError>> {
	if src_sizes.len() != src_strides.len() || src_sizes.len() > dst_sizes.len() {
		return Err(shape_error(format!("cannot broadcast {src_sizes:?} to {dst_sizes:?}")));
	}
	let lead = dst_sizes.len() - src_sizes.len();
	let mut strides: DimVec = smallvec![0; dst_sizes.len()];
	for (i, &dst) in dst_sizes.iter().enumerate().skip(lead) {
		let src = src_sizes[i - lead];
		strides[i] = if src == 1 {
			0
		} else if src == dst {
			src_strides[i - lead]
		} else {
			return Err(shape_error(format!("cannot broadcast {src_sizes:?} to {dst_sizes:?}")));
		};
	}
	Ok(strides)
}

/// Result shape of an elementwise operation on `a` and `b` (NumPy broadcasting rules).
#[allow(clippy::indexing_slicing)]
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<DimVec, ErrPack<TensorOpError>> {
	let ndim = a.len().max(b.len());
	let mut shape: DimVec = smallvec![1; ndim];
	for (i, out) in shape.iter_mut().rev().enumerate() {
		let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
		let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
		*out = if da == db || db == 1 {
			da
		} else if da == 1 {
			db
		} else {
			return Err(shape_error(format!("shapes {a:?} and {b:?} are not broadcastable")));
		};
	}
	Ok(shape)
}

/// Maps a flat logical index to a physical storage index.
///
/// The flat index is decomposed into per-axis coordinates using `sizes` and
/// re-projected through `strides` and `offset`.
#[inline]
pub fn linear_index(mut flat: usize, sizes: &[usize], strides: &[usize], offset: usize) -> usize {
	let mut index = offset;
	for (&size, &stride) in sizes.iter().zip(strides).rev() {
		if size != 0 {
			index += (flat % size) * stride;
			flat /= size;
		}
	}
	index
}

fn strides_are_contiguous(sizes: &[usize], strides: &[usize]) -> bool {
	let mut expected = 1;
	for (&size, &stride) in sizes.iter().zip(strides).rev() {
		if size != 1 && stride != expected {
			return false;
		}
		expected *= size;
	}
	true
}

//--------------------------------------------------------------------------------------------------

/// A shape/stride/offset interpretation of a `Storage`.
///
/// Cloning a view is cheap and shares the storage. Several views may alias the same
/// storage; writes through one are visible through all of them.
#[derive(Clone)]
pub struct View {
	sizes: DimVec,
	strides: DimVec,
	offset: usize,
	numel: usize,
	is_contiguous: bool,
	storage: Rc<Storage>,
}

impl View {
	fn contiguous_over(storage: Rc<Storage>, shape: &[usize], numel: usize) -> Self {
		Self {
			sizes: DimVec::from(shape),
			strides: compute_strides(shape),
			offset: 0,
			numel,
			is_contiguous: true,
			storage,
		}
	}

	/// Allocates a contiguous, zero-filled view.
	pub fn empty(shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		Self::full(shape, 0.0)
	}

	pub fn full(shape: &[usize], value: f32) -> Result<Self, ErrPack<TensorOpError>> {
		let numel = checked_numel(shape)?;
		let storage = Storage::filled(numel, value)?;
		Ok(Self::contiguous_over(storage, shape, numel))
	}

	pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self, ErrPack<TensorOpError>> {
		let numel = checked_numel(shape)?;
		if numel != data.len() {
			return Err(shape_error(format!(
				"shape {shape:?} needs {numel} elements, got {}",
				data.len()
			)));
		}
		Ok(Self::contiguous_over(Storage::from_vec(data), shape, numel))
	}

	/// One-element view with shape `[1]`.
	pub fn scalar(value: f32) -> Self {
		Self::contiguous_over(Storage::from_vec(vec![value]), &[1], 1)
	}

	/// Builds a view with explicit geometry over `storage`.
	///
	/// Fails if any element of the view would fall outside the storage.
	pub fn with_geometry(
		storage: Rc<Storage>,
		sizes: &[usize],
		strides: &[usize],
		offset: usize,
	) -> Result<Self, ErrPack<TensorOpError>> {
		if sizes.len() != strides.len() {
			return Err(shape_error(format!(
				"{} sizes but {} strides",
				sizes.len(),
				strides.len()
			)));
		}
		let numel = checked_numel(sizes)?;
		if numel > 0 {
			let last = sizes.iter().zip(strides).try_fold(offset, |acc, (&size, &stride)| {
				(size - 1).checked_mul(stride).and_then(|span| acc.checked_add(span))
			});
			match last {
				Some(last) if last < storage.len() => {},
				_ => {
					return Err(shape_error(format!(
						"view sizes={sizes:?} strides={strides:?} offset={offset} \
						exceeds storage of {} elements",
						storage.len()
					)));
				},
			}
		} else if offset > storage.len() {
			return Err(shape_error(format!("offset {offset} is past the end of the storage")));
		}
		Ok(Self {
			sizes: DimVec::from(sizes),
			strides: DimVec::from(strides),
			offset,
			numel,
			is_contiguous: strides_are_contiguous(sizes, strides),
			storage,
		})
	}

	pub fn shape(&self) -> &[usize] {
		&self.sizes
	}

	pub fn strides(&self) -> &[usize] {
		&self.strides
	}

	pub fn offset(&self) -> usize {
		self.offset
	}

	pub fn ndim(&self) -> usize {
		self.sizes.len()
	}

	pub fn numel(&self) -> usize {
		self.numel
	}

	pub fn is_contiguous(&self) -> bool {
		self.is_contiguous
	}

	pub fn storage(&self) -> &Rc<Storage> {
		&self.storage
	}

	pub fn shares_storage(&self, other: &Self) -> bool {
		Storage::ptr_eq(&self.storage, &other.storage)
	}

	/// Physical storage index of the element at logical position `flat`.
	#[inline]
	pub fn linear_index(&self, flat: usize) -> usize {
		if self.is_contiguous {
			self.offset + flat
		} else {
			linear_index(flat, &self.sizes, &self.strides, self.offset)
		}
	}

	#[inline]
	pub fn get(&self, flat: usize) -> f32 {
		self.storage.get(self.linear_index(flat))
	}

	#[inline]
	fn set(&self, flat: usize, value: f32) {
		self.storage.set(self.linear_index(flat), value);
	}

	/// Elements in logical (row-major) order.
	#[allow(clippy::indexing_slicing)]
	pub fn to_vec(&self) -> Vec<f32> {
		if self.is_contiguous {
			let cells = &self.storage.cells()[self.offset..self.offset + self.numel];
			return cells.iter().map(std::cell::Cell::get).collect();
		}
		(0..self.numel).map(|i| self.get(i)).collect()
	}

	pub fn item(&self) -> Result<f32, ErrPack<TensorOpError>> {
		if self.numel != 1 {
			return Err(ErrPack::new(
				TensorOpError::NotScalar,
				format!("expected one element, shape is {:?}", self.sizes),
			));
		}
		Ok(self.get(0))
	}

	pub fn sum(&self) -> f32 {
		(0..self.numel).map(|i| self.get(i)).sum()
	}

	/// Copies the elements into a fresh contiguous storage.
	pub fn duplicate(&self) -> Result<Self, ErrPack<TensorOpError>> {
		self.map(|x| x)
	}

	/// Returns a contiguous view with the same elements.
	///
	/// If the view is already contiguous, it is returned as is and no copy is made.
	pub fn materialize(&self) -> Result<Self, ErrPack<TensorOpError>> {
		if self.is_contiguous { Ok(self.clone()) } else { self.duplicate() }
	}

	pub fn map(&self, f: impl Fn(f32) -> f32) -> Result<Self, ErrPack<TensorOpError>> {
		let mut data = Vec::new();
		data.try_reserve_exact(self.numel)?;
		data.extend((0..self.numel).map(|i| f(self.get(i))));
		Ok(Self::contiguous_over(Storage::from_vec(data), &self.sizes, self.numel))
	}

	/// Elementwise combination of two views with broadcasting.
	pub fn zip_map(
		&self,
		other: &Self,
		f: impl Fn(f32, f32) -> f32,
	) -> Result<Self, ErrPack<TensorOpError>> {
		let shape = broadcast_shapes(&self.sizes, &other.sizes)?;
		let a = self.expand(&shape)?;
		let b = other.expand(&shape)?;
		let mut data = Vec::new();
		data.try_reserve_exact(a.numel)?;
		data.extend((0..a.numel).map(|i| f(a.get(i), b.get(i))));
		Ok(Self::contiguous_over(Storage::from_vec(data), &shape, a.numel))
	}

	/// Same elements, new shape. Shares storage when the view is contiguous,
	/// otherwise copies first.
	pub fn reshape(&self, shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		let numel = checked_numel(shape)?;
		if numel != self.numel {
			return Err(shape_error(format!("cannot reshape {:?} to {shape:?}", self.sizes)));
		}
		let base = self.materialize()?;
		Ok(Self {
			sizes: DimVec::from(shape),
			strides: compute_strides(shape),
			offset: base.offset,
			numel,
			is_contiguous: true,
			storage: base.storage,
		})
	}

	/// Like `reshape()`, but never copies. Fails on non-contiguous views.
	pub fn view(&self, shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		if !self.is_contiguous {
			return Err(shape_error(format!(
				"cannot view non-contiguous {:?} as {shape:?}; use reshape",
				self.sizes
			)));
		}
		self.reshape(shape)
	}

	/// Broadcast view. Expanded axes get stride 0 and share the storage.
	pub fn expand(&self, shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		if shape == self.sizes.as_slice() {
			return Ok(self.clone());
		}
		let strides = compute_broadcast_strides(&self.sizes, &self.strides, shape)?;
		let numel = checked_numel(shape)?;
		Ok(Self {
			is_contiguous: strides_are_contiguous(shape, &strides),
			sizes: DimVec::from(shape),
			strides,
			offset: self.offset,
			numel,
			storage: self.storage.clone(),
		})
	}

	/// View with arbitrary geometry over the same storage. `offset` is absolute.
	pub fn as_strided(
		&self,
		sizes: &[usize],
		strides: &[usize],
		offset: usize,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Self::with_geometry(self.storage.clone(), sizes, strides, offset)
	}

	pub fn transpose(&self, d0: usize, d1: usize) -> Result<Self, ErrPack<TensorOpError>> {
		let ndim = self.ndim();
		if d0 >= ndim || d1 >= ndim {
			return Err(shape_error(format!("cannot transpose dims {d0}, {d1} of {ndim}-d view")));
		}
		let mut result = self.clone();
		result.sizes.swap(d0, d1);
		result.strides.swap(d0, d1);
		result.is_contiguous = strides_are_contiguous(&result.sizes, &result.strides);
		Ok(result)
	}

	/// Reorders the axes. Axis `i` of the result is axis `perm[i]` of `self`.
	#[allow(clippy::indexing_slicing)]
	pub fn permute(&self, perm: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		let ndim = self.ndim();
		let mut seen: SmallVec<[bool; INLINE_DIMS]> = smallvec![false; ndim];
		let valid = perm.len() == ndim
			&& perm.iter().all(|&d| d < ndim && !std::mem::replace(&mut seen[d], true));
		if !valid {
			return Err(shape_error(format!("{perm:?} is not a permutation of {ndim} axes")));
		}
		let mut result = self.clone();
		result.sizes = perm.iter().map(|&d| self.sizes[d]).collect();
		result.strides = perm.iter().map(|&d| self.strides[d]).collect();
		result.is_contiguous = strides_are_contiguous(&result.sizes, &result.strides);
		Ok(result)
	}

	/// Window of `len` elements along `dim`, starting at `start`.
	#[allow(clippy::indexing_slicing)]
	pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self, ErrPack<TensorOpError>> {
		let Some(&size) = self.sizes.get(dim) else {
			return Err(shape_error(format!("dim {dim} out of range for {:?}", self.sizes)));
		};
		if start.checked_add(len).is_none_or(|end| end > size) {
			return Err(shape_error(format!(
				"range {start}..{start}+{len} out of bounds for dim {dim} of size {size}"
			)));
		}
		let mut result = self.clone();
		if len > 0 {
			result.offset += start * self.strides[dim];
		}
		result.sizes[dim] = len;
		result.numel = if size == 0 { 0 } else { self.numel / size * len };
		result.is_contiguous = strides_are_contiguous(&result.sizes, &result.strides);
		Ok(result)
	}

	/// Concatenates views along `dim`. All other dimensions must agree.
	#[allow(clippy::indexing_slicing)]
	pub fn cat(views: &[Self], dim: usize) -> Result<Self, ErrPack<TensorOpError>> {
		let Some(first) = views.first() else {
			return Err(shape_error("cannot concatenate an empty list".to_string()));
		};
		if dim >= first.ndim() {
			return Err(shape_error(format!("dim {dim} out of range for {:?}", first.sizes)));
		}
		let mut shape = first.sizes.clone();
		shape[dim] = 0;
		for v in views {
			let compatible = v.ndim() == first.ndim()
				&& v.sizes.iter().zip(&first.sizes).enumerate().all(|(d, (a, b))| d == dim || a == b);
			if !compatible {
				return Err(shape_error(format!(
					"cannot concatenate {:?} with {:?} along dim {dim}",
					first.sizes, v.sizes
				)));
			}
			shape[dim] += v.sizes[dim];
		}
		let result = Self::empty(&shape)?;
		let mut start = 0;
		for v in views {
			let len = v.sizes[dim];
			result.narrow(dim, start, len)?.assign(v)?;
			start += len;
		}
		Ok(result)
	}

	/// Writes `value` to every element visible through this view.
	pub fn fill(&self, value: f32) {
		for i in 0..self.numel {
			self.set(i, value);
		}
	}

	/// Copies `src` into this view elementwise. Shapes must match exactly.
	pub fn assign(&self, src: &Self) -> Result<(), ErrPack<TensorOpError>> {
		self.check_same_shape(src)?;
		for i in 0..self.numel {
			self.set(i, src.get(i));
		}
		Ok(())
	}

	/// `self += src`, writing through the view. Shapes must match exactly.
	pub fn add_assign(&self, src: &Self) -> Result<(), ErrPack<TensorOpError>> {
		self.check_same_shape(src)?;
		for i in 0..self.numel {
			self.storage.add_at(self.linear_index(i), src.get(i));
		}
		Ok(())
	}

	fn check_same_shape(&self, other: &Self) -> Result<(), ErrPack<TensorOpError>> {
		if self.sizes != other.sizes {
			return Err(shape_error(format!(
				"shape mismatch: {:?} vs {:?}",
				self.sizes, other.sizes
			)));
		}
		Ok(())
	}

	/// Sums over broadcast axes so the result has `shape`.
	///
	/// This is the reverse of `expand(shape)`.
	pub fn sum_to_shape(&self, shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		if shape == self.sizes.as_slice() {
			return Ok(self.clone());
		}
		let result = Self::empty(shape)?;
		let strides = compute_broadcast_strides(shape, &compute_strides(shape), &self.sizes)?;
		for i in 0..self.numel {
			let j = linear_index(i, &self.sizes, &strides, 0);
			result.storage.add_at(j, self.get(i));
		}
		Ok(result)
	}

	/// `[m, k] x [k, n] -> [m, n]`
	#[allow(clippy::indexing_slicing)]
	pub fn matmul(&self, other: &Self) -> Result<Self, ErrPack<TensorOpError>> {
		let (&[m, k], &[k2, n]) = (self.shape(), other.shape()) else {
			return Err(shape_error(format!(
				"matmul needs 2-d operands, got {:?} and {:?}",
				self.sizes, other.sizes
			)));
		};
		if k != k2 {
			return Err(shape_error(format!(
				"matmul inner dimensions differ: {:?} x {:?}",
				self.sizes, other.sizes
			)));
		}
		let a = self.materialize()?.to_vec();
		let b = other.materialize()?.to_vec();
		let mut out = Vec::new();
		out.try_reserve_exact(m * n)?;
		out.resize(m * n, 0.0);
		for i in 0..m {
			for p in 0..k {
				let a_ip = a[i * k + p];
				for j in 0..n {
					out[i * n + j] += a_ip * b[p * n + j];
				}
			}
		}
		Self::from_vec(&[m, n], out)
	}

	/// Softmax over the last dimension.
	pub fn softmax(&self) -> Result<Self, ErrPack<TensorOpError>> {
		let mut data = self.to_vec();
		let row = self.sizes.last().copied().unwrap_or(1);
		if row > 0 {
			for chunk in data.chunks_mut(row) {
				let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
				let mut total = 0.0;
				for x in chunk.iter_mut() {
					*x = (*x - max).exp();
					total += *x;
				}
				for x in chunk.iter_mut() {
					*x /= total;
				}
			}
		}
		Self::from_vec(&self.sizes, data)
	}
}

impl std::fmt::Debug for View {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("View")
			.field("sizes", &self.sizes.as_slice())
			.field("strides", &self.strides.as_slice())
			.field("offset", &self.offset)
			.field("data", &self.to_vec())
			.finish()
	}
}

//--------------------------------------------------------------------------------------------------
