//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::Cell;
use std::rc::Rc;

use crate::ErrPack;

use super::TensorOpError;

//--------------------------------------------------------------------------------------------------

/// Flat buffer of `f32` shared by all views that alias it.
///
/// Storage is always handled through `Rc<Storage>`. The strong count is the number of
/// views referencing the buffer, and the buffer is freed when the last one is dropped.
///
/// Elements are `Cell`s so that in-place operators can write through any view without
/// a mutable borrow. The engine is single threaded; `Rc` keeps it that way.
pub struct Storage {
	data: Box<[Cell<f32>]>,
}

impl Storage {
	/// Allocates `size` zero-initialized elements.
	pub fn allocate(size: usize) -> Result<Rc<Self>, ErrPack<TensorOpError>> {
		Self::filled(size, 0.0)
	}

	pub fn filled(size: usize, value: f32) -> Result<Rc<Self>, ErrPack<TensorOpError>> {
		let mut data: Vec<Cell<f32>> = Vec::new();
		data.try_reserve_exact(size)?;
		data.resize_with(size, || Cell::new(value));
		Ok(Rc::new(Self { data: data.into_boxed_slice() }))
	}

	pub fn from_vec(data: Vec<f32>) -> Rc<Self> {
		Rc::new(Self { data: data.into_iter().map(Cell::new).collect() })
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// # Panics
	/// - when `index` is out of bounds. Views validate their geometry on construction,
	///   so indices produced by `View::linear_index()` are always in bounds.
	#[inline]
	#[allow(clippy::indexing_slicing)]
	pub fn get(&self, index: usize) -> f32 {
		self.data[index].get()
	}

	#[inline]
	#[allow(clippy::indexing_slicing)]
	pub fn set(&self, index: usize, value: f32) {
		self.data[index].set(value);
	}

	#[inline]
	#[allow(clippy::indexing_slicing)]
	pub fn add_at(&self, index: usize, value: f32) {
		let cell = &self.data[index];
		cell.set(cell.get() + value);
	}

	pub fn cells(&self) -> &[Cell<f32>] {
		&self.data
	}

	/// Number of views currently sharing this storage.
	pub fn ref_count(this: &Rc<Self>) -> usize {
		Rc::strong_count(this)
	}

	pub fn ptr_eq(a: &Rc<Self>, b: &Rc<Self>) -> bool {
		Rc::ptr_eq(a, b)
	}
}

impl std::fmt::Debug for Storage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Storage(len={})", self.data.len())
	}
}

//--------------------------------------------------------------------------------------------------
