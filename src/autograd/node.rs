//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ErrPack;
use crate::tensor::{DimVec, TensorOpError, View};

use super::context::is_grad_enabled;
use super::engine;
use super::function::{Function, Op};

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
	fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(0);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}

	pub fn raw(self) -> u64 {
		self.0
	}
}

impl std::fmt::Display for NodeId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "#{}", self.0)
	}
}

//--------------------------------------------------------------------------------------------------

struct NodeInner {
	id: NodeId,
	value: RefCell<View>,
	requires_grad: Cell<bool>,
	is_leaf: Cell<bool>,
	retain_grad: Cell<bool>,
	grad: RefCell<Option<View>>,
	grad_fn: RefCell<Option<Function>>,

	// the node whose storage this one is a view of
	base: OnceCell<Weak<NodeInner>>,

	// bumped by every in-place operator, shared with all nodes over the same storage
	version: RefCell<Rc<Cell<u64>>>,
}

impl Drop for NodeInner {
	fn drop(&mut self) {
		// Dropping a long chain recursively would overflow the stack. Unlink the
		// predecessors we hold the last reference to and drop them one at a time.
		let Some(grad_fn) = self.grad_fn.get_mut().take() else {
			return;
		};
		let mut pending = grad_fn.into_inputs();
		while let Some(node) = pending.pop() {
			if let Some(mut inner) = Rc::into_inner(node.inner) {
				if let Some(grad_fn) = inner.grad_fn.get_mut().take() {
					pending.extend(grad_fn.into_inputs());
				}
			}
		}
	}
}

/// A vertex of the computation graph: a tensor value plus autograd bookkeeping.
///
/// `Node` is a cheap handle. Clones refer to the same vertex.
#[derive(Clone)]
pub struct Node {
	inner: Rc<NodeInner>,
}

impl Node {
	fn new(value: View, requires_grad: bool, is_leaf: bool, grad_fn: Option<Function>) -> Self {
		Self {
			inner: Rc::new(NodeInner {
				id: NodeId::next(),
				value: RefCell::new(value),
				requires_grad: Cell::new(requires_grad),
				is_leaf: Cell::new(is_leaf),
				retain_grad: Cell::new(false),
				grad: RefCell::new(None),
				grad_fn: RefCell::new(grad_fn),
				base: OnceCell::new(),
				version: RefCell::new(Rc::new(Cell::new(0))),
			}),
		}
	}

	/// Leaf holding a single value. Gradients are only tracked if `requires_grad` is set
	/// and gradient mode is enabled.
	pub fn leaf(value: f32, requires_grad: bool) -> Self {
		Self::from_view(View::scalar(value), requires_grad)
	}

	/// Leaf wrapping an existing view.
	pub fn from_view(value: View, requires_grad: bool) -> Self {
		Self::new(value, requires_grad && is_grad_enabled(), true, None)
	}

	pub fn from_vec(
		shape: &[usize],
		data: Vec<f32>,
		requires_grad: bool,
	) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self::from_view(View::from_vec(shape, data)?, requires_grad))
	}

	/// Zero-filled leaf that doesn't require gradients.
	pub fn empty(shape: &[usize]) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self::from_view(View::empty(shape)?, false))
	}

	pub fn full(shape: &[usize], value: f32) -> Result<Self, ErrPack<TensorOpError>> {
		Ok(Self::from_view(View::full(shape, value)?, false))
	}

	pub fn zeros_like(&self) -> Result<Self, ErrPack<TensorOpError>> {
		Self::full(&self.shape(), 0.0)
	}

	pub fn ones_like(&self) -> Result<Self, ErrPack<TensorOpError>> {
		Self::full(&self.shape(), 1.0)
	}

	/// Result of an operation. `requires_grad` follows from the presence of `grad_fn`.
	pub(crate) fn from_op(value: View, grad_fn: Option<Function>) -> Self {
		let requires_grad = grad_fn.is_some();
		Self::new(value, requires_grad, false, grad_fn)
	}

	/// Marks this node as a view of `base`. Writes through either one are seen by the
	/// version checks of both.
	pub(crate) fn set_base(&self, base: &Self) {
		let owner = base.inner.base.get().cloned().unwrap_or_else(|| Rc::downgrade(&base.inner));
		let _ = self.inner.base.set(owner);
		self.share_version(base);
	}

	fn share_version(&self, other: &Self) {
		let counter = other.inner.version.borrow().clone();
		*self.inner.version.borrow_mut() = counter;
	}

	pub fn id(&self) -> NodeId {
		self.inner.id
	}

	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}

	/// The current value. The returned view shares storage with the node.
	pub fn value(&self) -> View {
		self.inner.value.borrow().clone()
	}

	pub fn shape(&self) -> DimVec {
		DimVec::from(self.inner.value.borrow().shape())
	}

	pub fn numel(&self) -> usize {
		self.inner.value.borrow().numel()
	}

	pub fn to_vec(&self) -> Vec<f32> {
		self.inner.value.borrow().to_vec()
	}

	pub fn item(&self) -> Result<f32, ErrPack<TensorOpError>> {
		self.inner.value.borrow().item()
	}

	/// The node this one is a view of, if it is still alive.
	pub fn base(&self) -> Option<Self> {
		self.inner.base.get().and_then(Weak::upgrade).map(|inner| Self { inner })
	}

	pub fn requires_grad(&self) -> bool {
		self.inner.requires_grad.get()
	}

	pub fn is_leaf(&self) -> bool {
		self.inner.is_leaf.get()
	}

	/// Changes whether a leaf tracks gradients.
	///
	/// On non-leaf nodes this is a no-op: their flag is determined by how they were
	/// produced.
	pub fn set_requires_grad(&self, requires_grad: bool) {
		if !self.is_leaf() {
			log::debug!("set_requires_grad() ignored on non-leaf node {}", self.id());
			return;
		}
		self.inner.requires_grad.set(requires_grad);
	}

	/// Keep the gradient of a non-leaf node after backward. Leaves always keep theirs.
	pub fn retain_grad(&self) {
		self.inner.retain_grad.set(true);
	}

	pub fn retains_grad(&self) -> bool {
		self.is_leaf() || self.inner.retain_grad.get()
	}

	pub fn version(&self) -> u64 {
		self.inner.version.borrow().get()
	}

	fn bump_version(&self) {
		let version = self.inner.version.borrow();
		version.set(version.get() + 1);
	}

	pub fn has_grad_fn(&self) -> bool {
		self.inner.grad_fn.borrow().is_some()
	}

	/// Tag of the operation that produced this node, if it was recorded.
	pub fn grad_fn(&self) -> Option<Op> {
		self.inner.grad_fn.borrow().as_ref().map(Function::op)
	}

	/// Nodes this one was computed from. Empty for leaves and untracked results.
	pub fn predecessors(&self) -> Vec<Self> {
		self.inner.grad_fn.borrow().as_ref().map(|f| f.inputs().to_vec()).unwrap_or_default()
	}

	pub(crate) fn with_grad_fn<R>(&self, f: impl FnOnce(Option<&Function>) -> R) -> R {
		f(self.inner.grad_fn.borrow().as_ref())
	}

	#[cfg(test)]
	pub(crate) fn with_grad_fn_mut<R>(&self, f: impl FnOnce(Option<&mut Function>) -> R) -> R {
		f(self.inner.grad_fn.borrow_mut().as_mut())
	}

	//----------------------------------------------------------------------------------------------

	/// The accumulated gradient, if any contribution has been received.
	pub fn grad(&self) -> Option<View> {
		self.inner.grad.borrow().clone()
	}

	/// Adds `grad` into the accumulated gradient. No-op if the node doesn't require grad.
	pub fn acc_grad(&self, grad: &View) -> Result<(), ErrPack<TensorOpError>> {
		if !self.requires_grad() {
			return Ok(());
		}
		if grad.shape() != self.shape().as_slice() {
			return Err(ErrPack::new(
				TensorOpError::InconsistentGraph,
				format!(
					"gradient of shape {:?} for node {} of shape {:?}",
					grad.shape(),
					self.id(),
					self.shape()
				),
			));
		}
		let mut slot = self.inner.grad.borrow_mut();
		if let Some(acc) = slot.as_ref() {
			acc.add_assign(grad)
		} else {
			// the accumulator is exclusively ours, never an alias of an upstream gradient
			*slot = Some(grad.duplicate()?);
			Ok(())
		}
	}

	pub fn zero_grad(&self) {
		self.inner.grad.borrow_mut().take();
	}

	//----------------------------------------------------------------------------------------------

	/// Gradient of this 1-element node with respect to every node it depends on.
	pub fn backward(&self) -> Result<(), ErrPack<TensorOpError>> {
		engine::backward(self)
	}

	/// Like `backward()`, but seeded with an explicit gradient of the node's shape.
	pub fn backward_with(&self, seed: &View) -> Result<(), ErrPack<TensorOpError>> {
		engine::backward_with(self, seed)
	}

	/// New leaf sharing this node's storage, outside the graph.
	///
	/// The result may be modified in place, but doing so invalidates tensors saved from
	/// this node for backward.
	pub fn detach(&self) -> Self {
		let detached = Self::new(self.value(), false, true, None);
		detached.share_version(self);
		detached
	}

	/// Cuts this node out of the graph in place. It becomes a leaf that doesn't
	/// require gradients.
	pub fn detach_(&self) {
		let grad_fn = self.inner.grad_fn.borrow_mut().take();
		drop(grad_fn);
		self.inner.is_leaf.set(true);
		self.inner.requires_grad.set(false);
	}

	//----------------------------------------------------------------------------------------------

	/// Fails if this node, or the node owning its storage, is a leaf that requires grad
	/// while gradients are tracked.
	fn check_inplace(&self, what: &str) -> Result<(), ErrPack<TensorOpError>> {
		if !is_grad_enabled() {
			return Ok(());
		}
		let owner = self.base();
		for node in std::iter::once(self).chain(owner.as_ref()) {
			if node.is_leaf() && node.requires_grad() {
				return Err(ErrPack::new(
					TensorOpError::InvalidValue,
					format!(
						"{what}: leaf {} requires grad and cannot be modified in place \
						while gradients are tracked",
						node.id()
					),
				));
			}
		}
		Ok(())
	}

	/// Rebinds the node to a fresh zero-filled storage of `shape`.
	pub fn resize_(&self, shape: &[usize]) -> Result<(), ErrPack<TensorOpError>> {
		self.check_inplace("resize_")?;
		let value = View::empty(shape)?;
		*self.inner.value.borrow_mut() = value;
		self.bump_version();
		Ok(())
	}

	/// Rebinds the node to `source`, sharing its storage.
	pub fn set_(&self, source: &View) -> Result<(), ErrPack<TensorOpError>> {
		self.check_inplace("set_")?;
		*self.inner.value.borrow_mut() = source.clone();
		self.bump_version();
		Ok(())
	}

	/// Writes `value` to every element. Views sharing the storage see the change.
	pub fn fill_(&self, value: f32) -> Result<(), ErrPack<TensorOpError>> {
		self.check_inplace("fill_")?;
		self.inner.value.borrow().fill(value);
		self.bump_version();
		Ok(())
	}

	/// `value -= scale * delta`, in place.
	pub fn sub_scaled_(&self, delta: &View, scale: f32) -> Result<(), ErrPack<TensorOpError>> {
		self.check_inplace("sub_scaled_")?;
		let step = delta.map(|d| -scale * d)?;
		self.inner.value.borrow().add_assign(&step)?;
		self.bump_version();
		Ok(())
	}
}

impl std::fmt::Debug for Node {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Node")
			.field("id", &self.id())
			.field("value", &*self.inner.value.borrow())
			.field("requires_grad", &self.requires_grad())
			.field("is_leaf", &self.is_leaf())
			.field("grad_fn", &self.grad_fn())
			.finish_non_exhaustive()
	}
}

//--------------------------------------------------------------------------------------------------
