//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use crate::ErrPack;
use crate::autograd::{Node, no_grad};
use crate::tensor::{TensorOpError, View};

//--------------------------------------------------------------------------------------------------

/// Per-parameter optimizer state. `Sgd` keeps its velocity in `m`.
pub struct Moments {
	pub(crate) m: View,
	pub(crate) v: View,
}

/// A trainable tensor: a leaf node that requires gradients.
pub struct Param {
	node: Node,
	moments: Option<Moments>,
}

impl Param {
	pub fn new(shape: &[usize]) -> Result<Rc<RefCell<Self>>, ErrPack<TensorOpError>> {
		let node = Node::from_view(View::empty(shape)?, true);
		// created inside a no-grad scope, the flag would have been dropped
		node.set_requires_grad(true);
		Ok(Rc::new(RefCell::new(Self { node, moments: None })))
	}

	pub fn node(&self) -> &Node {
		&self.node
	}

	pub fn value(&self) -> View {
		self.node.value()
	}

	pub fn numel(&self) -> usize {
		self.node.numel()
	}

	pub fn grad(&self) -> Option<View> {
		self.node.grad()
	}

	pub fn zero_grad(&self) {
		self.node.zero_grad();
	}

	/// Overwrites the value with `data`, outside the graph.
	pub fn assign(&mut self, data: Vec<f32>) -> Result<(), ErrPack<TensorOpError>> {
		let value = View::from_vec(&self.node.shape(), data)?;
		no_grad(|| self.node.set_(&value))?;
		self.moments = None;
		Ok(())
	}

	#[cold]
	#[inline(never)]
	fn init_moments(&mut self) -> Result<&mut Moments, ErrPack<TensorOpError>> {
		let shape = self.node.shape();
		let moments = Moments { m: View::empty(&shape)?, v: View::empty(&shape)? };
		Ok(self.moments.insert(moments))
	}

	pub(crate) fn moments(&mut self) -> Result<&mut Moments, ErrPack<TensorOpError>> {
		if let Some(ref mut moments) = self.moments {
			Ok(moments)
		} else {
			self.init_moments()
		}
	}
}

//--------------------------------------------------------------------------------------------------
