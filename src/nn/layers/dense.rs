//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use crate::ErrPack;
use crate::autograd::{Node, add, matmul};
use crate::nn::param::Param;
use crate::rng::Rng;
use crate::tensor::TensorOpError;

use super::Layer;

//--------------------------------------------------------------------------------------------------

/// Fully connected layer: `out = inp * weight + bias`.
///
/// `inp` has shape `[batch, inputs]`, `weight` is `[inputs, outputs]`.
pub struct Dense {
	inputs: usize,
	outputs: usize,
	weight: Rc<RefCell<Param>>,
	bias: Rc<RefCell<Param>>,
}

impl Dense {
	pub fn new(inputs: usize, outputs: usize) -> Result<Self, ErrPack<TensorOpError>> {
		let weight = Param::new(&[inputs, outputs])?;
		let bias = Param::new(&[outputs])?;
		Ok(Self { inputs, outputs, weight, bias })
	}

	pub fn inputs(&self) -> usize {
		self.inputs
	}

	pub fn outputs(&self) -> usize {
		self.outputs
	}

	pub fn weight(&self) -> &Rc<RefCell<Param>> {
		&self.weight
	}

	pub fn bias(&self) -> &Rc<RefCell<Param>> {
		&self.bias
	}
}

impl Layer for Dense {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		f(self.weight.clone());
		f(self.bias.clone());
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(format!("{prefix}.weight"), self.weight.clone());
		f(format!("{prefix}.bias"), self.bias.clone());
	}

	fn forward(&self, inp: &Node) -> Result<Node, ErrPack<TensorOpError>> {
		let weight = self.weight.borrow().node().clone();
		let bias = self.bias.borrow().node().clone();
		add(&matmul(inp, &weight)?, &bias)
	}

	fn randomize(&mut self, rng: &mut Rng) -> Result<(), ErrPack<TensorOpError>> {
		let mut w = vec![0.0; self.inputs * self.outputs];
		rng.xavier_uniform(self.inputs, self.outputs, &mut w);
		self.weight.borrow_mut().assign(w)?;
		self.bias.borrow_mut().assign(vec![0.0; self.outputs])
	}
}

//--------------------------------------------------------------------------------------------------
