//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use crate::ErrPack;
use crate::autograd::Node;
use crate::nn::param::Param;
use crate::rng::Rng;
use crate::tensor::TensorOpError;

use super::Layer;

//--------------------------------------------------------------------------------------------------

/// Layers applied one after another.
#[derive(Default)]
pub struct Sequential {
	layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
	pub fn new() -> Self {
		Self { layers: Vec::new() }
	}

	pub fn push(&mut self, layer: impl Layer + 'static) -> &mut Self {
		self.layers.push(Box::new(layer));
		self
	}

	pub fn len(&self) -> usize {
		self.layers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.layers.is_empty()
	}
}

impl Layer for Sequential {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		for layer in &self.layers {
			layer.collect_params(f);
		}
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		for (i, layer) in self.layers.iter().enumerate() {
			layer.collect_named_params(&format!("{prefix}.{i}"), f);
		}
	}

	fn forward(&self, inp: &Node) -> Result<Node, ErrPack<TensorOpError>> {
		let mut out = inp.clone();
		for layer in &self.layers {
			out = layer.forward(&out)?;
		}
		Ok(out)
	}

	fn randomize(&mut self, rng: &mut Rng) -> Result<(), ErrPack<TensorOpError>> {
		for layer in &mut self.layers {
			layer.randomize(rng)?;
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
