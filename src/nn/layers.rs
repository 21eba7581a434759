//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

pub mod activation;
pub mod dense;
pub mod sequential;

use crate::ErrPack;
use crate::autograd::Node;
use crate::rng::Rng;
use crate::tensor::TensorOpError;

use super::Param;

pub use activation::Activation;
pub use dense::Dense;
pub use sequential::Sequential;

pub trait Layer {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>));
	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>));

	fn params(&self) -> Vec<Rc<RefCell<Param>>> {
		let mut params = Vec::new();
		self.collect_params(&mut |p| params.push(p));
		params
	}

	fn named_params(&self, prefix: &str) -> Vec<(String, Rc<RefCell<Param>>)> {
		let mut params = Vec::new();
		self.collect_named_params(prefix, &mut |name, p| params.push((name, p)));
		params
	}

	/// Computes the output. The graph is recorded if gradient mode is enabled.
	fn forward(&self, inp: &Node) -> Result<Node, ErrPack<TensorOpError>>;

	fn randomize(&mut self, rng: &mut Rng) -> Result<(), ErrPack<TensorOpError>>;
}
