//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;
use std::str::FromStr;

use crate::ErrPack;
use crate::autograd::ops::{DEFAULT_ELU_ALPHA, DEFAULT_LEAKY_RELU_SLOPE};
use crate::autograd::{self, Node};
use crate::nn::param::Param;
use crate::rng::Rng;
use crate::tensor::TensorOpError;

use super::Layer;

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
	Relu,
	Sigmoid,
	Tanh,
	Elu { alpha: f32 },
	Gelu,
	LeakyRelu { negative_slope: f32 },
	Linear,
	/// over the last dimension
	Softmax,
}

impl Activation {
	pub fn apply(self, inp: &Node) -> Result<Node, ErrPack<TensorOpError>> {
		match self {
			Self::Relu => autograd::relu(inp),
			Self::Sigmoid => autograd::sigmoid(inp),
			Self::Tanh => autograd::tanh(inp),
			Self::Elu { alpha } => autograd::elu_with(inp, alpha),
			Self::Gelu => autograd::gelu(inp),
			Self::LeakyRelu { negative_slope } => autograd::leaky_relu_with(inp, negative_slope),
			Self::Linear => autograd::linear(inp),
			Self::Softmax => autograd::softmax(inp),
		}
	}
}

impl FromStr for Activation {
	type Err = ErrPack<TensorOpError>;

	/// Parses an activation name. Parameterized activations get their default parameter.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"relu" => Ok(Self::Relu),
			"sigmoid" => Ok(Self::Sigmoid),
			"tanh" => Ok(Self::Tanh),
			"elu" => Ok(Self::Elu { alpha: DEFAULT_ELU_ALPHA }),
			"gelu" => Ok(Self::Gelu),
			"leaky_relu" => Ok(Self::LeakyRelu { negative_slope: DEFAULT_LEAKY_RELU_SLOPE }),
			"linear" => Ok(Self::Linear),
			"softmax" => Ok(Self::Softmax),
			_ => Err(ErrPack::new(
				TensorOpError::UnsupportedOperation,
				format!("unknown activation '{s}'"),
			)),
		}
	}
}

impl Layer for Activation {
	fn collect_params(&self, _f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		// no parameters to collect
	}

	fn collect_named_params(&self, _prefix: &str, _f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		// no parameters to collect
	}

	fn forward(&self, inp: &Node) -> Result<Node, ErrPack<TensorOpError>> {
		self.apply(inp)
	}

	fn randomize(&mut self, _rng: &mut Rng) -> Result<(), ErrPack<TensorOpError>> {
		// no parameters to randomize
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
