//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Reverse-mode automatic differentiation.
//!
//! Operations compute their values eagerly. If gradient mode is enabled and an input
//! requires a gradient, the result also gets a `Function` recording the inputs and
//! whatever the backward rule needs. `Node::backward()` then walks the recorded graph
//! in reverse topological order.

pub mod context;
pub mod engine;
pub mod function;
pub mod node;
pub mod ops;
pub mod views;

#[cfg(test)]
mod tests;

pub use context::{NoGradGuard, is_grad_enabled, no_grad, no_grad_depth, pop_no_grad, push_no_grad};
pub use engine::{backward, backward_with};
pub use function::{Arity, Function, Op, OpAttrs, SavedTensor};
pub use node::{Node, NodeId};
pub use ops::{
	add, add_scalar, div, elu, elu_with, exp, gelu, leaky_relu, leaky_relu_with, linear, log,
	matmul, mean, mul, mul_scalar, neg, pow, pow_scalar, relu, sigmoid, softmax, sub, sum, tanh,
};
pub use views::{as_strided, broadcast_to, cat, contiguous, expand, reshape, transpose, view};
