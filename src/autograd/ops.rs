//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::{SmallVec, smallvec};
use thin_vec::ThinVec;

use crate::ErrPack;
use crate::tensor::{TensorOpError, View};

use super::context::is_grad_enabled;
use super::function::{Function, Op, OpAttrs, SavedTensor};
use super::node::Node;

//--------------------------------------------------------------------------------------------------

pub(crate) type Saved = SmallVec<[SavedTensor; 2]>;

pub const DEFAULT_ELU_ALPHA: f32 = 1.0;
pub const DEFAULT_LEAKY_RELU_SLOPE: f32 = 0.01;

/// Wraps a forward result into a node.
///
/// A `Function` is attached only if gradient mode is enabled and at least one input
/// requires a gradient. `saved` is not evaluated otherwise.
pub(crate) fn record(
	op: Op,
	inputs: &[&Node],
	value: View,
	saved: impl FnOnce() -> Saved,
	attrs: OpAttrs,
) -> Result<Node, ErrPack<TensorOpError>> {
	op.check_arity(inputs.len())?;
	if !is_grad_enabled() || !inputs.iter().any(|n| n.requires_grad()) {
		return Ok(Node::from_op(value, None));
	}
	let inputs: ThinVec<Node> = inputs.iter().map(|&n| n.clone()).collect();
	let function = Function::new(op, inputs, saved(), attrs)?;
	Ok(Node::from_op(value, Some(function)))
}

#[cold]
#[inline(never)]
fn invalid_value(op: Op, what: &str, x: f32) -> ErrPack<TensorOpError> {
	ErrPack::new(TensorOpError::InvalidValue, format!("'{op}': {what} ({x})"))
}

fn check_all(
	op: Op,
	value: &View,
	what: &str,
	ok: impl Fn(f32) -> bool,
) -> Result<(), ErrPack<TensorOpError>> {
	match (0..value.numel()).map(|i| value.get(i)).find(|&x| !ok(x)) {
		Some(x) => Err(invalid_value(op, what, x)),
		None => Ok(()),
	}
}

fn check_finite(op: Op, value: &View) -> Result<(), ErrPack<TensorOpError>> {
	check_all(op, value, "input is NaN or infinite", f32::is_finite)
}

//--------------------------------------------------------------------------------------------------

/// Elementwise math shared by forward and backward rules.
pub mod scalar {
	pub fn sigmoid(x: f32) -> f32 {
		if x >= 0.0 {
			1.0 / (1.0 + (-x).exp())
		} else {
			let e = x.exp();
			e / (1.0 + e)
		}
	}

	const GELU_C: f32 = 0.797_884_6; // sqrt(2 / pi)
	const GELU_K: f32 = 0.044_715;

	/// GELU, tanh approximation.
	pub fn gelu(x: f32) -> f32 {
		0.5 * x * (1.0 + (GELU_C * (x + GELU_K * x * x * x)).tanh())
	}

	pub fn gelu_grad(x: f32) -> f32 {
		let t = (GELU_C * (x + GELU_K * x * x * x)).tanh();
		0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_C * (1.0 + 3.0 * GELU_K * x * x)
	}

	pub fn elu(x: f32, alpha: f32) -> f32 {
		if x > 0.0 { x } else { alpha * (x.exp() - 1.0) }
	}
}

//--------------------------------------------------------------------------------------------------
// Binary operations. Operands are broadcast against each other.

pub fn add(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().zip_map(&b.value(), |x, y| x + y)?;
	record(Op::Add, &[a, b], value, Saved::new, OpAttrs::None)
}

pub fn sub(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().zip_map(&b.value(), |x, y| x - y)?;
	record(Op::Sub, &[a, b], value, Saved::new, OpAttrs::None)
}

pub fn mul(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().zip_map(&b.value(), |x, y| x * y)?;
	let saved = || smallvec![SavedTensor::input(0, a), SavedTensor::input(1, b)];
	record(Op::Mul, &[a, b], value, saved, OpAttrs::None)
}

pub fn div(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let divisor = b.value();
	check_all(Op::Div, &divisor, "division by zero", |x| x != 0.0)?;
	let value = a.value().zip_map(&divisor, |x, y| x / y)?;
	let saved = || smallvec![SavedTensor::input(0, a), SavedTensor::input(1, b)];
	record(Op::Div, &[a, b], value, saved, OpAttrs::None)
}

/// `a ^ b`, elementwise.
pub fn pow(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().zip_map(&b.value(), f32::powf)?;
	check_all(Op::Pow, &value, "result is NaN", |x| !x.is_nan())?;
	let saved = || smallvec![SavedTensor::input(0, a), SavedTensor::input(1, b)];
	record(Op::Pow, &[a, b], value, saved, OpAttrs::None)
}

/// `[m, k] x [k, n] -> [m, n]`
pub fn matmul(a: &Node, b: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().matmul(&b.value())?;
	let saved = || smallvec![SavedTensor::input(0, a), SavedTensor::input(1, b)];
	record(Op::MatMul, &[a, b], value, saved, OpAttrs::None)
}

pub fn add_scalar(a: &Node, s: f32) -> Result<Node, ErrPack<TensorOpError>> {
	add(a, &Node::leaf(s, false))
}

pub fn mul_scalar(a: &Node, s: f32) -> Result<Node, ErrPack<TensorOpError>> {
	mul(a, &Node::leaf(s, false))
}

pub fn pow_scalar(a: &Node, s: f32) -> Result<Node, ErrPack<TensorOpError>> {
	pow(a, &Node::leaf(s, false))
}

//--------------------------------------------------------------------------------------------------
// Unary operations.

fn unary_saving_input(
	op: Op,
	a: &Node,
	attrs: OpAttrs,
	f: impl Fn(f32) -> f32,
) -> Result<Node, ErrPack<TensorOpError>> {
	let x = a.value();
	check_finite(op, &x)?;
	let value = x.map(f)?;
	record(op, &[a], value, || smallvec![SavedTensor::input(0, a)], attrs)
}

fn unary_saving_output(
	op: Op,
	a: &Node,
	f: impl Fn(f32) -> f32,
) -> Result<Node, ErrPack<TensorOpError>> {
	let x = a.value();
	check_finite(op, &x)?;
	let value = x.map(f)?;
	let saved_value = value.clone();
	record(op, &[a], value, || smallvec![SavedTensor::output(saved_value)], OpAttrs::None)
}

pub fn exp(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_output(Op::Exp, a, f32::exp)
}

/// Natural logarithm. Inputs must be positive.
pub fn log(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	check_all(Op::Log, &a.value(), "input must be positive", |x| x > 0.0)?;
	unary_saving_input(Op::Log, a, OpAttrs::None, f32::ln)
}

pub fn tanh(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_output(Op::Tanh, a, f32::tanh)
}

pub fn sigmoid(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_output(Op::Sigmoid, a, scalar::sigmoid)
}

pub fn relu(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_input(Op::Relu, a, OpAttrs::None, |x| x.max(0.0))
}

pub fn elu_with(a: &Node, alpha: f32) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_input(Op::Elu, a, OpAttrs::Slope(alpha), |x| scalar::elu(x, alpha))
}

pub fn elu(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	elu_with(a, DEFAULT_ELU_ALPHA)
}

pub fn gelu(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	unary_saving_input(Op::Gelu, a, OpAttrs::None, scalar::gelu)
}

pub fn leaky_relu_with(a: &Node, slope: f32) -> Result<Node, ErrPack<TensorOpError>> {
	let f = move |x: f32| if x > 0.0 { x } else { slope * x };
	unary_saving_input(Op::LeakyRelu, a, OpAttrs::Slope(slope), f)
}

pub fn leaky_relu(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	leaky_relu_with(a, DEFAULT_LEAKY_RELU_SLOPE)
}

/// Identity activation.
pub fn linear(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().duplicate()?;
	record(Op::Linear, &[a], value, Saved::new, OpAttrs::None)
}

/// Softmax over the last dimension.
pub fn softmax(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let x = a.value();
	check_finite(Op::Softmax, &x)?;
	let value = x.softmax()?;
	record(Op::Softmax, &[a], value, || smallvec![SavedTensor::input(0, a)], OpAttrs::None)
}

pub fn neg(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = a.value().map(|x| -x)?;
	record(Op::Neg, &[a], value, Saved::new, OpAttrs::None)
}

/// Sum of all elements, as a node of shape `[1]`.
pub fn sum(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let value = View::scalar(a.value().sum());
	record(Op::Sum, &[a], value, Saved::new, OpAttrs::None)
}

/// Mean of all elements, as a node of shape `[1]`.
pub fn mean(a: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	let x = a.value();
	let n = x.numel().max(1) as f32;
	let value = View::scalar(x.sum() / n);
	record(Op::Mean, &[a], value, Saved::new, OpAttrs::None)
}

//--------------------------------------------------------------------------------------------------
