//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::str::FromStr;

use smallvec::SmallVec;
use thin_vec::ThinVec;

use crate::ErrPack;
use crate::tensor::{DimVec, TensorOpError, View, linear_index};

use super::node::Node;
use super::ops::scalar::gelu_grad;

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
	Add,
	Sub,
	Mul,
	Div,
	Pow,
	Exp,
	Log,
	Tanh,
	Sigmoid,
	Relu,
	Softmax,
	Elu,
	Gelu,
	LeakyRelu,
	Linear,
	Neg,
	Sum,
	Mean,
	MatMul,
	View,
	Expand,
	AsStrided,
	Contiguous,
	Cat,
	Transpose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
	Unary,
	Binary,
	Variadic,
}

impl Op {
	pub const ALL: [Self; 25] = [
		Self::Add,
		Self::Sub,
		Self::Mul,
		Self::Div,
		Self::Pow,
		Self::Exp,
		Self::Log,
		Self::Tanh,
		Self::Sigmoid,
		Self::Relu,
		Self::Softmax,
		Self::Elu,
		Self::Gelu,
		Self::LeakyRelu,
		Self::Linear,
		Self::Neg,
		Self::Sum,
		Self::Mean,
		Self::MatMul,
		Self::View,
		Self::Expand,
		Self::AsStrided,
		Self::Contiguous,
		Self::Cat,
		Self::Transpose,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::Add => "add",
			Self::Sub => "sub",
			Self::Mul => "mul",
			Self::Div => "div",
			Self::Pow => "pow",
			Self::Exp => "exp",
			Self::Log => "log",
			Self::Tanh => "tanh",
			Self::Sigmoid => "sigmoid",
			Self::Relu => "relu",
			Self::Softmax => "softmax",
			Self::Elu => "elu",
			Self::Gelu => "gelu",
			Self::LeakyRelu => "leaky_relu",
			Self::Linear => "linear",
			Self::Neg => "neg",
			Self::Sum => "sum",
			Self::Mean => "mean",
			Self::MatMul => "matmul",
			Self::View => "view",
			Self::Expand => "expand",
			Self::AsStrided => "as_strided",
			Self::Contiguous => "contiguous",
			Self::Cat => "cat",
			Self::Transpose => "transpose",
		}
	}

	pub fn arity(self) -> Arity {
		match self {
			Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Pow | Self::MatMul => {
				Arity::Binary
			},
			Self::Cat => Arity::Variadic,
			_ => Arity::Unary,
		}
	}

	/// Number of tensors the backward rule reads.
	fn saved_len(self) -> usize {
		match self {
			Self::Mul | Self::Div | Self::Pow | Self::MatMul => 2,
			Self::Exp
			| Self::Log
			| Self::Tanh
			| Self::Sigmoid
			| Self::Relu
			| Self::Softmax
			| Self::Elu
			| Self::Gelu
			| Self::LeakyRelu
			| Self::AsStrided => 1,
			Self::Add
			| Self::Sub
			| Self::Linear
			| Self::Neg
			| Self::Sum
			| Self::Mean
			| Self::View
			| Self::Expand
			| Self::Contiguous
			| Self::Cat
			| Self::Transpose => 0,
		}
	}

	fn accepts(self, attrs: &OpAttrs) -> bool {
		match (self, attrs) {
			(Self::Elu | Self::LeakyRelu, OpAttrs::Slope(_))
			| (Self::Transpose, OpAttrs::Transpose(..))
			| (Self::Cat, OpAttrs::Cat { .. })
			| (Self::AsStrided, OpAttrs::Strided { .. }) => true,
			(Self::Elu | Self::LeakyRelu | Self::Transpose | Self::Cat | Self::AsStrided, _) => {
				false
			},
			(_, attrs) => matches!(attrs, OpAttrs::None),
		}
	}

	pub fn from_name(name: &str) -> Result<Self, ErrPack<TensorOpError>> {
		Self::ALL.iter().copied().find(|op| op.name() == name).ok_or_else(|| {
			ErrPack::new(TensorOpError::UnsupportedOperation, format!("unknown operation '{name}'"))
		})
	}

	pub(crate) fn check_arity(self, inputs: usize) -> Result<(), ErrPack<TensorOpError>> {
		let ok = match self.arity() {
			Arity::Unary => inputs == 1,
			Arity::Binary => inputs == 2,
			Arity::Variadic => inputs >= 1,
		};
		if !ok {
			return Err(ErrPack::new(
				TensorOpError::UnsupportedOperation,
				format!("'{}' cannot take {inputs} inputs", self.name()),
			));
		}
		Ok(())
	}
}

impl FromStr for Op {
	type Err = ErrPack<TensorOpError>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_name(s)
	}
}

impl std::fmt::Display for Op {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

//--------------------------------------------------------------------------------------------------

/// Non-tensor parameters of an operation.
#[derive(Clone, Debug)]
pub enum OpAttrs {
	None,
	/// `alpha` of elu, `negative_slope` of leaky relu
	Slope(f32),
	Transpose(usize, usize),
	/// sizes of the inputs along `dim`
	Cat { dim: usize, sizes: DimVec },
	Strided { sizes: DimVec, strides: DimVec, offset: usize },
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum SavedFrom {
	Input(usize),
	Output,
}

/// A tensor kept alive for the backward pass, plus the version of the node it came from.
pub struct SavedTensor {
	value: View,
	from: SavedFrom,
	version: u64,
}

impl SavedTensor {
	/// Saves the current value of input `index`.
	pub fn input(index: usize, node: &Node) -> Self {
		Self {
			value: node.value(),
			from: SavedFrom::Input(index),
			version: node.version(),
		}
	}

	/// Saves the forward result. The output node doesn't exist yet, so its version is 0.
	pub fn output(value: View) -> Self {
		Self { value, from: SavedFrom::Output, version: 0 }
	}

	pub fn value(&self) -> &View {
		&self.value
	}

	fn input_index(&self) -> Option<usize> {
		match self.from {
			SavedFrom::Input(index) => Some(index),
			SavedFrom::Output => None,
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward rule attached to a non-leaf node.
///
/// The rule reads only what was captured at construction: the op tag, the input shapes,
/// the saved tensors and the attributes. Later changes to the input nodes don't affect it.
pub struct Function {
	op: Op,
	inputs: ThinVec<Node>,
	input_shapes: SmallVec<[DimVec; 2]>,
	saved: SmallVec<[SavedTensor; 2]>,
	attrs: OpAttrs,
}

impl Function {
	pub fn new(
		op: Op,
		inputs: ThinVec<Node>,
		saved: SmallVec<[SavedTensor; 2]>,
		attrs: OpAttrs,
	) -> Result<Self, ErrPack<TensorOpError>> {
		op.check_arity(inputs.len())?;
		if saved.len() != op.saved_len() {
			return Err(ErrPack::new(
				TensorOpError::UnsupportedOperation,
				format!("'{op}' needs {} saved tensors, got {}", op.saved_len(), saved.len()),
			));
		}
		if !op.accepts(&attrs) {
			return Err(ErrPack::new(
				TensorOpError::UnsupportedOperation,
				format!("'{op}' does not accept attributes {attrs:?}"),
			));
		}
		let out_of_range =
			saved.iter().filter_map(SavedTensor::input_index).find(|&i| i >= inputs.len());
		if let Some(index) = out_of_range {
			return Err(ErrPack::new(
				TensorOpError::UnsupportedOperation,
				format!("'{op}' saves input {index}, but has only {} inputs", inputs.len()),
			));
		}
		if let OpAttrs::Cat { sizes, .. } = &attrs {
			if sizes.len() != inputs.len() {
				return Err(ErrPack::new(
					TensorOpError::UnsupportedOperation,
					format!("'{op}' has {} inputs but {} sizes", inputs.len(), sizes.len()),
				));
			}
		}
		let input_shapes = inputs.iter().map(Node::shape).collect();
		Ok(Self { op, inputs, input_shapes, saved, attrs })
	}

	pub fn op(&self) -> Op {
		self.op
	}

	pub fn inputs(&self) -> &[Node] {
		&self.inputs
	}

	pub(crate) fn into_inputs(self) -> ThinVec<Node> {
		self.inputs
	}

	/// Adds an edge without any checks. Only used to build malformed graphs in tests.
	#[cfg(test)]
	pub(crate) fn push_input(&mut self, node: Node) {
		self.input_shapes.push(node.shape());
		self.inputs.push(node);
	}

	/// Fails if a saved tensor was modified in place since it was saved.
	#[allow(clippy::indexing_slicing)]
	pub(crate) fn check_saved(&self, owner: &Node) -> Result<(), ErrPack<TensorOpError>> {
		for saved in &self.saved {
			let (node, what) = match saved.from {
				SavedFrom::Input(i) => (&self.inputs[i], "input"),
				SavedFrom::Output => (owner, "output"),
			};
			if node.version() != saved.version {
				return Err(ErrPack::new(
					TensorOpError::SavedTensorModified,
					format!(
						"{what} of '{}' was modified in place: saved at version {}, now at {}",
						self.op,
						saved.version,
						node.version()
					),
				));
			}
		}
		Ok(())
	}

	#[allow(clippy::indexing_slicing)]
	fn saved(&self, index: usize) -> &View {
		&self.saved[index].value
	}

	/// Reduces `grad` to the shape input `index` had and accumulates it there.
	///
	/// `grad` is only evaluated if the input requires a gradient.
	#[allow(clippy::indexing_slicing)]
	fn send(
		&self,
		index: usize,
		grad: impl FnOnce() -> Result<View, ErrPack<TensorOpError>>,
	) -> Result<(), ErrPack<TensorOpError>> {
		let input = &self.inputs[index];
		if !input.requires_grad() {
			return Ok(());
		}
		let grad = grad()?.sum_to_shape(&self.input_shapes[index])?;
		input.acc_grad(&grad)
	}

	/// Multiplies `d_out` elementwise by `f(saved)` and sends it to input 0.
	fn send_scaled(
		&self,
		d_out: &View,
		f: impl Fn(f32) -> f32,
	) -> Result<(), ErrPack<TensorOpError>> {
		self.send(0, || d_out.zip_map(self.saved(0), |g, x| g * f(x)))
	}

	/// Computes the gradient for each input and accumulates it with `acc_grad()`.
	#[allow(clippy::indexing_slicing)]
	pub(crate) fn apply(&self, owner: &Node, d_out: &View) -> Result<(), ErrPack<TensorOpError>> {
		self.check_saved(owner)?;
		log::trace!("backward {} through '{}'", owner.id(), self.op);
		match (self.op, &self.attrs) {
			(Op::Add, _) => {
				self.send(0, || Ok(d_out.clone()))?;
				self.send(1, || Ok(d_out.clone()))
			},
			(Op::Sub, _) => {
				self.send(0, || Ok(d_out.clone()))?;
				self.send(1, || d_out.map(|g| -g))
			},
			(Op::Mul, _) => {
				self.send(0, || d_out.zip_map(self.saved(1), |g, b| g * b))?;
				self.send(1, || d_out.zip_map(self.saved(0), |g, a| g * a))
			},
			(Op::Div, _) => {
				let (a, b) = (self.saved(0), self.saved(1));
				self.send(0, || d_out.zip_map(b, |g, b| g / b))?;
				self.send(1, || d_out.zip_map(a, |g, a| g * a)?.zip_map(b, |ga, b| -ga / (b * b)))
			},
			(Op::Pow, _) => {
				let (a, b) = (self.saved(0), self.saved(1));
				self.send(0, || {
					let local = a.zip_map(b, |a, b| b * a.powf(b - 1.0))?;
					d_out.zip_map(&local, |g, l| g * l)
				})?;
				self.send(1, || {
					// d(a^b)/db = a^b * ln(a), defined for a > 0 only
					let local = a.zip_map(b, |a, b| if a > 0.0 { a.powf(b) * a.ln() } else { 0.0 })?;
					d_out.zip_map(&local, |g, l| g * l)
				})
			},
			(Op::Exp, _) => self.send_scaled(d_out, |y| y),
			(Op::Log, _) => self.send_scaled(d_out, f32::recip),
			(Op::Tanh, _) => self.send_scaled(d_out, |y| 1.0 - y * y),
			(Op::Sigmoid, _) => self.send_scaled(d_out, |y| y * (1.0 - y)),
			(Op::Relu, _) => self.send_scaled(d_out, |x| if x > 0.0 { 1.0 } else { 0.0 }),
			(Op::Elu, &OpAttrs::Slope(alpha)) => {
				self.send_scaled(d_out, |x| if x > 0.0 { 1.0 } else { alpha * x.exp() })
			},
			(Op::Gelu, _) => self.send_scaled(d_out, gelu_grad),
			(Op::LeakyRelu, &OpAttrs::Slope(slope)) => {
				self.send_scaled(d_out, |x| if x > 0.0 { 1.0 } else { slope })
			},
			(Op::Linear | Op::Contiguous | Op::Expand, _) => self.send(0, || Ok(d_out.clone())),
			(Op::Softmax, _) => self.send(0, || softmax_backward(self.saved(0), d_out)),
			(Op::Neg, _) => self.send(0, || d_out.map(|g| -g)),
			(Op::Sum, _) => self.send(0, || View::full(&self.input_shapes[0], d_out.item()?)),
			(Op::Mean, _) => self.send(0, || {
				let shape = &self.input_shapes[0];
				let n = shape.iter().product::<usize>().max(1);
				View::full(shape, d_out.item()? / n as f32)
			}),
			(Op::MatMul, _) => {
				let (a, b) = (self.saved(0), self.saved(1));
				self.send(0, || d_out.matmul(&b.transpose(0, 1)?))?;
				self.send(1, || a.transpose(0, 1)?.matmul(d_out))
			},
			(Op::View, _) => self.send(0, || d_out.reshape(&self.input_shapes[0])),
			(Op::Transpose, &OpAttrs::Transpose(d0, d1)) => self.send(0, || d_out.transpose(d0, d1)),
			(Op::Cat, OpAttrs::Cat { dim, sizes }) => {
				let mut start = 0;
				for (i, &len) in sizes.iter().enumerate() {
					self.send(i, || d_out.narrow(*dim, start, len))?;
					start += len;
				}
				Ok(())
			},
			(Op::AsStrided, OpAttrs::Strided { sizes, strides, offset }) => self.send(0, || {
				as_strided_backward(self.saved(0), d_out, sizes, strides, *offset)
			}),
			(Op::Elu | Op::LeakyRelu | Op::Transpose | Op::Cat | Op::AsStrided, attrs) => {
				// `Function::new()` rejects these combinations
				Err(ErrPack::new(
					TensorOpError::InconsistentGraph,
					format!("'{}' recorded with attributes {attrs:?}", self.op),
				))
			},
		}
	}
}

impl std::fmt::Debug for Function {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Function")
			.field("op", &self.op)
			.field("inputs", &self.inputs.iter().map(Node::id).collect::<Vec<_>>())
			.field("attrs", &self.attrs)
			.finish_non_exhaustive()
	}
}

//--------------------------------------------------------------------------------------------------

/// Jacobian-vector product of softmax over the last dimension.
///
/// The softmax is recomputed from the saved input rather than cached.
/// `grad_i = s_i * (d_i - sum_j d_j * s_j)`
fn softmax_backward(x: &View, d_out: &View) -> Result<View, ErrPack<TensorOpError>> {
	let s = x.softmax()?.to_vec();
	let d = d_out.to_vec();
	let row = x.shape().last().copied().unwrap_or(1).max(1);
	let mut grad = Vec::with_capacity(s.len());
	for (s_row, d_row) in s.chunks(row).zip(d.chunks(row)) {
		let dot: f32 = s_row.iter().zip(d_row).map(|(s, d)| s * d).sum();
		grad.extend(s_row.iter().zip(d_row).map(|(s, d)| s * (d - dot)));
	}
	View::from_vec(x.shape(), grad)
}

/// Scatters `d_out` through the strided geometry onto the storage positions, then gathers
/// the result back into the logical layout of `base`.
///
/// When several logical positions of `base` alias one storage element, the contribution
/// is split evenly between them, so that summing over the aliases restores it once.
#[allow(clippy::indexing_slicing)]
fn as_strided_backward(
	base: &View,
	d_out: &View,
	sizes: &[usize],
	strides: &[usize],
	offset: usize,
) -> Result<View, ErrPack<TensorOpError>> {
	let scratch = View::empty(&[base.storage().len()])?;
	for i in 0..d_out.numel() {
		scratch.storage().add_at(linear_index(i, sizes, strides, offset), d_out.get(i));
	}
	let mut aliases = vec![0_u32; base.storage().len()];
	for j in 0..base.numel() {
		aliases[base.linear_index(j)] += 1;
	}
	let grad = (0..base.numel())
		.map(|j| {
			let k = base.linear_index(j);
			scratch.storage().get(k) / aliases[k] as f32
		})
		.collect();
	View::from_vec(base.shape(), grad)
}

