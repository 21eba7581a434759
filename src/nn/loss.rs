//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::ErrPack;
use crate::autograd::{Node, add, add_scalar, log, mean, mul, mul_scalar, neg, softmax, sub, sum};
use crate::tensor::TensorOpError;

//--------------------------------------------------------------------------------------------------

/// Keeps probabilities away from 0 and 1 before taking the logarithm.
const PROB_EPS: f32 = 1e-6;

pub(crate) fn check_same_shape(
	what: &str,
	pred: &Node,
	target: &Node,
) -> Result<(), ErrPack<TensorOpError>> {
	if pred.shape() != target.shape() {
		return Err(ErrPack::new(
			TensorOpError::Shape,
			format!(
				"{what}: prediction has shape {:?}, target has shape {:?}",
				pred.shape(),
				target.shape()
			),
		));
	}
	Ok(())
}

/// Mean squared error.
pub fn mse_loss(pred: &Node, target: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	check_same_shape("mse_loss", pred, target)?;
	let diff = sub(pred, target)?;
	mean(&mul(&diff, &diff)?)
}

/// Mean binary cross-entropy. `pred` holds probabilities, `target` holds 0 or 1.
pub fn binary_cross_entropy(pred: &Node, target: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	check_same_shape("binary_cross_entropy", pred, target)?;
	let p = add_scalar(&mul_scalar(pred, 1.0 - 2.0 * PROB_EPS)?, PROB_EPS)?;
	let not_p = add_scalar(&neg(&p)?, 1.0)?;
	let not_target = add_scalar(&neg(target)?, 1.0)?;
	let log_likelihood = add(&mul(target, &log(&p)?)?, &mul(&not_target, &log(&not_p)?)?)?;
	neg(&mean(&log_likelihood)?)
}

/// Softmax cross-entropy averaged over the batch.
///
/// `logits` and the one-hot `target` have shape `[batch, classes]`.
pub fn cross_entropy(logits: &Node, target: &Node) -> Result<Node, ErrPack<TensorOpError>> {
	check_same_shape("cross_entropy", logits, target)?;
	let batch = match logits.shape().as_slice() {
		[batch, _, ..] => *batch,
		_ => 1,
	};
	let log_probs = log(&add_scalar(&softmax(logits)?, PROB_EPS)?)?;
	let total = sum(&mul(target, &log_probs)?)?;
	mul_scalar(&total, -1.0 / batch.max(1) as f32)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;

	use super::*;

	#[test]
	fn test_mse() {
		let pred = Node::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], true).unwrap();
		let target = Node::from_vec(&[2, 2], vec![1.0, 0.0, 3.0, 6.0], false).unwrap();
		let loss = mse_loss(&pred, &target).unwrap();
		assert_approx_eq!(loss.item().unwrap(), 2.0, 1e-6);
		loss.backward().unwrap();
		// 2 * (pred - target) / n
		assert_eq!(pred.grad().unwrap().to_vec(), vec![0.0, 1.0, 0.0, -1.0]);

		let wrong = Node::from_vec(&[4], vec![0.0; 4], false).unwrap();
		assert_eq!(mse_loss(&pred, &wrong).unwrap_err().code, TensorOpError::Shape);
	}

	#[test]
	#[allow(clippy::indexing_slicing)]
	fn test_binary_cross_entropy() {
		let pred = Node::from_vec(&[2], vec![0.9, 0.2], true).unwrap();
		let target = Node::from_vec(&[2], vec![1.0, 0.0], false).unwrap();
		let loss = binary_cross_entropy(&pred, &target).unwrap();
		let expected = -(0.9_f32.ln() + 0.8_f32.ln()) / 2.0;
		assert_approx_eq!(loss.item().unwrap(), expected, 1e-4);

		loss.backward().unwrap();
		let grad = pred.grad().unwrap().to_vec();
		// d/dp = (p - t) / (p * (1 - p)) / n
		assert_approx_eq!(grad[0], (0.9 - 1.0) / (0.9 * 0.1) / 2.0, 1e-3);
		assert_approx_eq!(grad[1], 0.2 / (0.2 * 0.8) / 2.0, 1e-3);

		// saturated predictions stay finite
		let sure = Node::from_vec(&[2], vec![1.0, 0.0], false).unwrap();
		assert!(binary_cross_entropy(&sure, &target).unwrap().item().unwrap().is_finite());
	}

	#[test]
	#[allow(clippy::indexing_slicing)]
	fn test_cross_entropy() {
		let logits = Node::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0], true).unwrap();
		let target = Node::from_vec(&[2, 3], vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0], false).unwrap();
		let loss = cross_entropy(&logits, &target).unwrap();

		let lse = (1.0_f32.exp() + 2.0_f32.exp() + 3.0_f32.exp()).ln();
		let expected = ((lse - 3.0) + 3.0_f32.ln()) / 2.0;
		assert_approx_eq!(loss.item().unwrap(), expected, 1e-4);

		loss.backward().unwrap();
		// (softmax - target) / batch
		let grad = logits.grad().unwrap().to_vec();
		assert_approx_eq!(grad[3], (1.0 / 3.0 - 1.0) / 2.0, 1e-4);
		assert_approx_eq!(grad[4], (1.0 / 3.0) / 2.0, 1e-4);
	}
}
