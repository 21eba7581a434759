//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::ErrPack;
use crate::autograd::{NoGradGuard, Node};
use crate::tensor::TensorOpError;

use super::loss::check_same_shape;

//--------------------------------------------------------------------------------------------------

fn argmax(row: &[f32]) -> usize {
	let mut best = (0, f32::NEG_INFINITY);
	for (i, &x) in row.iter().enumerate() {
		if x > best.1 {
			best = (i, x);
		}
	}
	best.0
}

/// Fraction of correctly classified rows.
///
/// With one column, a prediction of at least 0.5 counts as class 1. With several columns,
/// the class is the arg max of the row.
pub fn accuracy(pred: &Node, target: &Node) -> Result<f32, ErrPack<TensorOpError>> {
	let _no_grad = NoGradGuard::new();
	check_same_shape("accuracy", pred, target)?;
	let classes = pred.shape().last().copied().unwrap_or(1).max(1);
	let (p, t) = (pred.to_vec(), target.to_vec());
	let rows = p.len() / classes;
	if rows == 0 {
		return Ok(0.0);
	}
	let correct = if classes == 1 {
		p.iter().zip(&t).filter(|&(&p, &t)| (p >= 0.5) == (t >= 0.5)).count()
	} else {
		let pairs = p.chunks(classes).zip(t.chunks(classes));
		pairs.filter(|(p, t)| argmax(p) == argmax(t)).count()
	};
	Ok(correct as f32 / rows as f32)
}

pub fn mean_absolute_error(pred: &Node, target: &Node) -> Result<f32, ErrPack<TensorOpError>> {
	let _no_grad = NoGradGuard::new();
	check_same_shape("mean_absolute_error", pred, target)?;
	let (p, t) = (pred.to_vec(), target.to_vec());
	if p.is_empty() {
		return Ok(0.0);
	}
	let total: f32 = p.iter().zip(&t).map(|(p, t)| (p - t).abs()).sum();
	Ok(total / p.len() as f32)
}

//--------------------------------------------------------------------------------------------------
