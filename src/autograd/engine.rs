//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use bit_set::BitSet;

use crate::ErrPack;
use crate::tensor::{TensorOpError, View};

use super::context::NoGradGuard;
use super::node::{Node, NodeId};

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn cycle_error(node: &Node) -> ErrPack<TensorOpError> {
	ErrPack::new(
		TensorOpError::CyclicGraph,
		format!("node {} is its own predecessor", node.id()),
	)
}

#[cold]
#[inline(never)]
fn missing_grad_fn_error(node: &Node) -> ErrPack<TensorOpError> {
	ErrPack::new(
		TensorOpError::InconsistentGraph,
		format!("non-leaf node {} requires grad but has no grad_fn", node.id()),
	)
}

struct Frame {
	node: Node,
	slot: usize,
	preds: Vec<Node>,
	next: usize,
}

struct Visitor {
	// every node seen so far gets a dense slot for the bit sets
	slots: HashMap<NodeId, usize>,
	on_stack: BitSet,
}

impl Visitor {
	fn enter(&mut self, node: Node) -> Result<Frame, ErrPack<TensorOpError>> {
		if !node.is_leaf() && !node.has_grad_fn() {
			return Err(missing_grad_fn_error(&node));
		}
		node.with_grad_fn(|f| f.map_or(Ok(()), |f| f.check_saved(&node)))?;

		let slot = self.slots.len();
		self.slots.insert(node.id(), slot);
		self.on_stack.insert(slot);

		let mut preds = node.predecessors();
		preds.retain(Node::requires_grad);
		Ok(Frame { node, slot, preds, next: 0 })
	}
}

/// Nodes reachable from `root` through edges that carry gradients, predecessors first.
///
/// Each node appears once, even if it is reachable along several paths. Also verifies that
/// no saved tensor was modified, so the backward pass can't fail halfway for that reason.
pub(crate) fn topological_order(root: &Node) -> Result<Vec<Node>, ErrPack<TensorOpError>> {
	let mut visitor = Visitor { slots: HashMap::new(), on_stack: BitSet::new() };
	let mut order = Vec::new();
	let mut stack = vec![visitor.enter(root.clone())?];
	while let Some(frame) = stack.last_mut() {
		if let Some(pred) = frame.preds.get(frame.next).cloned() {
			frame.next += 1;
			match visitor.slots.get(&pred.id()) {
				Some(&slot) if visitor.on_stack.contains(slot) => return Err(cycle_error(&pred)),
				Some(_) => {},
				None => {
					let frame = visitor.enter(pred)?;
					stack.push(frame);
				},
			}
		} else {
			let Some(frame) = stack.pop() else {
				break;
			};
			visitor.on_stack.remove(frame.slot);
			order.push(frame.node);
		}
	}
	Ok(order)
}

//--------------------------------------------------------------------------------------------------

/// Backward from a 1-element root, seeded with gradient 1.
pub fn backward(root: &Node) -> Result<(), ErrPack<TensorOpError>> {
	if root.numel() != 1 {
		return Err(ErrPack::new(
			TensorOpError::NotScalar,
			format!(
				"backward() needs a 1-element root, node {} has shape {:?}; use backward_with()",
				root.id(),
				root.shape()
			),
		));
	}
	let seed = View::full(&root.shape(), 1.0)?;
	backward_with(root, &seed)
}

/// Propagates `seed` from `root` to every node it depends on.
///
/// Gradients accumulate into leaves across calls. Gradients of intermediate nodes are
/// dropped at the end unless `retain_grad()` was requested.
pub fn backward_with(root: &Node, seed: &View) -> Result<(), ErrPack<TensorOpError>> {
	if seed.shape() != root.shape().as_slice() {
		return Err(ErrPack::new(
			TensorOpError::Shape,
			format!(
				"seed of shape {:?} for node {} of shape {:?}",
				seed.shape(),
				root.id(),
				root.shape()
			),
		));
	}
	if !root.requires_grad() {
		log::debug!("backward from {}: node doesn't require grad, nothing to do", root.id());
		return Ok(());
	}

	// all checks happen here, before any gradient is touched
	let order = topological_order(root)?;
	log::debug!("backward from {}: {} nodes", root.id(), order.len());

	let _no_grad = NoGradGuard::new();
	for node in order.iter().filter(|n| !n.is_leaf()) {
		node.zero_grad();
	}
	root.acc_grad(seed)?;
	for node in order.iter().rev() {
		let Some(grad) = node.grad() else {
			continue;
		};
		node.with_grad_fn(|f| f.map_or(Ok(()), |f| f.apply(node, &grad)))?;
		if !node.retains_grad() {
			node.zero_grad();
		}
	}
	Ok(())
}

//--------------------------------------------------------------------------------------------------
