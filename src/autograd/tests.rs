//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

#![allow(clippy::indexing_slicing)]

use assert_approx_eq::assert_approx_eq;
use smallvec::{SmallVec, smallvec};
use thin_vec::thin_vec;

use crate::ErrPack;
use crate::tensor::{Storage, TensorOpError, View};

use super::*;

//--------------------------------------------------------------------------------------------------

fn grad_of(node: &Node) -> Vec<f32> {
	node.grad().map(|g| g.to_vec()).unwrap_or_default()
}

fn assert_all_approx(actual: &[f32], expected: &[f32], eps: f32) {
	assert_eq!(actual.len(), expected.len());
	for (a, e) in actual.iter().zip(expected) {
		assert_approx_eq!(a, e, eps);
	}
}

/// Compares the gradient of `sum(f(x))` to central differences.
fn check_unary(f: impl Fn(&Node) -> Result<Node, ErrPack<TensorOpError>>, xs: &[f32]) {
	let x = Node::from_vec(&[xs.len()], xs.to_vec(), true).unwrap();
	sum(&f(&x).unwrap()).unwrap().backward().unwrap();
	let grad = grad_of(&x);

	let eval = |v: f32| no_grad(|| f(&Node::leaf(v, false)).unwrap().item().unwrap());
	let h = 1e-3;
	for (i, &xi) in xs.iter().enumerate() {
		let numeric = (eval(xi + h) - eval(xi - h)) / (2.0 * h);
		assert_approx_eq!(grad[i], numeric, 2e-3);
	}
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_additive_identity() {
	let a = Node::from_vec(&[3], vec![1.0, -2.0, 3.0], true).unwrap();
	let y = add(&a, &Node::leaf(0.0, false)).unwrap();
	let upstream = View::from_vec(&[3], vec![0.5, 1.0, -2.0]).unwrap();
	y.backward_with(&upstream).unwrap();
	assert_eq!(grad_of(&a), vec![0.5, 1.0, -2.0]);
}

#[test]
fn test_product_rule() {
	let a = Node::leaf(3.0, true);
	let b = Node::leaf(4.0, true);
	let c = mul(&a, &b).unwrap();
	c.backward().unwrap();
	assert_eq!(grad_of(&a), vec![4.0]);
	assert_eq!(grad_of(&b), vec![3.0]);
}

#[test]
fn test_chain_rule() {
	let a = Node::leaf(2.0, true);
	let b = Node::leaf(3.0, true);
	let d = mul(&add(&a, &b).unwrap(), &a).unwrap();
	d.backward().unwrap();
	// d = (a + b) * a  =>  dd/da = 2a + b, dd/db = a
	assert_eq!(grad_of(&a), vec![7.0]);
	assert_eq!(grad_of(&b), vec![2.0]);
}

#[test]
fn test_diamond_accumulates() {
	let x = Node::leaf(5.0, true);
	let y = add(&x, &x).unwrap();
	y.backward().unwrap();
	assert_eq!(grad_of(&x), vec![2.0]);

	// shared sub-expression reached along two longer paths
	let s = mul_scalar(&x, 3.0).unwrap();
	let z = mul(&exp(&Node::leaf(0.0, false)).unwrap(), &add(&s, &s).unwrap()).unwrap();
	x.zero_grad();
	z.backward().unwrap();
	assert_eq!(grad_of(&x), vec![6.0]);
}

#[test]
fn test_broadcast_shares_storage() {
	let one = Node::leaf(1.0, false);
	let e = expand(&one, &[4]).unwrap();
	assert!(e.value().shares_storage(&one.value()));
	assert_eq!(e.value().strides(), &[0]);
	assert_eq!(e.shape().as_slice(), &[4]);
}

#[test]
fn test_contiguous_idempotence() {
	let t = Node::from_vec(&[2, 3], (0..6).map(|x| x as f32).collect(), true).unwrap();
	let t = transpose(&t, 0, 1).unwrap();
	let c1 = contiguous(&t).unwrap();
	let c2 = contiguous(&c1).unwrap();
	assert!(c2.value().shares_storage(&c1.value()));
	assert!(c2.ptr_eq(&c1));
}

#[test]
fn test_no_grad_scoping() {
	let a = Node::leaf(2.0, true);
	let b = Node::leaf(3.0, true);

	push_no_grad();
	let y = mul(&a, &b).unwrap();
	pop_no_grad();
	assert!(!y.requires_grad());
	assert!(!y.has_grad_fn());

	let z = mul(&a, &b).unwrap();
	assert!(z.requires_grad());
	assert_eq!(z.grad_fn(), Some(Op::Mul));

	{
		let _guard = NoGradGuard::new();
		assert!(!Node::leaf(1.0, true).requires_grad());
		assert!(!add(&a, &b).unwrap().requires_grad());
	}
	assert!(add(&a, &b).unwrap().requires_grad());
}

#[test]
fn test_softmax_gradient_matches_finite_difference() {
	fn softmax_f64(z: &[f64]) -> Vec<f64> {
		let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
		let e: Vec<f64> = z.iter().map(|x| (x - max).exp()).collect();
		let total: f64 = e.iter().sum();
		e.iter().map(|x| x / total).collect()
	}

	let z_data = [1.0_f32, 2.0, 3.0];
	let z = Node::from_vec(&[3], z_data.to_vec(), true).unwrap();
	let s = softmax(&z).unwrap();

	// s - onehot(argmax)
	let mut upstream = s.to_vec();
	upstream[2] -= 1.0;
	s.backward_with(&View::from_vec(&[3], upstream.clone()).unwrap()).unwrap();
	let grad = grad_of(&z);

	let h = 1e-4;
	for i in 0..3 {
		let mut plus: Vec<f64> = z_data.iter().map(|&x| f64::from(x)).collect();
		let mut minus = plus.clone();
		plus[i] += h;
		minus[i] -= h;
		let (sp, sm) = (softmax_f64(&plus), softmax_f64(&minus));
		let numeric: f64 = (0..3).map(|j| f64::from(upstream[j]) * (sp[j] - sm[j]) / (2.0 * h)).sum();
		assert_approx_eq!(f64::from(grad[i]), numeric, 1e-4);
	}
}

#[test]
fn test_cycle_is_detected() {
	let a = Node::leaf(1.0, true);
	let b = Node::leaf(2.0, true);
	let c = mul(&a, &b).unwrap();
	c.with_grad_fn_mut(|f| {
		if let Some(f) = f {
			f.push_input(c.clone());
		}
	});

	let err = c.backward().unwrap_err();
	assert_eq!(err.code, TensorOpError::CyclicGraph);
	// nothing was accumulated before the failure
	assert!(a.grad().is_none());
	assert!(b.grad().is_none());

	// break the reference cycle
	c.detach_();
	assert!(c.is_leaf());
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_arithmetic_grads() {
	let a = Node::leaf(6.0, true);
	let b = Node::leaf(3.0, true);
	sub(&a, &b).unwrap().backward().unwrap();
	assert_eq!(grad_of(&a), vec![1.0]);
	assert_eq!(grad_of(&b), vec![-1.0]);

	a.zero_grad();
	b.zero_grad();
	div(&a, &b).unwrap().backward().unwrap();
	assert_approx_eq!(grad_of(&a)[0], 1.0 / 3.0, 1e-6);
	assert_approx_eq!(grad_of(&b)[0], -6.0 / 9.0, 1e-6);

	let base = Node::leaf(2.0, true);
	let exponent = Node::leaf(3.0, true);
	pow(&base, &exponent).unwrap().backward().unwrap();
	assert_approx_eq!(grad_of(&base)[0], 12.0, 1e-5);
	assert_approx_eq!(grad_of(&exponent)[0], 8.0 * 2.0_f32.ln(), 1e-5);

	let x = Node::leaf(1.0, true);
	exp(&x).unwrap().backward().unwrap();
	assert_approx_eq!(grad_of(&x)[0], std::f32::consts::E, 1e-5);

	let x = Node::leaf(2.0, true);
	log(&x).unwrap().backward().unwrap();
	assert_approx_eq!(grad_of(&x)[0], 0.5, 1e-6);

	let x = Node::leaf(3.0, true);
	pow_scalar(&x, 2.0).unwrap().backward().unwrap();
	assert_approx_eq!(grad_of(&x)[0], 6.0, 1e-5);
}

#[test]
fn test_reduction_grads() {
	let x = Node::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0], true).unwrap();
	let m = mean(&x).unwrap();
	assert_eq!(m.item().unwrap(), 2.5);
	m.backward().unwrap();
	assert_eq!(grad_of(&x), vec![0.25; 4]);

	x.zero_grad();
	sum(&neg(&x).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![-1.0; 4]);
}

#[test]
fn test_activation_grads_match_finite_differences() {
	let xs = [-1.5, -0.3, 0.4, 2.0];
	check_unary(tanh, &xs);
	check_unary(sigmoid, &xs);
	check_unary(relu, &xs);
	check_unary(elu, &xs);
	check_unary(|n| elu_with(n, 0.5), &xs);
	check_unary(gelu, &xs);
	check_unary(leaky_relu, &xs);
	check_unary(|n| leaky_relu_with(n, 0.2), &xs);
	check_unary(linear, &xs);
	check_unary(exp, &xs);
	check_unary(log, &[0.5, 1.0, 3.0]);
}

#[test]
fn test_broadcast_grads_are_reduced() {
	let a = Node::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], true).unwrap();
	let b = Node::from_vec(&[3], vec![10.0, 20.0, 30.0], true).unwrap();

	let y = add(&a, &b).unwrap();
	y.backward_with(&View::full(&[2, 3], 1.0).unwrap()).unwrap();
	assert_eq!(grad_of(&a), vec![1.0; 6]);
	assert_eq!(grad_of(&b), vec![2.0; 3]);

	a.zero_grad();
	b.zero_grad();
	sum(&mul(&a, &b).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&a), vec![10.0, 20.0, 30.0, 10.0, 20.0, 30.0]);
	assert_eq!(grad_of(&b), vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_matmul_grads() {
	let a = Node::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], true).unwrap();
	let b = Node::from_vec(&[2, 1], vec![5.0, 6.0], true).unwrap();
	let y = matmul(&a, &b).unwrap();
	assert_eq!(y.to_vec(), vec![17.0, 39.0]);
	sum(&y).unwrap().backward().unwrap();
	assert_eq!(grad_of(&a), vec![5.0, 6.0, 5.0, 6.0]);
	assert_eq!(grad_of(&b), vec![4.0, 6.0]);
}

#[test]
fn test_grads_flow_through_views() {
	let w = Node::from_vec(&[6], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], false).unwrap();

	let x = Node::from_vec(&[2, 3], vec![0.0; 6], true).unwrap();
	let r = reshape(&transpose(&x, 0, 1).unwrap(), &[6]).unwrap();
	sum(&mul(&r, &w).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);

	let x = Node::leaf(2.0, true);
	sum(&expand(&x, &[4]).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![4.0]);

	let a = Node::from_vec(&[2], vec![1.0, 1.0], true).unwrap();
	let b = Node::from_vec(&[1], vec![1.0], true).unwrap();
	let c = cat(&[&a, &b], 0).unwrap();
	let w3 = Node::from_vec(&[3], vec![1.0, 2.0, 3.0], false).unwrap();
	sum(&mul(&c, &w3).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&a), vec![1.0, 2.0]);
	assert_eq!(grad_of(&b), vec![3.0]);

	// overlapping windows [[x0, x1], [x1, x2]]
	let x = Node::from_vec(&[4], vec![1.0, 2.0, 3.0, 4.0], true).unwrap();
	let v = as_strided(&x, &[2, 2], &[1, 1], 0).unwrap();
	assert_eq!(v.to_vec(), vec![1.0, 2.0, 2.0, 3.0]);
	sum(&v).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![1.0, 2.0, 1.0, 0.0]);

	let x = Node::from_vec(&[2, 2], vec![0.0; 4], true).unwrap();
	let c = contiguous(&transpose(&x, 0, 1).unwrap()).unwrap();
	assert_eq!(c.grad_fn(), Some(Op::Contiguous));
	let w4 = Node::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], false).unwrap();
	sum(&mul(&c, &w4).unwrap()).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![1.0, 3.0, 2.0, 4.0]);

	let x = Node::from_vec(&[2, 2], vec![0.0; 4], true).unwrap();
	let t = transpose(&x, 0, 1).unwrap();
	assert_eq!(view(&t, &[4]).unwrap_err().code, TensorOpError::Shape);
}

#[test]
fn test_as_strided_over_broadcast_base() {
	let x = Node::leaf(2.0, true);
	let e = expand(&x, &[4]).unwrap();
	let s = as_strided(&e, &[1], &[1], 0).unwrap();
	sum(&s).unwrap().backward().unwrap();
	assert_eq!(grad_of(&x), vec![1.0]);

	// every row of `e` aliases the storage of `x`
	let x = Node::from_vec(&[1, 3], vec![1.0, 2.0, 3.0], true).unwrap();
	let e = expand(&x, &[2, 3]).unwrap();
	let s = as_strided(&e, &[2], &[1], 1).unwrap();
	assert_eq!(s.to_vec(), vec![2.0, 3.0]);
	let w = Node::from_vec(&[2], vec![10.0, 20.0], false).unwrap();
	sum(&mul(&s, &w).unwrap()).unwrap().backward().unwrap();
	assert_all_approx(&grad_of(&x), &[0.0, 10.0, 20.0], 1e-6);
}

#[test]
fn test_retain_grad() {
	let a = Node::leaf(2.0, true);
	let b = mul(&a, &a).unwrap();
	b.retain_grad();
	let hidden = add_scalar(&b, 1.0).unwrap();
	let c = mul_scalar(&hidden, 3.0).unwrap();
	c.backward().unwrap();

	assert_eq!(grad_of(&b), vec![3.0]);
	assert!(hidden.grad().is_none());
	assert!(c.grad().is_none());
	assert_eq!(grad_of(&a), vec![12.0]);
}

#[test]
fn test_repeated_backward_accumulates_into_leaves() {
	let a = Node::leaf(3.0, true);
	let c = mul_scalar(&a, 2.0).unwrap();
	c.backward().unwrap();
	c.backward().unwrap();
	assert_eq!(grad_of(&a), vec![4.0]);

	a.zero_grad();
	c.backward().unwrap();
	assert_eq!(grad_of(&a), vec![2.0]);
}

#[test]
fn test_backward_root_checks() {
	let x = Node::from_vec(&[2], vec![1.0, 2.0], true).unwrap();
	let y = mul_scalar(&x, 2.0).unwrap();
	assert_eq!(y.backward().unwrap_err().code, TensorOpError::NotScalar);

	let bad_seed = View::full(&[3], 1.0).unwrap();
	assert_eq!(y.backward_with(&bad_seed).unwrap_err().code, TensorOpError::Shape);

	// a root outside the graph is a no-op
	let constant = Node::leaf(1.0, false);
	constant.backward().unwrap();
	assert!(constant.grad().is_none());
}

#[test]
fn test_op_table_is_closed() {
	for op in Op::ALL {
		assert_eq!(Op::from_name(op.name()).unwrap(), op);
	}
	assert_eq!("leaky_relu".parse::<Op>().unwrap(), Op::LeakyRelu);
	assert_eq!(Op::from_name("conv2d").unwrap_err().code, TensorOpError::UnsupportedOperation);
}

#[test]
fn test_function_validates_eagerly() {
	let a = Node::leaf(1.0, true);
	let b = Node::leaf(2.0, true);

	let one_input = Function::new(Op::Add, thin_vec![a.clone()], SmallVec::new(), OpAttrs::None);
	assert_eq!(one_input.unwrap_err().code, TensorOpError::UnsupportedOperation);

	let no_saved =
		Function::new(Op::Mul, thin_vec![a.clone(), b.clone()], SmallVec::new(), OpAttrs::None);
	assert_eq!(no_saved.unwrap_err().code, TensorOpError::UnsupportedOperation);

	let saved = smallvec![SavedTensor::input(0, &a)];
	let no_slope = Function::new(Op::Elu, thin_vec![a.clone()], saved, OpAttrs::None);
	assert_eq!(no_slope.unwrap_err().code, TensorOpError::UnsupportedOperation);

	let saved = smallvec![SavedTensor::input(1, &a)];
	let dangling = Function::new(Op::Log, thin_vec![a.clone()], saved, OpAttrs::None);
	assert_eq!(dangling.unwrap_err().code, TensorOpError::UnsupportedOperation);

	let ok = Function::new(Op::Sub, thin_vec![a, b], SmallVec::new(), OpAttrs::None).unwrap();
	assert_eq!(ok.op(), Op::Sub);
	assert_eq!(ok.inputs().len(), 2);
}

#[test]
fn test_deep_chain() {
	let x = Node::leaf(1.0, true);
	let mut y = x.clone();
	for _ in 0..10_000 {
		y = add_scalar(&y, 0.5).unwrap();
	}
	assert_approx_eq!(y.item().unwrap(), 5001.0, 1e-1);
	y.backward().unwrap();
	assert_eq!(grad_of(&x), vec![1.0]);

	// dropping the chain must not recurse once per node
	drop(y);
	assert_eq!(x.predecessors().len(), 0);
}

#[test]
fn test_saved_tensor_modified_in_place() {
	let a = Node::leaf(0.5, true);
	let h = exp(&a).unwrap();
	let y = mul(&h, &h).unwrap();
	h.fill_(1.0).unwrap();
	assert_eq!(h.version(), 1);

	let err = y.backward().unwrap_err();
	assert_eq!(err.code, TensorOpError::SavedTensorModified);
	assert!(a.grad().is_none());
}

#[test]
fn test_inplace_on_tracked_leaf() {
	let w = Node::from_vec(&[2], vec![1.0, 2.0], true).unwrap();
	assert_eq!(w.fill_(0.0).unwrap_err().code, TensorOpError::InvalidValue);
	assert_eq!(w.version(), 0);

	no_grad(|| w.sub_scaled_(&View::full(&[2], 1.0).unwrap(), 0.5)).unwrap();
	assert_eq!(w.to_vec(), vec![0.5, 1.5]);
	assert_eq!(w.version(), 1);

	no_grad(|| w.resize_(&[3])).unwrap();
	assert_eq!(w.to_vec(), vec![0.0; 3]);

	let src = View::from_vec(&[1], vec![7.0]).unwrap();
	no_grad(|| w.set_(&src)).unwrap();
	assert!(w.value().shares_storage(&src));
	assert_eq!(w.version(), 3);
}

#[test]
fn test_inplace_through_view() {
	let a = Node::from_vec(&[2], vec![1.0, 2.0], true).unwrap();
	let b = Node::from_vec(&[2], vec![3.0, 4.0], true).unwrap();
	let y = sum(&mul(&a, &b).unwrap()).unwrap();

	let r = reshape(&a, &[2]).unwrap();
	assert_eq!(r.fill_(100.0).unwrap_err().code, TensorOpError::InvalidValue);
	assert_eq!(a.to_vec(), vec![1.0, 2.0]);
	assert_eq!(a.version(), 0);

	// with tracking off the write goes through, and backward notices it
	no_grad(|| r.fill_(100.0)).unwrap();
	assert_eq!(a.to_vec(), vec![100.0, 100.0]);
	assert_eq!(a.version(), 1);
	assert_eq!(r.version(), 1);
	assert_eq!(y.backward().unwrap_err().code, TensorOpError::SavedTensorModified);
	assert!(b.grad().is_none());

	// a detached alias may be written, but the saved value is still checked
	let h = exp(&Node::leaf(0.0, true)).unwrap();
	let y = mul(&h, &h).unwrap();
	let d = h.detach();
	d.fill_(2.0).unwrap();
	assert_eq!(h.version(), 1);
	assert_eq!(y.backward().unwrap_err().code, TensorOpError::SavedTensorModified);
}

#[test]
fn test_detach_and_set_requires_grad() {
	let a = Node::leaf(3.0, true);
	let b = Node::leaf(4.0, true);
	let d = a.detach();
	assert!(d.is_leaf());
	assert!(!d.requires_grad());
	assert!(d.value().shares_storage(&a.value()));

	mul(&d, &b).unwrap().backward().unwrap();
	assert!(a.grad().is_none());
	assert_eq!(grad_of(&b), vec![3.0]);

	let c = mul(&a, &b).unwrap();
	c.set_requires_grad(false);
	assert!(c.requires_grad());

	a.set_requires_grad(false);
	assert!(!mul_scalar(&a, 2.0).unwrap().requires_grad());
}

#[test]
fn test_storage_released_with_last_view() {
	let x = Node::from_vec(&[2, 2], vec![1.0; 4], true).unwrap();
	let y = reshape(&x, &[4]).unwrap();
	let storage = x.value().storage().clone();
	assert_eq!(Storage::ref_count(&storage), 3);
	drop(y);
	drop(x);
	assert_eq!(Storage::ref_count(&storage), 1);
}

//--------------------------------------------------------------------------------------------------
