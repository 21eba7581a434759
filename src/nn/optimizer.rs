//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Original Adam: https://arxiv.org/abs/1412.6980

use std::cell::RefCell;
use std::rc::Rc;

use crate::ErrPack;
use crate::autograd::NoGradGuard;
use crate::tensor::TensorOpError;

use super::param::Param;

//--------------------------------------------------------------------------------------------------

pub struct SgdCoef {
	pub learning_rate: f64,
	pub momentum: f64,
	pub weight_decay: f64,
}

impl Default for SgdCoef {
	fn default() -> Self {
		Self { learning_rate: 0.01, momentum: 0.0, weight_decay: 0.0 }
	}
}

pub struct AdamCoef {
	pub m_decay: f64,       // beta1
	pub v_decay: f64,       // beta2
	pub eps: f64,           // epsilon
	pub learning_rate: f64, // alpha
}

impl Default for AdamCoef {
	fn default() -> Self {
		Self {
			m_decay: 0.9,
			v_decay: 0.99,
			eps: 1e-8,
			learning_rate: 0.001,
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Updates parameters from their accumulated gradients.
///
/// Updates run in a no-grad scope and write into the parameter storage in place.
/// Parameters without a gradient are skipped.
pub trait Optimizer {
	fn step(&mut self, params: &[Rc<RefCell<Param>>]) -> Result<(), ErrPack<TensorOpError>>;

	fn zero_grad(&self, params: &[Rc<RefCell<Param>>]) {
		for param in params {
			param.borrow().zero_grad();
		}
	}
}

pub struct Sgd {
	pub coef: SgdCoef,
}

impl Sgd {
	pub fn new(coef: SgdCoef) -> Self {
		Self { coef }
	}
}

impl Optimizer for Sgd {
	fn step(&mut self, params: &[Rc<RefCell<Param>>]) -> Result<(), ErrPack<TensorOpError>> {
		let _no_grad = NoGradGuard::new();
		let weight_decay = self.coef.weight_decay as f32;
		let momentum = self.coef.momentum as f32;
		for param in params {
			let mut param = param.borrow_mut();
			let Some(grad) = param.grad() else {
				continue;
			};
			let grad = if weight_decay != 0.0 {
				grad.zip_map(&param.value(), |g, w| g + weight_decay * w)?
			} else {
				grad
			};
			let update = if momentum != 0.0 {
				let velocity = &param.moments()?.m;
				let new_velocity = velocity.zip_map(&grad, |v, g| momentum * v + g)?;
				velocity.assign(&new_velocity)?;
				new_velocity
			} else {
				grad
			};
			param.node().sub_scaled_(&update, self.coef.learning_rate as f32)?;
		}
		Ok(())
	}
}

pub struct Adam {
	pub coef: AdamCoef,
	steps: i32,
}

impl Adam {
	pub fn new(coef: AdamCoef) -> Self {
		Self { coef, steps: 0 }
	}

	pub fn steps(&self) -> i32 {
		self.steps
	}
}

impl Optimizer for Adam {
	fn step(&mut self, params: &[Rc<RefCell<Param>>]) -> Result<(), ErrPack<TensorOpError>> {
		let _no_grad = NoGradGuard::new();
		self.steps += 1;
		let AdamCoef { m_decay, v_decay, eps, learning_rate } = self.coef;
		let m_correction = (1.0 - m_decay.powi(self.steps)) as f32;
		let v_correction = (1.0 - v_decay.powi(self.steps)) as f32;
		let (m_decay, v_decay, eps) = (m_decay as f32, v_decay as f32, eps as f32);
		for param in params {
			let mut param = param.borrow_mut();
			let Some(grad) = param.grad() else {
				continue;
			};
			let moments = param.moments()?;

			// first and second moment estimates
			let m = moments.m.zip_map(&grad, |m, g| m_decay * m + (1.0 - m_decay) * g)?;
			let v = moments.v.zip_map(&grad, |v, g| v_decay * v + (1.0 - v_decay) * g * g)?;
			moments.m.assign(&m)?;
			moments.v.assign(&v)?;

			let update = m.zip_map(&v, |m, v| {
				let m_hat = m / m_correction;
				let v_hat = v / v_correction;
				m_hat / (v_hat.sqrt() + eps)
			})?;
			param.node().sub_scaled_(&update, learning_rate as f32)?;
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;

	use super::*;
	use crate::autograd::{mul, pow_scalar, sub, sum};
	use crate::autograd::Node;

	fn quadratic_loss(param: &Rc<RefCell<Param>>, target: f32) -> Node {
		let w = param.borrow().node().clone();
		let t = Node::leaf(target, false);
		sum(&pow_scalar(&sub(&w, &t).unwrap(), 2.0).unwrap()).unwrap()
	}

	#[test]
	fn test_sgd_step() {
		let p = Param::new(&[1]).unwrap();
		p.borrow_mut().assign(vec![1.0]).unwrap();
		let mut opt = Sgd::new(SgdCoef { learning_rate: 0.1, ..SgdCoef::default() });

		// d/dw (w - 3)^2 = 2 * (1 - 3) = -4
		quadratic_loss(&p, 3.0).backward().unwrap();
		opt.step(&[p.clone()]).unwrap();
		assert_approx_eq!(p.borrow().value().get(0), 1.4, 1e-6);
		assert_eq!(p.borrow().node().version(), 2);

		opt.zero_grad(&[p.clone()]);
		assert!(p.borrow().grad().is_none());
	}

	#[test]
	fn test_sgd_momentum_and_decay() {
		let p = Param::new(&[1]).unwrap();
		p.borrow_mut().assign(vec![2.0]).unwrap();
		let coef = SgdCoef { learning_rate: 0.5, momentum: 0.9, weight_decay: 0.1 };
		let mut opt = Sgd::new(coef);
		let w = p.borrow().node().clone();

		// loss = w, so grad = 1, plus decay 0.1 * 2
		sum(&w).unwrap().backward().unwrap();
		opt.step(&[p.clone()]).unwrap();
		assert_approx_eq!(p.borrow().value().get(0), 2.0 - 0.5 * 1.2, 1e-6);

		// velocity = 0.9 * 1.2 + (1 + 0.1 * 1.4)
		opt.zero_grad(&[p.clone()]);
		sum(&w).unwrap().backward().unwrap();
		opt.step(&[p.clone()]).unwrap();
		assert_approx_eq!(p.borrow().value().get(0), 1.4 - 0.5 * (1.08 + 1.14), 1e-5);
	}

	#[test]
	#[allow(clippy::indexing_slicing)]
	fn test_adam_converges() {
		let p = Param::new(&[2]).unwrap();
		p.borrow_mut().assign(vec![0.0, 5.0]).unwrap();
		let mut opt = Adam::new(AdamCoef { learning_rate: 0.05, ..AdamCoef::default() });
		let target = Node::from_vec(&[2], vec![1.0, -1.0], false).unwrap();
		for _ in 0..500 {
			opt.zero_grad(&[p.clone()]);
			let w = p.borrow().node().clone();
			let d = sub(&w, &target).unwrap();
			sum(&mul(&d, &d).unwrap()).unwrap().backward().unwrap();
			opt.step(&[p.clone()]).unwrap();
		}
		assert_eq!(opt.steps(), 500);
		let value = p.borrow().value().to_vec();
		assert_approx_eq!(value[0], 1.0, 0.05);
		assert_approx_eq!(value[1], -1.0, 0.05);
	}

	#[test]
	fn test_first_adam_step_is_learning_rate() {
		let p = Param::new(&[1]).unwrap();
		let mut opt = Adam::new(AdamCoef::default());
		quadratic_loss(&p, 3.0).backward().unwrap();
		opt.step(&[p.clone()]).unwrap();
		// bias-corrected m_hat / sqrt(v_hat) is sign(grad) on the first step
		assert_approx_eq!(p.borrow().value().get(0), 0.001, 1e-6);
	}
}
