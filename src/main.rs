//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use cmgrad::ErrPack;
use cmgrad::autograd::{NoGradGuard, Node};
use cmgrad::nn::{
	Activation, Adam, AdamCoef, Dense, Layer, Optimizer, Sequential, accuracy,
	binary_cross_entropy,
};
use cmgrad::rng::Rng;
use cmgrad::tensor::TensorOpError;

//--------------------------------------------------------------------------------------------------

pub struct TrainConfig {
	pub epochs: usize,
	pub learning_rate: f64,
	pub hidden: usize,
	pub log_every: usize,
	pub verbosity: usize,
	pub seed: u64,
}

impl Default for TrainConfig {
	fn default() -> Self {
		Self {
			epochs: 2000,
			learning_rate: 0.05,
			hidden: 8,
			log_every: 200,
			verbosity: 2, // info
			seed: 17,
		}
	}
}

/// Trains a small network on XOR and returns the final accuracy.
fn train_xor(config: &TrainConfig) -> Result<f32, ErrPack<TensorOpError>> {
	let x = Node::from_vec(&[4, 2], vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], false)?;
	let y = Node::from_vec(&[4, 1], vec![0.0, 1.0, 1.0, 0.0], false)?;

	let mut model = Sequential::new();
	model
		.push(Dense::new(2, config.hidden)?)
		.push(Activation::Tanh)
		.push(Dense::new(config.hidden, 1)?)
		.push(Activation::Sigmoid);
	model.randomize(&mut Rng::seeded(config.seed))?;

	let params = model.params();
	let n_params: usize = params.iter().map(|p| p.borrow().numel()).sum();
	log::info!("training XOR: {} parameter tensors, {n_params} values", params.len());

	let mut opt = Adam::new(AdamCoef {
		learning_rate: config.learning_rate,
		..AdamCoef::default()
	});
	for epoch in 0..config.epochs {
		opt.zero_grad(&params);
		let loss = binary_cross_entropy(&model.forward(&x)?, &y)?;
		loss.backward()?;
		opt.step(&params)?;
		if config.log_every > 0 && epoch % config.log_every == 0 {
			log::info!("epoch {epoch}: loss = {:.6}", loss.item()?);
		}
	}

	let pred = {
		let _no_grad = NoGradGuard::new();
		model.forward(&x)?
	};
	log::debug!("predictions: {:?}", pred.to_vec());
	accuracy(&pred, &y)
}

fn main() {
	let config = TrainConfig::default();
	if let Err(err) = stderrlog::new().module(module_path!()).verbosity(config.verbosity).init() {
		eprintln!("cannot install logger: {err}");
	}

	match train_xor(&config) {
		Ok(acc) => log::info!("final accuracy: {:.1}%", acc * 100.0),
		Err(err) => {
			log::error!("training failed: {err}");
			std::process::exit(1);
		},
	}
}
