//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Deterministic pseudo-random numbers for parameter initialization.
//!
//! The generator is the ChaCha block function with 14 rounds. It is not meant to be
//! cryptographically secure, only reproducible across platforms.

// "expand 32-byte k"
const CONST: [u32; 4] = [0x_6170_7865, 0x_3320_646e, 0x_7962_2d32, 0x_6b20_6574];

const STATE_WORDS: usize = 16;
const DOUBLE_ROUNDS: usize = 7;

#[rustfmt::skip]
const ROUNDS: [[usize; 4]; 8] = [
	// columns
	[0, 4,  8, 12], [1, 5,  9, 13], [2, 6, 10, 14], [3, 7, 11, 15],
	// diagonals
	[0, 5, 10, 15], [1, 6, 11, 12], [2, 7,  8, 13], [3, 4,  9, 14],
];

/// Samples of `normal()` are clamped to this magnitude.
pub const NORMAL_LIMIT: f64 = 10.0;

pub struct Rng {
	state: [u32; STATE_WORDS],
	block: [u32; STATE_WORDS],
	used: usize,
}

impl Default for Rng {
	fn default() -> Self {
		Self::seeded(0x_5eed_0f_c0ffee)
	}
}

#[allow(clippy::indexing_slicing)]
impl Rng {
	pub fn seeded(seed: u64) -> Self {
		// spread the seed over the key with splitmix64 so that nearby seeds diverge
		let mut z = seed;
		let mut key = [0_u32; 8];
		for pair in key.chunks_mut(2) {
			z = z.wrapping_add(0x_9e37_79b9_7f4a_7c15);
			let mut x = z;
			x = (x ^ (x >> 30)).wrapping_mul(0x_bf58_476d_1ce4_e5b9);
			x = (x ^ (x >> 27)).wrapping_mul(0x_94d0_49bb_1331_11eb);
			x ^= x >> 31;
			pair[0] = x as u32;
			pair[1] = (x >> 32) as u32;
		}
		let mut state = [0_u32; STATE_WORDS];
		state[..4].copy_from_slice(&CONST);
		state[4..12].copy_from_slice(&key);
		Self { state, block: [0; STATE_WORDS], used: STATE_WORDS }
	}

	fn refill(&mut self) {
		let mut x = self.state;
		for _ in 0..DOUBLE_ROUNDS {
			for &[a, b, c, d] in &ROUNDS {
				x[a] = x[a].wrapping_add(x[b]);
				x[d] = (x[d] ^ x[a]).rotate_left(16);
				x[c] = x[c].wrapping_add(x[d]);
				x[b] = (x[b] ^ x[c]).rotate_left(12);
				x[a] = x[a].wrapping_add(x[b]);
				x[d] = (x[d] ^ x[a]).rotate_left(8);
				x[c] = x[c].wrapping_add(x[d]);
				x[b] = (x[b] ^ x[c]).rotate_left(7);
			}
		}
		for (out, (&mixed, &orig)) in self.block.iter_mut().zip(x.iter().zip(&self.state)) {
			*out = mixed.wrapping_add(orig);
		}

		// 64-bit block counter
		let (lo, carry) = self.state[12].overflowing_add(1);
		self.state[12] = lo;
		self.state[13] = self.state[13].wrapping_add(u32::from(carry));
		self.used = 0;
	}

	pub fn next_u32(&mut self) -> u32 {
		if self.used == STATE_WORDS {
			self.refill();
		}
		let v = self.block[self.used];
		self.used += 1;
		v
	}

	/// Uniform in `[0.0, 1.0)`.
	pub fn uniform(&mut self) -> f64 {
		f64::from(self.next_u32()) * (1.0 / 4_294_967_296.0)
	}

	/// Uniform in `[lo, hi)`.
	pub fn uniform_range(&mut self, lo: f64, hi: f64) -> f64 {
		lo + (hi - lo) * self.uniform()
	}

	/// Normal with mean 0 and variance 1, clamped to `(-NORMAL_LIMIT, NORMAL_LIMIT)`.
	pub fn normal(&mut self) -> f64 {
		let x = 1.0 - self.uniform(); // (0.0, 1.0]
		let y = self.uniform();

		// Box-Muller
		let r = (-2.0 * x.ln()).sqrt();
		let result = r * (std::f64::consts::TAU * y).cos();

		if result.abs() >= NORMAL_LIMIT {
			log::warn!("Rng::normal(): clamping {result} to (-{NORMAL_LIMIT}, {NORMAL_LIMIT})");
			return 0.0;
		}
		result
	}

	/// Xavier/Glorot uniform initialization for a weight with the given fan-in and fan-out.
	pub fn xavier_uniform(&mut self, fan_in: usize, fan_out: usize, out: &mut [f32]) {
		let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
		for v in out {
			*v = self.uniform_range(-limit, limit) as f32;
		}
	}
}

//--------------------------------------------------------------------------------------------------
