//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

pub mod layers;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod param;

pub use layers::{Activation, Dense, Layer, Sequential};
pub use loss::{binary_cross_entropy, cross_entropy, mse_loss};
pub use metrics::{accuracy, mean_absolute_error};
pub use optimizer::{Adam, AdamCoef, Optimizer, Sgd, SgdCoef};
pub use param::Param;
