pub use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;

pub use candle_util::{candle_core, candle_nn};
pub use clap::{Args, Parser, ValueEnum};

pub use crate::error::LupinError;
