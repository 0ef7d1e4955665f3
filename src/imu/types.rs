//! Fixed-size matrix aliases for the 15-dimensional preintegration state
//! [δp, δθ, δv, δba, δbg] and its 18-dimensional noise input
//! [na₀, ng₀, na₁, ng₁, nba, nbg].

use nalgebra::{SMatrix, SVector};

pub type Matrix15 = SMatrix<f64, 15, 15>;
pub type Matrix15x18 = SMatrix<f64, 15, 18>;
pub type Matrix18 = SMatrix<f64, 18, 18>;
pub type Vector15 = SVector<f64, 15>;

/// Offsets of the state components inside the 15-vector.
pub const O_P: usize = 0;
pub const O_R: usize = 3;
pub const O_V: usize = 6;
pub const O_BA: usize = 9;
pub const O_BG: usize = 12;
