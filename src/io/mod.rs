//! Dataset loading for offline replay.

pub mod euroc;

pub use euroc::{EurocDataset, StereoImagePair};
