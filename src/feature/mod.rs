//! Feature observation types and window bookkeeping.

pub mod frame;
pub mod manager;

pub use frame::{FeatureFrame, FeatureId, TrackedPoint};
pub use manager::{Feature, FeatureManager, FeatureObservation, SolveFlag};
