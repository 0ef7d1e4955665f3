//! Factor-graph assembly and the dense window solver.

pub mod blocks;
pub mod factors;
pub mod problem;

pub use blocks::{BlockId, BlockKind};
pub use factors::{
    Factor, HuberLoss, ImuFactor, ProjectionObservation, ProjectionOneFrameTwoCam,
    ProjectionTwoFrameOneCam, ProjectionTwoFrameTwoCam,
};
pub use problem::{Problem, SolveOptions, SolveReport};
