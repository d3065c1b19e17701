pub mod constraints;
pub mod mode;
pub mod optimizer;
pub mod trajectory;

pub use mode::{ContactMode, ModeSequence};
pub use optimizer::HybridTrajOpt;
pub use trajectory::{HybridTrajectory, PiecewisePolynomial, TrajectoryError};
