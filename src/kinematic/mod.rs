pub mod evaluator;
pub mod evaluator_set;

pub use evaluator::{DistanceEvaluator, KinematicEvaluator, WorldPointEvaluator};
pub use evaluator_set::KinematicEvaluatorSet;
