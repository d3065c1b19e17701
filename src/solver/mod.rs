pub mod program;
pub mod sqp;

pub use program::{
    Constraint, Cost, LinearConstraint, NonlinearProgram, QuadraticCost, SolverResult,
};
pub use sqp::{NlpSolver, SqpSolver};
