use na::{DMatrix, DVector};

use crate::plant::MultibodyPlant;
use crate::solver::program::{Constraint, Cost, NonlinearProgram, SolverResult};
use crate::solver::sqp::NlpSolver;
use crate::trajopt::constraints::{
    constrained_dynamics, friction_cone_rows, CollocationConstraint, ImpactConstraint,
    KinematicPositionConstraint, KinematicVelocityConstraint,
};
use crate::trajopt::mode::ModeSequence;
use crate::trajopt::trajectory::{HybridTrajectory, PiecewisePolynomial};
use crate::types::Float;

/// Smallest admissible knot timestep. Keeps every mode away from the
/// degenerate zero-duration limit.
pub const MIN_TIMESTEP: Float = 1e-4;

/// Trapezoidal quadrature of a quadratic running cost over one interval:
///     h/2 (z_aᵀ Q z_a + z_bᵀ Q z_b)
/// Variable layout: [h | z_a | z_b].
struct TrapezoidalCost {
    Q: DMatrix<Float>,
    vars: Vec<usize>,
}

impl TrapezoidalCost {
    fn new(Q: DMatrix<Float>, vars: Vec<usize>) -> Self {
        assert_eq!(Q.nrows(), Q.ncols());
        assert_eq!(vars.len(), 1 + 2 * Q.nrows());
        TrapezoidalCost { Q, vars }
    }

    fn split(&self, z: &DVector<Float>) -> (Float, DVector<Float>, DVector<Float>) {
        let n = self.Q.nrows();
        (
            z[0],
            z.rows(1, n).into_owned(),
            z.rows(1 + n, n).into_owned(),
        )
    }
}

impl Cost for TrapezoidalCost {
    fn name(&self) -> &str {
        "running_cost"
    }

    fn vars(&self) -> &[usize] {
        &self.vars
    }

    fn eval(&self, z: &DVector<Float>) -> Float {
        let (h, za, zb) = self.split(z);
        let ga = (za.transpose() * &self.Q * &za)[(0, 0)];
        let gb = (zb.transpose() * &self.Q * &zb)[(0, 0)];
        0.5 * h * (ga + gb)
    }

    fn gradient(&self, z: &DVector<Float>) -> DVector<Float> {
        let n = self.Q.nrows();
        let (h, za, zb) = self.split(z);
        let qa = &self.Q * &za;
        let qb = &self.Q * &zb;
        let mut grad = DVector::zeros(1 + 2 * n);
        grad[0] = 0.5 * (za.dot(&qa) + zb.dot(&qb));
        grad.rows_mut(1, n).copy_from(&(&qa * h));
        grad.rows_mut(1 + n, n).copy_from(&(&qb * h));
        grad
    }

    fn hessian(&self, z: &DVector<Float>) -> DMatrix<Float> {
        let n = self.Q.nrows();
        let (h, za, zb) = self.split(z);
        let qa = &self.Q * &za;
        let qb = &self.Q * &zb;
        let mut H = DMatrix::zeros(1 + 2 * n, 1 + 2 * n);
        for i in 0..n {
            H[(0, 1 + i)] = qa[i];
            H[(1 + i, 0)] = qa[i];
            H[(0, 1 + n + i)] = qb[i];
            H[(1 + n + i, 0)] = qb[i];
            for j in 0..n {
                H[(1 + i, 1 + j)] = h * self.Q[(i, j)];
                H[(1 + n + i, 1 + n + j)] = h * self.Q[(i, j)];
            }
        }
        H
    }
}

/// Builds the complete collocation NLP for a mode sequence over a plant and
/// hands it to an external solver.
///
/// Decision variables, in allocation order: knot timesteps h (one per
/// interval), distinct knot states x and inputs u, then per mode the knot
/// forces λ, collocation forces λc, velocity slacks γc and relative-row
/// offsets, and per transition the impulse Λ and post-impact velocity v⁺.
///
/// The state block of a shared boundary knot holds the pre-impact state;
/// the incoming mode reads its first-knot velocity from v⁺.
pub struct HybridTrajOpt<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    sequence: &'a ModeSequence<'a, Float>,
    prog: NonlinearProgram<'a>,
    h_vars: Vec<usize>,
    x_vars: Vec<Vec<usize>>,
    u_vars: Vec<Vec<usize>>,
    force_vars: Vec<Vec<usize>>,
    coll_force_vars: Vec<Vec<usize>>,
    coll_slack_vars: Vec<Vec<usize>>,
    offset_vars: Vec<Vec<usize>>,
    impulse_vars: Vec<Option<Vec<usize>>>,
    post_impact_vel_vars: Vec<Option<Vec<usize>>>,
}

impl<'a> HybridTrajOpt<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        sequence: &'a ModeSequence<'a, Float>,
    ) -> Self {
        assert!(sequence.num_modes() > 0, "mode sequence must be non-empty");
        let n_q = plant.num_positions();
        let n_v = plant.num_velocities();
        let n_u = plant.num_actuators();
        assert!(n_q > 0 && n_v > 0, "plant has no state");
        for m in 0..sequence.num_modes() {
            let evals = sequence.mode(m).evaluators();
            if evals.count_active() > 0 {
                let q = DVector::zeros(n_q);
                let J = evals.eval_active_jacobian(plant, &q);
                assert_eq!(
                    J.ncols(),
                    n_v,
                    "mode {} evaluator set is inconsistent with the plant",
                    m
                );
            }
        }

        let num_knots = sequence.num_knots();
        let mut prog = NonlinearProgram::new();

        let h_vars = prog.add_decision_variables("h", num_knots - 1);
        prog.add_bounding_box_constraint(MIN_TIMESTEP, Float::INFINITY, &h_vars);

        let mut x_vars = Vec::with_capacity(num_knots);
        let mut u_vars = Vec::with_capacity(num_knots);
        for i in 0..num_knots {
            x_vars.push(prog.add_decision_variables(&format!("x{}", i), n_q + n_v));
            u_vars.push(prog.add_decision_variables(&format!("u{}", i), n_u));
        }

        let mut force_vars = vec![];
        let mut coll_force_vars = vec![];
        let mut coll_slack_vars = vec![];
        let mut offset_vars = vec![];
        for m in 0..sequence.num_modes() {
            let mode = sequence.mode(m);
            let n_c = mode.num_constraints();
            let knots = mode.num_knots();
            force_vars.push(prog.add_decision_variables(&format!("lambda{}", m), n_c * knots));
            coll_force_vars
                .push(prog.add_decision_variables(&format!("lambda_c{}", m), n_c * (knots - 1)));
            coll_slack_vars
                .push(prog.add_decision_variables(&format!("gamma_c{}", m), n_c * (knots - 1)));
            offset_vars.push(prog.add_decision_variables(
                &format!("rel_offset{}", m),
                mode.num_relative(),
            ));
        }

        let mut impulse_vars = vec![];
        let mut post_impact_vel_vars = vec![];
        for t in 0..sequence.num_modes() - 1 {
            let incoming = sequence.mode(t + 1);
            if incoming.num_constraints() > 0 {
                impulse_vars.push(Some(prog.add_decision_variables(
                    &format!("impulse{}", t),
                    incoming.num_constraints(),
                )));
                post_impact_vel_vars
                    .push(Some(prog.add_decision_variables(&format!("v_post{}", t), n_v)));
            } else {
                impulse_vars.push(None);
                post_impact_vel_vars.push(None);
            }
        }

        let mut trajopt = HybridTrajOpt {
            plant,
            sequence,
            prog,
            h_vars,
            x_vars,
            u_vars,
            force_vars,
            coll_force_vars,
            coll_slack_vars,
            offset_vars,
            impulse_vars,
            post_impact_vel_vars,
        };
        trajopt.add_timestep_constraints();
        trajopt.add_collocation_constraints();
        trajopt.add_kinematic_constraints();
        trajopt.add_impact_constraints();
        trajopt.add_friction_cone_constraints();
        trajopt
    }

    fn add_timestep_constraints(&mut self) {
        // Equal timesteps within a mode; the mode duration window becomes
        // linear bounds on the interval sum.
        for m in 0..self.sequence.num_modes() {
            let mode = self.sequence.mode(m);
            let start = self.sequence.first_knot(m);
            let intervals: Vec<usize> =
                (start..start + mode.num_knots() - 1).map(|i| self.h_vars[i]).collect();
            for w in intervals.windows(2) {
                self.prog.add_linear_equality_constraint(
                    DMatrix::from_row_slice(1, 2, &[1.0, -1.0]),
                    DVector::zeros(1),
                    w,
                );
            }
            let ones = DMatrix::from_element(1, intervals.len(), 1.0);
            self.prog.add_linear_constraint(
                ones,
                DVector::from_element(1, mode.min_duration()),
                DVector::from_element(1, mode.max_duration()),
                &intervals,
            );
        }
    }

    fn add_collocation_constraints(&mut self) {
        for m in 0..self.sequence.num_modes() {
            let mode = self.sequence.mode(m);
            let start = self.sequence.first_knot(m);
            for k in 0..mode.num_knots() - 1 {
                let i = start + k;
                let mut vars = vec![self.h_vars[i]];
                vars.extend(self.state_vars(m, k));
                vars.extend(self.state_vars(m, k + 1));
                vars.extend(self.u_vars[i].iter());
                vars.extend(self.u_vars[i + 1].iter());
                vars.extend(self.force_vars_at(m, k));
                vars.extend(self.force_vars_at(m, k + 1));
                vars.extend(self.collocation_force_vars(m, k));
                vars.extend(self.collocation_slack_vars(m, k));
                self.prog.add_constraint(Box::new(CollocationConstraint::new(
                    self.plant, mode, vars,
                )));
            }
        }
    }

    fn add_kinematic_constraints(&mut self) {
        let n_q = self.plant.num_positions();
        for m in 0..self.sequence.num_modes() {
            let mode = self.sequence.mode(m);
            if mode.num_constraints() == 0 {
                continue;
            }
            let start = self.sequence.first_knot(m);
            for k in 0..mode.num_knots() {
                let knot = start + k;
                let mut pos_vars: Vec<usize> = self.x_vars[knot][..n_q].to_vec();
                pos_vars.extend(self.offset_vars[m].iter());
                self.prog.add_constraint(Box::new(
                    KinematicPositionConstraint::new(self.plant, mode, pos_vars),
                ));
                self.prog.add_constraint(Box::new(
                    KinematicVelocityConstraint::new(self.plant, mode, self.state_vars(m, k)),
                ));
            }
        }
    }

    fn add_impact_constraints(&mut self) {
        for t in 0..self.sequence.num_modes() - 1 {
            let (Some(impulse), Some(v_post)) =
                (&self.impulse_vars[t], &self.post_impact_vel_vars[t])
            else {
                continue;
            };
            let boundary = self.sequence.first_knot(t + 1);
            let mut vars: Vec<usize> = self.x_vars[boundary].clone();
            vars.extend(v_post.iter());
            vars.extend(impulse.iter());
            self.prog.add_constraint(Box::new(ImpactConstraint::new(
                self.plant,
                self.sequence.mode(t + 1).evaluators(),
                vars,
            )));
        }
    }

    fn add_friction_cone_constraints(&mut self) {
        for m in 0..self.sequence.num_modes() {
            let mode = self.sequence.mode(m);
            let evals = mode.evaluators();
            for e in 0..evals.num_evaluators() {
                let evaluator = evals.get_evaluator(e);
                if !evaluator.is_frictional() {
                    continue;
                }
                let A = friction_cone_rows(evaluator);
                let seg_start = evals.active_start(e);
                let seg_len = evaluator.num_active();
                for k in 0..mode.num_knots() {
                    let lambda = self.force_vars_at(m, k);
                    let seg = lambda[seg_start..seg_start + seg_len].to_vec();
                    self.prog.add_linear_constraint(
                        A.clone(),
                        DVector::zeros(A.nrows()),
                        DVector::from_element(A.nrows(), Float::INFINITY),
                        &seg,
                    );
                }
                // The transition impulse into this mode obeys the same cone
                if m > 0 {
                    if let Some(impulse) = &self.impulse_vars[m - 1] {
                        let seg = impulse[seg_start..seg_start + seg_len].to_vec();
                        self.prog.add_linear_constraint(
                            A.clone(),
                            DVector::zeros(A.nrows()),
                            DVector::from_element(A.nrows(), Float::INFINITY),
                            &seg,
                        );
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Variable accessors

    pub fn num_knots(&self) -> usize {
        self.sequence.num_knots()
    }

    /// State variables of distinct knot i. At a shared mode boundary this
    /// is the pre-impact state.
    pub fn state(&self, i: usize) -> Vec<usize> {
        self.x_vars[i].clone()
    }

    pub fn input(&self, i: usize) -> Vec<usize> {
        self.u_vars[i].clone()
    }

    pub fn initial_state(&self) -> Vec<usize> {
        self.state_vars(0, 0)
    }

    pub fn final_state(&self) -> Vec<usize> {
        let last = self.num_knots() - 1;
        self.x_vars[last].clone()
    }

    /// State variables as seen by mode `m` at its local knot `k`: the
    /// incoming knot of a mode with an impact reads the post-impact
    /// velocity block.
    pub fn state_vars(&self, m: usize, k: usize) -> Vec<usize> {
        let n_q = self.plant.num_positions();
        let knot = self.sequence.first_knot(m) + k;
        if k == 0 && m > 0 {
            if let Some(v_post) = &self.post_impact_vel_vars[m - 1] {
                let mut vars: Vec<usize> = self.x_vars[knot][..n_q].to_vec();
                vars.extend(v_post.iter());
                return vars;
            }
        }
        self.x_vars[knot].clone()
    }

    /// Contact force variables of mode m at its local knot k.
    pub fn force_vars_at(&self, m: usize, k: usize) -> Vec<usize> {
        let n_c = self.sequence.mode(m).num_constraints();
        self.force_vars[m][k * n_c..(k + 1) * n_c].to_vec()
    }

    pub fn collocation_force_vars(&self, m: usize, k: usize) -> Vec<usize> {
        let n_c = self.sequence.mode(m).num_constraints();
        self.coll_force_vars[m][k * n_c..(k + 1) * n_c].to_vec()
    }

    pub fn collocation_slack_vars(&self, m: usize, k: usize) -> Vec<usize> {
        let n_c = self.sequence.mode(m).num_constraints();
        self.coll_slack_vars[m][k * n_c..(k + 1) * n_c].to_vec()
    }

    pub fn relative_offset_vars(&self, m: usize) -> &[usize] {
        &self.offset_vars[m]
    }

    pub fn impulse_vars(&self, transition: usize) -> Option<&[usize]> {
        self.impulse_vars[transition].as_deref()
    }

    pub fn timestep(&self, interval: usize) -> usize {
        self.h_vars[interval]
    }

    // ------------------------------------------------------------------
    // Bounds, costs, options

    pub fn add_bounding_box_constraint(&mut self, lb: Float, ub: Float, vars: &[usize]) {
        self.prog.add_bounding_box_constraint(lb, ub, vars);
    }

    pub fn add_linear_constraint(
        &mut self,
        A: DMatrix<Float>,
        lb: DVector<Float>,
        ub: DVector<Float>,
        vars: &[usize],
    ) {
        self.prog.add_linear_constraint(A, lb, ub, vars);
    }

    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint + 'a>) {
        self.prog.add_constraint(constraint);
    }

    pub fn add_quadratic_cost(&mut self, Q: DMatrix<Float>, b: DVector<Float>, vars: &[usize]) {
        self.prog.add_quadratic_cost(Q, b, vars);
    }

    /// Trapezoidal running cost on the velocity part of the state:
    ///     ∫ vᵀ Q v dt
    pub fn add_running_velocity_cost(&mut self, Q: DMatrix<Float>) {
        let n_q = self.plant.num_positions();
        let n_v = self.plant.num_velocities();
        assert_eq!(Q.nrows(), n_v);
        for i in 0..self.num_knots() - 1 {
            let mut vars = vec![self.h_vars[i]];
            vars.extend(self.x_vars[i][n_q..].iter());
            vars.extend(self.x_vars[i + 1][n_q..].iter());
            self.prog
                .add_cost(Box::new(TrapezoidalCost::new(Q.clone(), vars)));
        }
    }

    /// Trapezoidal running cost on the actuation:
    ///     ∫ uᵀ R u dt
    pub fn add_running_input_cost(&mut self, R: DMatrix<Float>) {
        let n_u = self.plant.num_actuators();
        assert!(n_u > 0, "plant has no actuators");
        assert_eq!(R.nrows(), n_u);
        for i in 0..self.num_knots() - 1 {
            let mut vars = vec![self.h_vars[i]];
            vars.extend(self.u_vars[i].iter());
            vars.extend(self.u_vars[i + 1].iter());
            self.prog
                .add_cost(Box::new(TrapezoidalCost::new(R.clone(), vars)));
        }
    }

    /// Bound the total trajectory duration.
    pub fn add_duration_bounds(&mut self, min: Float, max: Float) {
        assert!(0.0 <= min && min <= max);
        let ones = DMatrix::from_element(1, self.h_vars.len(), 1.0);
        self.prog.add_linear_constraint(
            ones,
            DVector::from_element(1, min),
            DVector::from_element(1, max),
            &self.h_vars.clone(),
        );
    }

    pub fn set_solver_option(&mut self, key: &str, value: Float) {
        self.prog.set_option(key, value);
    }

    // ------------------------------------------------------------------
    // Initial guesses

    /// Uniform timestep guess for a total duration.
    pub fn set_initial_guess_duration(&mut self, duration: Float) {
        let h = duration / self.h_vars.len() as Float;
        let guess = DVector::from_element(self.h_vars.len(), h);
        self.prog.set_initial_guess(&self.h_vars.clone(), &guess);
    }

    /// Straight-line state guess from x0 to xf over the distinct knots.
    /// Post-impact velocity guesses get the interpolated velocity too.
    pub fn set_initial_guess_state_linear(&mut self, x0: &DVector<Float>, xf: &DVector<Float>) {
        let n_q = self.plant.num_positions();
        let num_knots = self.num_knots();
        for i in 0..num_knots {
            let s = i as Float / (num_knots - 1) as Float;
            let x = x0 * (1.0 - s) + xf * s;
            self.prog.set_initial_guess(&self.x_vars[i].clone(), &x);
        }
        for t in 0..self.sequence.num_modes() - 1 {
            if let Some(v_post) = self.post_impact_vel_vars[t].clone() {
                let boundary = self.sequence.first_knot(t + 1);
                let s = boundary as Float / (num_knots - 1) as Float;
                let x = x0 * (1.0 - s) + xf * s;
                self.prog
                    .set_initial_guess(&v_post, &x.rows(n_q, x.len() - n_q).into_owned());
            }
        }
    }

    /// Constant force guess over all of a mode's knot and collocation
    /// forces; slacks start at zero.
    pub fn set_initial_guess_force_constant(&mut self, m: usize, lambda: &DVector<Float>) {
        let mode = self.sequence.mode(m);
        assert_eq!(lambda.len(), mode.num_constraints());
        for k in 0..mode.num_knots() {
            self.prog
                .set_initial_guess(&self.force_vars_at(m, k), lambda);
        }
        for k in 0..mode.num_knots() - 1 {
            self.prog
                .set_initial_guess(&self.collocation_force_vars(m, k), lambda);
        }
    }

    pub fn set_initial_guess(&mut self, vars: &[usize], values: &DVector<Float>) {
        self.prog.set_initial_guess(vars, values);
    }

    // ------------------------------------------------------------------
    // Solve and reconstruction

    pub fn program(&self) -> &NonlinearProgram<'a> {
        &self.prog
    }

    /// Hand the assembled program to the solver. Non-convergence is
    /// reported in the result, never raised.
    pub fn solve(&self, solver: &dyn NlpSolver) -> SolverResult {
        solver.solve(&self.prog)
    }

    /// Times of the distinct knot points implied by the solved timesteps.
    pub fn knot_times(&self, result: &SolverResult) -> Vec<Float> {
        let mut times = vec![0.0];
        for &h in &self.h_vars {
            times.push(times.last().unwrap() + result.x[h]);
        }
        times
    }

    /// Rebuild the state trajectory with the same cubic interpolant the
    /// collocation scheme uses. Velocity jumps land exactly at the mode
    /// boundary times; evaluation at a boundary returns the post-impact
    /// state.
    pub fn reconstruct_state_trajectory(&self, result: &SolverResult) -> PiecewisePolynomial {
        let times = self.knot_times(result);
        let mut trajectory: Option<PiecewisePolynomial> = None;
        for m in 0..self.sequence.num_modes() {
            let mode = self.sequence.mode(m);
            let start = self.sequence.first_knot(m);
            let mut breaks = vec![];
            let mut samples = vec![];
            let mut derivs = vec![];
            for k in 0..mode.num_knots() {
                let x = result.value(&self.state_vars(m, k));
                let xdot = self.knot_state_derivative(result, m, k, &x);
                breaks.push(times[start + k]);
                samples.push(x);
                derivs.push(xdot);
            }
            let piece = PiecewisePolynomial::cubic_hermite(&breaks, &samples, &derivs);
            trajectory = Some(match trajectory {
                None => piece,
                Some(mut t) => {
                    t.concatenate(piece);
                    t
                }
            });
        }
        trajectory.unwrap()
    }

    fn knot_state_derivative(
        &self,
        result: &SolverResult,
        m: usize,
        k: usize,
        x: &DVector<Float>,
    ) -> DVector<Float> {
        let n_q = self.plant.num_positions();
        let n_v = self.plant.num_velocities();
        let mode = self.sequence.mode(m);
        let knot = self.sequence.first_knot(m) + k;
        let q = x.rows(0, n_q).into_owned();
        let v = x.rows(n_q, n_v).into_owned();
        let u = result.value(&self.u_vars[knot]);
        let lambda = result.value(&self.force_vars_at(m, k));
        let vdot = constrained_dynamics(self.plant, mode.evaluators(), &q, &v, &u, &lambda);
        let mut xdot = DVector::zeros(n_q + n_v);
        xdot.rows_mut(0, n_q)
            .copy_from(&self.plant.map_velocity_to_qdot(&q, &v));
        xdot.rows_mut(n_q, n_v).copy_from(&vdot);
        xdot
    }

    /// First-order hold over the solved inputs.
    pub fn reconstruct_input_trajectory(&self, result: &SolverResult) -> PiecewisePolynomial {
        let times = self.knot_times(result);
        let samples: Vec<DVector<Float>> = (0..self.num_knots())
            .map(|i| result.value(&self.u_vars[i]))
            .collect();
        PiecewisePolynomial::first_order_hold(&times, &samples)
    }

    /// First-order hold over one mode's contact forces.
    pub fn reconstruct_force_trajectory(
        &self,
        result: &SolverResult,
        m: usize,
    ) -> PiecewisePolynomial {
        let times = self.knot_times(result);
        let mode = self.sequence.mode(m);
        let start = self.sequence.first_knot(m);
        let breaks: Vec<Float> = (0..mode.num_knots()).map(|k| times[start + k]).collect();
        let samples: Vec<DVector<Float>> = (0..mode.num_knots())
            .map(|k| result.value(&self.force_vars_at(m, k)))
            .collect();
        PiecewisePolynomial::first_order_hold(&breaks, &samples)
    }

    /// Bundle everything needed to restore the solution without re-solving.
    pub fn reconstruct(&self, result: &SolverResult) -> HybridTrajectory {
        let times = self.knot_times(result);
        let mode_boundary_times: Vec<Float> = (1..self.sequence.num_modes())
            .map(|m| times[self.sequence.first_knot(m)])
            .collect();
        let forces = (0..self.sequence.num_modes())
            .map(|m| self.reconstruct_force_trajectory(result, m))
            .collect();
        HybridTrajectory {
            state: self.reconstruct_state_trajectory(result),
            input: if self.plant.num_actuators() > 0 {
                Some(self.reconstruct_input_trajectory(result))
            } else {
                None
            },
            forces,
            knot_times: times,
            mode_boundary_times,
            num_positions: self.plant.num_positions(),
            num_velocities: self.plant.num_velocities(),
            num_actuators: self.plant.num_actuators(),
        }
    }
}

#[cfg(test)]
mod optimizer_tests {
    use na::{dvector, vector};

    use crate::helpers::{build_planar_point_foot, build_point_mass};
    use crate::kinematic::{KinematicEvaluatorSet, WorldPointEvaluator};
    use crate::plant::BodyPoint;
    use crate::solver::sqp::SqpSolver;
    use crate::trajopt::mode::{ContactMode, ModeSequence};
    use crate::GRAVITY;

    use super::*;

    #[test]
    #[should_panic]
    fn zero_mode_sequence_is_fatal() {
        let plant = build_point_mass(1.0);
        let sequence = ModeSequence::new();
        let _ = HybridTrajOpt::new(&plant, &sequence);
    }

    #[test]
    fn flight_phase_matches_ballistic_arc() {
        // Arrange: a single flight mode for a point mass with the initial
        // state pinned. The dynamics then admit exactly one trajectory,
        // the parabola z(t) = z0 + vz0 t - g t^2 / 2.
        let plant = build_point_mass(1.0);
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let duration = 0.6;
        let flight = ContactMode::new(&empty, 6, duration, duration);
        let mut sequence = ModeSequence::new();
        sequence.add_mode(&flight);

        let mut trajopt = HybridTrajOpt::new(&plant, &sequence);
        let x0 = dvector![0.0, 1.0, 1.0, 2.0];
        for (i, &v) in trajopt.initial_state().iter().enumerate() {
            trajopt.add_bounding_box_constraint(x0[i], x0[i], &[v]);
        }
        trajopt.set_initial_guess_duration(duration);
        trajopt.set_initial_guess_state_linear(&x0, &x0);
        trajopt.set_solver_option("constraint_tolerance", 1e-5);

        // Act
        let result = trajopt.solve(&SqpSolver::new());

        // Assert
        assert!(result.success, "solver did not converge");
        let times = trajopt.knot_times(&result);
        crate::assert_close!(times[times.len() - 1], duration, 1e-6);
        for (i, &t) in times.iter().enumerate() {
            let x = result.value(&trajopt.state(i));
            crate::assert_close!(x[0], 1.0 * t, 1e-4);
            crate::assert_close!(x[1], 1.0 + 2.0 * t - 0.5 * GRAVITY * t * t, 1e-4);
            crate::assert_close!(x[2], 1.0, 1e-4);
            crate::assert_close!(x[3], 2.0 - GRAVITY * t, 1e-4);
        }

        // Round trip: sampling the reconstruction at the knot times
        // reproduces the decision values
        let trajectory = trajopt.reconstruct(&result);
        trajectory.validate_for_plant(&plant).unwrap();
        for (i, &t) in times.iter().enumerate() {
            let x = result.value(&trajopt.state(i));
            crate::assert_vec_close!(trajectory.state.value(t), x, 1e-9);
        }

        // Restoring against a different plant is a load-time error
        let other = build_planar_point_foot(1.0, 1.0);
        assert!(trajectory.validate_for_plant(&other).is_err());
    }

    #[test]
    fn standing_balance_force_equals_weight() {
        // Arrange: full support on a frictional point foot, every knot
        // pinned to the same standing state. The contact normal force must
        // carry the whole weight.
        let plant = build_planar_point_foot(9.0, 1.0);
        let mut foot_eval = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        foot_eval.set_frictional();
        foot_eval.set_mu(1.0);
        let mut stance_set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        stance_set.add_evaluator(&foot_eval);

        let duration = 0.2;
        let stance = ContactMode::new(&stance_set, 3, duration, duration);
        let mut sequence = ModeSequence::new();
        sequence.add_mode(&stance);

        let mut trajopt = HybridTrajOpt::new(&plant, &sequence);
        let x_stand = dvector![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        for i in 0..trajopt.num_knots() {
            for (j, &v) in trajopt.state(i).iter().enumerate() {
                trajopt.add_bounding_box_constraint(x_stand[j], x_stand[j], &[v]);
            }
        }
        trajopt.add_running_input_cost(DMatrix::identity(2, 2));
        trajopt.set_initial_guess_duration(duration);
        trajopt.set_initial_guess_state_linear(&x_stand, &x_stand);
        let weight = plant.total_mass() * GRAVITY;
        trajopt.set_initial_guess_force_constant(0, &dvector![0.0, 0.0, weight]);
        trajopt.set_solver_option("constraint_tolerance", 1e-5);

        // Act
        let result = trajopt.solve(&SqpSolver::new());

        // Assert
        assert!(result.success, "solver did not converge");
        for k in 0..3 {
            let lambda = result.value(&trajopt.force_vars_at(0, k));
            crate::assert_close!(lambda[2], weight, 1e-3);
            crate::assert_close!(lambda[0], 0.0, 1e-3);
        }

        // The input reconstruction holds the knot values
        let trajectory = trajopt.reconstruct(&result);
        let times = trajopt.knot_times(&result);
        let input = trajectory.input.as_ref().unwrap();
        for (i, &t) in times.iter().enumerate() {
            let u = result.value(&trajopt.input(i));
            crate::assert_vec_close!(input.value(t), u, 1e-9);
        }
    }

    #[test]
    fn touchdown_impact_arrests_the_foot() {
        // Arrange: flight into full support. The rigid impact must zero
        // the foot velocity while the body velocity stays continuous
        // (diagonal mass matrix, constraint only on the foot rows).
        let plant = build_planar_point_foot(9.0, 1.0);
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let mut foot_eval = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        foot_eval.set_frictional();
        foot_eval.set_mu(1.0);
        let mut stance_set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        stance_set.add_evaluator(&foot_eval);

        let flight = ContactMode::new(&empty, 3, 0.3, 0.3);
        let stance = ContactMode::new(&stance_set, 3, 0.3, 0.3);
        let mut sequence = ModeSequence::new();
        sequence.add_mode(&flight);
        sequence.add_mode(&stance);

        let mut trajopt = HybridTrajOpt::new(&plant, &sequence);
        // Pin the initial body state and velocities; the initial foot
        // height is free for the solver to place so touchdown works out.
        let x0_init = trajopt.initial_state();
        trajopt.add_bounding_box_constraint(0.0, 0.0, &[x0_init[0]]);
        trajopt.add_bounding_box_constraint(1.5, 1.5, &[x0_init[1]]);
        trajopt.add_bounding_box_constraint(0.0, 0.0, &[x0_init[2]]);
        trajopt.add_bounding_box_constraint(0.0, 10.0, &[x0_init[3]]);
        trajopt.add_bounding_box_constraint(0.0, 0.0, &[x0_init[4]]);
        trajopt.add_bounding_box_constraint(-1.0, -1.0, &[x0_init[5]]);
        trajopt.add_bounding_box_constraint(0.0, 0.0, &[x0_init[6]]);
        trajopt.add_bounding_box_constraint(-1.0, -1.0, &[x0_init[7]]);

        let x_guess = dvector![0.0, 1.5, 0.0, 0.5, 0.0, -1.0, 0.0, -1.0];
        let x_land = dvector![0.0, 1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0];
        trajopt.set_initial_guess_duration(0.6);
        trajopt.set_initial_guess_state_linear(&x_guess, &x_land);
        let weight = plant.total_mass() * GRAVITY;
        trajopt.set_initial_guess_force_constant(1, &dvector![0.0, 0.0, weight]);
        trajopt.set_solver_option("constraint_tolerance", 1e-5);
        trajopt.set_solver_option("max_iterations", 200.0);

        // Act
        let result = trajopt.solve(&SqpSolver::new());

        // Assert
        assert!(result.success, "solver did not converge");
        let boundary = sequence.first_knot(1);
        let pre = result.value(&trajopt.state(boundary));
        let post = result.value(&trajopt.state_vars(1, 0));

        // Positions are shared across the transition
        crate::assert_vec_close!(pre.rows(0, 4), post.rows(0, 4), 1e-12);
        // The foot lands at height zero and its velocity is annihilated
        crate::assert_close!(pre[3], 0.0, 1e-4);
        crate::assert_close!(post[6], 0.0, 1e-4);
        crate::assert_close!(post[7], 0.0, 1e-4);
        // Body velocity is continuous through the impact
        crate::assert_close!(pre[4], post[4], 1e-4);
        crate::assert_close!(pre[5], post[5], 1e-4);
    }
}
