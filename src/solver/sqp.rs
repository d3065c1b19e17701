use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use na::{DMatrix, DVector};
use tracing::debug;

use crate::solver::program::{NonlinearProgram, SolverResult};
use crate::types::Float;

/// The boundary to the external nonlinear solver: consume an assembled
/// program, return convergence status, cost and decision-variable values.
pub trait NlpSolver {
    fn solve(&self, prog: &NonlinearProgram) -> SolverResult;
}

/// Dense sequential quadratic programming over clarabel QP subproblems.
///
/// Each iteration linearizes the constraint blocks (exactly for linear
/// blocks, by central differences otherwise), builds a convexified
/// quadratic model of the cost, and solves
///     min 1/2 dᵀH d + gᵀd
///     s.t. J d = lb - g            (equality rows, zero cone)
///          J d <= ub - g, ...      (inequality rows, nonnegative cone)
///          box bounds, trust region
/// followed by a backtracking line search on the l1 merit function
/// f(x) + mu * violation(x).
///
/// Options read from the program: `max_iterations`, `constraint_tolerance`,
/// `optimality_tolerance`, `initial_trust_radius`.
pub struct SqpSolver;

impl SqpSolver {
    pub fn new() -> Self {
        SqpSolver
    }
}

impl Default for SqpSolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp the eigenvalues of a symmetric matrix to keep the QP cost convex.
fn convexify(H: &DMatrix<Float>, floor: Float) -> DMatrix<Float> {
    let sym = (H + H.transpose()) * 0.5;
    let eig = sym.symmetric_eigen();
    let clamped = DVector::from_fn(eig.eigenvalues.len(), |i, _| eig.eigenvalues[i].max(floor));
    &eig.eigenvectors * DMatrix::from_diagonal(&clamped) * eig.eigenvectors.transpose()
}

struct QpRows {
    A: Vec<Vec<Float>>,
    b: Vec<Float>,
}

impl QpRows {
    fn new() -> Self {
        QpRows { A: vec![], b: vec![] }
    }

    fn push(&mut self, row: Vec<Float>, rhs: Float) {
        self.A.push(row);
        self.b.push(rhs);
    }

    fn len(&self) -> usize {
        self.b.len()
    }
}

impl NlpSolver for SqpSolver {
    fn solve(&self, prog: &NonlinearProgram) -> SolverResult {
        let n = prog.num_vars();
        let max_iterations = prog.option_or("max_iterations", 100.0) as usize;
        let feas_tol = prog.option_or("constraint_tolerance", 1e-6);
        let opt_tol = prog.option_or("optimality_tolerance", 1e-6);
        let mut trust = prog.option_or("initial_trust_radius", 10.0);

        let box_lb = prog.variable_lower_bounds();
        let box_ub = prog.variable_upper_bounds();

        // Start from the initial guess projected into the box
        let mut x = prog.initial_guess();
        for i in 0..n {
            x[i] = x[i].max(box_lb[i]).min(box_ub[i]);
        }

        let mut penalty: Float = 10.0;
        let mut success = false;
        let mut iterations = 0;

        for iter in 0..max_iterations {
            iterations = iter + 1;

            // Quadratic cost model: gradient and convexified Hessian
            let mut grad = DVector::zeros(n);
            let mut hess = DMatrix::zeros(n, n);
            for cost in prog.costs() {
                let z = NonlinearProgram::gather(&x, cost.vars());
                let g = cost.gradient(&z);
                let h = cost.hessian(&z);
                for (i, &vi) in cost.vars().iter().enumerate() {
                    grad[vi] += g[i];
                    for (j, &vj) in cost.vars().iter().enumerate() {
                        hess[(vi, vj)] += h[(i, j)];
                    }
                }
            }
            let hess = convexify(&hess, 1e-8);

            // Linearized constraint rows
            let mut eq = QpRows::new();
            let mut ineq = QpRows::new();
            for c in prog.constraints() {
                let z = NonlinearProgram::gather(&x, c.vars());
                let g = c.eval(&z);
                let J = c.jacobian(&z);
                for r in 0..c.num_constraints() {
                    let mut row = vec![0.0; n];
                    for (j, &vj) in c.vars().iter().enumerate() {
                        row[vj] = J[(r, j)];
                    }
                    let lb = c.lower_bound()[r];
                    let ub = c.upper_bound()[r];
                    if lb == ub {
                        eq.push(row, lb - g[r]);
                    } else {
                        if ub.is_finite() {
                            ineq.push(row.clone(), ub - g[r]);
                        }
                        if lb.is_finite() {
                            ineq.push(row.iter().map(|a| -a).collect(), g[r] - lb);
                        }
                    }
                }
            }

            // Box bounds and trust region on the step
            for i in 0..n {
                let mut row = vec![0.0; n];
                row[i] = 1.0;
                let up = (box_ub[i] - x[i]).min(trust);
                ineq.push(row.clone(), up);
                let mut row_neg = vec![0.0; n];
                row_neg[i] = -1.0;
                let down = (x[i] - box_lb[i]).min(trust);
                ineq.push(row_neg, down);
            }

            // Assemble and solve the QP subproblem
            let num_rows = eq.len() + ineq.len();
            let mut A = DMatrix::zeros(num_rows, n);
            let mut b = Vec::with_capacity(num_rows);
            for (r, row) in eq.A.iter().chain(ineq.A.iter()).enumerate() {
                for j in 0..n {
                    A[(r, j)] = row[j];
                }
            }
            b.extend_from_slice(&eq.b);
            b.extend_from_slice(&ineq.b);

            let P = CscMatrix::from(hess.row_iter());
            let A_csc = CscMatrix::from(A.row_iter());
            let q: Vec<Float> = grad.iter().cloned().collect();
            let cones: Vec<SupportedConeT<Float>> = vec![
                SupportedConeT::ZeroConeT(eq.len()),
                SupportedConeT::NonnegativeConeT(ineq.len()),
            ];
            let settings = DefaultSettingsBuilder::default()
                .verbose(false)
                .build()
                .unwrap();

            let mut qp = DefaultSolver::new(&P, &q, &A_csc, &b, &cones, settings);
            qp.solve();

            let solved = matches!(
                qp.solution.status,
                SolverStatus::Solved | SolverStatus::AlmostSolved
            );
            if !solved {
                trust *= 0.25;
                debug!(iter, trust, "QP subproblem failed, shrinking trust region");
                if trust < 1e-10 {
                    break;
                }
                continue;
            }

            let d = DVector::from_column_slice(&qp.solution.x);
            let viol0 = prog.eval_violation(&x);
            let step_norm = d.amax();

            // Converged: feasible and the QP proposes no further motion
            if viol0 < feas_tol && step_norm < opt_tol {
                success = true;
                break;
            }

            // Keep the merit penalty above the largest constraint multiplier
            let dual_inf = qp
                .solution
                .z
                .iter()
                .fold(0.0 as Float, |acc, zi| acc.max(zi.abs()));
            penalty = penalty.max(2.0 * dual_inf + 1.0);

            let f0 = prog.eval_cost(&x);
            let merit0 = f0 + penalty * viol0;

            let mut alpha = 1.0;
            let mut accepted = false;
            while alpha > 1e-8 {
                let x_trial = &x + &d * alpha;
                let merit =
                    prog.eval_cost(&x_trial) + penalty * prog.eval_violation(&x_trial);
                if merit < merit0 - 1e-10 * merit0.abs().max(1.0) {
                    x = x_trial;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }

            debug!(
                iter,
                cost = f0,
                violation = viol0,
                step = step_norm,
                alpha,
                accepted,
                "sqp iteration"
            );

            if accepted {
                if alpha == 1.0 {
                    trust = (trust * 2.0).min(1e3);
                }
                if viol0 < feas_tol && (step_norm * alpha) < opt_tol {
                    success = true;
                    break;
                }
            } else {
                trust *= 0.25;
                if trust < 1e-10 {
                    break;
                }
            }
        }

        let constraint_violation = prog.eval_violation(&x);
        if constraint_violation >= feas_tol {
            success = false;
        }
        SolverResult {
            success,
            cost: prog.eval_cost(&x),
            x,
            iterations,
            constraint_violation,
        }
    }
}

#[cfg(test)]
mod sqp_tests {
    use na::{dmatrix, dvector};

    use super::*;

    #[test]
    fn unconstrained_quadratic() {
        // Arrange: min 1/2 xᵀ Q x + bᵀ x, solution x = -Q⁻¹ b
        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 2);
        let Q = dmatrix![2.0, 0.0; 0.0, 4.0];
        let b = dvector![-2.0, -8.0];
        prog.add_quadratic_cost(Q, b, &x);

        // Act
        let result = SqpSolver::new().solve(&prog);

        // Assert
        assert!(result.success);
        crate::assert_vec_close!(result.value(&x), dvector![1.0, 2.0], 1e-5);
    }

    #[test]
    fn equality_constrained_quadratic() {
        // min |x|^2 s.t. x0 + x1 = 1  => x = (0.5, 0.5)
        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 2);
        prog.add_quadratic_cost(
            dmatrix![2.0, 0.0; 0.0, 2.0],
            dvector![0.0, 0.0],
            &x,
        );
        prog.add_linear_equality_constraint(dmatrix![1.0, 1.0], dvector![1.0], &x);

        let result = SqpSolver::new().solve(&prog);

        assert!(result.success);
        crate::assert_vec_close!(result.value(&x), dvector![0.5, 0.5], 1e-5);
    }

    #[test]
    fn nonlinear_constraint_on_circle() {
        use crate::solver::program::Constraint;

        // min x0 + x1 s.t. x0^2 + x1^2 = 2  => x = (-1, -1)
        struct Circle {
            lb: DVector<Float>,
            ub: DVector<Float>,
            vars: Vec<usize>,
        }
        impl Constraint for Circle {
            fn name(&self) -> &str {
                "circle"
            }
            fn num_constraints(&self) -> usize {
                1
            }
            fn lower_bound(&self) -> &DVector<Float> {
                &self.lb
            }
            fn upper_bound(&self) -> &DVector<Float> {
                &self.ub
            }
            fn vars(&self) -> &[usize] {
                &self.vars
            }
            fn eval(&self, z: &DVector<Float>) -> DVector<Float> {
                dvector![z[0] * z[0] + z[1] * z[1]]
            }
        }

        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 2);
        prog.add_quadratic_cost(
            dmatrix![0.0, 0.0; 0.0, 0.0],
            dvector![1.0, 1.0],
            &x,
        );
        prog.add_constraint(Box::new(Circle {
            lb: dvector![2.0],
            ub: dvector![2.0],
            vars: x.clone(),
        }));
        prog.set_initial_guess(&x, &dvector![-0.5, -1.5]);

        let result = SqpSolver::new().solve(&prog);

        assert!(result.success);
        crate::assert_vec_close!(result.value(&x), dvector![-1.0, -1.0], 1e-4);
    }

    #[test]
    fn infeasible_bounds_report_failure() {
        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 1);
        prog.add_bounding_box_constraint(0.0, 1.0, &x);
        prog.add_linear_equality_constraint(dmatrix![1.0], dvector![5.0], &x);

        let result = SqpSolver::new().solve(&prog);

        assert!(!result.success);
    }
}
