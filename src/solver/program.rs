use std::collections::BTreeMap;

use na::{DMatrix, DVector};

use crate::types::Float;

/// A (generally nonlinear) vector-valued constraint block
///     lb <= g(z) <= ub
/// over the subset of decision variables named by `vars()`. `eval` receives
/// only that gathered subvector.
///
/// The default Jacobian is a central finite difference; blocks with exact
/// derivatives (linear constraints) override it.
pub trait Constraint {
    fn name(&self) -> &str;

    fn num_constraints(&self) -> usize;

    fn lower_bound(&self) -> &DVector<Float>;

    fn upper_bound(&self) -> &DVector<Float>;

    /// Indices into the program's decision vector this block depends on.
    fn vars(&self) -> &[usize];

    fn eval(&self, z: &DVector<Float>) -> DVector<Float>;

    fn jacobian(&self, z: &DVector<Float>) -> DMatrix<Float> {
        let n = z.len();
        let m = self.num_constraints();
        let mut J = DMatrix::zeros(m, n);
        let mut zp = z.clone();
        for j in 0..n {
            let h = 1e-6 * z[j].abs().max(1.0);
            zp[j] = z[j] + h;
            let plus = self.eval(&zp);
            zp[j] = z[j] - h;
            let minus = self.eval(&zp);
            zp[j] = z[j];
            J.set_column(j, &((plus - minus) / (2.0 * h)));
        }
        J
    }
}

/// A scalar cost term over a subset of the decision variables.
pub trait Cost {
    fn name(&self) -> &str;

    fn vars(&self) -> &[usize];

    fn eval(&self, z: &DVector<Float>) -> Float;

    fn gradient(&self, z: &DVector<Float>) -> DVector<Float> {
        let n = z.len();
        let mut grad = DVector::zeros(n);
        let mut zp = z.clone();
        for j in 0..n {
            let h = 1e-6 * z[j].abs().max(1.0);
            zp[j] = z[j] + h;
            let plus = self.eval(&zp);
            zp[j] = z[j] - h;
            let minus = self.eval(&zp);
            zp[j] = z[j];
            grad[j] = (plus - minus) / (2.0 * h);
        }
        grad
    }

    fn hessian(&self, z: &DVector<Float>) -> DMatrix<Float> {
        let n = z.len();
        let mut H = DMatrix::zeros(n, n);
        let mut zp = z.clone();
        for j in 0..n {
            let h = 1e-5 * z[j].abs().max(1.0);
            zp[j] = z[j] + h;
            let plus = self.gradient(&zp);
            zp[j] = z[j] - h;
            let minus = self.gradient(&zp);
            zp[j] = z[j];
            H.set_column(j, &((plus - minus) / (2.0 * h)));
        }
        // Symmetrize the finite-difference result
        let Ht = H.transpose();
        (H + Ht) * 0.5
    }
}

/// lb <= A z <= ub
pub struct LinearConstraint {
    name: String,
    A: DMatrix<Float>,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl LinearConstraint {
    pub fn new(
        name: &str,
        A: DMatrix<Float>,
        lb: DVector<Float>,
        ub: DVector<Float>,
        vars: Vec<usize>,
    ) -> Self {
        assert_eq!(A.nrows(), lb.len());
        assert_eq!(A.nrows(), ub.len());
        assert_eq!(A.ncols(), vars.len());
        LinearConstraint {
            name: name.to_string(),
            A,
            lb,
            ub,
            vars,
        }
    }

    pub fn equality(name: &str, A: DMatrix<Float>, beq: DVector<Float>, vars: Vec<usize>) -> Self {
        let lb = beq.clone();
        Self::new(name, A, lb, beq, vars)
    }
}

impl Constraint for LinearConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_constraints(&self) -> usize {
        self.A.nrows()
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
        &self.A * z
    }

    fn jacobian(&self, _z: &DVector<Float>) -> DMatrix<Float> {
        self.A.clone()
    }
}

/// 1/2 zᵀ Q z + bᵀ z
pub struct QuadraticCost {
    name: String,
    Q: DMatrix<Float>,
    b: DVector<Float>,
    vars: Vec<usize>,
}

impl QuadraticCost {
    pub fn new(name: &str, Q: DMatrix<Float>, b: DVector<Float>, vars: Vec<usize>) -> Self {
        assert_eq!(Q.nrows(), Q.ncols());
        assert_eq!(Q.nrows(), b.len());
        assert_eq!(Q.nrows(), vars.len());
        QuadraticCost {
            name: name.to_string(),
            Q,
            b,
            vars,
        }
    }
}

impl Cost for QuadraticCost {
    fn name(&self) -> &str {
        &self.name
    }

    fn vars(&self) -> &[usize] {
        &self.vars
    }

    fn eval(&self, z: &DVector<Float>) -> Float {
        0.5 * (z.transpose() * &self.Q * z)[(0, 0)] + self.b.dot(z)
    }

    fn gradient(&self, z: &DVector<Float>) -> DVector<Float> {
        &self.Q * z + &self.b
    }

    fn hessian(&self, _z: &DVector<Float>) -> DMatrix<Float> {
        self.Q.clone()
    }
}

/// Outcome of one solver invocation. Non-convergence is reported here, never
/// raised; the caller decides whether to retry with a different guess or
/// looser tolerances.
#[derive(Clone, Debug)]
pub struct SolverResult {
    pub success: bool,
    pub cost: Float,
    pub x: DVector<Float>,
    pub iterations: usize,
    pub constraint_violation: Float,
}

impl SolverResult {
    /// Gather the solved values of a variable block.
    pub fn value(&self, vars: &[usize]) -> DVector<Float> {
        DVector::from_fn(vars.len(), |i, _| self.x[vars[i]])
    }

    pub fn scalar_value(&self, var: usize) -> Float {
        self.x[var]
    }
}

/// An in-memory nonlinear program: a flat decision vector partitioned into
/// named blocks, box bounds, constraint and cost blocks, an initial guess
/// and string-keyed solver options.
///
/// Construction is single-threaded appends; the program is read-only while
/// a solver runs on it.
pub struct NonlinearProgram<'a> {
    var_names: Vec<String>,
    lb: Vec<Float>,
    ub: Vec<Float>,
    initial_guess: Vec<Float>,
    constraints: Vec<Box<dyn Constraint + 'a>>,
    costs: Vec<Box<dyn Cost + 'a>>,
    options: BTreeMap<String, Float>,
}

impl<'a> NonlinearProgram<'a> {
    pub fn new() -> Self {
        NonlinearProgram {
            var_names: vec![],
            lb: vec![],
            ub: vec![],
            initial_guess: vec![],
            constraints: vec![],
            costs: vec![],
            options: BTreeMap::new(),
        }
    }

    /// Allocate `count` new decision variables, returning their indices.
    pub fn add_decision_variables(&mut self, name: &str, count: usize) -> Vec<usize> {
        let start = self.var_names.len();
        for i in 0..count {
            self.var_names.push(format!("{}[{}]", name, i));
            self.lb.push(Float::NEG_INFINITY);
            self.ub.push(Float::INFINITY);
            self.initial_guess.push(0.0);
        }
        (start..start + count).collect()
    }

    pub fn num_vars(&self) -> usize {
        self.var_names.len()
    }

    pub fn var_name(&self, index: usize) -> &str {
        &self.var_names[index]
    }

    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint + 'a>) {
        for &v in constraint.vars() {
            assert!(v < self.num_vars(), "constraint references unknown variable");
        }
        self.constraints.push(constraint);
    }

    pub fn add_linear_constraint(
        &mut self,
        A: DMatrix<Float>,
        lb: DVector<Float>,
        ub: DVector<Float>,
        vars: &[usize],
    ) {
        self.add_constraint(Box::new(LinearConstraint::new(
            "linear",
            A,
            lb,
            ub,
            vars.to_vec(),
        )));
    }

    pub fn add_linear_equality_constraint(
        &mut self,
        A: DMatrix<Float>,
        beq: DVector<Float>,
        vars: &[usize],
    ) {
        self.add_constraint(Box::new(LinearConstraint::equality(
            "linear_eq",
            A,
            beq,
            vars.to_vec(),
        )));
    }

    /// Tighten the box bounds on the listed variables. Repeated calls
    /// intersect.
    pub fn add_bounding_box_constraint(&mut self, lb: Float, ub: Float, vars: &[usize]) {
        assert!(lb <= ub, "bounding box lower bound exceeds upper bound");
        for &v in vars {
            self.lb[v] = self.lb[v].max(lb);
            self.ub[v] = self.ub[v].min(ub);
        }
    }

    pub fn add_cost(&mut self, cost: Box<dyn Cost + 'a>) {
        for &v in cost.vars() {
            assert!(v < self.num_vars(), "cost references unknown variable");
        }
        self.costs.push(cost);
    }

    pub fn add_quadratic_cost(&mut self, Q: DMatrix<Float>, b: DVector<Float>, vars: &[usize]) {
        self.add_cost(Box::new(QuadraticCost::new("quadratic", Q, b, vars.to_vec())));
    }

    pub fn set_initial_guess(&mut self, vars: &[usize], values: &DVector<Float>) {
        assert_eq!(vars.len(), values.len());
        for (i, &v) in vars.iter().enumerate() {
            self.initial_guess[v] = values[i];
        }
    }

    pub fn set_option(&mut self, key: &str, value: Float) {
        self.options.insert(key.to_string(), value);
    }

    pub fn option_or(&self, key: &str, default: Float) -> Float {
        *self.options.get(key).unwrap_or(&default)
    }

    pub fn variable_lower_bounds(&self) -> &[Float] {
        &self.lb
    }

    pub fn variable_upper_bounds(&self) -> &[Float] {
        &self.ub
    }

    pub fn initial_guess(&self) -> DVector<Float> {
        DVector::from_column_slice(&self.initial_guess)
    }

    pub fn constraints(&self) -> &[Box<dyn Constraint + 'a>] {
        &self.constraints
    }

    pub fn costs(&self) -> &[Box<dyn Cost + 'a>] {
        &self.costs
    }

    /// Gather a constraint or cost block's subvector out of the full
    /// decision vector.
    pub fn gather(x: &DVector<Float>, vars: &[usize]) -> DVector<Float> {
        DVector::from_fn(vars.len(), |i, _| x[vars[i]])
    }

    /// Total cost at x.
    pub fn eval_cost(&self, x: &DVector<Float>) -> Float {
        self.costs
            .iter()
            .map(|c| c.eval(&Self::gather(x, c.vars())))
            .sum()
    }

    /// Sum of constraint-bound and box-bound violations at x (l1 norm).
    pub fn eval_violation(&self, x: &DVector<Float>) -> Float {
        let mut viol = 0.0;
        for c in self.constraints.iter() {
            let g = c.eval(&Self::gather(x, c.vars()));
            for i in 0..g.len() {
                viol += (c.lower_bound()[i] - g[i]).max(0.0);
                viol += (g[i] - c.upper_bound()[i]).max(0.0);
            }
        }
        for i in 0..self.num_vars() {
            viol += (self.lb[i] - x[i]).max(0.0);
            viol += (x[i] - self.ub[i]).max(0.0);
        }
        viol
    }
}

impl<'a> Default for NonlinearProgram<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod program_tests {
    use na::{dmatrix, dvector};

    use super::*;

    #[test]
    fn bounding_boxes_intersect() {
        // Arrange
        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 2);

        // Act
        prog.add_bounding_box_constraint(-1.0, 1.0, &x);
        prog.add_bounding_box_constraint(0.0, 2.0, &[x[0]]);

        // Assert
        assert_eq!(prog.variable_lower_bounds(), &[0.0, -1.0]);
        assert_eq!(prog.variable_upper_bounds(), &[1.0, 1.0]);
    }

    #[test]
    fn linear_constraint_jacobian_is_exact() {
        let A = dmatrix![1.0, 2.0; 3.0, 4.0];
        let c = LinearConstraint::equality("eq", A.clone(), dvector![0.0, 0.0], vec![0, 1]);
        let z = dvector![0.7, -0.3];
        assert_eq!(c.jacobian(&z), A);
    }

    #[test]
    fn finite_difference_jacobian_matches_linear() {
        struct Affine;
        impl Constraint for Affine {
            fn name(&self) -> &str {
                "affine"
            }
            fn num_constraints(&self) -> usize {
                1
            }
            fn lower_bound(&self) -> &DVector<Float> {
                static ZERO: std::sync::OnceLock<DVector<Float>> = std::sync::OnceLock::new();
                ZERO.get_or_init(|| dvector![0.0])
            }
            fn upper_bound(&self) -> &DVector<Float> {
                self.lower_bound()
            }
            fn vars(&self) -> &[usize] {
                &[0, 1]
            }
            fn eval(&self, z: &DVector<Float>) -> DVector<Float> {
                dvector![2.0 * z[0] - 3.0 * z[1] + 1.0]
            }
        }

        let c = Affine;
        let J = c.jacobian(&dvector![0.4, 0.6]).row(0).transpose();
        crate::assert_vec_close!(J, dvector![2.0, -3.0], 1e-6);
    }

    #[test]
    fn violation_accounts_for_both_sides() {
        let mut prog = NonlinearProgram::new();
        let x = prog.add_decision_variables("x", 1);
        prog.add_bounding_box_constraint(0.0, 1.0, &x);
        prog.add_linear_constraint(
            dmatrix![1.0],
            dvector![0.5],
            dvector![0.5],
            &x,
        );

        let viol = prog.eval_violation(&dvector![2.0]);
        // box: 1.0 over, equality: 1.5 off
        crate::assert_close!(viol, 2.5, 1e-12);
    }
}
