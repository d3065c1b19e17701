use na::{DMatrix, DVector, Matrix3, Vector3};

use crate::kinematic::{KinematicEvaluator, KinematicEvaluatorSet};
use crate::plant::{BodyPoint, DiffScalar, MultibodyPlant};
use crate::solver::program::Constraint;
use crate::trajopt::mode::ContactMode;
use crate::types::Float;

/// Solve the constrained equations of motion for vdot:
///     M(q) vdot = B u - c(q, v) + Jᵀ λ
pub fn constrained_dynamics<T: DiffScalar>(
    plant: &dyn MultibodyPlant<T>,
    evaluators: &KinematicEvaluatorSet<T>,
    q: &DVector<T>,
    v: &DVector<T>,
    u: &DVector<T>,
    lambda: &DVector<T>,
) -> DVector<T> {
    let M = plant.mass_matrix(q);
    let c = plant.dynamics_bias(q, v);
    let mut rhs = -c;
    if u.len() > 0 {
        rhs += plant.actuation_matrix() * u;
    }
    if lambda.len() > 0 {
        let J = evaluators.eval_active_jacobian(plant, q);
        rhs += J.transpose() * lambda;
    }
    match M.clone().lu().solve(&rhs) {
        Some(vdot) => vdot,
        None => panic!("Failed to solve M(q) vdot = rhs: singular mass matrix"),
    }
}

/// State derivative under the constrained dynamics, with the velocity slack
/// gamma entering the position rows:
///     qdot = N(q) v + Jᵀ gamma
///     vdot = M⁻¹ (B u - c + Jᵀ λ)
fn state_derivative<T: DiffScalar>(
    plant: &dyn MultibodyPlant<T>,
    evaluators: &KinematicEvaluatorSet<T>,
    q: &DVector<T>,
    v: &DVector<T>,
    u: &DVector<T>,
    lambda: &DVector<T>,
    gamma: Option<&DVector<T>>,
) -> DVector<T> {
    let n_q = plant.num_positions();
    let n_v = plant.num_velocities();
    let mut qdot = plant.map_velocity_to_qdot(q, v);
    if let Some(gamma) = gamma {
        if gamma.len() > 0 {
            let J = evaluators.eval_active_jacobian(plant, q);
            qdot += plant.map_velocity_to_qdot(q, &(J.transpose() * gamma));
        }
    }
    let vdot = constrained_dynamics(plant, evaluators, q, v, u, lambda);
    let mut xdot = DVector::zeros(n_q + n_v);
    xdot.rows_mut(0, n_q).copy_from(&qdot);
    xdot.rows_mut(n_q, n_v).copy_from(&vdot);
    xdot
}

/// Cubic collocation defect for one knot interval.
///
/// The state derivatives at the two knots come from the constrained
/// dynamics with the knot forces; the unique cubic through both endpoint
/// states and derivatives is then required to satisfy the dynamics at its
/// midpoint with averaged inputs, the collocation force lambda_c and the
/// velocity slack gamma_c:
///     x_c    = (x0 + x1)/2 + h (xdot0 - xdot1)/8
///     xdot_c = -3 (x0 - x1)/(2h) - (xdot0 + xdot1)/4
///     0      = xdot_c - f(x_c, (u0+u1)/2, lambda_c, gamma_c)
/// Third-order accurate (local truncation error O(h^4)).
#[allow(clippy::too_many_arguments)]
pub fn collocation_defect<T: DiffScalar>(
    plant: &dyn MultibodyPlant<T>,
    evaluators: &KinematicEvaluatorSet<T>,
    h: T,
    x0: &DVector<T>,
    x1: &DVector<T>,
    u0: &DVector<T>,
    u1: &DVector<T>,
    l0: &DVector<T>,
    l1: &DVector<T>,
    lc: &DVector<T>,
    gc: &DVector<T>,
) -> DVector<T> {
    let n_q = plant.num_positions();
    let n_v = plant.num_velocities();

    let split = |x: &DVector<T>| (x.rows(0, n_q).into_owned(), x.rows(n_q, n_v).into_owned());
    let (q0, v0) = split(x0);
    let (q1, v1) = split(x1);

    let xdot0 = state_derivative(plant, evaluators, &q0, &v0, u0, l0, None);
    let xdot1 = state_derivative(plant, evaluators, &q1, &v1, u1, l1, None);

    let half = T::from(0.5);
    let eighth = T::from(0.125);
    let quarter = T::from(0.25);
    let three_half = T::from(1.5);

    let xc = (x0 + x1) * half + (&xdot0 - &xdot1) * (h * eighth);
    let xdotc = (x0 - x1) * (-three_half / h) - (&xdot0 + &xdot1) * quarter;

    let (qc, vc) = split(&xc);
    let uc = if u0.len() > 0 {
        (u0 + u1) * half
    } else {
        DVector::zeros(0)
    };

    let fc = state_derivative(plant, evaluators, &qc, &vc, &uc, lc, Some(gc));
    xdotc - fc
}

/// Residual of the rigid, inelastic impact at a mode transition:
///     M(q) (v⁺ - v⁻) = Jᵀ Λ
///     J v⁺ = 0
pub fn impact_residual<T: DiffScalar>(
    plant: &dyn MultibodyPlant<T>,
    evaluators: &KinematicEvaluatorSet<T>,
    q: &DVector<T>,
    v_pre: &DVector<T>,
    v_post: &DVector<T>,
    impulse: &DVector<T>,
) -> DVector<T> {
    let n_v = plant.num_velocities();
    let n_c = evaluators.count_active();
    let M = plant.mass_matrix(q);
    let J = evaluators.eval_active_jacobian(plant, q);

    let momentum = M * (v_post - v_pre) - J.transpose() * impulse;
    let post_vel = &J * v_post;

    let mut out = DVector::zeros(n_v + n_c);
    out.rows_mut(0, n_v).copy_from(&momentum);
    out.rows_mut(n_v, n_c).copy_from(&post_vel);
    out
}

fn zero_bounds(n: usize) -> (DVector<Float>, DVector<Float>) {
    (DVector::zeros(n), DVector::zeros(n))
}

/// NLP block enforcing the cubic collocation defect on one interval.
/// Variable layout: [h | x0 | x1 | u0 | u1 | l0 | l1 | lc | gc].
pub struct CollocationConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    mode: &'a ContactMode<'a, Float>,
    n_q: usize,
    n_v: usize,
    n_u: usize,
    n_c: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> CollocationConstraint<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        mode: &'a ContactMode<'a, Float>,
        vars: Vec<usize>,
    ) -> Self {
        let n_q = plant.num_positions();
        let n_v = plant.num_velocities();
        let n_u = plant.num_actuators();
        let n_c = mode.num_constraints();
        assert_eq!(vars.len(), 1 + 2 * (n_q + n_v) + 2 * n_u + 3 * n_c);
        let (lb, ub) = zero_bounds(n_q + n_v);
        CollocationConstraint {
            plant,
            mode,
            n_q,
            n_v,
            n_u,
            n_c,
            lb,
            ub,
            vars,
        }
    }
}

impl<'a> Constraint for CollocationConstraint<'a> {
    fn name(&self) -> &str {
        "collocation"
    }

    fn num_constraints(&self) -> usize {
        self.n_q + self.n_v
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
        let (n_q, n_v, n_u, n_c) = (self.n_q, self.n_v, self.n_u, self.n_c);
        let n_x = n_q + n_v;
        let mut at = 0;
        let mut take = |len: usize| {
            let v = z.rows(at, len).into_owned();
            at += len;
            v
        };
        let h = take(1)[0];
        let x0 = take(n_x);
        let x1 = take(n_x);
        let u0 = take(n_u);
        let u1 = take(n_u);
        let l0 = take(n_c);
        let l1 = take(n_c);
        let lc = take(n_c);
        let gc = take(n_c);

        let mut defect = collocation_defect(
            self.plant,
            self.mode.evaluators(),
            h,
            &x0,
            &x1,
            &u0,
            &u1,
            &l0,
            &l1,
            &lc,
            &gc,
        );
        for (&row, &s) in self.mode.dynamics_scale() {
            defect[row] *= s;
        }
        defect
    }
}

/// Position-level kinematic constraint at a knot: phi(q) = offset, where
/// offset is zero for non-relative rows and a per-mode decision variable
/// for relative rows. Variable layout: [q | offsets].
pub struct KinematicPositionConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    mode: &'a ContactMode<'a, Float>,
    relative_rows: Vec<usize>,
    n_q: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> KinematicPositionConstraint<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        mode: &'a ContactMode<'a, Float>,
        vars: Vec<usize>,
    ) -> Self {
        let n_q = plant.num_positions();
        let relative_rows = mode.relative_rows();
        assert_eq!(vars.len(), n_q + relative_rows.len());
        let (lb, ub) = zero_bounds(mode.num_constraints());
        KinematicPositionConstraint {
            plant,
            mode,
            relative_rows,
            n_q,
            lb,
            ub,
            vars,
        }
    }
}

impl<'a> Constraint for KinematicPositionConstraint<'a> {
    fn name(&self) -> &str {
        "kinematic_position"
    }

    fn num_constraints(&self) -> usize {
        self.mode.num_constraints()
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
        let q = z.rows(0, self.n_q).into_owned();
        let mut phi = self.mode.evaluators().eval_active(self.plant, &q);
        for (i, &row) in self.relative_rows.iter().enumerate() {
            phi[row] -= z[self.n_q + i];
        }
        for (&row, &s) in self.mode.kin_position_scale() {
            phi[row] *= s;
        }
        phi
    }
}

/// Velocity-level kinematic constraint at a knot: J(q) v = 0.
/// Variable layout: [x] = [q | v].
pub struct KinematicVelocityConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    mode: &'a ContactMode<'a, Float>,
    n_q: usize,
    n_v: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> KinematicVelocityConstraint<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        mode: &'a ContactMode<'a, Float>,
        vars: Vec<usize>,
    ) -> Self {
        let n_q = plant.num_positions();
        let n_v = plant.num_velocities();
        assert_eq!(vars.len(), n_q + n_v);
        let (lb, ub) = zero_bounds(mode.num_constraints());
        KinematicVelocityConstraint {
            plant,
            mode,
            n_q,
            n_v,
            lb,
            ub,
            vars,
        }
    }
}

impl<'a> Constraint for KinematicVelocityConstraint<'a> {
    fn name(&self) -> &str {
        "kinematic_velocity"
    }

    fn num_constraints(&self) -> usize {
        self.mode.num_constraints()
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
        let q = z.rows(0, self.n_q).into_owned();
        let v = z.rows(self.n_q, self.n_v).into_owned();
        let J = self.mode.evaluators().eval_active_jacobian(self.plant, &q);
        let mut phidot = J * v;
        for (&row, &s) in self.mode.kin_velocity_scale() {
            phidot[row] *= s;
        }
        phidot
    }
}

/// Rigid impact block at a mode transition.
/// Variable layout: [x_pre | v_post | impulse].
pub struct ImpactConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    evaluators: &'a KinematicEvaluatorSet<'a, Float>,
    n_q: usize,
    n_v: usize,
    n_c: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> ImpactConstraint<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        evaluators: &'a KinematicEvaluatorSet<'a, Float>,
        vars: Vec<usize>,
    ) -> Self {
        let n_q = plant.num_positions();
        let n_v = plant.num_velocities();
        let n_c = evaluators.count_active();
        assert!(n_c > 0, "impact requires an incoming constraint set");
        assert_eq!(vars.len(), n_q + n_v + n_v + n_c);
        let (lb, ub) = zero_bounds(n_v + n_c);
        ImpactConstraint {
            plant,
            evaluators,
            n_q,
            n_v,
            n_c,
            lb,
            ub,
            vars,
        }
    }
}

impl<'a> Constraint for ImpactConstraint<'a> {
    fn name(&self) -> &str {
        "impact"
    }

    fn num_constraints(&self) -> usize {
        self.n_v + self.n_c
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
        let q = z.rows(0, self.n_q).into_owned();
        let v_pre = z.rows(self.n_q, self.n_v).into_owned();
        let v_post = z.rows(self.n_q + self.n_v, self.n_v).into_owned();
        let impulse = z.rows(self.n_q + 2 * self.n_v, self.n_c).into_owned();
        impact_residual(self.plant, self.evaluators, &q, &v_pre, &v_post, &impulse)
    }
}

/// Linearized friction-pyramid rows for one frictional evaluator's force
/// segment (its active rows, in order): the normal force is non-negative
/// and each tangential component bounded by mu times the normal.
/// Returns the inequality matrix A with A λ >= 0.
pub fn friction_cone_rows(evaluator: &dyn KinematicEvaluator<Float>) -> DMatrix<Float> {
    assert!(evaluator.is_frictional(), "evaluator is not frictional");
    let active = evaluator.active_inds();
    let mu = evaluator.mu();
    let normal_col = active
        .iter()
        .position(|&r| r == 2)
        .expect("frictional evaluator must enforce the normal row");

    let mut rows: Vec<Vec<Float>> = vec![];
    // λ_n >= 0
    let mut normal_row = vec![0.0; active.len()];
    normal_row[normal_col] = 1.0;
    rows.push(normal_row);
    // ±λ_t <= mu λ_n for each enforced tangent
    for (col, &r) in active.iter().enumerate() {
        if r == 2 {
            continue;
        }
        let mut upper = vec![0.0; active.len()];
        upper[normal_col] = mu;
        upper[col] = -1.0;
        rows.push(upper);
        let mut lower = vec![0.0; active.len()];
        lower[normal_col] = mu;
        lower[col] = 1.0;
        rows.push(lower);
    }

    let num_rows = rows.len();
    DMatrix::from_fn(num_rows, active.len(), |i, j| rows[i][j])
}

/// The vertical center-of-mass velocity must be equal at two states.
/// Variable layout: [x_a | x_b].
pub struct ComHeightVelConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    n_q: usize,
    n_v: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> ComHeightVelConstraint<'a> {
    pub fn new(plant: &'a dyn MultibodyPlant<Float>, vars: Vec<usize>) -> Self {
        let n_q = plant.num_positions();
        let n_v = plant.num_velocities();
        assert_eq!(vars.len(), 2 * (n_q + n_v));
        let (lb, ub) = zero_bounds(1);
        ComHeightVelConstraint {
            plant,
            n_q,
            n_v,
            lb,
            ub,
            vars,
        }
    }
}

impl<'a> Constraint for ComHeightVelConstraint<'a> {
    fn name(&self) -> &str {
        "com_height_vel"
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
        let n_x = self.n_q + self.n_v;
        let com_zdot = |x: DVector<Float>| {
            let q = x.rows(0, self.n_q).into_owned();
            let v = x.rows(self.n_q, self.n_v).into_owned();
            let J = self.plant.com_jacobian(&q);
            let mut zdot = 0.0;
            for j in 0..self.n_v {
                zdot += J[(2, j)] * v[j];
            }
            zdot
        };
        let a = com_zdot(z.rows(0, n_x).into_owned());
        let b = com_zdot(z.rows(n_x, n_x).into_owned());
        DVector::from_element(1, a - b)
    }
}

/// One rotated coordinate of a body point, bounded in [lb, ub].
/// Variable layout: [q].
pub struct OneDimBodyPosConstraint<'a> {
    plant: &'a dyn MultibodyPlant<Float>,
    point: BodyPoint,
    rotation: Matrix3<Float>,
    axis: usize,
    lb: DVector<Float>,
    ub: DVector<Float>,
    vars: Vec<usize>,
}

impl<'a> OneDimBodyPosConstraint<'a> {
    pub fn new(
        plant: &'a dyn MultibodyPlant<Float>,
        point: BodyPoint,
        rotation: Matrix3<Float>,
        axis: usize,
        lb: Float,
        ub: Float,
        vars: Vec<usize>,
    ) -> Self {
        assert!(axis < 3, "axis must be 0 (x), 1 (y) or 2 (z)");
        assert_eq!(vars.len(), plant.num_positions());
        OneDimBodyPosConstraint {
            plant,
            point,
            rotation,
            axis,
            lb: DVector::from_element(1, lb),
            ub: DVector::from_element(1, ub),
            vars,
        }
    }
}

impl<'a> Constraint for OneDimBodyPosConstraint<'a> {
    fn name(&self) -> &str {
        "one_dim_body_pos"
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
        let p: Vector3<Float> = self.plant.point_position(z, &self.point);
        let rotated = self.rotation * p;
        DVector::from_element(1, rotated[self.axis])
    }
}

#[cfg(test)]
mod constraints_tests {
    use na::{dvector, vector};

    use crate::helpers::{build_planar_point_foot, build_point_mass};
    use crate::kinematic::WorldPointEvaluator;
    use crate::GRAVITY;

    use super::*;

    #[test]
    fn ballistic_arc_satisfies_collocation_exactly() {
        // Arrange: a point mass on the analytic parabola. The cubic scheme
        // reproduces constant-acceleration flight exactly.
        let plant = build_point_mass(2.0);
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let h = 0.2;
        let (x0v, z0, vx, vz) = (0.0, 1.0, 0.5, 2.0);
        let at = |t: Float| {
            dvector![
                x0v + vx * t,
                z0 + vz * t - 0.5 * GRAVITY * t * t,
                vx,
                vz - GRAVITY * t
            ]
        };
        let none = dvector![];

        // Act
        let defect = collocation_defect(
            &plant,
            &empty,
            h,
            &at(0.0),
            &at(h),
            &none,
            &none,
            &none,
            &none,
            &none,
            &none,
        );

        // Assert
        crate::assert_vec_close!(defect, DVector::<Float>::zeros(4), 1e-10);
    }

    #[test]
    fn impact_of_falling_foot_zeroes_contact_velocity() {
        // Arrange: point-foot plant falling straight down, foot touches down
        let plant = build_planar_point_foot(9.0, 1.0);
        let foot = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        let mut set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        set.add_evaluator(&foot);

        let q = dvector![0.0, 1.0, 0.0, 0.0];
        let v_pre = dvector![0.0, -3.0, 0.0, -3.0];
        // Rigid impact arrests the foot; the body keeps its velocity
        let v_post = dvector![0.0, -3.0, 0.0, 0.0];
        // Impulse = m_foot * dv on the foot rows (x, y, z of the contact)
        let impulse = dvector![0.0, 0.0, 3.0];

        // Act
        let residual = impact_residual(&plant, &set, &q, &v_pre, &v_post, &impulse);

        // Assert
        crate::assert_vec_close!(residual, DVector::<Float>::zeros(7), 1e-10);
    }

    #[test]
    fn com_height_vel_zero_for_matching_states() {
        let plant = build_planar_point_foot(3.0, 1.0);
        let c = ComHeightVelConstraint::new(&plant, (0..16).collect());

        // Same vertical CoM rate in both states
        let x_a = dvector![0., 1., 0., 0., 0.5, 2.0, 0.5, 2.0];
        let x_b = dvector![1., 2., 1., 1., -0.3, 2.0, 0.1, 2.0];
        let mut z = DVector::zeros(16);
        z.rows_mut(0, 8).copy_from(&x_a);
        z.rows_mut(8, 8).copy_from(&x_b);
        crate::assert_vec_close!(c.eval(&z), dvector![0.0], 1e-12);

        // Different rates produce a residual
        let mut z2 = z.clone();
        z2[13] = 0.0;
        assert!(c.eval(&z2)[0].abs() > 0.1);
    }

    #[test]
    fn one_dim_body_pos_reads_the_rotated_axis() {
        use na::Matrix3;

        let plant = build_planar_point_foot(3.0, 1.0);
        let c = OneDimBodyPosConstraint::new(
            &plant,
            BodyPoint::new(0, vector![0., 0., 0.]),
            Matrix3::identity(),
            2,
            0.5,
            2.0,
            (0..4).collect(),
        );

        let q = dvector![0.3, 1.2, 0.0, 0.0];
        crate::assert_vec_close!(c.eval(&q), dvector![1.2], 1e-12);
        assert_eq!(c.lower_bound()[0], 0.5);
        assert_eq!(c.upper_bound()[0], 2.0);
    }

    #[test]
    fn friction_rows_bound_tangentials() {
        let mut eval = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        eval.set_frictional();
        eval.set_mu(0.5);

        let A = friction_cone_rows(&eval);
        assert_eq!((A.nrows(), A.ncols()), (5, 3));

        // Inside the cone: all rows non-negative
        let inside = &A * dvector![0.2, -0.2, 1.0];
        assert!(inside.iter().all(|&r| r >= 0.0));
        // Outside: some row negative
        let outside = &A * dvector![0.9, 0.0, 1.0];
        assert!(outside.iter().any(|&r| r < 0.0));
    }
}
