use na::{DMatrix, DVector, Matrix3, Vector3};

use crate::plant::{BodyPoint, DiffScalar, MultibodyPlant};
use crate::types::Float;

/// A single algebraic constraint phi(q) on configuration, together with its
/// velocity-level Jacobian J = d(phi)/dv and the bias term J̇v needed for
/// acceleration-level constraints:
///     phidot  = J v
///     phiddot = J vdot + J̇v
///
/// An evaluator distinguishes its "full" output from the "active" rows that
/// are actually enforced; inactive rows are still available to callers (e.g.
/// for post-processing foot heights) but produce no constraint force.
pub trait KinematicEvaluator<T: DiffScalar> {
    /// Full constraint value, before active-row selection.
    fn eval_full(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DVector<T>;

    /// Full velocity-level Jacobian, num_full x n_v.
    fn eval_full_jacobian(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DMatrix<T>;

    /// Full bias term J̇v.
    fn eval_full_jacobian_dot_times_v(
        &self,
        plant: &dyn MultibodyPlant<T>,
        q: &DVector<T>,
        v: &DVector<T>,
    ) -> DVector<T>;

    fn num_full(&self) -> usize;

    /// Indices of the enforced rows, strictly increasing, each < num_full().
    fn active_inds(&self) -> &[usize];

    fn num_active(&self) -> usize {
        self.active_inds().len()
    }

    fn eval_active(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DVector<T> {
        let full = self.eval_full(plant, q);
        DVector::from_fn(self.num_active(), |i, _| full[self.active_inds()[i]])
    }

    fn eval_active_jacobian(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DMatrix<T> {
        let full = self.eval_full_jacobian(plant, q);
        let mut active = DMatrix::zeros(self.num_active(), full.ncols());
        for (i, &row) in self.active_inds().iter().enumerate() {
            active.set_row(i, &full.row(row));
        }
        active
    }

    fn eval_active_jacobian_dot_times_v(
        &self,
        plant: &dyn MultibodyPlant<T>,
        q: &DVector<T>,
        v: &DVector<T>,
    ) -> DVector<T> {
        let full = self.eval_full_jacobian_dot_times_v(plant, q, v);
        DVector::from_fn(self.num_active(), |i, _| full[self.active_inds()[i]])
    }

    /// Whether the constraint force on this evaluator is limited to a
    /// friction cone. The cone's normal is full row 2 by convention.
    fn is_frictional(&self) -> bool {
        false
    }

    /// Coefficient of friction. Only meaningful when is_frictional().
    fn mu(&self) -> Float {
        0.0
    }
}

/// A point fixed in a body, constrained to a fixed location in the world:
///     phi(q) = R (p_W(q) - offset)
/// where p_W is the point's world position, offset a world-frame anchor and
/// R a rotation into a constraint-local frame. Local row 2 is the contact
/// normal, rows 0 and 1 the tangents.
pub struct WorldPointEvaluator {
    point: BodyPoint,
    rotation: Matrix3<Float>,
    offset: Vector3<Float>,
    active_inds: Vec<usize>,
    frictional: bool,
    mu: Float,
}

impl WorldPointEvaluator {
    pub fn new(
        point: BodyPoint,
        rotation: Matrix3<Float>,
        offset: Vector3<Float>,
        active_inds: Vec<usize>,
    ) -> Self {
        assert!(active_inds.len() <= 3, "at most 3 active rows per point");
        assert!(
            active_inds.windows(2).all(|w| w[0] < w[1]),
            "active rows must be strictly increasing"
        );
        assert!(
            active_inds.iter().all(|&i| i < 3),
            "active rows must be in 0..3"
        );
        WorldPointEvaluator {
            point,
            rotation,
            offset,
            active_inds,
            frictional: false,
            mu: 0.0,
        }
    }

    /// A ground contact: identity local frame, all three rows active.
    pub fn ground_contact(point: BodyPoint, offset: Vector3<Float>) -> Self {
        Self::new(point, Matrix3::identity(), offset, vec![0, 1, 2])
    }

    pub fn set_frictional(&mut self) {
        assert!(
            self.active_inds.contains(&2),
            "frictional evaluator must enforce the normal row"
        );
        self.frictional = true;
    }

    pub fn set_mu(&mut self, mu: Float) {
        assert!(mu >= 0.0, "friction coefficient must be non-negative");
        self.mu = mu;
    }

    pub fn point(&self) -> &BodyPoint {
        &self.point
    }
}

impl<T: DiffScalar> KinematicEvaluator<T> for WorldPointEvaluator {
    fn eval_full(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DVector<T> {
        let p = plant.point_position(q, &self.point);
        let rot = self.rotation.map(|e| T::from(e));
        let offset = self.offset.map(|e| T::from(e));
        let local = rot * (p - offset);
        DVector::from_column_slice(local.as_slice())
    }

    fn eval_full_jacobian(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DMatrix<T> {
        let J = plant.point_jacobian(q, &self.point);
        let rot = self.rotation.map(|e| T::from(e));
        let rotated = rot * J;
        DMatrix::from_fn(3, rotated.ncols(), |i, j| rotated[(i, j)])
    }

    fn eval_full_jacobian_dot_times_v(
        &self,
        plant: &dyn MultibodyPlant<T>,
        q: &DVector<T>,
        v: &DVector<T>,
    ) -> DVector<T> {
        let jdotv = plant.point_jacobian_dot_times_v(q, v, &self.point);
        let rot = self.rotation.map(|e| T::from(e));
        let local = rot * jdotv;
        DVector::from_column_slice(local.as_slice())
    }

    fn num_full(&self) -> usize {
        3
    }

    fn active_inds(&self) -> &[usize] {
        &self.active_inds
    }

    fn is_frictional(&self) -> bool {
        self.frictional
    }

    fn mu(&self) -> Float {
        self.mu
    }
}

/// The distance between two body points, held at a fixed value:
///     phi(q) = |p_A(q) - p_B(q)| - distance
/// Scalar-valued; used for closed kinematic loops such as rod linkages.
pub struct DistanceEvaluator {
    point_a: BodyPoint,
    point_b: BodyPoint,
    distance: Float,
    active_inds: Vec<usize>,
}

impl DistanceEvaluator {
    pub fn new(point_a: BodyPoint, point_b: BodyPoint, distance: Float) -> Self {
        assert!(distance > 0.0, "distance must be positive");
        DistanceEvaluator {
            point_a,
            point_b,
            distance,
            active_inds: vec![0],
        }
    }
}

impl<T: DiffScalar> KinematicEvaluator<T> for DistanceEvaluator {
    fn eval_full(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DVector<T> {
        let r = plant.point_position(q, &self.point_a) - plant.point_position(q, &self.point_b);
        DVector::from_element(1, r.norm() - T::from(self.distance))
    }

    fn eval_full_jacobian(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DMatrix<T> {
        let r = plant.point_position(q, &self.point_a) - plant.point_position(q, &self.point_b);
        let J_rel = plant.point_jacobian(q, &self.point_a) - plant.point_jacobian(q, &self.point_b);
        // d|r|/dv = r^T J_rel / |r|
        let unit = r / r.norm();
        let mut J = DMatrix::zeros(1, J_rel.ncols());
        for j in 0..J_rel.ncols() {
            J[(0, j)] = unit.dot(&Vector3::new(J_rel[(0, j)], J_rel[(1, j)], J_rel[(2, j)]));
        }
        J
    }

    fn eval_full_jacobian_dot_times_v(
        &self,
        plant: &dyn MultibodyPlant<T>,
        q: &DVector<T>,
        v: &DVector<T>,
    ) -> DVector<T> {
        let r = plant.point_position(q, &self.point_a) - plant.point_position(q, &self.point_b);
        let J_rel = plant.point_jacobian(q, &self.point_a) - plant.point_jacobian(q, &self.point_b);
        let jdotv_rel = plant.point_jacobian_dot_times_v(q, v, &self.point_a)
            - plant.point_jacobian_dot_times_v(q, v, &self.point_b);
        let l = r.norm();
        let mut rdot = Vector3::zeros();
        for j in 0..J_rel.ncols() {
            rdot += Vector3::new(J_rel[(0, j)], J_rel[(1, j)], J_rel[(2, j)]) * v[j];
        }
        // phiddot = (rdot.rdot + r.rddot)/l - (r.rdot)^2/l^3, with the
        // J vdot part of rddot excluded (that is the bias by definition)
        let bias = (rdot.dot(&rdot) + r.dot(&jdotv_rel)) / l
            - (r.dot(&rdot) * r.dot(&rdot)) / (l * l * l);
        DVector::from_element(1, bias)
    }

    fn num_full(&self) -> usize {
        1
    }

    fn active_inds(&self) -> &[usize] {
        &self.active_inds
    }
}

#[cfg(test)]
mod evaluator_tests {
    use na::{dvector, vector, DVector, Matrix3};
    use rand::rng;

    use crate::helpers::build_planar_point_foot;
    use crate::plant::{BodyPoint, MultibodyPlant};
    use crate::types::Float;
    use crate::util::test_utils::random_dvector;

    use super::*;

    /// Central finite difference of eval_active along direction v
    fn directional_fd(
        eval: &dyn KinematicEvaluator<Float>,
        plant: &dyn MultibodyPlant<Float>,
        q: &DVector<Float>,
        v: &DVector<Float>,
    ) -> DVector<Float> {
        let eps = 1e-6;
        let plus = eval.eval_active(plant, &(q + v * eps));
        let minus = eval.eval_active(plant, &(q - v * eps));
        (plus - minus) / (2.0 * eps)
    }

    #[test]
    fn world_point_value_and_jacobian() {
        // Arrange
        let plant = build_planar_point_foot(10.0, 1.0);
        let foot = BodyPoint::new(1, vector![0., 0., 0.]);
        let eval = WorldPointEvaluator::ground_contact(foot, vector![0., 0., 0.]);
        let q = dvector![0.3, 1.1, 0.5, 0.0];

        // Act
        let phi = eval.eval_active(&plant, &q);

        // Assert: foot world position is (q2, 0, q3)
        crate::assert_vec_close!(phi, dvector![0.5, 0.0, 0.0], 1e-12);

        // Jacobian times qdot matches finite difference of phi
        let mut rng = rng();
        let v = random_dvector(&mut rng, 4, 1.0);
        let J = eval.eval_active_jacobian(&plant, &q);
        let fd = directional_fd(&eval, &plant, &q, &v);
        crate::assert_vec_close!(&J * &v, fd, 1e-6);
    }

    #[test]
    fn distance_evaluator_jacobian_matches_finite_difference() {
        // Arrange
        let plant = build_planar_point_foot(10.0, 1.0);
        let body = BodyPoint::new(0, vector![0., 0., 0.]);
        let foot = BodyPoint::new(1, vector![0., 0., 0.]);
        let eval = DistanceEvaluator::new(body, foot, 0.8);
        let q = dvector![0.1, 1.0, 0.4, 0.2];

        let mut rng = rng();
        let v = random_dvector(&mut rng, 4, 1.0);

        // Act
        let J = eval.eval_active_jacobian(&plant, &q);
        let fd = directional_fd(&eval, &plant, &q, &v);

        // Assert
        crate::assert_vec_close!(&J * &v, fd, 1e-5);
    }

    #[test]
    #[should_panic]
    fn frictional_requires_normal_row() {
        let foot = BodyPoint::new(1, vector![0., 0., 0.]);
        let mut eval =
            WorldPointEvaluator::new(foot, Matrix3::identity(), vector![0., 0., 0.], vec![0, 1]);
        eval.set_frictional();
    }
}
