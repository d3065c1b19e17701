use na::{DMatrix, DVector, Matrix3xX, Vector3};

use crate::plant::{BodyPoint, DiffScalar, MultibodyPlant};
use crate::types::Float;
use crate::GRAVITY;

/// A single planar point mass moving in the x-z plane. Configuration
/// q = [x, z], velocity v = [xdot, zdot], no actuators. The mass itself is
/// body 0.
pub struct PointMassPlant {
    pub mass: Float,
}

pub fn build_point_mass(mass: Float) -> PointMassPlant {
    assert!(mass > 0.0, "mass must be positive");
    PointMassPlant { mass }
}

impl<T: DiffScalar> MultibodyPlant<T> for PointMassPlant {
    fn num_positions(&self) -> usize {
        2
    }

    fn num_velocities(&self) -> usize {
        2
    }

    fn num_actuators(&self) -> usize {
        0
    }

    fn mass_matrix(&self, _q: &DVector<T>) -> DMatrix<T> {
        DMatrix::from_diagonal_element(2, 2, T::from(self.mass))
    }

    fn dynamics_bias(&self, _q: &DVector<T>, _v: &DVector<T>) -> DVector<T> {
        let mut c = DVector::zeros(2);
        c[1] = T::from(self.mass * GRAVITY);
        c
    }

    fn actuation_matrix(&self) -> DMatrix<T> {
        DMatrix::zeros(2, 0)
    }

    fn map_velocity_to_qdot(&self, _q: &DVector<T>, v: &DVector<T>) -> DVector<T> {
        v.clone()
    }

    fn point_position(&self, q: &DVector<T>, point: &BodyPoint) -> Vector3<T> {
        assert_eq!(point.body, 0, "point mass has a single body");
        Vector3::new(
            q[0] + T::from(point.point.x),
            T::from(point.point.y),
            q[1] + T::from(point.point.z),
        )
    }

    fn point_jacobian(&self, _q: &DVector<T>, point: &BodyPoint) -> Matrix3xX<T> {
        assert_eq!(point.body, 0, "point mass has a single body");
        let mut J = Matrix3xX::zeros(2);
        J[(0, 0)] = T::one();
        J[(2, 1)] = T::one();
        J
    }

    fn point_jacobian_dot_times_v(
        &self,
        _q: &DVector<T>,
        _v: &DVector<T>,
        point: &BodyPoint,
    ) -> Vector3<T> {
        assert_eq!(point.body, 0, "point mass has a single body");
        Vector3::zeros()
    }

    fn com_position(&self, q: &DVector<T>) -> Vector3<T> {
        Vector3::new(q[0], T::zero(), q[1])
    }

    fn com_jacobian(&self, _q: &DVector<T>) -> Matrix3xX<T> {
        let mut J = Matrix3xX::zeros(2);
        J[(0, 0)] = T::one();
        J[(2, 1)] = T::one();
        J
    }

    fn com_jacobian_dot_times_v(&self, _q: &DVector<T>, _v: &DVector<T>) -> Vector3<T> {
        Vector3::zeros()
    }
}

/// A planar monoped reduced to two point masses: a body (body 0) and a
/// point foot (body 1), coupled by a two-axis leg force actuator. The leg
/// force acts on the foot with its reaction on the body.
/// Configuration q = [x_b, z_b, x_f, z_f], velocity likewise.
pub struct PlanarPointFootPlant {
    pub body_mass: Float,
    pub foot_mass: Float,
}

pub fn build_planar_point_foot(body_mass: Float, foot_mass: Float) -> PlanarPointFootPlant {
    assert!(body_mass > 0.0 && foot_mass > 0.0, "masses must be positive");
    PlanarPointFootPlant {
        body_mass,
        foot_mass,
    }
}

impl PlanarPointFootPlant {
    pub fn total_mass(&self) -> Float {
        self.body_mass + self.foot_mass
    }
}

impl<T: DiffScalar> MultibodyPlant<T> for PlanarPointFootPlant {
    fn num_positions(&self) -> usize {
        4
    }

    fn num_velocities(&self) -> usize {
        4
    }

    fn num_actuators(&self) -> usize {
        2
    }

    fn mass_matrix(&self, _q: &DVector<T>) -> DMatrix<T> {
        let mb = T::from(self.body_mass);
        let mf = T::from(self.foot_mass);
        DMatrix::from_diagonal(&DVector::from_vec(vec![mb, mb, mf, mf]))
    }

    fn dynamics_bias(&self, _q: &DVector<T>, _v: &DVector<T>) -> DVector<T> {
        let g = T::from(GRAVITY);
        let mut c = DVector::zeros(4);
        c[1] = T::from(self.body_mass) * g;
        c[3] = T::from(self.foot_mass) * g;
        c
    }

    #[rustfmt::skip]
    fn actuation_matrix(&self) -> DMatrix<T> {
        let one = T::one();
        DMatrix::from_row_slice(4, 2, &[
            -one,       T::zero(),
            T::zero(), -one,
            one,        T::zero(),
            T::zero(),  one,
        ])
    }

    fn map_velocity_to_qdot(&self, _q: &DVector<T>, v: &DVector<T>) -> DVector<T> {
        v.clone()
    }

    fn point_position(&self, q: &DVector<T>, point: &BodyPoint) -> Vector3<T> {
        let base = match point.body {
            0 => (q[0], q[1]),
            1 => (q[2], q[3]),
            _ => panic!("planar point-foot plant has bodies 0 and 1"),
        };
        Vector3::new(
            base.0 + T::from(point.point.x),
            T::from(point.point.y),
            base.1 + T::from(point.point.z),
        )
    }

    fn point_jacobian(&self, _q: &DVector<T>, point: &BodyPoint) -> Matrix3xX<T> {
        let mut J = Matrix3xX::zeros(4);
        match point.body {
            0 => {
                J[(0, 0)] = T::one();
                J[(2, 1)] = T::one();
            }
            1 => {
                J[(0, 2)] = T::one();
                J[(2, 3)] = T::one();
            }
            _ => panic!("planar point-foot plant has bodies 0 and 1"),
        }
        J
    }

    fn point_jacobian_dot_times_v(
        &self,
        _q: &DVector<T>,
        _v: &DVector<T>,
        point: &BodyPoint,
    ) -> Vector3<T> {
        assert!(point.body < 2, "planar point-foot plant has bodies 0 and 1");
        Vector3::zeros()
    }

    fn com_position(&self, q: &DVector<T>) -> Vector3<T> {
        let mb = T::from(self.body_mass / self.total_mass());
        let mf = T::from(self.foot_mass / self.total_mass());
        Vector3::new(q[0] * mb + q[2] * mf, T::zero(), q[1] * mb + q[3] * mf)
    }

    fn com_jacobian(&self, _q: &DVector<T>) -> Matrix3xX<T> {
        let mb = T::from(self.body_mass / self.total_mass());
        let mf = T::from(self.foot_mass / self.total_mass());
        let mut J = Matrix3xX::zeros(4);
        J[(0, 0)] = mb;
        J[(0, 2)] = mf;
        J[(2, 1)] = mb;
        J[(2, 3)] = mf;
        J
    }

    fn com_jacobian_dot_times_v(&self, _q: &DVector<T>, _v: &DVector<T>) -> Vector3<T> {
        Vector3::zeros()
    }
}

#[cfg(test)]
mod helpers_tests {
    use na::dvector;

    use super::*;

    #[test]
    fn point_foot_com_is_mass_weighted_average() {
        // Arrange
        let plant = build_planar_point_foot(3.0, 1.0);
        let q = dvector![0.0, 1.0, 0.4, 0.0];

        // Act
        let com: Vector3<Float> = plant.com_position(&q);

        // Assert
        crate::assert_close!(com.x, 0.1, 1e-12);
        crate::assert_close!(com.z, 0.75, 1e-12);
    }
}
