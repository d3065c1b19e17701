use na::{DMatrix, DVector, Matrix3xX, RealField, Vector3};

use crate::types::Float;

/// Scalar types the kinematics and dynamics queries are generic over.
///
/// `Float` itself qualifies, and so does any automatic-differentiation
/// scalar that implements nalgebra's `RealField`, so the solver can obtain
/// exact gradients by pushing an AD type through the same code paths.
pub trait DiffScalar: RealField + Copy + From<Float> {}
impl<T: RealField + Copy + From<Float>> DiffScalar for T {}

/// A point fixed in a body's frame, identified by the body's index in the
/// plant.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyPoint {
    pub body: usize,
    pub point: Vector3<Float>,
}

impl BodyPoint {
    pub fn new(body: usize, point: Vector3<Float>) -> Self {
        BodyPoint { body, point }
    }
}

/// Query interface onto an externally-owned multibody model.
///
/// The equations of motion are written in the joint-space form
///     M(q) vdot + c(q, v) = B u + Jᵀ λ
/// where M is the mass matrix, c the dynamics bias (Coriolis, centrifugal
/// and gravity terms), B the actuation matrix, and Jᵀ λ the generalized
/// constraint forces.
///
/// Implementations that keep a mutable kinematics scratch context must keep
/// it private per evaluation call; these queries may be issued repeatedly
/// while the solver evaluates constraint residuals.
pub trait MultibodyPlant<T: DiffScalar> {
    fn num_positions(&self) -> usize;
    fn num_velocities(&self) -> usize;
    fn num_actuators(&self) -> usize;

    /// Joint-space mass matrix M(q), full symmetric n_v x n_v.
    fn mass_matrix(&self, q: &DVector<T>) -> DMatrix<T>;

    /// Dynamics bias c(q, v), gravity included.
    fn dynamics_bias(&self, q: &DVector<T>, v: &DVector<T>) -> DVector<T>;

    /// Actuation matrix B mapping actuator inputs to generalized forces,
    /// n_v x n_u.
    fn actuation_matrix(&self) -> DMatrix<T>;

    /// Map the generalized velocity v to the configuration derivative qdot.
    /// Identity whenever positions and velocities live in the same space.
    fn map_velocity_to_qdot(&self, q: &DVector<T>, v: &DVector<T>) -> DVector<T>;

    /// World-frame position of a point fixed in a body frame.
    fn point_position(&self, q: &DVector<T>, point: &BodyPoint) -> Vector3<T>;

    /// Translational velocity Jacobian of the point with respect to v,
    /// expressed in world frame, 3 x n_v.
    fn point_jacobian(&self, q: &DVector<T>, point: &BodyPoint) -> Matrix3xX<T>;

    /// Bias term J̇v of the point, so that its acceleration is
    /// a = J vdot + J̇v.
    fn point_jacobian_dot_times_v(
        &self,
        q: &DVector<T>,
        v: &DVector<T>,
        point: &BodyPoint,
    ) -> Vector3<T>;

    /// World-frame center of mass position.
    fn com_position(&self, q: &DVector<T>) -> Vector3<T>;

    /// Center of mass translational velocity Jacobian, 3 x n_v.
    fn com_jacobian(&self, q: &DVector<T>) -> Matrix3xX<T>;

    /// Center of mass bias term J̇v.
    fn com_jacobian_dot_times_v(&self, q: &DVector<T>, v: &DVector<T>) -> Vector3<T>;

    fn num_states(&self) -> usize {
        self.num_positions() + self.num_velocities()
    }
}
