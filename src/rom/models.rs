use na::{DMatrix, DVector, Matrix3xX, Vector3};
use tracing::warn;

use crate::plant::{BodyPoint, MultibodyPlant};
use crate::rom::features::MonomialFeatures;
use crate::types::Float;
use crate::GRAVITY;

/// Height below which the pendulum dynamics feature substitutes an epsilon
/// instead of dividing by a vanishing coordinate.
const HEIGHT_EPSILON: Float = 1e-8;

/// The closed set of reduced-order model variants. Each variant defines its
/// own mapping and dynamics features; everything else (the regression
/// parameters and how features combine into functions) is shared.
pub enum RomVariant {
    /// Linear inverted pendulum: stance foot to center of mass, in a 2-D
    /// (sagittal) or full 3-D world.
    Lipm {
        stance_foot: BodyPoint,
        world_dim: usize,
    },
    /// 2-D LIPM extended with a swing-foot position, actuated through tau.
    LipmWithSwingFoot {
        stance_foot: BodyPoint,
        swing_foot: BodyPoint,
    },
    /// Center-of-mass height only, with learned vertical dynamics.
    FixHeightAccel { stance_foot: BodyPoint },
    /// Center-of-mass height plus a 2-D swing foot.
    FixHeightAccelWithSwingFoot {
        stance_foot: BodyPoint,
        swing_foot: BodyPoint,
    },
}

/// A parametrized, differentiable map from full configuration to a small
/// set of model coordinates y, plus a second-order dynamics law
///     yddot = theta_yddot · dynamic_feature(y, ydot) + B_tau tau
/// with the mapping
///     y = theta_y · mapping_feature(q)
/// Both laws are linear in the regression parameters; the features carry
/// all nonlinearity.
pub struct ReducedOrderModel<'a> {
    name: String,
    n_y: usize,
    n_yddot: usize,
    n_tau: usize,
    B_tau: DMatrix<Float>,
    n_feature_y: usize,
    n_feature_yddot: usize,
    mapping_basis: MonomialFeatures,
    dynamic_basis: MonomialFeatures,
    theta_y: DVector<Float>,
    theta_yddot: DVector<Float>,
    plant: &'a dyn MultibodyPlant<Float>,
    variant: RomVariant,
}

impl<'a> ReducedOrderModel<'a> {
    /// Linear inverted pendulum in a 2-D or 3-D world. The initial
    /// parameters pick out the exact physical LIPM (identity mapping onto
    /// the pendulum coordinates, g/z dynamics).
    pub fn lipm(
        plant: &'a dyn MultibodyPlant<Float>,
        stance_foot: BodyPoint,
        mapping_basis: MonomialFeatures,
        dynamic_basis: MonomialFeatures,
        world_dim: usize,
    ) -> Self {
        assert!(world_dim == 2 || world_dim == 3, "LIPM world must be 2-D or 3-D");
        let n_y = world_dim;
        let n_feature_y = world_dim + mapping_basis.length();
        let n_feature_yddot = (world_dim - 1) + dynamic_basis.length();

        let mut theta_y = DVector::zeros(n_y * n_feature_y);
        theta_y[0] = 1.0;
        theta_y[1 + n_feature_y] = 1.0;
        if world_dim == 3 {
            theta_y[2 + 2 * n_feature_y] = 1.0;
        }
        let mut theta_yddot = DVector::zeros(n_y * n_feature_yddot);
        theta_yddot[0] = 1.0;
        if world_dim == 3 {
            theta_yddot[1 + n_feature_yddot] = 1.0;
        }

        let model = ReducedOrderModel {
            name: format!("{}D lipm", world_dim),
            n_y,
            n_yddot: n_y,
            n_tau: 0,
            B_tau: DMatrix::zeros(n_y, 0),
            n_feature_y,
            n_feature_yddot,
            mapping_basis,
            dynamic_basis,
            theta_y,
            theta_yddot,
            plant,
            variant: RomVariant::Lipm {
                stance_foot,
                world_dim,
            },
        };
        model.check_model_consistency();
        model
    }

    /// 2-D LIPM with a 2-D swing foot; the swing foot coordinates are the
    /// actuated ("task input") directions.
    pub fn lipm_with_swing_foot(
        plant: &'a dyn MultibodyPlant<Float>,
        stance_foot: BodyPoint,
        swing_foot: BodyPoint,
        mapping_basis: MonomialFeatures,
        dynamic_basis: MonomialFeatures,
    ) -> Self {
        const DIM: usize = 4;
        let n_feature_y = DIM + mapping_basis.length();
        let n_feature_yddot = 1 + dynamic_basis.length();

        #[rustfmt::skip]
        let B_tau = DMatrix::from_row_slice(DIM, 2, &[
            0.0, 0.0,
            0.0, 0.0,
            1.0, 0.0,
            0.0, 1.0,
        ]);

        let mut theta_y = DVector::zeros(DIM * n_feature_y);
        for i in 0..DIM {
            theta_y[i + i * n_feature_y] = 1.0;
        }
        let mut theta_yddot = DVector::zeros(DIM * n_feature_yddot);
        theta_yddot[0] = 1.0;

        let model = ReducedOrderModel {
            name: "2D lipm with 2D swing foot".to_string(),
            n_y: DIM,
            n_yddot: DIM,
            n_tau: 2,
            B_tau,
            n_feature_y,
            n_feature_yddot,
            mapping_basis,
            dynamic_basis,
            theta_y,
            theta_yddot,
            plant,
            variant: RomVariant::LipmWithSwingFoot {
                stance_foot,
                swing_foot,
            },
        };
        model.check_model_consistency();
        model
    }

    /// Center-of-mass height with fully learned vertical dynamics.
    pub fn fix_height_accel(
        plant: &'a dyn MultibodyPlant<Float>,
        stance_foot: BodyPoint,
        mapping_basis: MonomialFeatures,
        dynamic_basis: MonomialFeatures,
    ) -> Self {
        const DIM: usize = 1;
        let n_feature_y = 1 + mapping_basis.length();
        let n_feature_yddot = dynamic_basis.length();

        let mut theta_y = DVector::zeros(DIM * n_feature_y);
        theta_y[0] = 1.0;
        let theta_yddot = DVector::zeros(DIM * n_feature_yddot);

        let model = ReducedOrderModel {
            name: "Fixed COM vertical acceleration".to_string(),
            n_y: DIM,
            n_yddot: DIM,
            n_tau: 0,
            B_tau: DMatrix::zeros(DIM, 0),
            n_feature_y,
            n_feature_yddot,
            mapping_basis,
            dynamic_basis,
            theta_y,
            theta_yddot,
            plant,
            variant: RomVariant::FixHeightAccel { stance_foot },
        };
        model.check_model_consistency();
        model
    }

    /// Center-of-mass height plus a 2-D swing foot.
    pub fn fix_height_accel_with_swing_foot(
        plant: &'a dyn MultibodyPlant<Float>,
        stance_foot: BodyPoint,
        swing_foot: BodyPoint,
        mapping_basis: MonomialFeatures,
        dynamic_basis: MonomialFeatures,
    ) -> Self {
        const DIM: usize = 3;
        let n_feature_y = DIM + mapping_basis.length();
        let n_feature_yddot = dynamic_basis.length();

        #[rustfmt::skip]
        let B_tau = DMatrix::from_row_slice(DIM, 2, &[
            0.0, 0.0,
            1.0, 0.0,
            0.0, 1.0,
        ]);

        let mut theta_y = DVector::zeros(DIM * n_feature_y);
        for i in 0..DIM {
            theta_y[i + i * n_feature_y] = 1.0;
        }
        let theta_yddot = DVector::zeros(DIM * n_feature_yddot);

        let model = ReducedOrderModel {
            name: "Fixed COM vertical acceleration + 2D swing foot".to_string(),
            n_y: DIM,
            n_yddot: DIM,
            n_tau: 2,
            B_tau,
            n_feature_y,
            n_feature_yddot,
            mapping_basis,
            dynamic_basis,
            theta_y,
            theta_yddot,
            plant,
            variant: RomVariant::FixHeightAccelWithSwingFoot {
                stance_foot,
                swing_foot,
            },
        };
        model.check_model_consistency();
        model
    }

    // ------------------------------------------------------------------
    // Structural accessors and parameter mutation

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_y(&self) -> usize {
        self.n_y
    }

    pub fn n_yddot(&self) -> usize {
        self.n_yddot
    }

    pub fn n_tau(&self) -> usize {
        self.n_tau
    }

    pub fn n_feature_y(&self) -> usize {
        self.n_feature_y
    }

    pub fn n_feature_yddot(&self) -> usize {
        self.n_feature_yddot
    }

    pub fn B_tau(&self) -> &DMatrix<Float> {
        &self.B_tau
    }

    pub fn mapping_basis(&self) -> &MonomialFeatures {
        &self.mapping_basis
    }

    pub fn dynamic_basis(&self) -> &MonomialFeatures {
        &self.dynamic_basis
    }

    pub fn variant(&self) -> &RomVariant {
        &self.variant
    }

    /// Dimension checks that must hold at all times; violations are
    /// programming errors, checked after construction and every mutation.
    pub fn check_model_consistency(&self) {
        assert_eq!(self.B_tau.nrows(), self.n_yddot, "B_tau row count");
        assert_eq!(self.B_tau.ncols(), self.n_tau, "B_tau column count");
        assert_eq!(
            self.theta_y.len(),
            self.n_y * self.n_feature_y,
            "theta_y size"
        );
        assert_eq!(
            self.theta_yddot.len(),
            self.n_yddot * self.n_feature_yddot,
            "theta_yddot size"
        );
    }

    pub fn theta_y(&self) -> &DVector<Float> {
        &self.theta_y
    }

    pub fn theta_yddot(&self) -> &DVector<Float> {
        &self.theta_yddot
    }

    /// Both parameter blocks stacked, mapping first.
    pub fn theta(&self) -> DVector<Float> {
        let mut out = DVector::zeros(self.theta_y.len() + self.theta_yddot.len());
        out.rows_mut(0, self.theta_y.len()).copy_from(&self.theta_y);
        out.rows_mut(self.theta_y.len(), self.theta_yddot.len())
            .copy_from(&self.theta_yddot);
        out
    }

    pub fn set_theta_y(&mut self, theta_y: DVector<Float>) {
        assert_eq!(self.theta_y.len(), theta_y.len(), "theta_y size change");
        self.theta_y = theta_y;
        self.check_model_consistency();
    }

    pub fn set_theta_yddot(&mut self, theta_yddot: DVector<Float>) {
        assert_eq!(
            self.theta_yddot.len(),
            theta_yddot.len(),
            "theta_yddot size change"
        );
        self.theta_yddot = theta_yddot;
        self.check_model_consistency();
    }

    pub fn set_theta(&mut self, theta: DVector<Float>) {
        assert_eq!(
            theta.len(),
            self.theta_y.len() + self.theta_yddot.len(),
            "theta size change"
        );
        self.theta_y = theta.rows(0, self.theta_y.len()).into_owned();
        self.theta_yddot = theta
            .rows(self.theta_y.len(), self.theta_yddot.len())
            .into_owned();
        self.check_model_consistency();
    }

    // ------------------------------------------------------------------
    // Model functions: parameters times features

    /// y = theta_y · mapping_feature(q)
    pub fn eval_mapping_func(&self, q: &DVector<Float>) -> DVector<Float> {
        let phi = self.eval_mapping_feat(q);
        DVector::from_fn(self.n_y, |i, _| {
            self.theta_y
                .rows(i * self.n_feature_y, self.n_feature_y)
                .dot(&phi)
        })
    }

    /// yddot = theta_yddot · dynamic_feature(y, ydot) + B_tau tau
    pub fn eval_dynamic_func(
        &self,
        y: &DVector<Float>,
        ydot: &DVector<Float>,
        tau: &DVector<Float>,
    ) -> DVector<Float> {
        assert_eq!(tau.len(), self.n_tau);
        let phi = self.eval_dynamic_feat(y, ydot);
        let mut out = DVector::from_fn(self.n_yddot, |i, _| {
            self.theta_yddot
                .rows(i * self.n_feature_yddot, self.n_feature_yddot)
                .dot(&phi)
        });
        if self.n_tau > 0 {
            out += &self.B_tau * tau;
        }
        out
    }

    /// ydot = theta_y · d(mapping_feature)/dq · qdot
    pub fn eval_mapping_func_jv(&self, q: &DVector<Float>, v: &DVector<Float>) -> DVector<Float> {
        let jv = self.eval_mapping_feat_jv(q, v);
        DVector::from_fn(self.n_y, |i, _| {
            self.theta_y
                .rows(i * self.n_feature_y, self.n_feature_y)
                .dot(&jv)
        })
    }

    /// The J̇v bias of the mapping function, theta_y · J̇v of the features.
    pub fn eval_mapping_func_jdot_v(
        &self,
        q: &DVector<Float>,
        v: &DVector<Float>,
    ) -> DVector<Float> {
        let jdotv = self.eval_mapping_feat_jdot_v(q, v);
        DVector::from_fn(self.n_y, |i, _| {
            self.theta_y
                .rows(i * self.n_feature_y, self.n_feature_y)
                .dot(&jdotv)
        })
    }

    // ------------------------------------------------------------------
    // Variant-specific feature evaluation

    fn stance_to_com(&self, q: &DVector<Float>, stance_foot: &BodyPoint) -> Vector3<Float> {
        self.plant.com_position(q) - self.plant.point_position(q, stance_foot)
    }

    fn com_to_swing(&self, q: &DVector<Float>, swing_foot: &BodyPoint) -> Vector3<Float> {
        self.plant.point_position(q, swing_foot) - self.plant.com_position(q)
    }

    /// mapping_feature(q): leading physical coordinates, then the monomial
    /// basis over q.
    pub fn eval_mapping_feat(&self, q: &DVector<Float>) -> DVector<Float> {
        let basis = self.mapping_basis.eval(q);
        let lead: Vec<Float> = match &self.variant {
            RomVariant::Lipm {
                stance_foot,
                world_dim,
            } => {
                let st_to_com = self.stance_to_com(q, stance_foot);
                if *world_dim == 2 {
                    vec![st_to_com.x, st_to_com.z]
                } else {
                    vec![st_to_com.x, st_to_com.y, st_to_com.z]
                }
            }
            RomVariant::LipmWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st_to_com = self.stance_to_com(q, stance_foot);
                let com_to_sw = self.com_to_swing(q, swing_foot);
                vec![st_to_com.x, st_to_com.z, com_to_sw.x, com_to_sw.z]
            }
            RomVariant::FixHeightAccel { stance_foot } => {
                vec![self.stance_to_com(q, stance_foot).z]
            }
            RomVariant::FixHeightAccelWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st_to_com = self.stance_to_com(q, stance_foot);
                let com_to_sw = self.com_to_swing(q, swing_foot);
                vec![st_to_com.z, com_to_sw.x, com_to_sw.z]
            }
        };
        stack(&lead, &basis, self.n_feature_y)
    }

    /// dynamic_feature(y, ydot): the pendulum term g/z scaled coordinates
    /// where the variant has one, then the monomial basis over [y; ydot].
    pub fn eval_dynamic_feat(
        &self,
        y: &DVector<Float>,
        ydot: &DVector<Float>,
    ) -> DVector<Float> {
        assert_eq!(y.len(), self.n_y);
        assert_eq!(ydot.len(), self.n_y);
        let mut y_and_ydot = DVector::zeros(2 * self.n_y);
        y_and_ydot.rows_mut(0, self.n_y).copy_from(y);
        y_and_ydot.rows_mut(self.n_y, self.n_y).copy_from(ydot);
        let basis = self.dynamic_basis.eval(&y_and_ydot);

        let lead: Vec<Float> = match &self.variant {
            RomVariant::Lipm { world_dim, .. } => {
                let z = guarded_height(y[*world_dim - 1]);
                (0..world_dim - 1).map(|i| y[i] * GRAVITY / z).collect()
            }
            RomVariant::LipmWithSwingFoot { .. } => {
                let z = guarded_height(y[1]);
                vec![y[0] * GRAVITY / z]
            }
            RomVariant::FixHeightAccel { .. }
            | RomVariant::FixHeightAccelWithSwingFoot { .. } => vec![],
        };
        stack(&lead, &basis, self.n_feature_yddot)
    }

    /// Directional derivative of the mapping features along v.
    pub fn eval_mapping_feat_jv(&self, q: &DVector<Float>, v: &DVector<Float>) -> DVector<Float> {
        let qdot = self.plant.map_velocity_to_qdot(q, v);
        let basis_jv = self.mapping_basis.eval_jv(q, &qdot);

        let com_minus_stance_jv = |stance_foot: &BodyPoint| -> Vector3<Float> {
            let J = self.plant.com_jacobian(q) - self.plant.point_jacobian(q, stance_foot);
            jacobian_times(&J, v)
        };
        let swing_minus_com_jv = |swing_foot: &BodyPoint| -> Vector3<Float> {
            let J = self.plant.point_jacobian(q, swing_foot) - self.plant.com_jacobian(q);
            jacobian_times(&J, v)
        };

        let lead: Vec<Float> = match &self.variant {
            RomVariant::Lipm {
                stance_foot,
                world_dim,
            } => {
                let jv = com_minus_stance_jv(stance_foot);
                if *world_dim == 2 {
                    vec![jv.x, jv.z]
                } else {
                    vec![jv.x, jv.y, jv.z]
                }
            }
            RomVariant::LipmWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st = com_minus_stance_jv(stance_foot);
                let sw = swing_minus_com_jv(swing_foot);
                vec![st.x, st.z, sw.x, sw.z]
            }
            RomVariant::FixHeightAccel { stance_foot } => {
                vec![com_minus_stance_jv(stance_foot).z]
            }
            RomVariant::FixHeightAccelWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st = com_minus_stance_jv(stance_foot);
                let sw = swing_minus_com_jv(swing_foot);
                vec![st.z, sw.x, sw.z]
            }
        };
        stack(&lead, &basis_jv, self.n_feature_y)
    }

    /// J̇v bias of the mapping features.
    pub fn eval_mapping_feat_jdot_v(
        &self,
        q: &DVector<Float>,
        v: &DVector<Float>,
    ) -> DVector<Float> {
        let qdot = self.plant.map_velocity_to_qdot(q, v);
        let basis_jdotv = self.mapping_basis.eval_jdot_v(q, &qdot);

        let com_minus_stance = |stance_foot: &BodyPoint| -> Vector3<Float> {
            self.plant.com_jacobian_dot_times_v(q, v)
                - self.plant.point_jacobian_dot_times_v(q, v, stance_foot)
        };
        let swing_minus_com = |swing_foot: &BodyPoint| -> Vector3<Float> {
            self.plant.point_jacobian_dot_times_v(q, v, swing_foot)
                - self.plant.com_jacobian_dot_times_v(q, v)
        };

        let lead: Vec<Float> = match &self.variant {
            RomVariant::Lipm {
                stance_foot,
                world_dim,
            } => {
                let jdotv = com_minus_stance(stance_foot);
                if *world_dim == 2 {
                    vec![jdotv.x, jdotv.z]
                } else {
                    vec![jdotv.x, jdotv.y, jdotv.z]
                }
            }
            RomVariant::LipmWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st = com_minus_stance(stance_foot);
                let sw = swing_minus_com(swing_foot);
                vec![st.x, st.z, sw.x, sw.z]
            }
            RomVariant::FixHeightAccel { stance_foot } => vec![com_minus_stance(stance_foot).z],
            RomVariant::FixHeightAccelWithSwingFoot {
                stance_foot,
                swing_foot,
            } => {
                let st = com_minus_stance(stance_foot);
                let sw = swing_minus_com(swing_foot);
                vec![st.z, sw.x, sw.z]
            }
        };
        stack(&lead, &basis_jdotv, self.n_feature_y)
    }
}

fn jacobian_times(J: &Matrix3xX<Float>, v: &DVector<Float>) -> Vector3<Float> {
    let mut out = Vector3::zeros();
    for j in 0..J.ncols() {
        out += Vector3::new(J[(0, j)], J[(1, j)], J[(2, j)]) * v[j];
    }
    out
}

/// Substitute an epsilon for a vanishing pendulum height and say so.
fn guarded_height(z: Float) -> Float {
    if z.abs() < HEIGHT_EPSILON {
        warn!(height = z, "near-singular height in reduced-order dynamics feature");
        if z < 0.0 {
            -HEIGHT_EPSILON
        } else {
            HEIGHT_EPSILON
        }
    } else {
        z
    }
}

fn stack(lead: &[Float], basis: &DVector<Float>, expected: usize) -> DVector<Float> {
    let mut out = DVector::zeros(lead.len() + basis.len());
    for (i, &l) in lead.iter().enumerate() {
        out[i] = l;
    }
    out.rows_mut(lead.len(), basis.len()).copy_from(basis);
    assert_eq!(out.len(), expected, "feature length mismatch");
    out
}
