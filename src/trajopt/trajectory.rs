use itertools::izip;
use na::DVector;
use thiserror::Error;

use crate::plant::MultibodyPlant;
use crate::types::Float;

/// Errors raised when restoring a trajectory against a plant it was not
/// produced for.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("state dimension mismatch: trajectory has {actual}, plant expects {expected}")]
    StateDimensionMismatch { expected: usize, actual: usize },

    #[error("input dimension mismatch: trajectory has {actual}, plant expects {expected}")]
    InputDimensionMismatch { expected: usize, actual: usize },

    #[error("knot times are not strictly increasing at index {index}")]
    NonMonotonicTimes { index: usize },
}

/// One polynomial piece x(t) = c0 + c1 s + c2 s² + c3 s³ with s = t - t0.
struct Segment {
    t0: Float,
    t1: Float,
    c0: DVector<Float>,
    c1: DVector<Float>,
    c2: DVector<Float>,
    c3: DVector<Float>,
}

/// A vector-valued piecewise polynomial. Segments may share break times,
/// which represents a discontinuity; evaluation at a shared time returns
/// the later segment (right-continuous), so a post-impact state is what a
/// query at the transition time sees.
pub struct PiecewisePolynomial {
    segments: Vec<Segment>,
    dim: usize,
}

impl PiecewisePolynomial {
    /// Cubic Hermite interpolation through samples with prescribed
    /// derivatives, the same interpolant the collocation scheme integrates.
    pub fn cubic_hermite(
        breaks: &[Float],
        samples: &[DVector<Float>],
        derivatives: &[DVector<Float>],
    ) -> Self {
        assert!(breaks.len() >= 2, "need at least two breaks");
        assert_eq!(breaks.len(), samples.len());
        assert_eq!(breaks.len(), derivatives.len());
        assert!(
            breaks.windows(2).all(|w| w[0] < w[1]),
            "breaks must be strictly increasing"
        );
        let dim = samples[0].len();

        let mut segments = vec![];
        for (t, x, d) in izip!(breaks.windows(2), samples.windows(2), derivatives.windows(2)) {
            let h = t[1] - t[0];
            let (x0, x1) = (&x[0], &x[1]);
            let (d0, d1) = (&d[0], &d[1]);
            assert_eq!(x0.len(), dim);
            assert_eq!(d0.len(), dim);

            let c2 = ((x1 - x0) * 3.0 / (h * h)) - (d0 * 2.0 + d1) / h;
            let c3 = ((x0 - x1) * 2.0 / (h * h * h)) + (d0 + d1) / (h * h);
            segments.push(Segment {
                t0: t[0],
                t1: t[1],
                c0: x0.clone(),
                c1: d0.clone(),
                c2,
                c3,
            });
        }
        PiecewisePolynomial { segments, dim }
    }

    /// Linear interpolation between samples.
    pub fn first_order_hold(breaks: &[Float], samples: &[DVector<Float>]) -> Self {
        assert!(breaks.len() >= 2, "need at least two breaks");
        assert_eq!(breaks.len(), samples.len());
        assert!(
            breaks.windows(2).all(|w| w[0] < w[1]),
            "breaks must be strictly increasing"
        );
        let dim = samples[0].len();

        let mut segments = vec![];
        for (t, x) in izip!(breaks.windows(2), samples.windows(2)) {
            let h = t[1] - t[0];
            let slope = (&x[1] - &x[0]) / h;
            segments.push(Segment {
                t0: t[0],
                t1: t[1],
                c0: x[0].clone(),
                c1: slope,
                c2: DVector::zeros(dim),
                c3: DVector::zeros(dim),
            });
        }
        PiecewisePolynomial { segments, dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn start_time(&self) -> Float {
        self.segments.first().unwrap().t0
    }

    pub fn end_time(&self) -> Float {
        self.segments.last().unwrap().t1
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn segment_at(&self, t: Float) -> &Segment {
        // The last segment whose start is at or before t; right-continuous
        // at shared break times.
        self.segments
            .iter()
            .rev()
            .find(|s| t >= s.t0)
            .unwrap_or_else(|| self.segments.first().unwrap())
    }

    /// Evaluate at time t, clamped to the trajectory's time span.
    pub fn value(&self, t: Float) -> DVector<Float> {
        let t = t.max(self.start_time()).min(self.end_time());
        let seg = self.segment_at(t);
        let s = t - seg.t0;
        &seg.c0 + &seg.c1 * s + &seg.c2 * (s * s) + &seg.c3 * (s * s * s)
    }

    /// Time derivative at t.
    pub fn derivative_value(&self, t: Float) -> DVector<Float> {
        let t = t.max(self.start_time()).min(self.end_time());
        let seg = self.segment_at(t);
        let s = t - seg.t0;
        &seg.c1 + &seg.c2 * (2.0 * s) + &seg.c3 * (3.0 * s * s)
    }

    /// Append another trajectory starting where this one ends. A shared
    /// boundary time is allowed and represents a jump.
    pub fn concatenate(&mut self, other: PiecewisePolynomial) {
        assert_eq!(self.dim, other.dim, "dimension mismatch in concatenate");
        assert!(
            other.start_time() >= self.end_time() - 1e-9,
            "trajectories overlap in time"
        );
        self.segments.extend(other.segments);
    }
}

/// A solved hybrid trajectory with the metadata needed to restore it
/// without re-solving: knot times, mode boundaries and dimensions.
pub struct HybridTrajectory {
    pub state: PiecewisePolynomial,
    pub input: Option<PiecewisePolynomial>,
    /// Per-mode contact force trajectories, in mode order.
    pub forces: Vec<PiecewisePolynomial>,
    pub knot_times: Vec<Float>,
    pub mode_boundary_times: Vec<Float>,
    pub num_positions: usize,
    pub num_velocities: usize,
    pub num_actuators: usize,
}

impl HybridTrajectory {
    /// A restored trajectory must match the plant it is replayed against.
    pub fn validate_for_plant(
        &self,
        plant: &dyn MultibodyPlant<Float>,
    ) -> Result<(), TrajectoryError> {
        let n_x = plant.num_states();
        if self.num_positions + self.num_velocities != n_x || self.state.dim() != n_x {
            return Err(TrajectoryError::StateDimensionMismatch {
                expected: n_x,
                actual: self.state.dim(),
            });
        }
        if let Some(input) = &self.input {
            if input.dim() != plant.num_actuators() {
                return Err(TrajectoryError::InputDimensionMismatch {
                    expected: plant.num_actuators(),
                    actual: input.dim(),
                });
            }
        }
        for (i, w) in self.knot_times.windows(2).enumerate() {
            if w[0] >= w[1] {
                return Err(TrajectoryError::NonMonotonicTimes { index: i + 1 });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod trajectory_tests {
    use na::dvector;

    use crate::helpers::build_point_mass;

    use super::*;

    #[test]
    fn cubic_hermite_reproduces_knots() {
        // Arrange
        let breaks = [0.0, 0.4, 1.0];
        let samples = [dvector![0.0, 1.0], dvector![0.5, 0.3], dvector![-1.0, 2.0]];
        let derivs = [dvector![1.0, 0.0], dvector![0.2, -0.4], dvector![0.0, 0.0]];

        // Act
        let traj = PiecewisePolynomial::cubic_hermite(&breaks, &samples, &derivs);

        // Assert: knot values and derivatives are reproduced exactly
        for (t, x) in breaks.iter().zip(samples.iter()) {
            crate::assert_vec_close!(traj.value(*t), x, 1e-12);
        }
        for (t, d) in breaks.iter().zip(derivs.iter()) {
            crate::assert_vec_close!(traj.derivative_value(*t), d, 1e-12);
        }
    }

    #[test]
    fn first_order_hold_midpoint() {
        let breaks = [0.0, 2.0];
        let samples = [dvector![0.0], dvector![4.0]];
        let traj = PiecewisePolynomial::first_order_hold(&breaks, &samples);
        crate::assert_vec_close!(traj.value(1.0), dvector![2.0], 1e-12);
    }

    #[test]
    fn concatenated_jump_is_right_continuous() {
        // Arrange: two constant pieces with a jump at t = 1
        let before = PiecewisePolynomial::first_order_hold(
            &[0.0, 1.0],
            &[dvector![1.0], dvector![1.0]],
        );
        let after = PiecewisePolynomial::first_order_hold(
            &[1.0, 2.0],
            &[dvector![5.0], dvector![5.0]],
        );

        // Act
        let mut traj = before;
        traj.concatenate(after);

        // Assert: at the shared time the later piece wins
        crate::assert_vec_close!(traj.value(1.0), dvector![5.0], 1e-12);
        crate::assert_vec_close!(traj.value(1.0 - 1e-9), dvector![1.0], 1e-6);
    }

    #[test]
    fn restoring_against_wrong_plant_is_an_error() {
        let plant = build_point_mass(1.0);
        let state = PiecewisePolynomial::first_order_hold(
            &[0.0, 1.0],
            &[dvector![0.0, 0.0, 0.0], dvector![1.0, 1.0, 1.0]],
        );
        let traj = HybridTrajectory {
            state,
            input: None,
            forces: vec![],
            knot_times: vec![0.0, 1.0],
            mode_boundary_times: vec![],
            num_positions: 2,
            num_velocities: 1,
            num_actuators: 0,
        };

        let err = traj.validate_for_plant(&plant).unwrap_err();
        assert!(matches!(err, TrajectoryError::StateDimensionMismatch { .. }));
    }
}
