use std::collections::{BTreeMap, BTreeSet};

use crate::kinematic::KinematicEvaluatorSet;
use crate::plant::DiffScalar;
use crate::types::Float;

/// One phase of hybrid dynamics: a fixed set of simultaneously-active
/// kinematic constraints, a knot-point count and a duration window.
///
/// Constraint rows can be marked "relative": the row is not pinned to zero,
/// only required to hold a single (optimized) offset across all of the
/// mode's knots. Used for contact coordinates that are free to land
/// anywhere, e.g. the fore-aft position of a toe.
///
/// The three scale maps multiply the corresponding residual rows for
/// numerical conditioning; they never change the feasible set.
pub struct ContactMode<'a, T: DiffScalar> {
    evaluators: &'a KinematicEvaluatorSet<'a, T>,
    num_knots: usize,
    min_duration: Float,
    max_duration: Float,
    relative_rows: BTreeSet<usize>,
    dynamics_scale: BTreeMap<usize, Float>,
    kin_velocity_scale: BTreeMap<usize, Float>,
    kin_position_scale: BTreeMap<usize, Float>,
}

impl<'a, T: DiffScalar> ContactMode<'a, T> {
    pub fn new(
        evaluators: &'a KinematicEvaluatorSet<'a, T>,
        num_knots: usize,
        min_duration: Float,
        max_duration: Float,
    ) -> Self {
        assert!(num_knots >= 2, "a mode needs at least two knot points");
        assert!(
            0.0 <= min_duration && min_duration <= max_duration,
            "need 0 <= min_duration <= max_duration"
        );
        ContactMode {
            evaluators,
            num_knots,
            min_duration,
            max_duration,
            relative_rows: BTreeSet::new(),
            dynamics_scale: BTreeMap::new(),
            kin_velocity_scale: BTreeMap::new(),
            kin_position_scale: BTreeMap::new(),
        }
    }

    pub fn evaluators(&self) -> &'a KinematicEvaluatorSet<'a, T> {
        self.evaluators
    }

    pub fn num_knots(&self) -> usize {
        self.num_knots
    }

    pub fn min_duration(&self) -> Float {
        self.min_duration
    }

    pub fn max_duration(&self) -> Float {
        self.max_duration
    }

    /// Number of active constraint rows, i.e. the dimension of this mode's
    /// force variables.
    pub fn num_constraints(&self) -> usize {
        self.evaluators.count_active()
    }

    /// Mark one scalar output of one evaluator as relative: its value is
    /// optimized as a per-mode offset instead of being pinned to zero.
    pub fn make_constraint_relative(&mut self, evaluator_index: usize, dim: usize) {
        let evaluator = self.evaluators.get_evaluator(evaluator_index);
        assert!(
            dim < evaluator.num_active(),
            "dimension {} out of range for evaluator with {} active rows",
            dim,
            evaluator.num_active()
        );
        let row = self.evaluators.active_start(evaluator_index) + dim;
        self.relative_rows.insert(row);
    }

    /// Stacked active-constraint rows currently marked relative, ascending.
    pub fn relative_rows(&self) -> Vec<usize> {
        self.relative_rows.iter().cloned().collect()
    }

    pub fn num_relative(&self) -> usize {
        self.relative_rows.len()
    }

    /// Scale the listed velocity rows of the collocation dynamics residual.
    pub fn set_dynamics_scale(&mut self, rows: &[usize], scale: Float) {
        for &row in rows {
            self.dynamics_scale.insert(row, scale);
        }
    }

    /// Scale the velocity-level constraint residual rows of the listed
    /// evaluators/dimensions.
    pub fn set_kin_velocity_scale(&mut self, evaluators: &[usize], dims: &[usize], scale: Float) {
        for &e in evaluators {
            let start = self.evaluators.active_start(e);
            for &d in dims {
                assert!(d < self.evaluators.get_evaluator(e).num_active());
                self.kin_velocity_scale.insert(start + d, scale);
            }
        }
    }

    /// Scale the position-level constraint residual rows of the listed
    /// evaluators/dimensions.
    pub fn set_kin_position_scale(&mut self, evaluators: &[usize], dims: &[usize], scale: Float) {
        for &e in evaluators {
            let start = self.evaluators.active_start(e);
            for &d in dims {
                assert!(d < self.evaluators.get_evaluator(e).num_active());
                self.kin_position_scale.insert(start + d, scale);
            }
        }
    }

    pub fn dynamics_scale(&self) -> &BTreeMap<usize, Float> {
        &self.dynamics_scale
    }

    pub fn kin_velocity_scale(&self) -> &BTreeMap<usize, Float> {
        &self.kin_velocity_scale
    }

    pub fn kin_position_scale(&self) -> &BTreeMap<usize, Float> {
        &self.kin_position_scale
    }
}

/// An ordered list of contact modes. Adjacent modes share their boundary
/// knot point; where the incoming mode activates constraints, the optimizer
/// inserts a rigid impact (velocity jump) at the shared knot.
pub struct ModeSequence<'a, T: DiffScalar> {
    modes: Vec<&'a ContactMode<'a, T>>,
}

impl<'a, T: DiffScalar> ModeSequence<'a, T> {
    pub fn new() -> Self {
        ModeSequence { modes: vec![] }
    }

    pub fn add_mode(&mut self, mode: &'a ContactMode<'a, T>) {
        self.modes.push(mode);
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    pub fn mode(&self, index: usize) -> &'a ContactMode<'a, T> {
        assert!(index < self.modes.len(), "mode index out of range");
        self.modes[index]
    }

    pub fn modes(&self) -> &[&'a ContactMode<'a, T>] {
        &self.modes
    }

    /// Number of distinct knot points over the whole sequence: adjacent
    /// modes share one boundary knot.
    pub fn num_knots(&self) -> usize {
        let total: usize = self.modes.iter().map(|m| m.num_knots()).sum();
        total - (self.modes.len().saturating_sub(1))
    }

    /// Distinct-knot index of the first knot of the given mode.
    pub fn first_knot(&self, mode_index: usize) -> usize {
        assert!(mode_index < self.modes.len(), "mode index out of range");
        self.modes[..mode_index]
            .iter()
            .map(|m| m.num_knots() - 1)
            .sum()
    }
}

impl<'a, T: DiffScalar> Default for ModeSequence<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod mode_tests {
    use na::vector;

    use crate::kinematic::WorldPointEvaluator;
    use crate::plant::BodyPoint;
    use crate::types::Float;

    use super::*;

    #[test]
    fn knot_accounting_shares_boundaries() {
        // Arrange
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let stance = ContactMode::new(&empty, 10, 0.05, 2.0);
        let flight = ContactMode::new(&empty, 7, 0.05, 2.0);

        let mut sequence = ModeSequence::new();
        sequence.add_mode(&stance);
        sequence.add_mode(&flight);
        sequence.add_mode(&stance);

        // Assert: 10 + 7 + 10 - 2 shared boundary knots
        assert_eq!(sequence.num_knots(), 25);
        assert_eq!(sequence.first_knot(0), 0);
        assert_eq!(sequence.first_knot(1), 9);
        assert_eq!(sequence.first_knot(2), 15);
    }

    #[test]
    fn relative_rows_are_stacked_indices() {
        let foot0 = WorldPointEvaluator::ground_contact(
            BodyPoint::new(0, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        let foot1 = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        let mut set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        set.add_evaluator(&foot0);
        set.add_evaluator(&foot1);

        let mut mode = ContactMode::new(&set, 5, 0.0, 1.0);
        mode.make_constraint_relative(0, 0);
        mode.make_constraint_relative(1, 1);

        assert_eq!(mode.relative_rows(), vec![0, 4]);
        assert_eq!(mode.num_relative(), 2);
    }

    #[test]
    #[should_panic]
    fn single_knot_mode_is_fatal() {
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let _ = ContactMode::new(&empty, 1, 0.0, 1.0);
    }

    #[test]
    #[should_panic]
    fn inverted_duration_window_is_fatal() {
        let empty: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let _ = ContactMode::new(&empty, 5, 2.0, 1.0);
    }
}
