use na::{DMatrix, DVector};

use super::evaluator::KinematicEvaluator;
use crate::plant::{DiffScalar, MultibodyPlant};

/// An ordered collection of kinematic evaluators that are active at the same
/// time. The order is significant: it fixes the layout of the stacked
/// constraint vector and therefore of the associated force variables.
///
/// The set does not own its evaluators; they are borrowed for the lifetime
/// of the problem being set up.
pub struct KinematicEvaluatorSet<'a, T: DiffScalar> {
    evaluators: Vec<&'a dyn KinematicEvaluator<T>>,
}

impl<'a, T: DiffScalar> KinematicEvaluatorSet<'a, T> {
    pub fn new() -> Self {
        KinematicEvaluatorSet { evaluators: vec![] }
    }

    /// Append an evaluator, returning its index within the set.
    pub fn add_evaluator(&mut self, evaluator: &'a dyn KinematicEvaluator<T>) -> usize {
        self.evaluators.push(evaluator);
        self.evaluators.len() - 1
    }

    pub fn num_evaluators(&self) -> usize {
        self.evaluators.len()
    }

    /// Fetch an evaluator by index. Out-of-range indices are a programming
    /// error.
    pub fn get_evaluator(&self, index: usize) -> &'a dyn KinematicEvaluator<T> {
        assert!(
            index < self.evaluators.len(),
            "evaluator index {} out of range (set has {})",
            index,
            self.evaluators.len()
        );
        self.evaluators[index]
    }

    /// Total active constraint dimension of the set.
    pub fn count_active(&self) -> usize {
        self.evaluators.iter().map(|e| e.num_active()).sum()
    }

    pub fn count_full(&self) -> usize {
        self.evaluators.iter().map(|e| e.num_full()).sum()
    }

    /// Row offset of evaluator `index` within the stacked active vector.
    pub fn active_start(&self, index: usize) -> usize {
        assert!(index < self.evaluators.len(), "evaluator index out of range");
        self.evaluators[..index].iter().map(|e| e.num_active()).sum()
    }

    /// Stacked active constraint values.
    pub fn eval_active(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DVector<T> {
        let mut out = DVector::zeros(self.count_active());
        let mut row = 0;
        for e in self.evaluators.iter() {
            out.rows_mut(row, e.num_active())
                .copy_from(&e.eval_active(plant, q));
            row += e.num_active();
        }
        out
    }

    /// Stacked active velocity-level Jacobian, count_active x n_v.
    pub fn eval_active_jacobian(&self, plant: &dyn MultibodyPlant<T>, q: &DVector<T>) -> DMatrix<T> {
        let n_v = plant.num_velocities();
        let mut out = DMatrix::zeros(self.count_active(), n_v);
        let mut row = 0;
        for e in self.evaluators.iter() {
            out.rows_mut(row, e.num_active())
                .copy_from(&e.eval_active_jacobian(plant, q));
            row += e.num_active();
        }
        out
    }

    /// Stacked active bias term J̇v, so that the stacked constraint
    /// acceleration is J vdot + J̇v.
    pub fn eval_active_jacobian_dot_times_v(
        &self,
        plant: &dyn MultibodyPlant<T>,
        q: &DVector<T>,
        v: &DVector<T>,
    ) -> DVector<T> {
        let mut out = DVector::zeros(self.count_active());
        let mut row = 0;
        for e in self.evaluators.iter() {
            out.rows_mut(row, e.num_active())
                .copy_from(&e.eval_active_jacobian_dot_times_v(plant, q, v));
            row += e.num_active();
        }
        out
    }

    pub fn evaluators(&self) -> &[&'a dyn KinematicEvaluator<T>] {
        &self.evaluators
    }
}

impl<'a, T: DiffScalar> Default for KinematicEvaluatorSet<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod evaluator_set_tests {
    use na::{dvector, vector};

    use crate::helpers::build_planar_point_foot;
    use crate::kinematic::evaluator::WorldPointEvaluator;
    use crate::plant::BodyPoint;
    use crate::types::Float;

    use super::*;

    #[test]
    fn stacking_order_and_dimensions() {
        // Arrange
        let plant = build_planar_point_foot(10.0, 1.0);
        let body_eval = WorldPointEvaluator::ground_contact(
            BodyPoint::new(0, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );
        let foot_eval = WorldPointEvaluator::ground_contact(
            BodyPoint::new(1, vector![0., 0., 0.]),
            vector![0., 0., 0.],
        );

        let mut set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        let i0 = set.add_evaluator(&body_eval);
        let i1 = set.add_evaluator(&foot_eval);

        // Assert
        assert_eq!((i0, i1), (0, 1));
        assert_eq!(set.count_active(), 6);
        assert_eq!(set.active_start(1), 3);

        let q = dvector![0.1, 1.2, 0.5, 0.0];
        let phi = set.eval_active(&plant, &q);
        crate::assert_vec_close!(phi, dvector![0.1, 0.0, 1.2, 0.5, 0.0, 0.0], 1e-12);

        let J = set.eval_active_jacobian(&plant, &q);
        assert_eq!((J.nrows(), J.ncols()), (6, 4));
    }

    #[test]
    #[should_panic]
    fn out_of_range_evaluator_is_fatal() {
        let set: KinematicEvaluatorSet<Float> = KinematicEvaluatorSet::new();
        set.get_evaluator(0);
    }
}
