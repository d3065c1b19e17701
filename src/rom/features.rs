use std::collections::{BTreeMap, BTreeSet};

use na::DVector;

use crate::types::Float;

/// A monomial over variable indices, stored as a sorted multiset: x0*x1*x1
/// is [0, 1, 1]. Multisets compare by unordered multiplicity, so x0*x1 and
/// x1*x0 collapse to one feature.
pub type Monomial = Vec<usize>;

type PartialDiffMap = BTreeMap<(usize, Monomial), (Float, Monomial)>;

/// The complete polynomial feature basis of total degree 0..=order over the
/// non-skipped variables, with the first and second order partial
/// derivatives of every feature precomputed symbolically, so Jacobian and
/// bias evaluations never re-differentiate.
///
/// The derivative maps key on (feature index, differentiated-variable
/// multiset) and hold (coefficient, reduced monomial):
///     d/dx_i (x_i^2 x_j) -> key (idx, [i]) value (2, [i, j])
pub struct MonomialFeatures {
    n_q: usize,
    name: String,
    features: Vec<Monomial>,
    first_ord_partial_diff: PartialDiffMap,
    second_ord_partial_diff: PartialDiffMap,
}

/// Remove one occurrence of `var` from a sorted multiset.
fn remove_one(monomial: &Monomial, var: usize) -> Monomial {
    let mut out = monomial.clone();
    let pos = out.iter().position(|&e| e == var).unwrap();
    out.remove(pos);
    out
}

impl MonomialFeatures {
    pub fn new(n_order: usize, n_q: usize, skip_inds: &[usize], name: &str) -> Self {
        for &idx in skip_inds {
            assert!(idx < n_q, "skip index {} out of range", idx);
        }

        let active_inds: Vec<usize> =
            (0..n_q).filter(|i| !skip_inds.contains(i)).collect();

        // Enumerate every multiset of degree 0..=n_order over the active
        // variables, one degree at a time.
        let mut features: BTreeSet<Monomial> = BTreeSet::new();
        let mut previous: BTreeSet<Monomial> = BTreeSet::new();
        for _order in 0..=n_order {
            previous = Self::subfeatures_with_one_more_order(&active_inds, &previous);
            features.extend(previous.iter().cloned());
        }
        let features: Vec<Monomial> = features.into_iter().collect();

        // First order partial derivatives of each feature
        let mut first_ord_partial_diff: PartialDiffMap = BTreeMap::new();
        for (feature_idx, feat) in features.iter().enumerate() {
            for &i in active_inds.iter() {
                let count = feat.iter().filter(|&&e| e == i).count();
                if count != 0 {
                    let reduced = remove_one(feat, i);
                    first_ord_partial_diff
                        .insert((feature_idx, vec![i]), (count as Float, reduced));
                }
            }
        }

        // Second order: differentiate every first-order term once more,
        // merging coefficients of terms that meet at the same key
        let mut second_ord_partial_diff: PartialDiffMap = BTreeMap::new();
        for ((feature_idx, wrt), (coeff, monomial)) in first_ord_partial_diff.iter() {
            for &i in active_inds.iter() {
                let count = monomial.iter().filter(|&&e| e == i).count();
                if count != 0 {
                    let reduced = remove_one(monomial, i);
                    let mut new_wrt = wrt.clone();
                    new_wrt.push(i);
                    new_wrt.sort_unstable();
                    let new_coeff = coeff * count as Float;
                    second_ord_partial_diff
                        .entry((*feature_idx, new_wrt))
                        .and_modify(|e| e.0 += new_coeff)
                        .or_insert((new_coeff, reduced));
                }
            }
        }

        MonomialFeatures {
            n_q,
            name: name.to_string(),
            features,
            first_ord_partial_diff,
            second_ord_partial_diff,
        }
    }

    /// All multisets with exactly one more element than the given set of
    /// same-order terms; the zero-order seed is the empty monomial.
    fn subfeatures_with_one_more_order(
        active_inds: &[usize],
        terms_of_same_order: &BTreeSet<Monomial>,
    ) -> BTreeSet<Monomial> {
        let mut ret = BTreeSet::new();
        if terms_of_same_order.is_empty() {
            ret.insert(Monomial::new());
        } else {
            for term in terms_of_same_order {
                for &i in active_inds {
                    let mut new_term = term.clone();
                    new_term.push(i);
                    new_term.sort_unstable();
                    ret.insert(new_term);
                }
            }
        }
        ret
    }

    /// Number of features (the basis length).
    pub fn length(&self) -> usize {
        self.features.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> &[Monomial] {
        &self.features
    }

    /// Evaluate the feature vector at q.
    pub fn eval(&self, q: &DVector<Float>) -> DVector<Float> {
        assert_eq!(q.len(), self.n_q);
        DVector::from_fn(self.features.len(), |idx, _| {
            self.features[idx].iter().map(|&e| q[e]).product()
        })
    }

    /// Directional derivative of the feature vector along qdot:
    ///     d(feature)/dq · qdot
    pub fn eval_jv(&self, q: &DVector<Float>, qdot: &DVector<Float>) -> DVector<Float> {
        self.eval_time_derivative(q, qdot, &self.first_ord_partial_diff)
    }

    /// Second-order chain-rule term J̇ qdot, the time derivative of the
    /// feature Jacobian times qdot at fixed qdot.
    pub fn eval_jdot_v(&self, q: &DVector<Float>, qdot: &DVector<Float>) -> DVector<Float> {
        self.eval_time_derivative(q, qdot, &self.second_ord_partial_diff)
    }

    fn eval_time_derivative(
        &self,
        q: &DVector<Float>,
        qdot: &DVector<Float>,
        partial_diff_map: &PartialDiffMap,
    ) -> DVector<Float> {
        assert_eq!(q.len(), self.n_q);
        assert_eq!(qdot.len(), self.n_q);

        let mut ret = DVector::zeros(self.features.len());
        for ((feature_idx, wrt), (coeff, monomial)) in partial_diff_map.iter() {
            let mut value = *coeff;
            for &q_idx in monomial.iter() {
                value *= q[q_idx];
            }
            for &qdot_idx in wrt.iter() {
                value *= qdot[qdot_idx];
            }
            ret[*feature_idx] += value;
        }
        ret
    }

    pub fn print_symbolic_features(&self) {
        println!("Features =");
        println!("  row index : symbolic term");
        for (idx, feat) in self.features.iter().enumerate() {
            println!("  {}: {:?}", idx, feat);
        }
    }

    pub fn print_symbolic_partial_derivatives(&self, order: usize) {
        assert!(order == 1 || order == 2);
        let map = if order == 1 {
            &self.first_ord_partial_diff
        } else {
            &self.second_ord_partial_diff
        };
        println!(
            "{} order partial derivatives =",
            if order == 1 { "First" } else { "Second" }
        );
        for ((idx, wrt), (coeff, monomial)) in map.iter() {
            println!("  {}, {:?} ==> {}, {:?}", idx, wrt, coeff, monomial);
        }
    }
}

#[cfg(test)]
mod features_tests {
    use rand::rng;

    use crate::util::test_utils::random_dvector;

    use super::*;

    fn binomial(n: usize, k: usize) -> usize {
        let mut result = 1;
        for i in 0..k {
            result = result * (n - i) / (i + 1);
        }
        result
    }

    #[test]
    fn feature_count_matches_multiset_closed_form() {
        // The number of multisets of size <= k over n symbols is C(n+k, k)
        for (order, n_q, skips) in [
            (2, 2, vec![]),
            (2, 3, vec![]),
            (3, 4, vec![]),
            (2, 4, vec![1, 3]),
        ] {
            let features = MonomialFeatures::new(order, n_q, &skips, "");
            let n_active = n_q - skips.len();
            assert_eq!(features.length(), binomial(n_active + order, order));
        }
    }

    #[test]
    fn exhaustive_order_two_over_two_vars() {
        let features = MonomialFeatures::new(2, 2, &[], "");
        let expected: Vec<Monomial> = vec![
            vec![],
            vec![0],
            vec![0, 0],
            vec![0, 1],
            vec![1],
            vec![1, 1],
        ];
        let mut actual = features.features().to_vec();
        actual.sort();
        let mut expected = expected;
        expected.sort();
        assert_eq!(actual, expected);
    }

    #[test]
    fn skipped_variables_never_appear() {
        let features = MonomialFeatures::new(3, 4, &[1, 3], "");
        for feat in features.features() {
            assert!(feat.iter().all(|&e| e != 1 && e != 3));
        }
    }

    #[test]
    fn eval_jv_matches_finite_difference() {
        // Arrange
        let features = MonomialFeatures::new(3, 4, &[2], "test");
        let mut rng = rng();
        for _ in 0..10 {
            let q = random_dvector(&mut rng, 4, 1.5);
            let qdot = random_dvector(&mut rng, 4, 1.5);

            // Act
            let jv = features.eval_jv(&q, &qdot);

            // Assert against a central finite difference of eval
            let eps = 1e-6;
            let fd = (features.eval(&(&q + &qdot * eps)) - features.eval(&(&q - &qdot * eps)))
                / (2.0 * eps);
            for i in 0..features.length() {
                let scale = jv[i].abs().max(1.0);
                crate::assert_close!(jv[i], fd[i], 1e-5 * scale);
            }
        }
    }

    #[test]
    fn eval_jdot_v_matches_finite_difference_of_jv() {
        let features = MonomialFeatures::new(3, 3, &[], "test");
        let mut rng = rng();
        for _ in 0..10 {
            let q = random_dvector(&mut rng, 3, 1.5);
            let qdot = random_dvector(&mut rng, 3, 1.5);

            let jdotv = features.eval_jdot_v(&q, &qdot);

            // J̇ qdot at fixed qdot is the time derivative of J qdot along
            // q(t) = q + qdot t
            let eps = 1e-6;
            let fd = (features.eval_jv(&(&q + &qdot * eps), &qdot)
                - features.eval_jv(&(&q - &qdot * eps), &qdot))
                / (2.0 * eps);
            for i in 0..features.length() {
                let scale = jdotv[i].abs().max(1.0);
                crate::assert_close!(jdotv[i], fd[i], 1e-4 * scale);
            }
        }
    }

    #[test]
    fn constant_feature_has_no_derivatives() {
        let features = MonomialFeatures::new(0, 3, &[], "");
        assert_eq!(features.length(), 1);
        let q = DVector::from_element(3, 2.0);
        let qdot = DVector::from_element(3, 1.0);
        assert_eq!(features.eval(&q)[0], 1.0);
        assert_eq!(features.eval_jv(&q, &qdot)[0], 0.0);
        assert_eq!(features.eval_jdot_v(&q, &qdot)[0], 0.0);
    }
}
