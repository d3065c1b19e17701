use na::DVector;

use crate::types::Float;

pub fn assert_close(a: Float, b: Float, tol: Float) {
    assert!((a - b).abs() < tol, "{} != {}", a, b);
}

pub fn assert_dvec_close(a: &DVector<Float>, b: &DVector<Float>, tol: Float) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (a, b) in a.iter().zip(b.iter()) {
        assert!((a - b).abs() < tol, "{} != {}", a, b);
    }
}

#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        let diff: $crate::types::Float = left - right;
        let diff = diff.abs();
        if diff > tol {
            panic!(
                "assertion failed: {} ~= {} \
                (tolerance: {}, difference: {})",
                left, right, tol, diff
            );
        }
    };
}

#[macro_export]
macro_rules! assert_vec_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        for (a, b) in left.iter().zip(right.iter()) {
            crate::assert_close!(a, b, tol);
        }
    };
}

#[cfg(test)]
pub mod test_utils {
    use na::DVector;
    use rand::{rngs::ThreadRng, Rng};

    use crate::types::Float;

    /// Build a DVector of length n where each element is random in (-range, range)
    pub fn random_dvector(rng: &mut ThreadRng, n: usize, range: Float) -> DVector<Float> {
        DVector::from_fn(n, |_, _| rng.random_range(-range..range))
    }
}
