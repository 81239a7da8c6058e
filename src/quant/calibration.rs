//! Calibration statistics store
//!
//! Per-tensor running min/max (QSV: quantization statistics variable),
//! refined across calibration batches by exponential smoothing:
//! `new = old * f + batch * (1 - f)` with `f` in `[0, 1]`.
//! `f = 0` discards history entirely, `f = 1` freezes it.
//!
//! The store is written only during calibration passes and is read-only
//! during parameter materialization; the two phases never overlap.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn, Zip};

use crate::error::{Error, Result};

/// Running min/max statistics for one tensor. Min and max keep the tensor's
/// rank (size-1 axes) so they broadcast against it.
#[derive(Clone, Debug, PartialEq)]
pub struct Qsv {
    pub min: ArrayD<f32>,
    pub max: ArrayD<f32>,
}

impl Qsv {
    pub fn new(min: ArrayD<f32>, max: ArrayD<f32>) -> Self {
        Self { min, max }
    }

    /// Scalar statistics broadcast to the given rank.
    pub fn scalar(min: f32, max: f32, rank: usize) -> Self {
        let shape = vec![1usize; rank.max(1)];
        Self {
            min: ArrayD::from_elem(IxDyn(&shape), min),
            max: ArrayD::from_elem(IxDyn(&shape), max),
        }
    }

    /// Default pre-calibration statistics for an activation tensor. The 0/6
    /// range stabilizes the first smoothing steps.
    pub fn activation_default(rank: usize) -> Self {
        Self::scalar(0.0, 6.0, rank)
    }
}

/// Blend a stored QSV with a new batch observation.
pub fn moving_average_update(old: &Qsv, batch: &Qsv, smoothing: f32) -> Qsv {
    let blend = |prev: &ArrayD<f32>, new: &ArrayD<f32>| {
        let mut out = ArrayD::<f32>::zeros(prev.raw_dim());
        Zip::from(&mut out)
            .and(prev)
            .and(new)
            .for_each(|o, &p, &n| *o = p * smoothing + n * (1.0 - smoothing));
        out
    };
    Qsv {
        min: blend(&old.min, &batch.min),
        max: blend(&old.max, &batch.max),
    }
}

/// Mapping from tensor name to its calibration statistics.
#[derive(Clone, Debug, Default)]
pub struct CalibrationStore {
    entries: HashMap<String, Qsv>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch's min/max for a tensor. The first observation
    /// initializes the entry directly; later ones apply the smoothing rule.
    pub fn observe(&mut self, tensor_name: &str, batch: Qsv, smoothing: f32) {
        match self.entries.get_mut(tensor_name) {
            Some(existing) => *existing = moving_average_update(existing, &batch, smoothing),
            None => {
                self.entries.insert(tensor_name.to_string(), batch);
            }
        }
    }

    /// Replace a tensor's statistics unconditionally (used by same-scale
    /// propagation constraints).
    pub fn insert(&mut self, tensor_name: &str, qsv: Qsv) {
        self.entries.insert(tensor_name.to_string(), qsv);
    }

    /// Statistics for a tensor; an activation quantized without calibration
    /// is a user-facing configuration error.
    pub fn lookup(&self, tensor_name: &str) -> Result<&Qsv> {
        self.entries
            .get(tensor_name)
            .ok_or_else(|| Error::MissingStatistics(tensor_name.to_string()))
    }

    pub fn contains(&self, tensor_name: &str) -> bool {
        self.entries.contains_key(tensor_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn scalar(min: f32, max: f32) -> Qsv {
        Qsv::scalar(min, max, 1)
    }

    #[test]
    fn test_first_observation_initializes() {
        let mut store = CalibrationStore::new();
        store.observe("act", scalar(-1.0, 2.0), 0.99);
        let qsv = store.lookup("act").unwrap();
        assert_abs_diff_eq!(qsv.min[[0]], -1.0);
        assert_abs_diff_eq!(qsv.max[[0]], 2.0);
    }

    #[test]
    fn test_smoothing_zero_discards_history() {
        let mut store = CalibrationStore::new();
        store.observe("act", scalar(-10.0, 8.0), 0.0);
        store.observe("act", scalar(-1000.0, 800.0), 0.0);
        let qsv = store.lookup("act").unwrap();
        assert_abs_diff_eq!(qsv.min[[0]], -1000.0);
        assert_abs_diff_eq!(qsv.max[[0]], 800.0);
    }

    #[test]
    fn test_smoothing_one_freezes_history() {
        let mut store = CalibrationStore::new();
        store.observe("act", scalar(-10.0, 8.0), 1.0);
        store.observe("act", scalar(-1000.0, 800.0), 1.0);
        let qsv = store.lookup("act").unwrap();
        assert_abs_diff_eq!(qsv.min[[0]], -10.0);
        assert_abs_diff_eq!(qsv.max[[0]], 8.0);
    }

    #[test]
    fn test_smoothing_blends_outliers() {
        let old = scalar(-10.0, 8.0);
        let batch = scalar(-1000.0, 800.0);
        let updated = moving_average_update(&old, &batch, 0.99);
        assert_abs_diff_eq!(updated.min[[0]], -19.9, epsilon = 1e-3);
        assert_abs_diff_eq!(updated.max[[0]], 15.92, epsilon = 1e-3);
    }

    #[test]
    fn test_lookup_missing_is_error() {
        let store = CalibrationStore::new();
        let err = store.lookup("never_seen").unwrap_err();
        assert!(matches!(err, Error::MissingStatistics(name) if name == "never_seen"));
    }

    #[test]
    fn test_activation_default_rank() {
        let qsv = Qsv::activation_default(4);
        assert_eq!(qsv.min.shape(), &[1, 1, 1, 1]);
        assert_abs_diff_eq!(qsv.max[[0, 0, 0, 0]], 6.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// The update rule is a linear blend for any smoothing in [0, 1].
        #[test]
        fn prop_moving_average_linear(
            old_min in -100.0f32..0.0,
            batch_min in -100.0f32..0.0,
            smoothing in 0.0f32..=1.0,
        ) {
            let updated = moving_average_update(
                &scalar(old_min, 1.0),
                &scalar(batch_min, 1.0),
                smoothing,
            );
            let expected = old_min * smoothing + batch_min * (1.0 - smoothing);
            prop_assert!((updated.min[[0]] - expected).abs() < 1e-4);
        }

        /// Observations never change entry shapes.
        #[test]
        fn prop_observe_preserves_shape(batches in prop::collection::vec((-10.0f32..0.0, 0.0f32..10.0), 1..10)) {
            let mut store = CalibrationStore::new();
            for (lo, hi) in batches {
                store.observe("t", scalar(lo, hi), 0.9);
            }
            prop_assert_eq!(store.lookup("t").unwrap().min.shape(), &[1]);
        }
    }
}
