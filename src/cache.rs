//! Per-market warm starts for the delta and price contractions.
//!
//! Each market owns one entry behind its own lock, so parallel workers never contend
//! for another market's entry. Contents only affect where iteration starts.

use std::sync::{Mutex, MutexGuard, PoisonError};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Where the delta contraction starts in each objective evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaBehavior {
    /// The delta the current GMM step started from: the closed-form logit delta in the
    /// first step, and the previous step's final delta afterwards.
    #[default]
    First,
    /// The delta from the most recent successful evaluation.
    Last,
}

#[derive(Clone, Debug, Default)]
struct Entry {
    step_delta: Option<DVector<f64>>,
    last_delta: Option<DVector<f64>>,
    last_prices: Option<DVector<f64>>,
}

/// Last converged vectors, one entry per market.
#[derive(Debug, Default)]
pub struct WarmStartCache {
    entries: Vec<Mutex<Entry>>,
}

impl WarmStartCache {
    pub fn new(markets: usize) -> Self {
        Self {
            entries: (0..markets).map(|_| Mutex::new(Entry::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, market: usize) -> Option<MutexGuard<'_, Entry>> {
        self.entries
            .get(market)
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Starting delta for `market` under `behavior`, if one has been stored.
    pub fn delta_start(&self, market: usize, behavior: DeltaBehavior) -> Option<DVector<f64>> {
        let entry = self.entry(market)?;
        match behavior {
            DeltaBehavior::First => entry.step_delta.clone(),
            DeltaBehavior::Last => entry.last_delta.clone().or_else(|| entry.step_delta.clone()),
        }
    }

    /// Records a converged delta.
    pub fn store_delta(&self, market: usize, delta: &DVector<f64>) {
        if let Some(mut entry) = self.entry(market) {
            entry.last_delta = Some(delta.clone());
        }
    }

    /// Starts a new GMM step in `market` from `delta`.
    pub fn begin_step(&self, market: usize, delta: DVector<f64>) {
        if let Some(mut entry) = self.entry(market) {
            entry.last_delta = Some(delta.clone());
            entry.step_delta = Some(delta);
        }
    }

    pub fn price_start(&self, market: usize) -> Option<DVector<f64>> {
        self.entry(market)?.last_prices.clone()
    }

    pub fn store_prices(&self, market: usize, prices: &DVector<f64>) {
        if let Some(mut entry) = self.entry(market) {
            entry.last_prices = Some(prices.clone());
        }
    }

    /// Forgets every stored vector. Called before the first GMM step.
    pub fn clear(&self) {
        for entry in &self.entries {
            *entry.lock().unwrap_or_else(PoisonError::into_inner) = Entry::default();
        }
    }
}

impl Clone for WarmStartCache {
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|entry| {
                    Mutex::new(entry.lock().unwrap_or_else(PoisonError::into_inner).clone())
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn first_and_last_deltas_are_tracked_separately() {
        let cache = WarmStartCache::new(2);
        assert!(cache.delta_start(0, DeltaBehavior::First).is_none());

        cache.store_delta(0, &DVector::from_vec(vec![1.0]));
        cache.store_delta(0, &DVector::from_vec(vec![2.0]));
        assert!(cache.delta_start(0, DeltaBehavior::First).is_none());
        assert_eq!(cache.delta_start(0, DeltaBehavior::Last).unwrap()[0], 2.0);
        assert!(cache.delta_start(1, DeltaBehavior::Last).is_none());
        assert!(cache.delta_start(5, DeltaBehavior::Last).is_none());

        cache.clear();
        assert!(cache.delta_start(0, DeltaBehavior::Last).is_none());
    }

    #[test]
    fn a_new_step_starts_both_behaviors_from_its_delta() {
        let cache = WarmStartCache::new(1);
        cache.store_delta(0, &DVector::from_vec(vec![1.0]));
        cache.begin_step(0, DVector::from_vec(vec![5.0]));
        assert_eq!(cache.delta_start(0, DeltaBehavior::First).unwrap()[0], 5.0);
        assert_eq!(cache.delta_start(0, DeltaBehavior::Last).unwrap()[0], 5.0);

        cache.store_delta(0, &DVector::from_vec(vec![6.0]));
        assert_eq!(cache.delta_start(0, DeltaBehavior::First).unwrap()[0], 5.0);
        assert_eq!(cache.delta_start(0, DeltaBehavior::Last).unwrap()[0], 6.0);
    }

    #[test]
    fn parallel_writers_touch_only_their_market() {
        let cache = WarmStartCache::new(64);
        (0..64usize).into_par_iter().for_each(|t| {
            cache.store_prices(t, &DVector::from_element(2, t as f64));
        });
        for t in 0..64 {
            assert_eq!(cache.price_start(t).unwrap()[1], t as f64);
        }
    }
}
