//! All-or-nothing evaluation of several limits.
//!
//! Checking and incrementing limits one at a time leaks counts: if the
//! third limit rejects, the first two have already been charged. Instead,
//! every bucket involved is locked up front, every limit is checked against
//! the locked counts, and only then are the costs applied, to all of them
//! or to none.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use super::identifier::{BucketKey, Identifier};
use super::resolver::ResolvedLimit;
use super::sliding::{self, Admission};
use super::store::{Bucket, WindowStore};
use super::types::{EvaluationResult, LimitStatus};

/// The two buckets a limit reads at a given instant.
struct Windows {
    current: BucketKey,
    /// None while the current window is the first one since the epoch
    previous: Option<BucketKey>,
}

impl Windows {
    fn new(identifier: &Identifier, duration_ms: u64, now_ms: u64) -> Self {
        let start = sliding::window_start(now_ms, duration_ms);
        Self {
            current: BucketKey::new(identifier.clone(), duration_ms, start),
            previous: start
                .checked_sub(duration_ms)
                .map(|prev| BucketKey::new(identifier.clone(), duration_ms, prev)),
        }
    }
}

/// Evaluates resolved limit sets atomically against a [`WindowStore`].
#[derive(Debug, Clone)]
pub struct Coordinator {
    store: Arc<WindowStore>,
}

impl Coordinator {
    pub fn new(store: Arc<WindowStore>) -> Self {
        Self { store }
    }

    /// Admit or reject `limits` as one unit.
    ///
    /// On success every limit is charged its cost. On rejection nothing is
    /// charged; only the limits without headroom report `exceeded`, and all
    /// of them report their remaining quota as it was before the call.
    pub fn evaluate(&self, limits: &[ResolvedLimit], now_ms: u64) -> EvaluationResult {
        if limits.is_empty() {
            return EvaluationResult::unlimited();
        }

        let windows: Vec<Windows> = limits
            .iter()
            .map(|l| Windows::new(&l.identifier, l.duration_ms, now_ms))
            .collect();

        // Current windows are created so they can be charged; previous
        // windows are only read, so missing ones count as zero.
        let mut buckets: BTreeMap<&BucketKey, Arc<Bucket>> = BTreeMap::new();
        for window in &windows {
            buckets
                .entry(&window.current)
                .or_insert_with(|| self.store.bucket(&window.current));
            if let Some(previous) = &window.previous {
                if let Some(bucket) = self.store.existing(previous) {
                    buckets.entry(previous).or_insert(bucket);
                }
            }
        }

        // BTreeMap iteration is sorted, so every caller locks in the same
        // global order and overlapping requests cannot deadlock.
        let mut guards: BTreeMap<&BucketKey, MutexGuard<'_, u64>> = buckets
            .iter()
            .map(|(key, bucket)| (*key, bucket.lock()))
            .collect();

        // Check phase. `pending` only matters if a caller passes the same
        // identifier twice; the resolver never does.
        let mut pending: HashMap<&BucketKey, u64> = HashMap::new();
        let admissions: Vec<Admission> = limits
            .iter()
            .zip(&windows)
            .map(|(limit, window)| {
                let queued = pending.get(&window.current).copied().unwrap_or(0);
                let current = guards.get(&window.current).map(|g| **g).unwrap_or(0) + queued;
                let previous = window
                    .previous
                    .as_ref()
                    .and_then(|key| guards.get(key))
                    .map(|g| **g)
                    .unwrap_or(0);

                let admission =
                    sliding::evaluate(limit.limit, limit.duration_ms, now_ms, current, previous, limit.cost);
                if admission.allowed {
                    *pending.entry(&window.current).or_insert(0) += limit.cost;
                }
                admission
            })
            .collect();

        let success = admissions.iter().all(|a| a.allowed);

        // Commit phase, still under every lock.
        if success {
            for (limit, window) in limits.iter().zip(&windows) {
                if limit.cost == 0 {
                    continue;
                }
                if let (Some(count), Some(bucket)) =
                    (guards.get_mut(&window.current), buckets.get(&window.current))
                {
                    **count = count.saturating_add(limit.cost);
                    self.store.replicate(&window.current, bucket, limit.cost as i64);
                }
            }
        }
        drop(guards);

        let statuses: Vec<LimitStatus> = limits
            .iter()
            .zip(&admissions)
            .map(|(limit, admission)| LimitStatus {
                name: limit.name.clone(),
                limit: limit.limit,
                remaining: if success {
                    admission.remaining_after(limit.limit, limit.cost)
                } else {
                    admission.remaining
                },
                reset: admission.reset,
                exceeded: !admission.allowed,
                auto_apply: limit.auto_apply,
            })
            .collect();

        if success {
            trace!(limits = limits.len(), now_ms, "Admitted request");
        } else {
            let exceeded: Vec<&str> = statuses
                .iter()
                .filter(|s| s.exceeded)
                .map(|s| s.name.as_str())
                .collect();
            debug!(exceeded = ?exceeded, limits = limits.len(), "Rate limit exceeded, nothing charged");
        }

        EvaluationResult {
            success,
            limits: statuses,
        }
    }

    /// Current status of one limit without charging it.
    ///
    /// `exceeded` here means the window is already over its limit, which
    /// can only happen after a lease commit charged more than it reserved.
    pub fn observe(&self, limit: &ResolvedLimit, now_ms: u64) -> LimitStatus {
        let window = Windows::new(&limit.identifier, limit.duration_ms, now_ms);
        let current = self.store.peek(&window.current);
        let previous = window.previous.as_ref().map(|k| self.store.peek(k)).unwrap_or(0);
        let admission = sliding::evaluate(limit.limit, limit.duration_ms, now_ms, current, previous, 0);

        LimitStatus {
            name: limit.name.clone(),
            limit: limit.limit,
            remaining: admission.remaining,
            reset: admission.reset,
            exceeded: admission.estimate > limit.limit as f64,
            auto_apply: limit.auto_apply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::resolver::LimitSource;

    fn limit(config_id: &str, name: &str, limit: u32, duration_ms: u64, cost: u64) -> ResolvedLimit {
        ResolvedLimit {
            identifier: Identifier::new(config_id, name),
            name: name.to_string(),
            limit,
            duration_ms,
            cost,
            auto_apply: false,
            source: LimitSource::Key,
        }
    }

    fn count(store: &WindowStore, l: &ResolvedLimit, now_ms: u64) -> u64 {
        store.peek(&BucketKey::new(
            l.identifier.clone(),
            l.duration_ms,
            sliding::window_start(now_ms, l.duration_ms),
        ))
    }

    #[test]
    fn test_empty_set_is_admitted() {
        let coordinator = Coordinator::new(Arc::new(WindowStore::new()));
        let result = coordinator.evaluate(&[], 0);
        assert!(result.success);
        assert!(result.limits.is_empty());
    }

    #[test]
    fn test_success_charges_every_limit() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let limits = vec![limit("a", "minute", 10, 60_000, 2), limit("b", "hour", 100, 3_600_000, 2)];

        let result = coordinator.evaluate(&limits, 1_000);
        assert!(result.success);
        assert_eq!(result.limits[0].remaining, 8);
        assert_eq!(result.limits[1].remaining, 98);
        assert_eq!(result.limits[0].reset, 60_000);
        assert_eq!(count(&store, &limits[0], 1_000), 2);
        assert_eq!(count(&store, &limits[1], 1_000), 2);
    }

    #[test]
    fn test_rejection_charges_nothing() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let tight = limit("a", "tight", 1, 60_000, 1);
        let loose = limit("b", "loose", 100, 60_000, 1);

        assert!(coordinator.evaluate(&[loose.clone(), tight.clone()], 0).success);

        let result = coordinator.evaluate(&[loose.clone(), tight.clone()], 0);
        assert!(!result.success);
        assert!(!result.limits[0].exceeded);
        assert_eq!(result.limits[0].remaining, 99);
        assert!(result.limits[1].exceeded);
        assert_eq!(result.limits[1].remaining, 0);

        assert_eq!(count(&store, &loose, 0), 1);
        assert_eq!(count(&store, &tight, 0), 1);
    }

    #[test]
    fn test_zero_cost_is_a_peek() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let full = limit("a", "full", 2, 1_000, 2);
        assert!(coordinator.evaluate(&[full], 0).success);

        let peek = limit("a", "full", 2, 1_000, 0);
        let result = coordinator.evaluate(&[peek.clone()], 10);
        assert!(result.success);
        assert!(!result.limits[0].exceeded);
        assert_eq!(result.limits[0].remaining, 0);
        assert_eq!(count(&store, &peek, 10), 2);
    }

    #[test]
    fn test_previous_window_counts() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let l = limit("a", "x", 10, 1_000, 10);
        assert!(coordinator.evaluate(&[l.clone()], 1_000).success);

        // Right after the boundary the previous window is still fully counted
        let one = limit("a", "x", 10, 1_000, 1);
        assert!(!coordinator.evaluate(&[one.clone()], 2_000).success);

        // Halfway through, half of it has faded
        let result = coordinator.evaluate(&[one], 2_500);
        assert!(result.success);
        assert_eq!(result.limits[0].remaining, 4);
    }

    #[test]
    fn test_duplicate_identifier_is_not_double_admitted() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let l = limit("a", "x", 3, 1_000, 2);

        let result = coordinator.evaluate(&[l.clone(), l.clone()], 0);
        assert!(!result.success);
        assert_eq!(count(&store, &l, 0), 0);
    }

    #[test]
    fn test_observe_does_not_charge() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let l = limit("a", "x", 5, 1_000, 1);
        coordinator.evaluate(&[l.clone()], 0);

        let status = coordinator.observe(&l, 0);
        assert_eq!(status.remaining, 4);
        assert!(!status.exceeded);
        assert_eq!(count(&store, &l, 0), 1);
    }

    #[test]
    fn test_overlapping_sets_in_opposite_order_do_not_deadlock() {
        let store = Arc::new(WindowStore::new());
        let coordinator = Coordinator::new(store.clone());
        let a = limit("a", "a", 1_000_000, 60_000, 1);
        let b = limit("b", "b", 1_000_000, 60_000, 1);

        std::thread::scope(|s| {
            for i in 0..8 {
                let coordinator = coordinator.clone();
                let set = if i % 2 == 0 {
                    vec![a.clone(), b.clone()]
                } else {
                    vec![b.clone(), a.clone()]
                };
                s.spawn(move || {
                    for _ in 0..500 {
                        assert!(coordinator.evaluate(&set, 0).success);
                    }
                });
            }
        });

        assert_eq!(count(&store, &a, 0), 4_000);
        assert_eq!(count(&store, &b, 0), 4_000);
    }
}
