//! Explicit call instrumentation.
//!
//! Code that wants to be measured wraps the call in
//! [`Instrumentation::record`] with a [`TraceSpec`] naming where the
//! measurements go and which ones to take. The `instrumentation` collector
//! turns the accumulated counters into observations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::collector::Observation;
use crate::concurrent_map::ShardedMap;
use crate::sharded_counter::ShardedCounter;
use crate::types::MetricType;

/// Which measurements a trace point takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectSet {
    pub elapsed: bool,
    pub invocations: bool,
    pub errors: bool,
}

impl CollectSet {
    pub const ALL: Self = Self {
        elapsed: true,
        invocations: true,
        errors: true,
    };

    pub const NONE: Self = Self {
        elapsed: false,
        invocations: false,
        errors: false,
    };
}

impl Default for CollectSet {
    fn default() -> Self {
        Self::ALL
    }
}

/// Where a trace point's measurements are filed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceSpec {
    pub name: String,
    pub namespace: Vec<String>,
    pub collect: CollectSet,
}

impl TraceSpec {
    #[must_use]
    pub fn new(namespace: &[&str], name: impl Into<String>, collect: CollectSet) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.iter().map(|s| (*s).to_string()).collect(),
            collect,
        }
    }

    fn key(&self) -> String {
        let mut key = self.namespace.join("/");
        key.push(':');
        key.push_str(&self.name);
        key
    }
}

/// Anything whose success can be judged after the call.
pub trait Traced {
    fn is_failure(&self) -> bool;
}

impl<T, E> Traced for Result<T, E> {
    fn is_failure(&self) -> bool {
        self.is_err()
    }
}

#[derive(Debug)]
struct TracePoint {
    spec: TraceSpec,
    invocations: ShardedCounter,
    errors: ShardedCounter,
    elapsed_total_ns: AtomicU64,
    elapsed_last_ns: AtomicU64,
}

/// Registry of trace points and their counters.
#[derive(Debug, Default)]
pub struct Instrumentation {
    points: ShardedMap<String, Arc<TracePoint>>,
}

impl Instrumentation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn point(&self, spec: &TraceSpec) -> Arc<TracePoint> {
        self.points
            .get_or_insert_with(&spec.key(), || {
                Arc::new(TracePoint {
                    spec: spec.clone(),
                    invocations: ShardedCounter::new(),
                    errors: ShardedCounter::new(),
                    elapsed_total_ns: AtomicU64::new(0),
                    elapsed_last_ns: AtomicU64::new(0),
                })
            })
            .0
    }

    /// Run `f` and record what `spec` selects.
    pub fn record<R: Traced>(&self, spec: &TraceSpec, f: impl FnOnce() -> R) -> R {
        if spec.collect == CollectSet::NONE {
            return f();
        }
        let point = self.point(spec);
        let started = Instant::now();
        let result = f();
        let collect = spec.collect;
        if collect.invocations {
            point.invocations.increment();
        }
        if collect.errors && result.is_failure() {
            point.errors.increment();
        }
        if collect.elapsed {
            let ns = started.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
            point.elapsed_total_ns.fetch_add(ns, Ordering::Relaxed);
            point.elapsed_last_ns.store(ns, Ordering::Relaxed);
        }
        result
    }

    /// Current value of every selected measurement.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Observation> {
        let mut points = self.points.values();
        points.sort_by(|a, b| a.spec.key().cmp(&b.spec.key()));

        let mut out = Vec::new();
        for point in points {
            let spec = &point.spec;
            let mut namespace = spec.namespace.clone();
            namespace.push(spec.name.clone());
            let invocations = point.invocations.get();
            if spec.collect.invocations {
                out.push(Observation::new(
                    namespace.clone(),
                    "invocations",
                    MetricType::LongCounter,
                    invocations as i64,
                ));
            }
            if spec.collect.errors {
                out.push(Observation::new(
                    namespace.clone(),
                    "errors",
                    MetricType::LongCounter,
                    point.errors.get() as i64,
                ));
            }
            if spec.collect.elapsed {
                let total = point.elapsed_total_ns.load(Ordering::Relaxed);
                let avg = if invocations == 0 { 0 } else { total / invocations };
                out.push(Observation::new(
                    namespace.clone(),
                    "avg_elapsed_ns",
                    MetricType::LongGauge,
                    avg as i64,
                ));
                out.push(Observation::new(
                    namespace,
                    "last_elapsed_ns",
                    MetricType::LongGauge,
                    point.elapsed_last_ns.load(Ordering::Relaxed) as i64,
                ));
            }
        }
        out
    }

    /// Number of distinct trace points seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(obs: &'a [Observation], name: &str) -> Option<&'a Observation> {
        obs.iter().find(|o| o.name == name)
    }

    #[test]
    fn records_invocations_and_errors() {
        let inst = Instrumentation::new();
        let spec = TraceSpec::new(&["dispatcher"], "submit", CollectSet::ALL);
        let ok: Result<u32, ()> = inst.record(&spec, || Ok(1));
        assert_eq!(ok, Ok(1));
        let _: Result<u32, ()> = inst.record(&spec, || Err(()));

        let obs = inst.snapshot();
        assert_eq!(find(&obs, "invocations").unwrap().value, 2);
        assert_eq!(find(&obs, "errors").unwrap().value, 1);
        assert!(find(&obs, "avg_elapsed_ns").is_some());
        assert_eq!(
            find(&obs, "invocations").unwrap().namespace,
            vec!["dispatcher".to_string(), "submit".to_string()]
        );
    }

    #[test]
    fn collect_set_limits_output() {
        let inst = Instrumentation::new();
        let spec = TraceSpec::new(
            &["x"],
            "only_count",
            CollectSet {
                elapsed: false,
                invocations: true,
                errors: false,
            },
        );
        let _: Result<(), ()> = inst.record(&spec, || Ok(()));
        let obs = inst.snapshot();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].name, "invocations");
    }

    #[test]
    fn empty_collect_set_is_untracked() {
        let inst = Instrumentation::new();
        let spec = TraceSpec::new(&["x"], "off", CollectSet::NONE);
        let _: Result<(), ()> = inst.record(&spec, || Ok(()));
        assert!(inst.is_empty());
    }
}
