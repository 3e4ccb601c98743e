//! Metric filtering, label-set hashing and key-index assignment.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use md5::{Digest, Md5};
use regex::Regex;

/// Capacity of the filter decision cache.
const DECISION_CACHE_SIZE: usize = 100;

/// One label constraint: the label must exist and its value must match.
#[derive(Debug, Clone)]
pub struct LabelConstraint {
    pub label: String,
    pub value_regex: Regex,
}

/// A labeled filter rule, matched against the prefixed name
/// `<endpoint>.<metric>`.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub metric_regex: Regex,
    pub labels: Vec<LabelConstraint>,
}

/// Which OpenMetrics series to capture. The empty spec passes everything.
#[derive(Debug, Clone, Default)]
pub enum FilterSpec {
    /// No filtering configured.
    #[default]
    All,
    /// Match by metric name only.
    Names(Vec<Regex>),
    /// Match by prefixed name plus label constraints.
    Labeled(Vec<FilterRule>),
}

/// Stable content hash of a label set: MD5 over the sorted `k=v;`
/// representation, so iteration order never changes the result.
pub fn label_hash(labels: &BTreeMap<String, String>) -> String {
    let mut hasher = Md5::new();
    for (k, v) in labels {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}

/// Filter with a small LRU over `(metric_name, label-set hash)` decisions.
///
/// Injectable: each monitor constructs its own (shared across its
/// OpenMetrics resources), so tests never touch global state.
pub struct MetricFilter {
    spec: FilterSpec,
    cache: Mutex<lru::LruCache<String, bool>>,
}

impl MetricFilter {
    pub fn new(spec: FilterSpec) -> Self {
        Self {
            spec,
            cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(DECISION_CACHE_SIZE).unwrap(),
            )),
        }
    }

    /// Decide whether a series passes the filter, consulting the cache first.
    pub fn should_capture(
        &self,
        endpoint: &str,
        metric: &str,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        if matches!(self.spec, FilterSpec::All) {
            return true;
        }

        let cache_key = format!("{metric}{}", label_hash(labels));
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(&decision) = cache.get(&cache_key) {
                return decision;
            }
        }

        let decision = self.evaluate(endpoint, metric, labels);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(cache_key, decision);
        }
        decision
    }

    fn evaluate(&self, endpoint: &str, metric: &str, labels: &BTreeMap<String, String>) -> bool {
        match &self.spec {
            FilterSpec::All => true,
            FilterSpec::Names(regexes) => regexes.iter().any(|re| re.is_match(metric)),
            FilterSpec::Labeled(rules) => {
                let prefixed = format!("{endpoint}.{metric}");
                rules.iter().any(|rule| {
                    rule.metric_regex.is_match(&prefixed)
                        && rule.labels.iter().all(|c| {
                            labels
                                .get(&c.label)
                                .is_some_and(|v| c.value_regex.is_match(v))
                        })
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_decision(&self, metric: &str, labels: &BTreeMap<String, String>) -> Option<bool> {
        let key = format!("{metric}{}", label_hash(labels));
        self.cache.lock().ok()?.peek(&key).copied()
    }
}

/// Dense per-(metric, label-set) indices, assigned in observation order.
/// Scoped to one endpoint; the owning sampler is the only mutator. The
/// mapping lives for the monitor's lifetime only.
#[derive(Debug, Default)]
pub struct LabelIndex {
    per_metric: HashMap<String, HashMap<String, usize>>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `hash` within `metric`, assigning the next dense integer on
    /// first observation.
    pub fn index_for(&mut self, metric: &str, hash: &str) -> usize {
        let indices = self.per_metric.entry(metric.to_string()).or_default();
        let next = indices.len();
        *indices.entry(hash.to_string()).or_insert(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // -- label_hash ----------------------------------------------------------

    #[test]
    fn hash_is_order_independent() {
        let a = labels(&[("pod", "a"), ("env", "prod")]);
        let b = labels(&[("env", "prod"), ("pod", "a")]);
        assert_eq!(label_hash(&a), label_hash(&b));
    }

    #[test]
    fn hash_matches_md5_of_sorted_pairs() {
        let l = labels(&[("pod", "not-trainer-1337")]);
        let expected = format!("{:x}", Md5::digest(b"pod=not-trainer-1337;"));
        assert_eq!(label_hash(&l), expected);
    }

    #[test]
    fn different_label_sets_hash_differently() {
        assert_ne!(
            label_hash(&labels(&[("pod", "a")])),
            label_hash(&labels(&[("pod", "b")]))
        );
    }

    // -- MetricFilter --------------------------------------------------------

    #[test]
    fn empty_spec_passes_everything() {
        let f = MetricFilter::new(FilterSpec::All);
        assert!(f.should_capture("ep", "anything", &labels(&[])));
    }

    #[test]
    fn name_filter_matches_name_only() {
        let f = MetricFilter::new(FilterSpec::Names(vec![Regex::new("^DCGM_").unwrap()]));
        assert!(f.should_capture("ep", "DCGM_FI_DEV_GPU_UTIL", &labels(&[])));
        assert!(!f.should_capture("ep", "node_cpu_seconds", &labels(&[])));
    }

    #[test]
    fn labeled_filter_requires_label_match() {
        let f = MetricFilter::new(FilterSpec::Labeled(vec![FilterRule {
            metric_regex: Regex::new(".*DCGM_.*").unwrap(),
            labels: vec![LabelConstraint {
                label: "pod".into(),
                value_regex: Regex::new("^trainer-.*").unwrap(),
            }],
        }]));

        assert!(f.should_capture(
            "ep",
            "DCGM_FI_DEV_POWER_USAGE",
            &labels(&[("pod", "trainer-42")])
        ));
        assert!(!f.should_capture(
            "ep",
            "DCGM_FI_DEV_POWER_USAGE",
            &labels(&[("pod", "not-trainer-1337")])
        ));
        // Label missing entirely.
        assert!(!f.should_capture("ep", "DCGM_FI_DEV_POWER_USAGE", &labels(&[])));
    }

    #[test]
    fn negative_decision_is_cached_under_name_plus_hash() {
        let f = MetricFilter::new(FilterSpec::Labeled(vec![FilterRule {
            metric_regex: Regex::new(".*DCGM_.*").unwrap(),
            labels: vec![LabelConstraint {
                label: "pod".into(),
                value_regex: Regex::new("^trainer-.*").unwrap(),
            }],
        }]));

        let l = labels(&[("pod", "not-trainer-1337")]);
        assert!(!f.should_capture("ep", "DCGM_FI_DEV_POWER_USAGE", &l));
        assert_eq!(f.cached_decision("DCGM_FI_DEV_POWER_USAGE", &l), Some(false));
    }

    #[test]
    fn decision_is_deterministic_for_same_inputs() {
        let f = MetricFilter::new(FilterSpec::Names(vec![Regex::new("^m$").unwrap()]));
        let l = labels(&[("a", "1"), ("b", "2")]);
        let first = f.should_capture("ep", "m", &l);
        for _ in 0..5 {
            assert_eq!(f.should_capture("ep", "m", &l), first);
        }
    }

    // -- LabelIndex ----------------------------------------------------------

    #[test]
    fn indices_assigned_in_observation_order() {
        let mut idx = LabelIndex::new();
        assert_eq!(idx.index_for("m", "hash-a"), 0);
        assert_eq!(idx.index_for("m", "hash-b"), 1);
        assert_eq!(idx.index_for("m", "hash-a"), 0); // stable
    }

    #[test]
    fn indices_are_per_metric() {
        let mut idx = LabelIndex::new();
        assert_eq!(idx.index_for("m1", "h"), 0);
        assert_eq!(idx.index_for("m2", "h"), 0);
        assert_eq!(idx.index_for("m2", "h2"), 1);
    }
}
