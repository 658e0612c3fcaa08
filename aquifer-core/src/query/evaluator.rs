//! Query Evaluator & Attribution
//!
//! Decides which producers should be active, and who wins when several
//! bindings contend for the same output grip.
//!
//! # Evaluation
//!
//! On every input change the evaluator re-tests the affected bindings
//! (found through an inverted input-grip index, plus anything that
//! changed structurally since the last call), partitions the currently
//! matching bindings by transitive overlap of their output sets, ranks
//! each partition by score descending with binding-id ascending as the
//! tie-break, and awards each still-unclaimed output grip to the first
//! candidate providing it. The result is diffed against the previous
//! attribution and only actual winner changes are emitted.
//!
//! # Precomputation
//!
//! Every input grip has a finite effective domain: the candidate values
//! mentioned by some condition, plus "anything else" (which matches no
//! condition). When the product of domain sizes is at or below the
//! configured threshold the evaluator precomputes the attribution for
//! every combination, indexed by a composite key of sorted current
//! values; above the threshold it computes on demand, optionally
//! memoized under the same key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::graph::Tap;
use crate::grip::Grip;
use crate::value::Value;

use super::binding::Binding;
use super::partition::DisjointSet;

/// Composite key of sorted (grip path, canonicalized value) pairs.
/// `None` stands for "holds no candidate value".
type CombiKey = Vec<(String, Option<Value>)>;

type Winners = IndexMap<Grip, String>;

/// Tuning knobs for the evaluator.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Precompute the full attribution table while the input-value
    /// combination space is at or below this size.
    pub precompute_limit: usize,

    /// Above the limit, memoize on-demand results by input snapshot.
    pub memoize: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            precompute_limit: 64,
            memoize: true,
        }
    }
}

/// One side of an attribution change for one producer.
#[derive(Clone)]
pub struct DeltaEntry {
    /// The binding that won or lost.
    pub binding: String,

    /// Its producer.
    pub tap: Arc<dyn Tap>,

    /// The grips newly won (added) or newly lost (removed).
    pub grips: Vec<Grip>,
}

impl std::fmt::Debug for DeltaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaEntry")
            .field("binding", &self.binding)
            .field("grips", &self.grips)
            .finish()
    }
}

/// The difference between two consecutive attributions. Contains only
/// actual winner changes; evaluating twice with unchanged inputs yields
/// an empty delta the second time.
#[derive(Debug, Default, Clone)]
pub struct AttributionDelta {
    pub added: Vec<DeltaEntry>,
    pub removed: Vec<DeltaEntry>,
}

impl AttributionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The declarative producer-activation engine.
pub struct QueryEvaluator {
    config: EvaluatorConfig,
    bindings: IndexMap<String, Arc<Binding>>,

    /// Inverted index: input grip → bindings whose query reads it.
    index: HashMap<Grip, IndexSet<String>>,

    /// Cached match result (total score) per binding.
    matched: HashMap<String, Option<i64>>,

    /// Bindings whose cached match result is out of date.
    stale: IndexSet<String>,

    /// Current attribution: output grip → winning binding.
    winners: Winners,

    /// Producers of removed bindings that still hold wins, kept until
    /// their loss has been emitted in a delta.
    retired: HashMap<String, Arc<dyn Tap>>,

    /// Binding set changed since the last evaluation.
    structural: bool,

    /// Sorted per-grip candidate domains, rebuilt on structural change.
    domains: Vec<(Grip, IndexSet<Value>)>,

    /// Full attribution table, present while the combination space is
    /// within the configured limit.
    table: Option<HashMap<CombiKey, Winners>>,

    /// On-demand memo, used while no table is present.
    memo: HashMap<CombiKey, Winners>,
}

impl QueryEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            bindings: IndexMap::new(),
            index: HashMap::new(),
            matched: HashMap::new(),
            stale: IndexSet::new(),
            winners: Winners::new(),
            retired: HashMap::new(),
            structural: false,
            domains: Vec::new(),
            table: None,
            memo: HashMap::new(),
        }
    }

    /// Register a binding. Re-using an existing id replaces the old
    /// binding.
    pub fn add_binding(&mut self, binding: Binding) {
        let id = binding.id().to_string();
        self.remove_binding(&id);

        for grip in binding.query().inputs() {
            self.index
                .entry(grip.clone())
                .or_default()
                .insert(id.clone());
        }
        self.stale.insert(id.clone());
        self.bindings.insert(id, Arc::new(binding));
        self.structural = true;
    }

    /// Remove a binding. Removing an unknown id is a no-op.
    pub fn remove_binding(&mut self, id: &str) {
        let Some(binding) = self.bindings.shift_remove(id) else {
            return;
        };

        for grip in binding.query().inputs() {
            if let Some(ids) = self.index.get_mut(grip) {
                ids.shift_remove(id);
                if ids.is_empty() {
                    self.index.remove(grip);
                }
            }
        }
        self.matched.remove(id);
        self.stale.shift_remove(id);

        // If the binding holds wins, its producer must survive until
        // the loss is emitted.
        if self.winners.values().any(|winner| winner == id) {
            self.retired.insert(id.to_string(), binding.tap());
        }
        self.structural = true;
    }

    /// The input grips the evaluator currently watches.
    pub fn input_grips(&self) -> Vec<Grip> {
        self.index.keys().cloned().collect()
    }

    /// Current attribution: output grip → winning binding id.
    pub fn winners(&self) -> &IndexMap<Grip, String> {
        &self.winners
    }

    /// Recompute attribution after `changed` input grips took on the
    /// given current values, returning the winner delta.
    pub fn on_inputs_changed(
        &mut self,
        changed: &[Grip],
        values: &HashMap<Grip, Value>,
    ) -> AttributionDelta {
        if self.structural {
            self.rebuild();
            self.structural = false;
        } else {
            for grip in changed {
                if let Some(ids) = self.index.get(grip) {
                    self.stale.extend(ids.iter().cloned());
                }
            }
        }

        let key = self.combi_key(values);
        let new_winners = if let Some(table) = &self.table {
            table.get(&key).cloned().unwrap_or_default()
        } else if let Some(hit) = self.memo.get(&key) {
            hit.clone()
        } else {
            let stale = std::mem::take(&mut self.stale);
            for id in stale {
                if let Some(binding) = self.bindings.get(&id) {
                    let score = binding
                        .query()
                        .evaluate(values)
                        .map(|s| s + binding.base_score());
                    self.matched.insert(id, score);
                }
            }
            let winners = self.rank_matched();
            if self.config.memoize {
                self.memo.insert(key, winners.clone());
            }
            winners
        };

        self.diff(new_winners)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Recompute domains and decide between table and on-demand mode.
    fn rebuild(&mut self) {
        self.memo.clear();
        self.table = None;
        self.stale = self.bindings.keys().cloned().collect();

        let mut domains: HashMap<Grip, IndexSet<Value>> = HashMap::new();
        for binding in self.bindings.values() {
            for (grip, candidates) in binding.query().conditions() {
                let domain = domains.entry(grip.clone()).or_default();
                for value in candidates.keys() {
                    domain.insert(value.clone());
                }
            }
        }
        let mut domains: Vec<(Grip, IndexSet<Value>)> = domains.into_iter().collect();
        domains.sort_by(|(a, _), (b, _)| a.path().cmp(b.path()));
        for (_, domain) in &mut domains {
            domain.sort();
        }
        self.domains = domains;

        let space = self
            .domains
            .iter()
            .try_fold(1usize, |acc, (_, domain)| acc.checked_mul(domain.len() + 1));
        if let Some(space) = space {
            if !self.bindings.is_empty() && space <= self.config.precompute_limit {
                self.table = Some(self.build_table());
                self.stale.clear();
                debug!(combinations = space, "attribution table precomputed");
            }
        }
    }

    /// Canonicalize current values into the composite lookup key: the
    /// indexed grips in path order, each mapped to its candidate value
    /// or `None` when it holds something no condition mentions.
    fn combi_key(&self, values: &HashMap<Grip, Value>) -> CombiKey {
        self.domains
            .iter()
            .map(|(grip, domain)| {
                let current = values
                    .get(grip)
                    .cloned()
                    .unwrap_or_else(|| grip.default_value().clone());
                let canonical = domain.contains(&current).then_some(current);
                (grip.path().to_string(), canonical)
            })
            .collect()
    }

    /// Enumerate every combination of the candidate domains and rank
    /// each one.
    fn build_table(&self) -> HashMap<CombiKey, Winners> {
        // Odometer over domain positions; index 0 is the "no candidate"
        // slot, 1..=n pick a candidate.
        let mut table = HashMap::new();
        let mut odometer = vec![0usize; self.domains.len()];
        loop {
            let assignment: Vec<(&Grip, Option<&Value>)> = self
                .domains
                .iter()
                .zip(&odometer)
                .map(|((grip, domain), &slot)| {
                    let value = (slot > 0).then(|| &domain[slot - 1]);
                    (grip, value)
                })
                .collect();

            let key: CombiKey = assignment
                .iter()
                .map(|(grip, value)| (grip.path().to_string(), value.cloned()))
                .collect();

            let mut matching = Vec::new();
            for binding in self.bindings.values() {
                if let Some(score) = Self::match_assignment(binding, &assignment) {
                    matching.push((
                        binding.id().to_string(),
                        score + binding.base_score(),
                        binding.outputs().to_vec(),
                    ));
                }
            }
            table.insert(key, Self::rank(matching));

            // Advance the odometer; done once it wraps fully.
            let mut pos = 0;
            loop {
                if pos == odometer.len() {
                    return table;
                }
                odometer[pos] += 1;
                if odometer[pos] <= self.domains[pos].1.len() {
                    break;
                }
                odometer[pos] = 0;
                pos += 1;
            }
        }
    }

    /// Match one binding against a canonical domain assignment.
    fn match_assignment(binding: &Binding, assignment: &[(&Grip, Option<&Value>)]) -> Option<i64> {
        let conditions = binding.query().conditions();
        if conditions.is_empty() {
            return None;
        }
        let mut total = 0;
        for (grip, candidates) in conditions {
            let (_, value) = assignment
                .iter()
                .find(|(candidate, _)| *candidate == grip)?;
            total += candidates.get(value.as_deref()?)?;
        }
        Some(total)
    }

    fn rank_matched(&self) -> Winners {
        let matching: Vec<(String, i64, Vec<Grip>)> = self
            .bindings
            .values()
            .filter_map(|binding| {
                let score = (*self.matched.get(binding.id())?)?;
                Some((
                    binding.id().to_string(),
                    score,
                    binding.outputs().to_vec(),
                ))
            })
            .collect();
        Self::rank(matching)
    }

    /// Partition by transitive output overlap, then rank each partition
    /// by (score descending, id ascending) and award unclaimed grips in
    /// that order.
    fn rank(matching: Vec<(String, i64, Vec<Grip>)>) -> Winners {
        let mut slots: IndexMap<Grip, usize> = IndexMap::new();
        for (_, _, outputs) in &matching {
            for grip in outputs {
                let next = slots.len();
                slots.entry(grip.clone()).or_insert(next);
            }
        }

        let mut set = DisjointSet::new(slots.len());
        for (_, _, outputs) in &matching {
            for window in outputs.windows(2) {
                set.union(slots[&window[0]], slots[&window[1]]);
            }
        }

        // Partition id → indexes into `matching`, in first-seen order.
        let mut partitions: IndexMap<usize, Vec<usize>> = IndexMap::new();
        for (i, (_, _, outputs)) in matching.iter().enumerate() {
            let Some(first) = outputs.first() else { continue };
            let root = set.find(slots[first]);
            partitions.entry(root).or_default().push(i);
        }

        let mut winners = Winners::new();
        for (_, members) in partitions {
            let mut members = members;
            members.sort_by(|&a, &b| {
                let (id_a, score_a, _) = &matching[a];
                let (id_b, score_b, _) = &matching[b];
                score_b.cmp(score_a).then_with(|| id_a.cmp(id_b))
            });

            let mut claimed: HashSet<Grip> = HashSet::new();
            for i in members {
                let (id, _, outputs) = &matching[i];
                for grip in outputs {
                    if claimed.insert(grip.clone()) {
                        winners.insert(grip.clone(), id.clone());
                    }
                }
            }
        }
        winners
    }

    /// Diff against the previous attribution and emit only changes.
    fn diff(&mut self, new_winners: Winners) -> AttributionDelta {
        let mut added: IndexMap<String, Vec<Grip>> = IndexMap::new();
        let mut removed: IndexMap<String, Vec<Grip>> = IndexMap::new();

        for (grip, winner) in &new_winners {
            match self.winners.get(grip) {
                Some(previous) if previous == winner => {}
                Some(previous) => {
                    removed.entry(previous.clone()).or_default().push(grip.clone());
                    added.entry(winner.clone()).or_default().push(grip.clone());
                }
                None => added.entry(winner.clone()).or_default().push(grip.clone()),
            }
        }
        for (grip, previous) in &self.winners {
            if !new_winners.contains_key(grip) {
                removed.entry(previous.clone()).or_default().push(grip.clone());
            }
        }

        self.winners = new_winners;

        let delta = AttributionDelta {
            added: self.to_entries(added),
            removed: self.to_entries(removed),
        };
        self.retired.clear();

        if !delta.is_empty() {
            debug!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                "attribution delta"
            );
        }
        delta
    }

    fn to_entries(&self, per_binding: IndexMap<String, Vec<Grip>>) -> Vec<DeltaEntry> {
        per_binding
            .into_iter()
            .filter_map(|(id, grips)| {
                let tap = self
                    .bindings
                    .get(&id)
                    .map(|binding| binding.tap())
                    .or_else(|| self.retired.get(&id).cloned())?;
                Some(DeltaEntry {
                    binding: id,
                    tap,
                    grips,
                })
            })
            .collect()
    }
}

impl Default for QueryEvaluator {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default())
    }
}
