//! Per-predicate indexed fact stores.
//!
//! Each store holds a main table (id → fact) plus secondary hash indices,
//! one per binding pattern some rule occurrence probes it with. Indices are
//! created lazily at lookup-generation time; constants stay out of the hash
//! key (to keep bucket cardinality low) and are re-checked by a post filter.
//! Fact ids are monotone and never reused; removal deletes the fact from the
//! main table and every bucket it was hashed into.

use crate::fact::{Fact, PredId, RuleId};
use crate::registry::Registry;
use crate::term::Value;
use hashbrown::HashMap;
use rustc_hash::{FxHashMap, FxHashSet};

/// A bucket key: the stringified values at the index's key positions.
pub type IndexKey = Box<[String]>;

/// A live fact record. Alongside the values it carries everything needed to
/// take the fact out again: the index keys it occupies and the propagation
/// history signatures that mention it.
#[derive(Clone, Debug)]
pub struct StoredFact {
    pub id: u64,
    pub values: Box<[Value]>,
    pub index_keys: Vec<IndexKey>,
    pub history: FxHashMap<RuleId, Vec<String>>,
}

/// A lookup plan for one occurrence's probe of a store: which secondary
/// index to use (`None` = scan the main table) and which constant positions
/// the post filter must re-check.
#[derive(Clone, Debug)]
pub struct Lookup {
    pub index: Option<usize>,
    pub consts: Box<[(usize, Value)]>,
}

impl Lookup {
    /// The deferred constant screen.
    pub fn passes(&self, values: &[Value]) -> bool {
        self.consts
            .iter()
            .all(|(pos, expected)| values.get(*pos) == Some(expected))
    }
}

struct StoreIndex {
    /// Argument positions whose bound values form the bucket key, ascending.
    positions: Box<[usize]>,
    buckets: HashMap<IndexKey, FxHashSet<u64>>,
}

impl StoreIndex {
    fn key_of(&self, values: &[Value]) -> IndexKey {
        self.positions
            .iter()
            .map(|&p| values[p].to_string())
            .collect()
    }

    /// Key from a pattern's currently bound terms; `None` if any key
    /// position is unbound (then the bucket cannot be addressed).
    fn key_of_pattern(&self, pattern: &Fact) -> Option<IndexKey> {
        self.positions
            .iter()
            .map(|&p| pattern.args[p].value().map(|v| v.to_string()))
            .collect()
    }
}

pub struct FactStore {
    pred: PredId,
    next_id: u64,
    main: FxHashMap<u64, StoredFact>,
    indices: Vec<StoreIndex>,
}

impl FactStore {
    pub fn new(pred: PredId) -> Self {
        Self {
            pred,
            next_id: 0,
            main: FxHashMap::default(),
            indices: Vec::new(),
        }
    }

    pub fn pred(&self) -> PredId {
        self.pred
    }

    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Classify a probe pattern into a lookup plan, creating the secondary
    /// index for its binding pattern on first use. Calling this again with
    /// the same binding pattern reuses the same index.
    pub fn generate_lookup(&mut self, pattern: &Fact) -> Lookup {
        let mut key_positions: Vec<usize> = Vec::new();
        let mut consts: Vec<(usize, Value)> = Vec::new();
        for (pos, term) in pattern.args.iter().enumerate() {
            if term.is_bound() {
                key_positions.push(pos);
            } else if term.is_const() {
                if let Some(v) = term.value() {
                    consts.push((pos, v));
                }
            }
            // free variables and don't-cares take no part in the lookup
        }

        let index = if key_positions.is_empty() {
            None
        } else {
            Some(self.ensure_index(key_positions))
        };
        Lookup {
            index,
            consts: consts.into_boxed_slice(),
        }
    }

    fn ensure_index(&mut self, positions: Vec<usize>) -> usize {
        if let Some(i) = self
            .indices
            .iter()
            .position(|idx| *idx.positions == *positions)
        {
            return i;
        }
        let mut index = StoreIndex {
            positions: positions.into_boxed_slice(),
            buckets: HashMap::new(),
        };
        // Backfill facts already present so the bucket invariant holds no
        // matter when the index is created.
        for fact in self.main.values_mut() {
            let key = index.key_of(&fact.values);
            fact.index_keys.push(key.clone());
            index.buckets.entry(key).or_default().insert(fact.id);
        }
        self.indices.push(index);
        self.indices.len() - 1
    }

    /// Insert a fact, hashing it into every existing index, and return its
    /// id.
    pub fn add(&mut self, values: Box<[Value]>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let mut index_keys = Vec::with_capacity(self.indices.len());
        for index in &mut self.indices {
            let key = index.key_of(&values);
            index.buckets.entry(key.clone()).or_default().insert(id);
            index_keys.push(key);
        }
        self.main.insert(
            id,
            StoredFact {
                id,
                values,
                index_keys,
                history: FxHashMap::default(),
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<&StoredFact> {
        self.main.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut StoredFact> {
        self.main.get_mut(&id)
    }

    /// Remove a fact from the main table and every bucket it occupies,
    /// pruning buckets that become empty.
    ///
    /// # Panics
    ///
    /// Panics on an unknown id: the engine only removes ids it allocated and
    /// has not removed before, so a miss means the store is corrupted.
    pub fn remove(&mut self, id: u64) -> StoredFact {
        let Some(fact) = self.main.remove(&id) else {
            panic!(
                "store for predicate #{}: removing unknown fact id {id}",
                self.pred.0
            );
        };
        for (index, key) in self.indices.iter_mut().zip(fact.index_keys.iter()) {
            let Some(bucket) = index.buckets.get_mut(key) else {
                panic!(
                    "store for predicate #{}: fact {id} missing from bucket {key:?}",
                    self.pred.0
                );
            };
            bucket.remove(&id);
            if bucket.is_empty() {
                index.buckets.remove(key);
            }
        }
        fact
    }

    /// Snapshot the candidate ids for a probe: the addressed bucket, or the
    /// whole main table when no index applies. Order is not meaningful.
    pub fn candidate_ids(&self, lookup: &Lookup, pattern: &Fact) -> Vec<u64> {
        match lookup.index {
            None => self.main.keys().copied().collect(),
            Some(i) => {
                let index = &self.indices[i];
                match index.key_of_pattern(pattern) {
                    Some(key) => index
                        .buckets
                        .get(&key)
                        .map(|bucket| bucket.iter().copied().collect())
                        .unwrap_or_default(),
                    None => Vec::new(),
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredFact> {
        self.main.values()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        for index in &self.indices {
            let mut seen = 0usize;
            for (key, bucket) in &index.buckets {
                assert!(!bucket.is_empty(), "empty bucket not pruned");
                for id in bucket {
                    let fact = self.main.get(id).expect("bucket holds a dead fact");
                    assert_eq!(
                        &index.key_of(&fact.values),
                        key,
                        "fact hashed into the wrong bucket"
                    );
                    seen += 1;
                }
            }
            assert_eq!(seen, self.main.len(), "index and main table diverge");
        }
    }
}

/// One location's stores, one per registered predicate.
pub struct Stores {
    by_pred: Vec<FactStore>,
}

impl Stores {
    pub fn new(registry: &Registry) -> Self {
        Self {
            by_pred: registry
                .pred_ids()
                .map(FactStore::new)
                .collect(),
        }
    }

    pub fn store(&self, pred: PredId) -> &FactStore {
        &self.by_pred[pred.0 as usize]
    }

    pub fn store_mut(&mut self, pred: PredId) -> &mut FactStore {
        &mut self.by_pred[pred.0 as usize]
    }

    pub fn add(&mut self, pred: PredId, values: Box<[Value]>) -> u64 {
        self.store_mut(pred).add(values)
    }

    pub fn get(&self, pred: PredId, id: u64) -> Option<&StoredFact> {
        self.store(pred).get(id)
    }

    pub fn get_mut(&mut self, pred: PredId, id: u64) -> Option<&mut StoredFact> {
        self.store_mut(pred).get_mut(id)
    }

    pub fn remove(&mut self, pred: PredId, id: u64) -> StoredFact {
        self.store_mut(pred).remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FactStore> {
        self.by_pred.iter()
    }

    /// A readable copy of everything currently alive, keyed by predicate
    /// name. Workers return this at shutdown.
    pub fn snapshot(&self, registry: &Registry) -> Snapshot {
        let mut preds = HashMap::new();
        for store in &self.by_pred {
            let facts: Vec<Vec<Value>> = store
                .iter()
                .map(|f| f.values.to_vec())
                .collect();
            preds.insert(registry.pred_name(store.pred).to_string(), facts);
        }
        Snapshot { preds }
    }
}

/// The live facts of one location at a point in time.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    preds: HashMap<String, Vec<Vec<Value>>>,
}

impl Snapshot {
    pub fn count(&self, pred: &str) -> usize {
        self.preds.get(pred).map_or(0, Vec::len)
    }

    pub fn facts(&self, pred: &str) -> &[Vec<Value>] {
        self.preds.get(pred).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, pred: &str, values: &[Value]) -> bool {
        self.facts(pred).iter().any(|f| f.as_slice() == values)
    }

    pub fn total(&self) -> usize {
        self.preds.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Term;
    use proptest::prelude::*;

    fn values(vs: &[i64]) -> Box<[Value]> {
        vs.iter().map(|&v| Value::Int(v)).collect()
    }

    fn pattern_bound_first(pred: PredId) -> Fact {
        let x = Term::var();
        x.bind(Value::Int(1));
        Fact::new(pred, [x, Term::var()])
    }

    #[test]
    fn add_then_remove_round_trip() {
        let mut st = FactStore::new(PredId(0));
        let a = st.add(values(&[1, 2]));
        let b = st.add(values(&[1, 3]));
        assert_eq!(st.len(), 2);
        assert_ne!(a, b);

        let rec = st.remove(a);
        assert_eq!(&*rec.values, &*values(&[1, 2]));
        assert_eq!(st.len(), 1);
        assert!(st.get(a).is_none());
        st.assert_invariants();
    }

    #[test]
    #[should_panic(expected = "unknown fact id")]
    fn remove_unknown_id_is_fatal() {
        let mut st = FactStore::new(PredId(0));
        st.remove(41);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut st = FactStore::new(PredId(0));
        let a = st.add(values(&[1]));
        st.remove(a);
        let b = st.add(values(&[1]));
        assert!(b > a);
    }

    #[test]
    fn lookup_reuses_index_for_same_binding_pattern() {
        let mut st = FactStore::new(PredId(0));
        let l1 = st.generate_lookup(&pattern_bound_first(PredId(0)));
        let l2 = st.generate_lookup(&pattern_bound_first(PredId(0)));
        assert_eq!(l1.index, l2.index);
        assert_eq!(st.index_count(), 1);

        // a different binding pattern gets its own index
        let y = Term::var();
        y.bind(Value::Int(2));
        let other = Fact::new(PredId(0), [Term::var(), y]);
        let l3 = st.generate_lookup(&other);
        assert_ne!(l1.index, l3.index);
        assert_eq!(st.index_count(), 2);
    }

    #[test]
    fn unindexed_pattern_scans_the_main_table() {
        let mut st = FactStore::new(PredId(0));
        st.add(values(&[1, 2]));
        st.add(values(&[3, 4]));
        let pat = Fact::new(PredId(0), [Term::var(), Term::var()]);
        let lookup = st.generate_lookup(&pat);
        assert!(lookup.index.is_none());
        assert_eq!(st.candidate_ids(&lookup, &pat).len(), 2);
    }

    #[test]
    fn indexed_candidates_come_from_the_addressed_bucket() {
        let mut st = FactStore::new(PredId(0));
        st.add(values(&[1, 2]));
        st.add(values(&[1, 3]));
        st.add(values(&[2, 3]));

        let pat = pattern_bound_first(PredId(0));
        let lookup = st.generate_lookup(&pat);
        let hits = st.candidate_ids(&lookup, &pat);
        assert_eq!(hits.len(), 2);
        for id in hits {
            assert_eq!(st.get(id).unwrap().values[0], Value::Int(1));
        }

        pat.args[0].bind(Value::Int(9));
        assert!(st.candidate_ids(&lookup, &pat).is_empty());
        st.assert_invariants();
    }

    #[test]
    fn late_index_creation_backfills_existing_facts() {
        let mut st = FactStore::new(PredId(0));
        st.add(values(&[5, 1]));
        st.add(values(&[5, 2]));

        let pat = pattern_bound_first(PredId(0));
        pat.args[0].bind(Value::Int(5));
        let lookup = st.generate_lookup(&pat);
        assert_eq!(st.candidate_ids(&lookup, &pat).len(), 2);
        st.assert_invariants();
    }

    #[test]
    fn constants_are_screened_by_the_post_filter() {
        let mut st = FactStore::new(PredId(0));
        let pat = Fact::new(PredId(0), [Term::val(7), Term::var()]);
        let lookup = st.generate_lookup(&pat);
        assert!(lookup.index.is_none());
        assert!(lookup.passes(&values(&[7, 0])));
        assert!(!lookup.passes(&values(&[8, 0])));
    }

    proptest! {
        #[test]
        fn store_invariants_hold_under_any_script(
            script in prop::collection::vec((any::<bool>(), 0u8..8, 0u8..8), 1..60)
        ) {
            let mut st = FactStore::new(PredId(0));
            // two indices with different binding patterns
            let p1 = pattern_bound_first(PredId(0));
            st.generate_lookup(&p1);
            let y = Term::var();
            y.bind(Value::Int(0));
            st.generate_lookup(&Fact::new(PredId(0), [Term::var(), y]));

            let mut live: Vec<u64> = Vec::new();
            let mut adds = 0usize;
            let mut removes = 0usize;
            for (is_add, a, b) in script {
                if is_add || live.is_empty() {
                    live.push(st.add(values(&[i64::from(a), i64::from(b)])));
                    adds += 1;
                } else {
                    let victim = live.remove((a as usize) % live.len());
                    st.remove(victim);
                    removes += 1;
                }
                st.assert_invariants();
            }
            prop_assert_eq!(st.len(), adds - removes);
        }
    }
}
