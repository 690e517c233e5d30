//! Propagation history: the CHR dedup for rules with no simplify heads.
//!
//! A pure propagation rule deletes nothing, so the same partner combination
//! would refire on every unrelated activation. Each firing is keyed by the
//! signature of its participant set; signatures are also recorded on the
//! participating facts so they can be purged when a participant dies.

use crate::fact::{PredId, RuleId};
use crate::store::Stores;
use rustc_hash::{FxHashMap, FxHashSet};

/// Canonical signature of a participant set: `pred:id` pairs, sorted, so the
/// same set produces the same signature for every arrival order.
fn signature(participants: &[(PredId, u64)]) -> String {
    let mut parts: Vec<(PredId, u64)> = participants.to_vec();
    parts.sort_unstable();
    let mut sig = String::new();
    for (i, (pred, id)) in parts.iter().enumerate() {
        if i > 0 {
            sig.push(',');
        }
        sig.push_str(&format!("{}:{}", pred.0, id));
    }
    sig
}

#[derive(Debug, Default)]
pub struct Histories {
    tables: FxHashMap<RuleId, FxHashSet<String>>,
}

impl Histories {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff this participant set has not fired `rule` before. A fresh
    /// set is recorded in the rule's table and back-referenced on every
    /// participant.
    pub fn check_and_record(
        &mut self,
        rule: RuleId,
        participants: &[(PredId, u64)],
        stores: &mut Stores,
    ) -> bool {
        let sig = signature(participants);
        let table = self.tables.entry(rule).or_default();
        if table.contains(&sig) {
            return false;
        }
        table.insert(sig.clone());
        for &(pred, id) in participants {
            let Some(fact) = stores.get_mut(pred, id) else {
                panic!(
                    "propagation history for rule #{}: participant {}:{id} is not in its store",
                    rule.0, pred.0
                );
            };
            fact.history.entry(rule).or_default().push(sig.clone());
        }
        true
    }

    /// Drop every signature a removed fact took part in. Must run whenever a
    /// fact carrying history back-references leaves its store.
    pub fn purge(&mut self, refs: &FxHashMap<RuleId, Vec<String>>) {
        for (rule, sigs) in refs {
            if let Some(table) = self.tables.get_mut(rule) {
                for sig in sigs {
                    table.remove(sig);
                }
            }
        }
    }

    pub fn recorded(&self, rule: RuleId) -> usize {
        self.tables.get(&rule).map_or(0, FxHashSet::len)
    }
}
