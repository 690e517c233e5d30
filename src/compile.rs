//! Rule compilation: one matching function per rule occurrence.
//!
//! Each head atom of a rule becomes an occurrence with that atom as the
//! entry; the remaining heads become partners located through store lookups.
//! Guards are scheduled as early as their variables are ground, and partners
//! are ordered by a greedy score — not a globally optimal join plan, just
//! the heuristic the engine's behavior is calibrated to.

use crate::fact::{Fact, PredId, RuleId};
use crate::registry::Registry;
use crate::rule::{Guard, RuleDef, RuleVars};
use crate::store::{Lookup, Stores};
use crate::term::Term;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Locate one partner in its store: probe plan, pattern, and the terms this
/// step newly binds (the search unbinds exactly these on backtrack).
pub struct LookupStep {
    pub propagated: bool,
    pub pred: PredId,
    pub lookup: Lookup,
    pub pattern: Fact,
    pub binds: Vec<Term>,
}

/// One step of an occurrence's matching function.
pub enum MatchStep {
    Lookup(LookupStep),
    Check(Guard),
}

/// A compiled rule occurrence: the matching function for one head atom.
pub struct Occurrence {
    pub rule: RuleId,
    pub occ_idx: usize,
    pub label: String,
    /// Entry role: kept (propagate) or deleted (simplify) on firing.
    pub entry_propagated: bool,
    pub entry: Fact,
    pub steps: Vec<MatchStep>,
    /// No simplify heads anywhere in the rule: firings are deduplicated
    /// through the propagation history.
    pub pure_propagation: bool,
    pub def: Arc<dyn RuleDef>,
    pub vars: Rc<RuleVars>,
}

/// Compiled occurrences grouped by entry predicate, in registration order.
pub type OccurrenceTable = FxHashMap<PredId, Rc<Vec<Occurrence>>>;

/// Compile every registered rule against this worker's stores (lookup
/// generation creates the stores' secondary indices here). The registry is
/// expected to be validated already.
pub fn compile_rules(registry: &Registry, stores: &mut Stores) -> OccurrenceTable {
    let mut table: FxHashMap<PredId, Vec<Occurrence>> = FxHashMap::default();

    for (rule_id, def) in registry.rules() {
        let vars = Rc::new(RuleVars::for_rule(def.as_ref()));
        let simplify = def.simplify(&vars);
        let propagate = def.propagate(&vars);
        let pure_propagation = simplify.is_empty();

        let entries: Vec<(bool, Fact)> = simplify
            .into_iter()
            .map(|f| (false, f))
            .chain(propagate.into_iter().map(|f| (true, f)))
            .collect();

        for occ_idx in 0..entries.len() {
            let (entry_propagated, entry) = entries[occ_idx].clone();
            let partners: Vec<(bool, Fact)> = entries
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != occ_idx)
                .map(|(_, e)| e.clone())
                .collect();

            // Plan with the entry's variables counted as bound.
            entry.placeholder_bind_terms();
            let mut steps = Vec::new();
            let deferred = schedule_guards(def.guards(&vars), &mut steps);
            order_partners(stores, partners, deferred, &mut steps);

            for (_, head) in &entries {
                head.unbind_terms();
            }
            vars.unbind_all();

            table.entry(entry.pred).or_default().push(Occurrence {
                rule: rule_id,
                occ_idx,
                label: format!("{}#{}", def.name(), occ_idx),
                entry_propagated,
                entry,
                steps,
                pure_propagation,
                def: Arc::clone(def),
                vars: Rc::clone(&vars),
            });
        }
    }

    table
        .into_iter()
        .map(|(pred, occs)| (pred, Rc::new(occs)))
        .collect()
}

/// Move every guard that is ground under current bindings into the step
/// list; return the rest for later scheduling.
fn schedule_guards(guards: Vec<Guard>, steps: &mut Vec<MatchStep>) -> Vec<Guard> {
    let mut deferred = Vec::new();
    for guard in guards {
        if guard.is_ground() {
            steps.push(MatchStep::Check(guard));
        } else {
            deferred.push(guard);
        }
    }
    deferred
}

/// Greedy join ordering: repeatedly pick the partner with the best score
///
/// ```text
/// 10 * bound-positions + newly-schedulable-guards + constants - free-positions
/// ```
///
/// with ties to the earliest partner, emit its lookup step, count it as
/// bound, and schedule every guard that just became ground.
fn order_partners(
    stores: &mut Stores,
    mut partners: Vec<(bool, Fact)>,
    mut guards: Vec<Guard>,
    steps: &mut Vec<MatchStep>,
) {
    while !partners.is_empty() {
        let mut best_idx = 0;
        let mut best_score = i64::MIN;
        let mut best_free: Vec<Term> = Vec::new();

        for (idx, (_, pattern)) in partners.iter().enumerate() {
            let mut joins = 0i64;
            let mut consts = 0i64;
            let mut free: Vec<Term> = Vec::new();
            for term in pattern.all_terms() {
                if term.is_var() {
                    if term.is_bound() {
                        joins += 1;
                    } else {
                        free.push(term.clone());
                    }
                } else if term.is_const() {
                    consts += 1;
                }
            }

            // Speculatively bind this partner's free terms to see how many
            // deferred guards it would unlock, then undo.
            for t in &free {
                t.bind(crate::fact::placeholder());
            }
            let unlocked = guards.iter().filter(|g| g.is_ground()).count() as i64;
            for t in &free {
                t.unbind();
            }

            let score = joins * 10 + unlocked + consts - free.len() as i64;
            if score > best_score {
                best_score = score;
                best_idx = idx;
                best_free = free;
            }
        }

        let (propagated, pattern) = partners.remove(best_idx);
        let lookup = stores.store_mut(pattern.pred).generate_lookup(&pattern);
        let pred = pattern.pred;
        pattern.placeholder_bind_terms();
        steps.push(MatchStep::Lookup(LookupStep {
            propagated,
            pred,
            lookup,
            pattern,
            binds: best_free,
        }));
        guards = schedule_guards(guards, steps);
    }

    // Guards over variables no head binds: validation rejects these, but if
    // one slips through it is checked (and fails) rather than skipped.
    for guard in guards {
        steps.push(MatchStep::Check(guard));
    }
}
