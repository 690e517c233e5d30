//! Predicate and rule registration.
//!
//! One `Registry` is built at startup and shared (read-only) with every
//! worker; there is no process-wide mutable registration state. Validation
//! runs once, before any worker starts: descriptor errors are fatal
//! configuration errors, never runtime surprises.

use crate::fact::{PredId, RuleId};
use crate::rule::{RuleDef, RuleVars};
use hashbrown::{HashMap, HashSet};
use lasso::{Spur, ThreadedRodeo};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PredDecl {
    pub name: Spur,
    pub arity: usize,
}

pub struct Registry {
    names: ThreadedRodeo,
    preds: Vec<PredDecl>,
    pred_by_name: HashMap<Spur, PredId>,
    rules: Vec<Arc<dyn RuleDef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            names: ThreadedRodeo::new(),
            preds: Vec::new(),
            pred_by_name: HashMap::new(),
            rules: Vec::new(),
        }
    }

    /// Register a predicate symbol once; re-registering the same name with
    /// the same arity returns the existing symbol.
    ///
    /// # Panics
    ///
    /// Panics if the name was already registered with a different arity —
    /// the registry would otherwise hand out one symbol for two shapes.
    pub fn register_pred(&mut self, name: &str, arity: usize) -> PredId {
        let key = self.names.get_or_intern(name);
        if let Some(&id) = self.pred_by_name.get(&key) {
            let existing = &self.preds[id.0 as usize];
            if existing.arity != arity {
                panic!(
                    "predicate {name} re-registered with arity {arity} (was {})",
                    existing.arity
                );
            }
            return id;
        }
        let id = PredId(self.preds.len() as u32);
        self.preds.push(PredDecl { name: key, arity });
        self.pred_by_name.insert(key, id);
        id
    }

    pub fn register_rule(&mut self, def: Arc<dyn RuleDef>) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(def);
        id
    }

    pub fn pred_id(&self, name: &str) -> Option<PredId> {
        self.names
            .get(name)
            .and_then(|key| self.pred_by_name.get(&key).copied())
    }

    pub fn pred_name(&self, id: PredId) -> &str {
        self.names.resolve(&self.preds[id.0 as usize].name)
    }

    pub fn pred_arity(&self, id: PredId) -> usize {
        self.preds[id.0 as usize].arity
    }

    pub fn pred_count(&self) -> usize {
        self.preds.len()
    }

    pub fn pred_ids(&self) -> impl Iterator<Item = PredId> {
        (0..self.preds.len() as u32).map(PredId)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &Arc<dyn RuleDef>)> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, def)| (RuleId(i as u32), def))
    }

    /// Check every rule's head patterns and guard scope against the
    /// registered predicates. Called once before any worker starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for def in &self.rules {
            let vars = RuleVars::for_rule(def.as_ref());
            let heads: Vec<_> = def
                .simplify(&vars)
                .into_iter()
                .chain(def.propagate(&vars))
                .collect();
            if heads.is_empty() {
                return Err(ConfigError::EmptyHead {
                    rule: def.name().to_string(),
                });
            }
            let mut head_vars: HashSet<u32> = HashSet::new();
            for head in &heads {
                let Some(decl) = self.preds.get(head.pred.0 as usize) else {
                    return Err(ConfigError::UnknownPredicate {
                        rule: def.name().to_string(),
                        pred: head.pred,
                    });
                };
                if head.args.len() != decl.arity {
                    return Err(ConfigError::ArityMismatch {
                        rule: def.name().to_string(),
                        pred: self.names.resolve(&decl.name).to_string(),
                        expected: decl.arity,
                        found: head.args.len(),
                    });
                }
                for t in head.all_terms() {
                    if let crate::term::Term::Var(cell) = t {
                        head_vars.insert(cell.id());
                    }
                }
            }
            for guard in def.guards(&vars) {
                for t in guard.terms() {
                    if let crate::term::Term::Var(cell) = t {
                        if !head_vars.contains(&cell.id()) {
                            return Err(ConfigError::GuardOutOfScope {
                                rule: def.name().to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("preds", &self.preds.len())
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Startup configuration errors: a rule descriptor referenced something the
/// registry does not know, or initial goals are not routable.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    UnknownPredicate {
        rule: String,
        pred: PredId,
    },
    ArityMismatch {
        rule: String,
        pred: String,
        expected: usize,
        found: usize,
    },
    EmptyHead {
        rule: String,
    },
    GuardOutOfScope {
        rule: String,
    },
    UngroundGoal {
        pred: String,
    },
    UnlocatedGoal {
        pred: String,
    },
    BadLocation {
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownPredicate { rule, pred } => {
                write!(f, "rule {rule} references unregistered predicate #{}", pred.0)
            }
            ConfigError::ArityMismatch {
                rule,
                pred,
                expected,
                found,
            } => write!(
                f,
                "rule {rule} uses {pred}/{found}, registered as {pred}/{expected}"
            ),
            ConfigError::EmptyHead { rule } => {
                write!(f, "rule {rule} has no head atoms")
            }
            ConfigError::GuardOutOfScope { rule } => {
                write!(f, "rule {rule} has a guard over variables not bound by any head")
            }
            ConfigError::UngroundGoal { pred } => {
                write!(f, "initial goal {pred} has unbound arguments")
            }
            ConfigError::UnlocatedGoal { pred } => {
                write!(f, "initial goal {pred} carries no location")
            }
            ConfigError::BadLocation { value } => {
                write!(f, "malformed location {value:?}")
            }
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::rule::Guard;
    use crate::term::Term;

    struct Bad {
        pred: PredId,
        arity: usize,
    }

    impl RuleDef for Bad {
        fn name(&self) -> &str {
            "bad"
        }

        fn var_count(&self) -> usize {
            self.arity
        }

        fn simplify(&self, v: &RuleVars) -> Vec<Fact> {
            vec![Fact::new(
                self.pred,
                (0..self.arity).map(|i| v.var(i)),
            )]
        }
    }

    #[test]
    fn registration_is_stable() {
        let mut reg = Registry::new();
        let a = reg.register_pred("edge", 2);
        let b = reg.register_pred("node", 1);
        assert_ne!(a, b);
        assert_eq!(reg.register_pred("edge", 2), a);
        assert_eq!(reg.pred_id("node"), Some(b));
        assert_eq!(reg.pred_name(a), "edge");
        assert_eq!(reg.pred_arity(a), 2);
    }

    #[test]
    fn validate_rejects_unknown_predicate() {
        let mut reg = Registry::new();
        reg.register_rule(Arc::new(Bad {
            pred: PredId(7),
            arity: 1,
        }));
        assert!(matches!(
            reg.validate(),
            Err(ConfigError::UnknownPredicate { .. })
        ));
    }

    #[test]
    fn validate_rejects_arity_mismatch() {
        let mut reg = Registry::new();
        let p = reg.register_pred("p", 2);
        reg.register_rule(Arc::new(Bad { pred: p, arity: 1 }));
        assert!(matches!(
            reg.validate(),
            Err(ConfigError::ArityMismatch { .. })
        ));
    }

    struct LooseGuard {
        pred: PredId,
    }

    impl RuleDef for LooseGuard {
        fn name(&self) -> &str {
            "loose"
        }

        fn var_count(&self) -> usize {
            1
        }

        fn simplify(&self, v: &RuleVars) -> Vec<Fact> {
            vec![Fact::new(self.pred, [v.var(0)])]
        }

        fn guards(&self, v: &RuleVars) -> Vec<Guard> {
            let stray = Term::var();
            vec![Guard::lt(&v.var(0), &stray)]
        }
    }

    #[test]
    fn validate_rejects_unscoped_guard() {
        let mut reg = Registry::new();
        let p = reg.register_pred("p", 1);
        reg.register_rule(Arc::new(LooseGuard { pred: p }));
        assert!(matches!(
            reg.validate(),
            Err(ConfigError::GuardOutOfScope { .. })
        ));
    }
}
