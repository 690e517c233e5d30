//! Rule descriptors: the entire surface the runtime requires from a front
//! end.
//!
//! A `RuleDef` exposes four pure functions of its variables — simplify and
//! propagate head patterns, guards, and consequents. The runtime instantiates
//! the variables once per worker (`RuleVars`) and compiles one matching
//! function per head atom; `consequents` is only invoked under full bindings
//! when an occurrence fires.

use crate::fact::Fact;
use crate::term::{Term, Value};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// A rule as the front end describes it. Implementations hold no mutable
/// state; all binding flows through the `RuleVars` passed in.
pub trait RuleDef: Send + Sync {
    fn name(&self) -> &str;

    /// Number of universally quantified variables.
    fn var_count(&self) -> usize;

    /// Number of existential location variables (locations spawned on
    /// firing).
    fn exist_loc_count(&self) -> usize {
        0
    }

    /// Head atoms deleted when the rule fires.
    fn simplify(&self, _vars: &RuleVars) -> Vec<Fact> {
        Vec::new()
    }

    /// Head atoms kept when the rule fires.
    fn propagate(&self, _vars: &RuleVars) -> Vec<Fact> {
        Vec::new()
    }

    fn guards(&self, _vars: &RuleVars) -> Vec<Guard> {
        Vec::new()
    }

    /// Facts produced on firing, evaluated lazily under the bindings of the
    /// matched heads.
    fn consequents(&self, _vars: &RuleVars) -> Vec<Fact> {
        Vec::new()
    }
}

/// One worker's instantiation of a rule's variables. Every pattern a
/// `RuleDef` builds from these terms shares their binding cells.
pub struct RuleVars {
    vars: Vec<Term>,
    exist_locs: Vec<Term>,
}

impl RuleVars {
    pub fn for_rule(def: &dyn RuleDef) -> Self {
        Self {
            vars: Term::vars(def.var_count()),
            exist_locs: Term::vars(def.exist_loc_count()),
        }
    }

    /// The `i`th variable; the clone shares the binding cell.
    pub fn var(&self, i: usize) -> Term {
        self.vars[i].clone()
    }

    pub fn all(&self) -> &[Term] {
        &self.vars
    }

    pub fn exist_locs(&self) -> &[Term] {
        &self.exist_locs
    }

    /// Current value of the `i`th variable.
    pub fn value(&self, i: usize) -> Option<Value> {
        self.vars[i].value()
    }

    /// Current integer value of the `i`th variable, for consequent
    /// arithmetic.
    pub fn int(&self, i: usize) -> Option<i64> {
        match self.vars[i].value() {
            Some(Value::Int(n)) => Some(n),
            _ => None,
        }
    }

    /// `n` fresh destination names for rule bodies.
    pub fn exists(&self, n: usize) -> Vec<Term> {
        (0..n).map(|_| Term::fresh_name()).collect()
    }

    pub fn unbind_all(&self) {
        for t in self.vars.iter().chain(self.exist_locs.iter()) {
            t.unbind();
        }
    }
}

/// A boolean side condition over rule variables. Scheduled by the compiler
/// as soon as all of its terms are ground; evaluation on an unbound term is
/// false (the branch just fails).
#[derive(Clone)]
pub struct Guard {
    label: String,
    terms: SmallVec<[Term; 2]>,
    pred: Rc<dyn Fn(&[Value]) -> bool>,
}

impl Guard {
    pub fn new(
        label: impl Into<String>,
        terms: impl IntoIterator<Item = Term>,
        pred: impl Fn(&[Value]) -> bool + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            terms: terms.into_iter().collect(),
            pred: Rc::new(pred),
        }
    }

    fn cmp_op(label: &str, x: &Term, y: &Term, accept: fn(Ordering) -> bool) -> Self {
        Self::new(label, [x.clone(), y.clone()], move |vs| {
            matches!(compare(&vs[0], &vs[1]), Some(ord) if accept(ord))
        })
    }

    pub fn lt(x: &Term, y: &Term) -> Self {
        Self::cmp_op("<", x, y, |o| o == Ordering::Less)
    }

    pub fn le(x: &Term, y: &Term) -> Self {
        Self::cmp_op("<=", x, y, |o| o != Ordering::Greater)
    }

    pub fn eq(x: &Term, y: &Term) -> Self {
        Self::cmp_op("==", x, y, |o| o == Ordering::Equal)
    }

    pub fn ne(x: &Term, y: &Term) -> Self {
        Self::cmp_op("!=", x, y, |o| o != Ordering::Equal)
    }

    pub fn ge(x: &Term, y: &Term) -> Self {
        Self::cmp_op(">=", x, y, |o| o != Ordering::Less)
    }

    pub fn gt(x: &Term, y: &Term) -> Self {
        Self::cmp_op(">", x, y, |o| o == Ordering::Greater)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn is_ground(&self) -> bool {
        self.terms.iter().all(Term::is_ground)
    }

    pub fn eval(&self) -> bool {
        let mut values: SmallVec<[Value; 2]> = SmallVec::with_capacity(self.terms.len());
        for t in &self.terms {
            match t.value() {
                Some(v) => values.push(v),
                None => return false,
            }
        }
        (self.pred)(&values)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("label", &self.label)
            .field("arity", &self.terms.len())
            .finish()
    }
}

/// Scalar ordering used by the comparison guards: numerics by magnitude,
/// strings lexicographically, mixed kinds unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        _ => None,
    }
}
