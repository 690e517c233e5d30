//! Facts and goals.
//!
//! A `Fact` doubles as a head/consequent pattern (terms may be unbound
//! variables) and as a concrete instance (all terms ground). A `Goal` is the
//! flattened form queued for processing and shipped between locations.

use crate::term::{Term, Value};
use smallvec::SmallVec;
use std::error::Error;
use std::fmt;

/// Stable predicate symbol, assigned once at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PredId(pub u32);

/// Stable rule identifier, assigned once at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

/// Placeholder value the join-order planner binds free terms to while it
/// scores guard schedulability. Never observed by guard evaluation.
pub(crate) fn placeholder() -> Value {
    Value::Str(String::from("?"))
}

/// A predicate instance or pattern: symbol, ordered arguments, an optional
/// location tag, and a scheduling priority (lower pops first, 0 default).
#[derive(Clone, Debug)]
pub struct Fact {
    pub pred: PredId,
    pub args: SmallVec<[Term; 4]>,
    pub location: Option<Term>,
    pub priority: i32,
}

impl Fact {
    pub fn new(pred: PredId, args: impl IntoIterator<Item = Term>) -> Self {
        Self {
            pred,
            args: args.into_iter().collect(),
            location: None,
            priority: 0,
        }
    }

    /// Tag this fact with an owning location.
    pub fn at(mut self, loc: Term) -> Self {
        self.location = Some(loc);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Arguments followed by the location tag, if any.
    pub fn all_terms(&self) -> impl Iterator<Item = &Term> {
        self.args.iter().chain(self.location.iter())
    }

    pub fn unbind_terms(&self) {
        for t in self.all_terms() {
            t.unbind();
        }
    }

    /// Bind every term (and the location) to a placeholder scalar. The
    /// join-order planner uses this to ask "which guards become ground if
    /// this partner is matched" without caring about actual values.
    pub(crate) fn placeholder_bind_terms(&self) {
        for t in self.all_terms() {
            t.bind(placeholder());
        }
    }

    /// Flatten the argument terms into ground values.
    pub fn flatten(&self) -> Result<Goal, UngroundTerm> {
        let mut values = Vec::with_capacity(self.args.len());
        for (position, t) in self.args.iter().enumerate() {
            match t.value() {
                Some(v) => values.push(v),
                None => {
                    return Err(UngroundTerm {
                        pred: self.pred,
                        position,
                    })
                }
            }
        }
        Ok(Goal {
            priority: self.priority,
            pred: self.pred,
            values: values.into_boxed_slice(),
        })
    }
}

/// A fact flattened for the goal queue: no terms, just ground scalars. The
/// store-assigned fact id is attached when the goal is activated, not here.
#[derive(Clone, Debug, PartialEq)]
pub struct Goal {
    pub priority: i32,
    pub pred: PredId,
    pub values: Box<[Value]>,
}

/// A fact was flattened while one of its arguments was still unbound.
#[derive(Clone, Debug)]
pub struct UngroundTerm {
    pub pred: PredId,
    pub position: usize,
}

impl fmt::Display for UngroundTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "argument {} of predicate #{} is not ground",
            self.position, self.pred.0
        )
    }
}

impl Error for UngroundTerm {}
