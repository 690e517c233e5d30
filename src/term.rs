//! Scalar values and logic-variable terms.
//!
//! A `Term` is the unit every pattern and fact argument is made of: a
//! mutable variable cell, a constant, or a don't-care. Binding is destructive
//! and explicitly undone by whoever bound it; the search code treats this as
//! a single-entry trail and unbinds on every exit path.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// A ground scalar carried by facts: the only payloads the engine moves
/// between locations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // Mixed numerics compare by magnitude, like the guard operators.
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

static NEXT_VAR_ID: AtomicU32 = AtomicU32::new(1);

/// The shared binding cell of a variable. Cloning a `Term` clones the handle,
/// not the cell, which is how one rule variable shows up in several head
/// patterns at once.
#[derive(Clone, Debug)]
pub struct VarCell {
    id: u32,
    slot: Rc<RefCell<Option<Value>>>,
}

impl VarCell {
    fn fresh() -> Self {
        Self {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            slot: Rc::new(RefCell::new(None)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// A pattern/argument position: variable, constant, or don't-care.
#[derive(Clone, Debug)]
pub enum Term {
    Var(VarCell),
    Const(Value),
    DontCare,
}

impl Term {
    /// A fresh unbound variable.
    pub fn var() -> Self {
        Term::Var(VarCell::fresh())
    }

    /// A constant term.
    pub fn val(v: impl Into<Value>) -> Self {
        Term::Const(v.into())
    }

    pub fn dont_care() -> Self {
        Term::DontCare
    }

    /// `n` fresh variables.
    pub fn vars(n: usize) -> Vec<Term> {
        (0..n).map(|_| Term::var()).collect()
    }

    /// A fresh destination name: a constant carrying a unique token, used by
    /// rule bodies that need a name nobody else holds.
    pub fn fresh_name() -> Self {
        Term::Const(Value::Str(Uuid::new_v4().to_string()))
    }

    /// Bind a variable to a value. No-op on constants and don't-cares.
    pub fn bind(&self, v: Value) {
        if let Term::Var(cell) = self {
            *cell.slot.borrow_mut() = Some(v);
        }
    }

    /// Clear a variable's binding. No-op on constants and don't-cares.
    pub fn unbind(&self) {
        if let Term::Var(cell) = self {
            *cell.slot.borrow_mut() = None;
        }
    }

    /// The current value: a constant's payload, or a variable's binding.
    pub fn value(&self) -> Option<Value> {
        match self {
            Term::Var(cell) => cell.slot.borrow().clone(),
            Term::Const(v) => Some(v.clone()),
            Term::DontCare => None,
        }
    }

    /// Ground means "has a value": constants always, variables when bound.
    /// Don't-cares are never ground.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Var(cell) => cell.slot.borrow().is_some(),
            Term::Const(_) => true,
            Term::DontCare => false,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Term::Var(cell) if cell.slot.borrow().is_some())
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Term::Const(_))
    }

    pub fn is_dont_care(&self) -> bool {
        matches!(self, Term::DontCare)
    }
}

/// Diagnostic equality only; matching always goes through the store.
impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self.value(), other.value()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (Term::Var(a), Term::Var(b)) => a.id == b.id,
                (Term::DontCare, Term::DontCare) => true,
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::DontCare => write!(f, "_"),
            Term::Const(v) => write!(f, "{v}"),
            Term::Var(cell) => match cell.slot.borrow().as_ref() {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "${}", cell.id),
            },
        }
    }
}

/// Unbinds a slice of terms when dropped. Search frames use this so a trial's
/// bindings are released on every exit path, success or failure.
pub struct BindScope<'a> {
    terms: &'a [Term],
}

impl<'a> BindScope<'a> {
    pub fn new(terms: &'a [Term]) -> Self {
        Self { terms }
    }
}

impl Drop for BindScope<'_> {
    fn drop(&mut self) {
        for t in self.terms {
            t.unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_then_unbind_restores_groundness() {
        let v = Term::var();
        assert!(!v.is_ground());
        v.bind(Value::Int(7));
        assert!(v.is_ground());
        assert_eq!(v.value(), Some(Value::Int(7)));
        v.unbind();
        assert!(!v.is_ground());
        assert_eq!(v.value(), None);

        let c = Term::val(3);
        assert!(c.is_ground());
        c.bind(Value::Int(9));
        c.unbind();
        assert_eq!(c.value(), Some(Value::Int(3)));

        let d = Term::dont_care();
        assert!(!d.is_ground());
        d.bind(Value::Int(1));
        assert!(!d.is_ground());
    }

    #[test]
    fn clones_share_the_binding_cell() {
        let x = Term::var();
        let y = x.clone();
        x.bind(Value::Str("a".into()));
        assert_eq!(y.value(), Some(Value::Str("a".into())));
        y.unbind();
        assert!(!x.is_ground());
    }

    #[test]
    fn bind_scope_releases_on_drop() {
        let terms = vec![Term::var(), Term::var(), Term::val(1)];
        {
            let _scope = BindScope::new(&terms);
            terms[0].bind(Value::Int(1));
            terms[1].bind(Value::Int(2));
        }
        assert!(!terms[0].is_ground());
        assert!(!terms[1].is_ground());
        assert!(terms[2].is_ground());
    }

    #[test]
    fn mixed_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Str("2".into()));
    }

    #[test]
    fn fresh_names_are_distinct() {
        let a = Term::fresh_name();
        let b = Term::fresh_name();
        assert_ne!(a.value(), b.value());
    }
}
