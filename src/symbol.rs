//! Global symbol interning.
//!
//! Every identifier that flows through the compiler — namespace
//! components, function/variable/struct/enum names, once-tags, typemap
//! keys — is interned once and thereafter compared by the cheap [`Symbol`]
//! handle rather than by string content.

use std::cell::RefCell;
use std::fmt;
use hashbrown::HashMap;

/// An interned string. Two `Symbol`s compare equal iff they were interned
/// from equal strings by the same [`Interner`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
  /// The reserved symbol for `_`, the "don't care" / blank identifier.
  pub const UNDER: Symbol = Symbol(0);

  #[must_use] pub fn into_usize(self) -> usize { self.0 as usize }
}

impl fmt::Debug for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    with_interner(|i| write!(f, "{:?}", i.resolve(*self)))
  }
}

impl fmt::Display for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    with_interner(|i| f.write_str(i.resolve(*self)))
  }
}

/// Symbols serialize as their resolved text rather than their raw index,
/// so a DTM (spec.md §4.8) is portable across processes whose interners
/// assigned different indices to the same names.
impl serde::Serialize for Symbol {
  fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&self.to_string())
  }
}

impl<'de> serde::Deserialize<'de> for Symbol {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    Ok(intern(&s))
  }
}

/// A string interner. Strings are leaked into the process to obtain
/// `'static` string slices cheaply comparable by pointer once interned;
/// this is acceptable because `Symbol`s are permanent for the lifetime
/// of the process (spec.md §3 "Types are permanent within the process"
/// applies equally to the names that identify them).
#[derive(Default)]
pub struct Interner {
  map: HashMap<&'static str, Symbol>,
  strings: Vec<&'static str>,
}

impl Interner {
  #[must_use] pub fn new() -> Self {
    let mut i = Interner::default();
    let under = i.intern_fresh("_");
    debug_assert_eq!(under, Symbol::UNDER);
    i
  }

  fn intern_fresh(&mut self, s: &str) -> Symbol {
    let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
    let sym = Symbol(self.strings.len() as u32);
    self.strings.push(leaked);
    self.map.insert(leaked, sym);
    sym
  }

  /// Intern `s`, returning an existing symbol if one is already registered.
  pub fn intern(&mut self, s: &str) -> Symbol {
    if let Some(&sym) = self.map.get(s) { return sym }
    self.intern_fresh(s)
  }

  /// Resolve a symbol back to its string. Panics if `sym` was not produced
  /// by this interner; this is an internal invariant, not a user error.
  #[must_use] pub fn resolve(&self, sym: Symbol) -> &'static str {
    self.strings[sym.0 as usize]
  }
}

thread_local! {
  static INTERNER: RefCell<Interner> = RefCell::new(Interner::new());
}

fn with_interner<R>(f: impl FnOnce(&Interner) -> R) -> R {
  INTERNER.with(|i| f(&i.borrow()))
}

/// Intern a string against the process-wide interner.
pub fn intern(s: &str) -> Symbol {
  INTERNER.with(|i| i.borrow_mut().intern(s))
}

/// Resolve a symbol against the process-wide interner.
#[must_use] pub fn resolve(sym: Symbol) -> &'static str {
  with_interner(|i| i.resolve(sym))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_string_interns_to_same_symbol() {
    let a = intern("foo");
    let b = intern("foo");
    assert_eq!(a, b);
    assert_ne!(a, intern("bar"));
  }

  #[test]
  fn resolve_round_trips() {
    let s = intern("namespace.member");
    assert_eq!(resolve(s), "namespace.member");
  }

  #[test]
  fn under_is_reserved() {
    assert_eq!(resolve(Symbol::UNDER), "_");
  }
}
