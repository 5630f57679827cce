//! The namespace tree (C3, spec.md §3 "Namespace & Context", §4.2).
//!
//! A [`Namespace`] maps each name to four *independent* slots: an
//! overload set of [`Function`]s, a single [`Variable`], a single
//! [`Struct`], a single [`Enum`]. Namespaces form a tree rooted at the
//! anonymous global namespace; child namespaces are reached by
//! qualified (dot-separated) name.

use hashbrown::HashMap;
use hashbrown::HashSet;
use crate::emit::Emitter;
use crate::symbol::Symbol;
use crate::types::entity::{Enum, Function, OnceTag, Struct, Variable};
use crate::types::ty::TypeRegistry;

/// Why inserting a declaration into a namespace failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
  /// Same name, different category of declaration (spec.md §3: a name
  /// identifies up to one binding per category, but those categories
  /// don't arbitrate between each other — this covers the case of
  /// redeclaring e.g. a struct where a struct already exists).
  RedeclarationStruct,
  RedeclarationEnum,
  RedeclarationVariable,
  /// A function overload with an identical signature already exists
  /// (spec.md §4.2: "Adding a function that duplicates an existing
  /// overload ... is an error").
  DuplicateOverload,
}

/// Everything one name can be bound to within one namespace.
#[derive(Default, Clone)]
pub struct NameEntry {
  pub functions: Vec<Function>,
  pub variable: Option<Variable>,
  pub struct_: Option<Struct>,
  pub enum_: Option<Enum>,
}

/// One node of the namespace tree.
#[derive(Clone)]
pub struct Namespace {
  /// This namespace's own name; empty (`Symbol::UNDER`-free convention:
  /// we use `None`) for the anonymous root.
  pub name: Option<Symbol>,
  entries: HashMap<Symbol, NameEntry>,
  children: HashMap<Symbol, Namespace>,
}

impl Namespace {
  #[must_use] pub fn root() -> Self {
    Namespace { name: None, entries: HashMap::new(), children: HashMap::new() }
  }

  #[must_use] pub fn new_child(name: Symbol) -> Self {
    Namespace { name: Some(name), entries: HashMap::new(), children: HashMap::new() }
  }

  #[must_use] pub fn child(&self, name: Symbol) -> Option<&Namespace> { self.children.get(&name) }
  #[must_use] pub fn child_mut(&mut self, name: Symbol) -> Option<&mut Namespace> { self.children.get_mut(&name) }

  /// Get or create the child namespace named `name`.
  pub fn ensure_child(&mut self, name: Symbol) -> &mut Namespace {
    self.children.entry(name).or_insert_with(|| Namespace::new_child(name))
  }

  /// Descend the tree along `path`, creating namespaces as needed
  /// (spec.md §4.4 `namespace` form).
  pub fn ensure_path(&mut self, path: &[Symbol]) -> &mut Namespace {
    let mut ns = self;
    for &seg in path { ns = ns.ensure_child(seg); }
    ns
  }

  /// Descend the tree along `path` without creating anything.
  #[must_use] pub fn resolve_path(&self, path: &[Symbol]) -> Option<&Namespace> {
    let mut ns = self;
    for &seg in path { ns = ns.child(seg)?; }
    Some(ns)
  }

  #[must_use] pub fn entry(&self, name: Symbol) -> Option<&NameEntry> { self.entries.get(&name) }

  /// All names declared directly in this namespace (not its children),
  /// for nearest-match diagnostics (spec.md §7 "...NotInScopeWithClosest").
  pub fn names(&self) -> impl Iterator<Item = Symbol> + '_ { self.entries.keys().copied() }

  /// All `(name, entry)` pairs declared directly in this namespace, used
  /// by the DTM packager (C9) to walk the whole declaration set when
  /// serializing (spec.md §4.8 "A serialized Context").
  pub fn entries_iter(&self) -> impl Iterator<Item = (Symbol, &NameEntry)> { self.entries.iter().map(|(&k, v)| (k, v)) }

  /// All `(name, child)` pairs of this namespace's direct children.
  pub fn children_iter(&self) -> impl Iterator<Item = (Symbol, &Namespace)> { self.children.iter().map(|(&k, v)| (k, v)) }

  /// Mutable `(name, child)` pairs of this namespace's direct children,
  /// used by the DTM packager's symbol-list filtering (spec.md §4.8 step
  /// 8) to recurse into every level while pruning.
  pub fn children_iter_mut(&mut self) -> impl Iterator<Item = (Symbol, &mut Namespace)> { self.children.iter_mut().map(|(&k, v)| (k, v)) }

  /// Drop `name`'s entire entry (every category) from this namespace
  /// directly, used by `import`'s symbol-list restriction.
  pub fn remove_entry(&mut self, name: Symbol) { self.entries.remove(&name); }

  fn entry_mut(&mut self, name: Symbol) -> &mut NameEntry {
    self.entries.entry(name).or_default()
  }

  #[must_use] pub fn functions(&self, name: Symbol) -> &[Function] {
    self.entries.get(&name).map_or(&[], |e| &e.functions)
  }

  #[must_use] pub fn variable(&self, name: Symbol) -> Option<&Variable> {
    self.entries.get(&name).and_then(|e| e.variable.as_ref())
  }

  #[must_use] pub fn struct_(&self, name: Symbol) -> Option<&Struct> {
    self.entries.get(&name).and_then(|e| e.struct_.as_ref())
  }

  #[must_use] pub fn enum_(&self, name: Symbol) -> Option<&Enum> {
    self.entries.get(&name).and_then(|e| e.enum_.as_ref())
  }

  /// Insert a function overload. Fails if an existing overload has the
  /// same parameter signature, ignoring constness of by-value arguments
  /// (spec.md §4.2).
  pub fn insert_function(&mut self, reg: &TypeRegistry, f: Function) -> Result<(), InsertError> {
    let name = f.name;
    let e = self.entry_mut(name);
    for existing in &e.functions {
      if same_signature(reg, existing, &f) { return Err(InsertError::DuplicateOverload) }
    }
    e.functions.push(f);
    Ok(())
  }

  pub fn insert_variable(&mut self, v: Variable) -> Result<(), InsertError> {
    let e = self.entry_mut(v.name);
    if e.variable.is_some() { return Err(InsertError::RedeclarationVariable) }
    e.variable = Some(v);
    Ok(())
  }

  pub fn insert_struct(&mut self, s: Struct) -> Result<(), InsertError> {
    let e = self.entry_mut(s.name);
    if e.struct_.is_some() { return Err(InsertError::RedeclarationStruct) }
    e.struct_ = Some(s);
    Ok(())
  }

  pub fn insert_enum(&mut self, en: Enum) -> Result<(), InsertError> {
    let e = self.entry_mut(en.name);
    if e.enum_.is_some() { return Err(InsertError::RedeclarationEnum) }
    e.enum_ = Some(en);
    Ok(())
  }

  /// Fold `other`'s declarations into `self` (spec.md §4.2 "Merging").
  /// Function overload sets are unioned with de-duplication; a
  /// colliding struct/enum must be identical (same once-tag or same
  /// body) or this is an error.
  pub fn merge(&mut self, reg: &TypeRegistry, other: &Namespace) -> Result<(), MergeError> {
    for (&name, other_entry) in &other.entries {
      let mine = self.entries.entry(name).or_default();
      for f in &other_entry.functions {
        if !mine.functions.iter().any(|existing| same_signature(reg, existing, f)) {
          mine.functions.push(f.clone());
        }
      }
      if let Some(v) = &other_entry.variable {
        if mine.variable.is_none() { mine.variable = Some(v.clone()); }
      }
      if let Some(s) = &other_entry.struct_ {
        match &mine.struct_ {
          None => mine.struct_ = Some(s.clone()),
          Some(existing) if structs_compatible(existing, s) => {}
          Some(_) => return Err(MergeError::IncompatibleStruct(name)),
        }
      }
      if let Some(en) = &other_entry.enum_ {
        match &mine.enum_ {
          None => mine.enum_ = Some(en.clone()),
          Some(existing) if enums_compatible(existing, en) => {}
          Some(_) => return Err(MergeError::IncompatibleEnum(name)),
        }
      }
    }
    for (&name, other_child) in &other.children {
      self.merge_child(reg, name, other_child)?;
    }
    Ok(())
  }

  fn merge_child(&mut self, reg: &TypeRegistry, name: Symbol, other_child: &Namespace) -> Result<(), MergeError> {
    self.ensure_child(name).merge(reg, other_child)
  }

  /// Remove any Struct/Enum whose once-tag is in `tags`, and clear the
  /// bodies of Functions/Variables carrying one of those tags (spec.md
  /// §4.2 "once-guard erasure").
  pub fn erase_once_tagged(&mut self, tags: &HashSet<OnceTag>) {
    for entry in self.entries.values_mut() {
      entry.functions.retain(|f| !f.once_tag.is_some_and(|t| tags.contains(&t)));
      if entry.variable.as_ref().is_some_and(|v| v.once_tag.is_some_and(|t| tags.contains(&t))) {
        entry.variable = None;
      }
      if entry.struct_.as_ref().is_some_and(|s| s.once_tag.is_some_and(|t| tags.contains(&t))) {
        entry.struct_ = None;
      }
      if entry.enum_.as_ref().is_some_and(|e| e.once_tag.is_some_and(|t| tags.contains(&t))) {
        entry.enum_ = None;
      }
    }
    for child in self.children.values_mut() { child.erase_once_tagged(tags); }
  }

  /// Remove all macro functions (spec.md §4.9 "erase all macros").
  pub fn erase_macros(&mut self) {
    for entry in self.entries.values_mut() { entry.functions.retain(|f| !f.is_macro); }
    for child in self.children.values_mut() { child.erase_macros(); }
  }

  /// Remove all compile-time-only functions (spec.md §4.9 "erase ... cto
  /// functions from the combined IR").
  pub fn erase_ctos(&mut self) {
    for entry in self.entries.values_mut() { entry.functions.retain(|f| !f.cto); }
    for child in self.children.values_mut() { child.erase_ctos(); }
  }

  /// After a module has been re-linked, replace stale IR value handles
  /// by looking each declaration up by its mangled name in the new
  /// module (spec.md §4.8 "Reget-pointers").
  pub fn reget_pointers(&mut self, emitter: &impl Emitter) {
    for entry in self.entries.values_mut() {
      for f in &mut entry.functions {
        if let Some(h) = emitter.resolve_function_by_name(&f.mangled_name) { f.handle = Some(h); }
      }
      if let Some(v) = &mut entry.variable {
        if let Some(h) = emitter.resolve_global_by_name(&v.name.to_string()) { v.handle = Some(h); }
      }
    }
    for child in self.children.values_mut() { child.reget_pointers(emitter); }
  }

  /// Visit every namespace in the tree, `self` first (used by the
  /// driver to walk the whole declaration set, e.g. when computing
  /// `--static` link sets).
  pub fn walk(&self, f: &mut impl FnMut(&Namespace)) {
    f(self);
    for child in self.children.values() { child.walk(f); }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
  IncompatibleStruct(Symbol),
  IncompatibleEnum(Symbol),
}

fn same_signature(reg: &TypeRegistry, a: &Function, b: &Function) -> bool {
  let ap = a.user_params();
  let bp = b.user_params();
  if ap.len() != bp.len() { return false }
  ap.iter().zip(bp.iter()).all(|(x, y)| reg.equal(&x.ty, &y.ty, true))
}

fn structs_compatible(a: &Struct, b: &Struct) -> bool {
  if a.once_tag.is_some() && a.once_tag == b.once_tag { return true }
  a.members.len() == b.members.len() &&
    a.members.iter().zip(b.members.iter()).all(|(x, y)| x.name == y.name)
}

fn enums_compatible(a: &Enum, b: &Enum) -> bool {
  if a.once_tag.is_some() && a.once_tag == b.once_tag { return true }
  a.members.len() == b.members.len() &&
    a.members.iter().zip(b.members.iter()).all(|(x, y)| x.name == y.name && x.value == y.value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{FileSpan, Position, Span};
  use crate::symbol::intern;
  use crate::types::entity::Linkage;
  use crate::types::ty::{BaseTag, NativeTypes};
  use std::rc::Rc;

  fn span() -> FileSpan {
    FileSpan::new(Rc::from("t.dt"), Span::new(Position::new(1, 1), Position::new(1, 2)))
  }

  fn mkfn(reg: &mut TypeRegistry, name: &str, params: Vec<crate::types::ty::Type>) -> Function {
    let void = reg.basic(BaseTag::Void);
    Function {
      name: intern(name), ret: void,
      params: params.into_iter().map(|t| Variable::param(Symbol::UNDER, t, span())).collect(),
      linkage: Linkage::Extern, is_macro: false, is_setf_fn: false, cto: false,
      once_tag: None, handle: None, span: span(), mangled_name: name.into(),
    }
  }

  #[test]
  fn distinct_overloads_both_insert() {
    let mut reg = TypeRegistry::new(NativeTypes::default());
    let i = reg.basic(BaseTag::I32);
    let mut ns = Namespace::root();
    ns.insert_function(&reg, mkfn(&mut reg, "f", vec![i.clone()])).unwrap();
    ns.insert_function(&reg, mkfn(&mut reg, "f", vec![i.clone(), i])).unwrap();
    assert_eq!(ns.functions(intern("f")).len(), 2);
  }

  #[test]
  fn duplicate_signature_is_rejected() {
    let mut reg = TypeRegistry::new(NativeTypes::default());
    let i = reg.basic(BaseTag::I32);
    let mut ns = Namespace::root();
    ns.insert_function(&reg, mkfn(&mut reg, "f", vec![i.clone()])).unwrap();
    let err = ns.insert_function(&reg, mkfn(&mut reg, "f", vec![i])).unwrap_err();
    assert_eq!(err, InsertError::DuplicateOverload);
  }

  #[test]
  fn once_guard_erasure_removes_tagged_struct() {
    let mut ns = Namespace::root();
    let tag = intern("A");
    let s = Struct {
      name: intern("S"), members: vec![], linkage: Linkage::Intern,
      once_tag: Some(tag), internal_name: "S".into(), handle: None, span: span(),
    };
    ns.insert_struct(s).unwrap();
    let mut tags = HashSet::new();
    tags.insert(tag);
    ns.erase_once_tagged(&tags);
    assert!(ns.struct_(intern("S")).is_none());
  }
}
