//! The Context (C3, spec.md §4.2): symbol resolution, overload
//! resolution, merging, once-guard erasure, and the save-point mechanism
//! used to roll back speculative macro-argument lowering (spec.md §4.7).

use std::rc::Rc;
use hashbrown::HashSet;
use crate::error::ErrorReporter;
use crate::namespace::{InsertError, Namespace};
use crate::symbol::Symbol;
use crate::types::entity::{Enum, Function, Linkage, OnceTag, Struct, Variable};
use crate::types::ty::{NativeTypes, QualifiedName, Type, TypeKind, TypeRegistry};

/// An argument's type as known to overload resolution: either a real
/// lowered [`Type`], or — when C7's tentative lowering during macro
/// argument preparation failed — a stand-in for "this might be a Node
/// the callee is a macro over" (spec.md §4.6 "Call", §4.7 step 2).
#[derive(Clone, Debug)]
pub enum ArgType {
  Typed(Type),
  PointerToNode,
}

/// Why a call failed to resolve to any candidate (spec.md §7).
#[derive(Debug, Clone)]
pub enum OverloadError {
  NotInScope,
  NotInScopeWithClosest(String),
  NoMatch,
}

/// The result of a successful overload resolution (spec.md §4.2 step 5).
#[derive(Clone, Debug)]
pub struct OverloadMatch {
  pub function: Function,
  pub is_macro: bool,
  /// Set when the match only succeeded via the extern-c C-interop
  /// relaxation (spec.md §4.2 step 4).
  pub via_c_interop: bool,
}

/// Symbol, namespace, and type resolution (spec.md §3 "Namespace &
/// Context", §4.2).
pub struct Context {
  pub root: Namespace,
  /// The used-namespaces stack, most-recently-pushed last; searched
  /// from the end (top) towards the start (spec.md §4.2 "most-recent
  /// first"). The root (global) namespace's empty path is always at
  /// the bottom.
  used: Vec<Rc<[Symbol]>>,
  /// The namespace path new declarations are inserted into.
  current_path: Rc<[Symbol]>,
  pub errors: ErrorReporter,
  pub types: TypeRegistry,
  anon_counter: u64,
}

/// A snapshot of the Context taken before a speculative operation
/// (spec.md §9 "Context save point"): the used-namespace stack depth,
/// the active namespace path, and the current namespace's declaration
/// tables. `restore` rewinds all of it, dropping anything added since.
pub struct SavePoint {
  used_depth: usize,
  current_path: Rc<[Symbol]>,
  current_ns_snapshot: Namespace,
}

impl Context {
  #[must_use] pub fn new(native: NativeTypes) -> Self {
    Context {
      root: Namespace::root(),
      used: vec![Rc::from(Vec::<Symbol>::new())],
      current_path: Rc::from(Vec::<Symbol>::new()),
      errors: ErrorReporter::new(),
      types: TypeRegistry::new(native),
      anon_counter: 0,
    }
  }

  #[must_use] pub fn current_path(&self) -> &[Symbol] { &self.current_path }

  /// A fresh, process-unique name for an anonymous struct type (spec.md
  /// §4.3 "Anonymous struct types").
  pub fn fresh_anon_name(&mut self) -> Symbol {
    let n = self.anon_counter;
    self.anon_counter += 1;
    crate::symbol::intern(&format!("__anon_struct_{n}"))
  }

  /// `namespace NAME ...`: descend into (creating if needed) a child
  /// namespace, make it both the insertion target and a used namespace,
  /// for the duration of the enclosed body (spec.md §4.4).
  pub fn push_namespace(&mut self, name: Symbol) {
    let mut path: Vec<Symbol> = self.current_path.to_vec();
    path.push(name);
    self.current_path = Rc::from(path);
    self.root.ensure_path(&self.current_path);
    self.used.push(self.current_path.clone());
  }

  pub fn pop_namespace(&mut self) {
    self.used.pop();
    let mut path: Vec<Symbol> = self.current_path.to_vec();
    path.pop();
    self.current_path = Rc::from(path);
  }

  /// `using-namespace PATH`: push a namespace onto the used stack
  /// without changing the insertion target.
  pub fn push_used_namespace(&mut self, path: Rc<[Symbol]>) { self.used.push(path); }
  pub fn pop_used_namespace(&mut self) { self.used.pop(); }

  /// Unqualified lookup order: the used-namespaces stack, most-recent
  /// first (spec.md §4.2).
  fn search_order(&self) -> impl Iterator<Item = &Namespace> {
    self.used.iter().rev().filter_map(|p| self.root.resolve_path(p))
  }

  #[must_use] pub fn lookup_variable(&self, name: Symbol) -> Option<&Variable> {
    self.search_order().find_map(|ns| ns.variable(name))
  }

  #[must_use] pub fn lookup_struct(&self, name: Symbol) -> Option<&Struct> {
    self.search_order().find_map(|ns| ns.struct_(name))
  }

  #[must_use] pub fn lookup_enum(&self, name: Symbol) -> Option<&Enum> {
    self.search_order().find_map(|ns| ns.enum_(name))
  }

  /// Qualified (dot-separated) lookup: descend the tree from the root.
  #[must_use] pub fn lookup_qualified_struct(&self, path: &[Symbol], name: Symbol) -> Option<&Struct> {
    self.root.resolve_path(path)?.struct_(name)
  }

  #[must_use] pub fn lookup_qualified_enum(&self, path: &[Symbol], name: Symbol) -> Option<&Enum> {
    self.root.resolve_path(path)?.enum_(name)
  }

  #[must_use] pub fn lookup_qualified_variable(&self, path: &[Symbol], name: Symbol) -> Option<&Variable> {
    self.root.resolve_path(path)?.variable(name)
  }

  /// All function overloads visible for `name`, collected across the
  /// whole used-namespaces stack (spec.md §4.2 step 1: "the candidate
  /// set over the used-namespaces stack").
  #[must_use] pub fn function_candidates(&self, name: Symbol) -> Vec<&Function> {
    let mut out = Vec::new();
    for ns in self.search_order() { out.extend(ns.functions(name)); }
    out
  }

  /// All names visible anywhere on the used-namespaces stack, for
  /// nearest-match suggestions (spec.md §7).
  fn visible_names(&self) -> Vec<Symbol> {
    let mut out = Vec::new();
    for ns in self.search_order() { out.extend(ns.names()); }
    out
  }

  pub fn insert_function(&mut self, f: Function) -> Result<(), InsertError> {
    let path = self.current_path.clone();
    self.root.ensure_path(&path).insert_function(&self.types, f)
  }

  pub fn insert_variable(&mut self, v: Variable) -> Result<(), InsertError> {
    let path = self.current_path.clone();
    self.root.ensure_path(&path).insert_variable(v)
  }

  pub fn insert_struct(&mut self, s: Struct) -> Result<(), InsertError> {
    let path = self.current_path.clone();
    self.root.ensure_path(&path).insert_struct(s)
  }

  pub fn insert_enum(&mut self, e: Enum) -> Result<(), InsertError> {
    let path = self.current_path.clone();
    self.root.ensure_path(&path).insert_enum(e)
  }

  /// Build the qualified name for `name` as declared at the current
  /// namespace path (spec.md §3 "identified by a qualified name plus
  /// the namespace path").
  #[must_use] pub fn qualify(&self, name: Symbol) -> QualifiedName {
    QualifiedName::new(self.current_path.clone(), name)
  }

  /// The reserved intrinsic type macros' parameters and return values
  /// are typed as: a pointer to the parser's Node type (spec.md §4.5).
  pub fn node_pointer_type(&mut self) -> Type {
    let node = self.types.named(QualifiedName::new(Rc::from(Vec::<Symbol>::new()), crate::symbol::intern("Node")));
    self.types.pointer(node)
  }

  /// Capture a save point for the current namespace (spec.md §9
  /// "Context save point").
  #[must_use] pub fn save(&mut self) -> SavePoint {
    let path = self.current_path.clone();
    let snap = self.root.ensure_path(&path).clone();
    SavePoint { used_depth: self.used.len(), current_path: path, current_ns_snapshot: snap }
  }

  /// Roll back to `sp`, dropping any declarations or used-namespace
  /// pushes made since (spec.md §4.7 "Rollback").
  pub fn restore(&mut self, sp: SavePoint) {
    self.used.truncate(sp.used_depth);
    self.current_path = sp.current_path;
    let path = self.current_path.clone();
    *self.root.ensure_path(&path) = sp.current_ns_snapshot;
  }

  /// Merge another unit's Context into this one (spec.md §4.8 step 9,
  /// §4.2 "Merging").
  pub fn merge(&mut self, other: &Context) -> Result<(), crate::namespace::MergeError> {
    self.root.merge(&other.types, &other.root)
  }

  /// `once`-guard erasure across the whole namespace tree (spec.md §4.2).
  pub fn erase_once_tagged(&mut self, tags: &HashSet<OnceTag>) { self.root.erase_once_tagged(tags); }
  pub fn erase_macros(&mut self) { self.root.erase_macros(); }
  pub fn erase_ctos(&mut self) { self.root.erase_ctos(); }

  /// Resolve an overload (spec.md §4.2). `args` is the lowered (or
  /// tentative) argument-type list in call order.
  pub fn resolve_overload(&self, name: Symbol, args: &[ArgType]) -> Result<OverloadMatch, OverloadError> {
    let candidates = self.function_candidates(name);
    if candidates.is_empty() {
      return Err(match nearest_match(name, &self.visible_names()) {
        Some(close) => OverloadError::NotInScopeWithClosest(close),
        None => OverloadError::NotInScope,
      });
    }

    let mut scored: Vec<(usize, usize, &Function)> = Vec::new();
    for (decl_idx, f) in candidates.iter().enumerate() {
      if let Some(exact_count) = self.match_candidate(f, args, false) {
        scored.push((exact_count, decl_idx, *f));
      }
    }
    if !scored.is_empty() {
      // Prefer (a) non-variadic over variadic, (b) exact-match count
      // descending, (c) first-declared among ties (spec.md §4.2 step 3).
      scored.sort_by(|a, b| {
        let a_variadic = a.2.is_variadic();
        let b_variadic = b.2.is_variadic();
        a_variadic.cmp(&b_variadic)
          .then(b.0.cmp(&a.0))
          .then(a.1.cmp(&b.1))
      });
      let (_, _, f) = scored[0];
      return Ok(OverloadMatch { function: f.clone(), is_macro: f.is_macro, via_c_interop: false });
    }

    // Step 4: the lone extern-c relaxation.
    let c_candidates: Vec<&Function> = candidates.iter().copied()
      .filter(|f| f.linkage == Linkage::ExternC)
      .collect();
    if let [f] = c_candidates[..] {
      if self.match_candidate(f, args, true).is_some() {
        return Ok(OverloadMatch { function: f.clone(), is_macro: f.is_macro, via_c_interop: true });
      }
    }
    Err(OverloadError::NoMatch)
  }

  /// Returns `Some(exact_match_count)` if `f` matches `args` under the
  /// ordinary rules (spec.md §4.2 step 2), or, when `c_interop_relax` is
  /// set, under the looser "attempt implicit casts on every argument"
  /// rule of step 4.
  fn match_candidate(&self, f: &Function, args: &[ArgType], c_interop_relax: bool) -> Option<usize> {
    let params = f.user_params();
    let required = f.required_arity();
    let variadic = f.is_variadic();
    if variadic { if args.len() < required { return None } }
    else if args.len() != params.len() { return None }

    let mut exact = 0;
    for (i, arg) in args.iter().enumerate() {
      let is_varargs_slot = variadic && i >= required;
      if is_varargs_slot {
        // Trailing varargs arguments match anything (spec.md §4.6 "For
        // variadic calls, trailing arguments undergo C-style promotion").
        continue;
      }
      let pty = &params[i].ty;
      let matched = match arg {
        ArgType::Typed(t) => {
          if self.types.equal(t, pty, false) { exact += 1; true }
          else if c_interop_relax { can_implicit_cast(&self.types, t, pty) }
          else { can_implicit_coerce(&self.types, t, pty) }
        }
        ArgType::PointerToNode => {
          matches!(&**pty, TypeKind::Pointer(inner) if matches!(&**inner, TypeKind::Named(q) if q.name == crate::symbol::intern("Node")))
        }
      };
      if !matched { return None }
    }
    Some(exact)
  }
}

/// Implicit numeric/bool coercion used by ordinary overload matching
/// and by cast elision (spec.md §4.6 "Numeric coercion rules").
/// Integer widening is implicit, narrowing is not; floating widening is
/// implicit; pointer<->integer conversions are never implicit.
#[must_use] pub fn can_implicit_coerce(reg: &TypeRegistry, from: &Type, to: &Type) -> bool {
  if reg.equal(from, to, false) { return true }
  if TypeRegistry::is_integer(from) && TypeRegistry::is_integer(to) {
    let (Some(fw), Some(tw)) = (reg.integer_size(from), reg.integer_size(to)) else { return false };
    let f_signed = TypeRegistry::is_signed(from);
    let t_signed = TypeRegistry::is_signed(to);
    return tw > fw || (tw == fw && f_signed == t_signed);
  }
  if TypeRegistry::is_floating(from) && TypeRegistry::is_floating(to) {
    let (Some(fr), Some(tr)) = (TypeRegistry::fp_relative_size(from), TypeRegistry::fp_relative_size(to)) else { return false };
    return tr >= fr;
  }
  false
}

/// The looser cast attempted for the single extern-c relaxation (spec.md
/// §4.2 step 4): any integer/bool conversion, widening or narrowing.
#[must_use] pub fn can_implicit_cast(reg: &TypeRegistry, from: &Type, to: &Type) -> bool {
  if reg.equal(from, to, false) { return true }
  (TypeRegistry::is_integer(from) || TypeRegistry::is_floating(from))
    && (TypeRegistry::is_integer(to) || TypeRegistry::is_floating(to))
}

/// A small nearest-match helper for the `...NotInScopeWithClosest`
/// diagnostic (spec.md §7). Not load-bearing for compilation
/// correctness, only diagnostic quality.
fn nearest_match(name: Symbol, candidates: &[Symbol]) -> Option<String> {
  let target = name.to_string();
  candidates.iter()
    .map(|c| (levenshtein(&target, &c.to_string()), c.to_string()))
    .filter(|(d, _)| *d <= 2 && *d > 0)
    .min_by_key(|(d, _)| *d)
    .map(|(_, s)| s)
}

fn levenshtein(a: &str, b: &str) -> usize {
  let a: Vec<char> = a.chars().collect();
  let b: Vec<char> = b.chars().collect();
  let mut prev: Vec<usize> = (0..=b.len()).collect();
  let mut cur = vec![0usize; b.len() + 1];
  for i in 1..=a.len() {
    cur[0] = i;
    for j in 1..=b.len() {
      let cost = usize::from(a[i - 1] != b[j - 1]);
      cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
    }
    std::mem::swap(&mut prev, &mut cur);
  }
  prev[b.len()]
}
