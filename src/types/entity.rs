//! Declaration entities: [`Function`], [`Variable`], [`Struct`], [`Enum`]
//! (spec.md §3). These are what a [`crate::namespace::Namespace`] stores
//! and what the declaration forms (C6) build.

use crate::emit::{FuncHandle, StructHandle, ValueHandle};
use crate::span::FileSpan;
use crate::symbol::Symbol;
use crate::types::ty::Type;

/// Linkage classification (spec.md §3: "linkage ∈ {intern, extern,
/// extern-c, extern-weak, auto}").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Linkage {
  Intern,
  Extern,
  ExternC,
  ExternWeak,
  /// Inferred from context (e.g. a parameter or local never has
  /// explicit linkage); not itself a valid linkage for a top-level `def`.
  Auto,
}

impl Linkage {
  #[must_use] pub fn from_keyword(s: &str) -> Option<Self> {
    match s {
      "intern" => Some(Linkage::Intern),
      "extern" => Some(Linkage::Extern),
      "extern-c" => Some(Linkage::ExternC),
      "extern-weak" => Some(Linkage::ExternWeak),
      "auto" => Some(Linkage::Auto),
      _ => None,
    }
  }
}

/// A per-unit once-tag, the textual label spec.md §3/§4.8 attaches to
/// declarations and modules to de-duplicate re-inclusion.
pub type OnceTag = Symbol;

/// A declared variable: a global, a function parameter, or a local.
/// (spec.md §3 "Variable".)
#[derive(Clone, Debug)]
pub struct Variable {
  pub name: Symbol,
  pub ty: Type,
  pub linkage: Linkage,
  pub handle: Option<ValueHandle>,
  pub once_tag: Option<OnceTag>,
  pub span: FileSpan,
}

impl Variable {
  #[must_use] pub fn param(name: Symbol, ty: Type, span: FileSpan) -> Self {
    Variable { name, ty, linkage: Linkage::Auto, handle: None, once_tag: None, span }
  }
}

/// A declared function or macro (spec.md §3 "Function"). A macro's
/// `params` carries a leading implicit macro-context parameter ahead of
/// the user-visible parameters (spec.md §4.5).
#[derive(Clone, Debug)]
pub struct Function {
  pub name: Symbol,
  pub ret: Type,
  pub params: Vec<Variable>,
  pub linkage: Linkage,
  pub is_macro: bool,
  pub is_setf_fn: bool,
  /// Compile-time-only: available at JIT time but never linked into a
  /// final executable (spec.md glossary "CTO").
  pub cto: bool,
  pub once_tag: Option<OnceTag>,
  pub handle: Option<FuncHandle>,
  pub span: FileSpan,
  pub mangled_name: String,
}

impl Function {
  /// The function's non-implicit parameters: for a macro, skips the
  /// leading macro-context parameter.
  #[must_use] pub fn user_params(&self) -> &[Variable] {
    if self.is_macro && !self.params.is_empty() { &self.params[1..] } else { &self.params }
  }

  /// Whether this function accepts a trailing `varargs` parameter
  /// (spec.md §3 invariant (b): "the sentinel varargs appears only as
  /// the final parameter").
  #[must_use] pub fn is_variadic(&self) -> bool {
    matches!(self.params.last().map(|v| &*v.ty), Some(crate::types::ty::TypeKind::Base(crate::types::ty::BaseTag::Varargs)))
  }

  /// The number of required (non-varargs) parameters.
  #[must_use] pub fn required_arity(&self) -> usize {
    let n = self.user_params().len();
    if self.is_variadic() { n - 1 } else { n }
  }
}

/// A struct member: a named field, possibly a bitfield (encoded in
/// `ty` as `TypeKind::Bitfield`, spec.md §4.3).
#[derive(Clone, Debug)]
pub struct StructMember {
  pub name: Symbol,
  pub ty: Type,
}

/// A declared struct (spec.md §3 "Struct").
#[derive(Clone, Debug)]
pub struct Struct {
  pub name: Symbol,
  pub members: Vec<StructMember>,
  pub linkage: Linkage,
  pub once_tag: Option<OnceTag>,
  /// The mangled (internal) name used for the emitted IR struct type.
  pub internal_name: String,
  pub handle: Option<StructHandle>,
  pub span: FileSpan,
}

impl Struct {
  #[must_use] pub fn member(&self, name: Symbol) -> Option<(usize, &StructMember)> {
    self.members.iter().enumerate().find(|(_, m)| m.name == name)
  }
}

/// One `(name value)` pair of a declared enum.
#[derive(Clone, Copy, Debug)]
pub struct EnumMember {
  pub name: Symbol,
  pub value: i64,
}

/// A declared enum (spec.md §3 "Enum"). Every enum is also projected
/// into a one-field struct (the discriminant) "so that it participates
/// uniformly in value lowering".
#[derive(Clone, Debug)]
pub struct Enum {
  pub name: Symbol,
  pub underlying: Type,
  pub members: Vec<EnumMember>,
  pub linkage: Linkage,
  pub once_tag: Option<OnceTag>,
  pub span: FileSpan,
  pub projected_struct: Struct,
}

impl Enum {
  #[must_use] pub fn member_value(&self, name: Symbol) -> Option<i64> {
    self.members.iter().find(|m| m.name == name).map(|m| m.value)
  }

  /// Build the projected single-field struct for an enum named `name`
  /// with the given discriminant field name and underlying type.
  #[must_use] pub fn project_struct(
    name: Symbol, discriminant_field: Symbol, underlying: Type,
    linkage: Linkage, once_tag: Option<OnceTag>, internal_name: String, span: FileSpan,
  ) -> Struct {
    Struct {
      name,
      members: vec![StructMember { name: discriminant_field, ty: underlying }],
      linkage, once_tag, internal_name, handle: None, span,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{FileSpan, Position, Span};
  use crate::symbol::intern;
  use crate::types::ty::{NativeTypes, TypeRegistry};
  use std::rc::Rc;

  fn span() -> FileSpan {
    FileSpan::new(Rc::from("t.dt"), Span::new(Position::new(1, 1), Position::new(1, 2)))
  }

  #[test]
  fn macro_user_params_skips_implicit_context() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let void = r.basic(crate::types::ty::BaseTag::Void);
    let ctx_ty = r.pointer(void.clone());
    let f = Function {
      name: intern("twice"), ret: void.clone(),
      params: vec![
        Variable::param(intern("mc"), ctx_ty, span()),
        Variable::param(intern("n"), void, span()),
      ],
      linkage: Linkage::Extern, is_macro: true, is_setf_fn: false, cto: false,
      once_tag: None, handle: None, span: span(), mangled_name: "twice".into(),
    };
    assert_eq!(f.user_params().len(), 1);
    assert_eq!(f.user_params()[0].name, intern("n"));
  }

  #[test]
  fn variadic_detection_and_required_arity() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let void = r.basic(crate::types::ty::BaseTag::Void);
    let int = r.basic(crate::types::ty::BaseTag::I32);
    let va = r.basic(crate::types::ty::BaseTag::Varargs);
    let f = Function {
      name: intern("printf"), ret: int.clone(),
      params: vec![Variable::param(intern("fmt"), int.clone(), span()), Variable::param(Symbol::UNDER, va, span())],
      linkage: Linkage::ExternC, is_macro: false, is_setf_fn: false, cto: false,
      once_tag: None, handle: None, span: span(), mangled_name: "printf".into(),
    };
    assert!(f.is_variadic());
    assert_eq!(f.required_arity(), 1);
  }
}
