//! The Type registry (C1, spec.md §4.1).
//!
//! Types are interned by structural identity: `TypeRegistry::intern`
//! returns the same [`Type`] handle for any two structurally equal
//! [`TypeKind`] values, so `Rc::ptr_eq` on two `Type`s agrees with
//! structural equality (spec.md §3 invariant (d)).

use std::rc::Rc;
use hashbrown::HashMap;
use crate::symbol::Symbol;

/// An interned type. Cloning is a refcount bump.
pub type Type = Rc<TypeKind>;

/// The base (non-composite) types of spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BaseTag {
  Void,
  /// The sentinel that may appear only as the final parameter of a
  /// function type (spec.md §3 invariant (b)).
  Varargs,
  I8, I16, I32, I64, I128,
  U8, U16, U32, U64, U128,
  /// Platform-width integers; concrete width comes from `NativeTypes`.
  Int, UInt, Size, Intptr, Ptrdiff,
  Bool,
  /// A distinct 8-bit integer (spec.md §4.6 "Char is a distinct 8-bit integer").
  Char,
  Float, Double, LongDouble,
}

/// A namespace path plus a terminal name, identifying a struct or enum
/// (spec.md §3 "a named aggregate ... identified by a qualified name
/// plus the namespace path in which it was declared").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QualifiedName {
  pub path: Rc<[Symbol]>,
  pub name: Symbol,
}

impl QualifiedName {
  #[must_use] pub fn new(path: Rc<[Symbol]>, name: Symbol) -> Self { QualifiedName { path, name } }

  #[must_use] pub fn dotted(&self) -> String {
    let mut s = String::new();
    for p in self.path.iter() { s.push_str(&p.to_string()); s.push('.'); }
    s.push_str(&self.name.to_string());
    s
  }
}

/// The shape of an interned [`Type`]. Named aggregates hold only their
/// qualified name, never a body — the body lives in the [`crate::context::Context`]'s
/// namespace tree, which is what keeps cyclic struct/enum references
/// well-founded (spec.md §9 "Cyclic type graphs").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
  Base(BaseTag),
  Pointer(Type),
  /// Array of element type with a size; `0` means unsized (spec.md §3).
  Array(Type, u64),
  /// A function type. `Varargs` may appear only as the last entry of `params`.
  Function { ret: Type, params: Rc<[Type]> },
  Named(QualifiedName),
  /// `(const T)` (spec.md §4.3).
  Const(Type),
  /// `(bitfield N T)`, legal only inside struct field declarations
  /// (spec.md §4.3); the width is carried on the type itself per the
  /// grammar, enforcement of "only inside struct fields" is the type
  /// form parser's job (C4), not the registry's.
  Bitfield(Type, u32),
}

/// Platform integer widths, the `NativeTypes` descriptor of spec.md §4.2.
#[derive(Clone, Copy, Debug)]
pub struct NativeTypes {
  pub int_bits: u32,
  pub uint_bits: u32,
  pub size_bits: u32,
  pub intptr_bits: u32,
  pub ptrdiff_bits: u32,
  pub pointer_bits: u32,
}

impl Default for NativeTypes {
  /// LP64 defaults (matching the original Dale compiler's x86-64 target).
  fn default() -> Self {
    NativeTypes { int_bits: 32, uint_bits: 32, size_bits: 64, intptr_bits: 64, ptrdiff_bits: 64, pointer_bits: 64 }
  }
}

/// The Type registry. Holds the intern table, the platform widths, and
/// the typemap of textual aliases registered by the preamble module
/// (spec.md §4.1 "The registry also holds a typemap").
pub struct TypeRegistry {
  interned: HashMap<TypeKind, Type>,
  pub native: NativeTypes,
  typemap: HashMap<String, String>,
}

impl TypeRegistry {
  #[must_use] pub fn new(native: NativeTypes) -> Self {
    TypeRegistry { interned: HashMap::new(), native, typemap: HashMap::new() }
  }

  fn intern(&mut self, kind: TypeKind) -> Type {
    if let Some(t) = self.interned.get(&kind) { return t.clone() }
    let t: Type = Rc::new(kind.clone());
    self.interned.insert(kind, t.clone());
    t
  }

  pub fn basic(&mut self, tag: BaseTag) -> Type { self.intern(TypeKind::Base(tag)) }
  pub fn pointer(&mut self, to: Type) -> Type { self.intern(TypeKind::Pointer(to)) }
  pub fn array(&mut self, elem: Type, n: u64) -> Type { self.intern(TypeKind::Array(elem, n)) }
  pub fn function(&mut self, ret: Type, params: Vec<Type>) -> Type {
    self.intern(TypeKind::Function { ret, params: params.into() })
  }
  pub fn named(&mut self, q: QualifiedName) -> Type { self.intern(TypeKind::Named(q)) }
  pub fn constant(&mut self, inner: Type) -> Type { self.intern(TypeKind::Const(inner)) }
  pub fn bitfield(&mut self, inner: Type, width: u32) -> Type { self.intern(TypeKind::Bitfield(inner, width)) }

  /// Register a typemap alias, as the preamble module ("drt") does for
  /// the platform's textual type aliases (spec.md §4.1, §B.2).
  pub fn add_typemap_entry(&mut self, from: &str, to: &str) {
    self.typemap.insert(from.to_owned(), to.to_owned());
  }

  #[must_use] pub fn typemap_entry(&self, from: &str) -> Option<&str> {
    self.typemap.get(from).map(String::as_str)
  }

  /// All registered aliases, for serializing the typemap into a DTM
  /// (spec.md §4.8 "The typemap: textual aliases added by the module").
  pub fn typemap_entries(&self) -> impl Iterator<Item = (&str, &str)> {
    self.typemap.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Encode `t` into its canonical mangled-name form (spec.md §4.1
  /// `encode`; grounded on the original compiler's `Type::toEncStr`,
  /// `examples/original_source/src/dale/Element/Type/Type.h`).
  #[must_use] pub fn encode(&self, t: &Type) -> String {
    let mut s = String::new();
    self.encode_into(t, &mut s);
    s
  }

  fn encode_into(&self, t: &Type, out: &mut String) {
    match &**t {
      TypeKind::Base(b) => out.push_str(base_tag_enc(*b)),
      TypeKind::Pointer(to) => { out.push('P'); self.encode_into(to, out); }
      TypeKind::Array(elem, n) => { out.push_str(&format!("A{n}_")); self.encode_into(elem, out); }
      TypeKind::Function { ret, params } => {
        out.push('F');
        self.encode_into(ret, out);
        out.push('_');
        for p in params.iter() { self.encode_into(p, out); }
        out.push('E');
      }
      TypeKind::Named(q) => { out.push_str("N"); out.push_str(&q.dotted()); out.push('_'); }
      TypeKind::Const(inner) => { out.push('K'); self.encode_into(inner, out); }
      TypeKind::Bitfield(inner, w) => { out.push_str(&format!("B{w}_")); self.encode_into(inner, out); }
    }
  }

  /// Human-readable form, e.g. `(p int)`, `(array-of 4 char)` (spec.md
  /// §4.1 `pretty`; grounded on `Type::toStringProper`).
  #[must_use] pub fn pretty(&self, t: &Type) -> String {
    match &**t {
      TypeKind::Base(b) => base_tag_name(*b).to_owned(),
      TypeKind::Pointer(to) => format!("(p {})", self.pretty(to)),
      TypeKind::Array(elem, n) => format!("(array-of {n} {})", self.pretty(elem)),
      TypeKind::Function { ret, params } => {
        let ps: Vec<String> = params.iter().map(|p| self.pretty(p)).collect();
        format!("(fn {} ({}))", self.pretty(ret), ps.join(" "))
      }
      TypeKind::Named(q) => q.dotted(),
      TypeKind::Const(inner) => format!("(const {})", self.pretty(inner)),
      TypeKind::Bitfield(inner, w) => format!("(bitfield {w} {})", self.pretty(inner)),
    }
  }

  /// Structural equality with an option to ignore the constness of
  /// function parameters (spec.md §4.1 `equal`, used when checking for
  /// duplicate overloads per spec.md §4.2: "same parameter signature,
  /// ignoring constness of by-value arguments").
  #[must_use] pub fn equal(&self, a: &Type, b: &Type, ignore_arg_const: bool) -> bool {
    match (&**a, &**b) {
      (TypeKind::Function { ret: r1, params: p1 }, TypeKind::Function { ret: r2, params: p2 }) => {
        if !self.equal(r1, r2, false) || p1.len() != p2.len() { return false }
        p1.iter().zip(p2.iter()).all(|(x, y)| {
          if ignore_arg_const {
            self.equal(&strip_const(x), &strip_const(y), false)
          } else {
            self.equal(x, y, false)
          }
        })
      }
      (TypeKind::Pointer(x), TypeKind::Pointer(y)) => self.equal(x, y, false),
      (TypeKind::Array(x, n1), TypeKind::Array(y, n2)) => n1 == n2 && self.equal(x, y, false),
      (TypeKind::Const(x), TypeKind::Const(y)) => self.equal(x, y, false),
      (TypeKind::Bitfield(x, w1), TypeKind::Bitfield(y, w2)) => w1 == w2 && self.equal(x, y, false),
      (TypeKind::Named(q1), TypeKind::Named(q2)) => q1 == q2,
      (TypeKind::Base(b1), TypeKind::Base(b2)) => b1 == b2,
      _ => false,
    }
  }

  /// `ptr_equal`: identity comparison on interned handles (spec.md §3
  /// invariant (d), spec.md §8 "Type interning" property).
  #[must_use] pub fn ptr_equal(a: &Type, b: &Type) -> bool { Rc::ptr_eq(a, b) }

  #[must_use] pub fn is_integer(t: &Type) -> bool {
    matches!(&**t, TypeKind::Base(b) if is_integer_tag(*b))
  }

  #[must_use] pub fn is_signed(t: &Type) -> bool {
    matches!(&**t, TypeKind::Base(b) if is_signed_tag(*b))
  }

  #[must_use] pub fn is_floating(t: &Type) -> bool {
    matches!(&**t, TypeKind::Base(BaseTag::Float | BaseTag::Double | BaseTag::LongDouble))
  }

  /// Integer width in bytes, resolving platform widths via `self.native`.
  #[must_use] pub fn integer_size(&self, t: &Type) -> Option<u32> {
    let TypeKind::Base(b) = &**t else { return None };
    Some(match b {
      BaseTag::I8 | BaseTag::U8 | BaseTag::Char | BaseTag::Bool => 1,
      BaseTag::I16 | BaseTag::U16 => 2,
      BaseTag::I32 | BaseTag::U32 => 4,
      BaseTag::I64 | BaseTag::U64 => 8,
      BaseTag::I128 | BaseTag::U128 => 16,
      BaseTag::Int => self.native.int_bits / 8,
      BaseTag::UInt => self.native.uint_bits / 8,
      BaseTag::Size => self.native.size_bits / 8,
      BaseTag::Intptr => self.native.intptr_bits / 8,
      BaseTag::Ptrdiff => self.native.ptrdiff_bits / 8,
      _ => return None,
    })
  }

  /// A small relative ranking of floating-point size (0 = float, 1 =
  /// double, 2 = long double), used to decide widening casts.
  #[must_use] pub fn fp_relative_size(t: &Type) -> Option<u32> {
    match &**t {
      TypeKind::Base(BaseTag::Float) => Some(0),
      TypeKind::Base(BaseTag::Double) => Some(1),
      TypeKind::Base(BaseTag::LongDouble) => Some(2),
      _ => None,
    }
  }

  /// `alignof`, a natural companion to `sizeof`/`integer_size` the
  /// original compiler exposes as `Operation/Alignmentof` (spec.md §B.4).
  #[must_use] pub fn align_of(&self, t: &Type) -> u32 {
    match &**t {
      TypeKind::Base(_) => self.integer_size(t).unwrap_or_else(|| match &**t {
        TypeKind::Base(BaseTag::Float) => 4,
        TypeKind::Base(BaseTag::Double | BaseTag::LongDouble) => 8,
        TypeKind::Base(BaseTag::Void | BaseTag::Varargs) => 1,
        _ => 1,
      }),
      TypeKind::Pointer(_) | TypeKind::Function { .. } => self.native.pointer_bits / 8,
      TypeKind::Array(elem, _) => self.align_of(elem),
      TypeKind::Const(inner) | TypeKind::Bitfield(inner, _) => self.align_of(inner),
      TypeKind::Named(_) => self.native.pointer_bits / 8,
    }
  }
}

fn strip_const(t: &Type) -> Type {
  if let TypeKind::Const(inner) = &**t { inner.clone() } else { t.clone() }
}

fn is_integer_tag(b: BaseTag) -> bool {
  matches!(b,
    BaseTag::I8 | BaseTag::I16 | BaseTag::I32 | BaseTag::I64 | BaseTag::I128 |
    BaseTag::U8 | BaseTag::U16 | BaseTag::U32 | BaseTag::U64 | BaseTag::U128 |
    BaseTag::Int | BaseTag::UInt | BaseTag::Size | BaseTag::Intptr | BaseTag::Ptrdiff |
    BaseTag::Bool | BaseTag::Char)
}

fn is_signed_tag(b: BaseTag) -> bool {
  matches!(b,
    BaseTag::I8 | BaseTag::I16 | BaseTag::I32 | BaseTag::I64 | BaseTag::I128 |
    BaseTag::Int | BaseTag::Intptr | BaseTag::Ptrdiff)
}

fn base_tag_name(b: BaseTag) -> &'static str {
  match b {
    BaseTag::Void => "void", BaseTag::Varargs => "...",
    BaseTag::I8 => "i8", BaseTag::I16 => "i16", BaseTag::I32 => "i32", BaseTag::I64 => "i64", BaseTag::I128 => "i128",
    BaseTag::U8 => "u8", BaseTag::U16 => "u16", BaseTag::U32 => "u32", BaseTag::U64 => "u64", BaseTag::U128 => "u128",
    BaseTag::Int => "int", BaseTag::UInt => "uint", BaseTag::Size => "size",
    BaseTag::Intptr => "intptr", BaseTag::Ptrdiff => "ptrdiff",
    BaseTag::Bool => "bool", BaseTag::Char => "char",
    BaseTag::Float => "float", BaseTag::Double => "double", BaseTag::LongDouble => "longdouble",
  }
}

fn base_tag_enc(b: BaseTag) -> &'static str {
  match b {
    BaseTag::Void => "v", BaseTag::Varargs => "z",
    BaseTag::I8 => "c", BaseTag::I16 => "s", BaseTag::I32 => "i", BaseTag::I64 => "l", BaseTag::I128 => "n",
    BaseTag::U8 => "UC", BaseTag::U16 => "US", BaseTag::U32 => "UI", BaseTag::U64 => "UL", BaseTag::U128 => "UN",
    BaseTag::Int => "j", BaseTag::UInt => "Uj", BaseTag::Size => "m",
    BaseTag::Intptr => "q", BaseTag::Ptrdiff => "r",
    BaseTag::Bool => "b", BaseTag::Char => "h",
    BaseTag::Float => "f", BaseTag::Double => "d", BaseTag::LongDouble => "e",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interning_gives_pointer_equal_handles() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let a = r.basic(BaseTag::I32);
    let b = r.basic(BaseTag::I32);
    assert!(TypeRegistry::ptr_equal(&a, &b));
    let pa = r.pointer(a.clone());
    let pb = r.pointer(b.clone());
    assert!(TypeRegistry::ptr_equal(&pa, &pb));
  }

  #[test]
  fn distinct_shapes_are_not_equal() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let i32_ = r.basic(BaseTag::I32);
    let i64_ = r.basic(BaseTag::I64);
    assert!(!r.equal(&i32_, &i64_, false));
  }

  #[test]
  fn ignore_arg_const_strips_top_level_const_on_params_only() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let i = r.basic(BaseTag::I32);
    let ci = r.constant(i.clone());
    let void = r.basic(BaseTag::Void);
    let f1 = r.function(void.clone(), vec![i.clone()]);
    let f2 = r.function(void.clone(), vec![ci.clone()]);
    assert!(!r.equal(&f1, &f2, false));
    assert!(r.equal(&f1, &f2, true));
  }

  #[test]
  fn varargs_is_only_legal_trailing_base() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    let void = r.basic(BaseTag::Void);
    let va = r.basic(BaseTag::Varargs);
    let i = r.basic(BaseTag::I32);
    let f = r.function(void, vec![i, va]);
    let TypeKind::Function { params, .. } = &*f else { panic!() };
    assert!(matches!(&*params[1], TypeKind::Base(BaseTag::Varargs)));
  }

  #[test]
  fn named_equality_is_by_qualified_name_not_body() {
    let mut r = TypeRegistry::new(NativeTypes::default());
    use crate::symbol::intern;
    let q = QualifiedName::new(Rc::from(vec![intern("ns")]), intern("Foo"));
    let t1 = r.named(q.clone());
    let t2 = r.named(q);
    assert!(r.equal(&t1, &t2, false));
    assert!(TypeRegistry::ptr_equal(&t1, &t2));
  }
}
