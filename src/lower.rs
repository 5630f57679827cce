//! The Procedure Body Lowerer (C7, spec.md §4.6). The busiest
//! component: walks a body's Node tree and produces both a typed result
//! and IR instructions through the [`Emitter`]'s builder.
//!
//! Control flow in the covered grammar is straight-line (spec.md §4.6
//! names literals, variable reference, call, aggregate literals, the
//! core assignment/dereference operators, cast, scope-close, and
//! implicit copy — no branching form is named), so a [`ParseResult`]'s
//! "block it leaves control in" is the function's single entry block
//! for everything this module lowers.

use crate::context::{ArgType, Context, OverloadError};
use crate::emit::{BlockHandle, Emitter, ValueRef};
use crate::error::CoreError;
use crate::node::{Node, Token};
use crate::symbol::{intern, Symbol};
use crate::types::entity::Function;
use crate::types::ty::{BaseTag, QualifiedName, Type, TypeKind};

/// The record every sub-expression produces (spec.md §4.6).
#[derive(Clone)]
pub struct ParseResult {
  pub block: BlockHandle,
  pub ty: Type,
  pub value: Option<ValueRef>,
  pub do_not_destruct: bool,
  pub do_not_copy_with_setf: bool,
  pub freshly_copied: bool,
}

impl ParseResult {
  #[must_use] pub fn new(block: BlockHandle, ty: Type, value: Option<ValueRef>) -> Self {
    ParseResult { block, ty, value, do_not_destruct: false, do_not_copy_with_setf: false, freshly_copied: false }
  }
}

/// Signals that lowering a call hit a candidate flagged `is-macro`
/// (spec.md §4.2 step 5): the caller (the dispatcher, which owns C8)
/// must re-enter through the macro engine and splice the result.
pub struct NeedsMacro {
  pub function: Function,
  pub arg_nodes: Vec<Node>,
}

pub enum LowerOutcome {
  Done(ParseResult),
  Macro(NeedsMacro),
}

struct LocalVar {
  name: Symbol,
  ty: Type,
  ptr: ValueRef,
  no_destruct: bool,
}

struct Scope {
  locals: Vec<LocalVar>,
}

/// Per-function lowering state: the emitter, the enclosing function
/// (for `is_setf_fn` checks and lexical-scope tracking), and the scope
/// stack used for both name resolution and scope-close destructor
/// ordering (spec.md §4.6 "Scope close").
pub struct Lowerer<'e, E: Emitter> {
  pub emitter: &'e mut E,
  pub func: Function,
  scopes: Vec<Scope>,
}

impl<'e, E: Emitter> Lowerer<'e, E> {
  #[must_use] pub fn new(emitter: &'e mut E, func: Function) -> Self {
    Lowerer { emitter, func, scopes: vec![Scope { locals: Vec::new() }] }
  }

  pub fn push_scope(&mut self) { self.scopes.push(Scope { locals: Vec::new() }); }

  /// Pop the innermost scope, destructing its locals in reverse
  /// declaration order (spec.md §4.6 "Scope close", §8 "Scope-close").
  pub fn pop_scope(&mut self, ctx: &Context, block: BlockHandle) {
    let Some(scope) = self.scopes.pop() else { return };
    for local in scope.locals.iter().rev() {
      if local.no_destruct { continue }
      destruct_value(self.emitter, ctx, &local.ty, local.ptr, block);
    }
  }

  fn declare_local(&mut self, name: Symbol, ty: Type, ptr: ValueRef, no_destruct: bool) {
    self.scopes.last_mut().expect("at least one scope always open").locals.push(LocalVar { name, ty, ptr, no_destruct });
  }

  /// Bind a function parameter as a local in the outermost (function)
  /// scope, used by C6 right after it stores each incoming argument into
  /// its alloca (spec.md §4.5: a declared parameter is usable by name in
  /// the body, exactly like a `var` local).
  pub fn declare_param(&mut self, name: Symbol, ty: Type, ptr: ValueRef) {
    self.declare_local(name, ty, ptr, false);
  }

  fn find_local(&self, name: Symbol) -> Option<(&Type, ValueRef)> {
    for scope in self.scopes.iter().rev() {
      if let Some(l) = scope.locals.iter().rev().find(|l| l.name == name) {
        return Some((&l.ty, l.ptr));
      }
    }
    None
  }
}

/// Destruct the value at `ptr` of type `ty`: look up `destroy` for the
/// pointer-to-`ty` type; if found, call it. Arrays are destructed
/// element-by-element, last to first (spec.md §4.6 "arrays are
/// destructed element-by-element from last to first"). A missing
/// `destroy` overload is simply not invoked (spec.md §4.6 only mandates
/// the lookup-based hook; see DESIGN.md for the member-wise-fallback
/// Open Question).
fn destruct_value(emitter: &mut impl Emitter, ctx: &Context, ty: &Type, ptr: ValueRef, block: BlockHandle) {
  if let TypeKind::Array(elem, n) = &**ty {
    for i in (0..*n).rev() {
      let idx = emitter.const_int(&ctx_size_type(ctx), i128::from(i));
      let elem_ptr = emitter.gep_index(ptr, idx);
      destruct_value(emitter, ctx, elem, elem_ptr, block);
    }
    return;
  }
  let ptr_ty = std::rc::Rc::new(TypeKind::Pointer(ty.clone()));
  if let Ok(m) = ctx.resolve_overload(intern("destroy"), &[ArgType::Typed(ptr_ty)]) {
    if !m.is_macro {
      if let Some(h) = m.function.handle { emitter.call(h, &[ptr]); }
    }
  }
}

/// C-style default argument promotion applied to trailing varargs
/// arguments at a variadic call site (spec.md §4.6 "Call": `float->double`,
/// integer types narrower than the platform `int` widen, signed
/// sign-extending and unsigned zero-extending).
fn variadic_promote<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, v: ValueRef, ty: &Type,
) -> ValueRef {
  use crate::types::ty::TypeRegistry;
  if TypeRegistry::is_floating(ty) && crate::types::ty::TypeRegistry::fp_relative_size(ty) == Some(0) {
    let double = ctx.types.basic(BaseTag::Double);
    return lcx.emitter.cast(v, ty, &double);
  }
  if TypeRegistry::is_integer(ty) {
    if let Some(width) = ctx.types.integer_size(ty) {
      let int_bytes = ctx.types.native.int_bits / 8;
      if width < int_bytes {
        let target = if TypeRegistry::is_signed(ty) { ctx.types.basic(BaseTag::Int) } else { ctx.types.basic(BaseTag::UInt) };
        return lcx.emitter.cast(v, ty, &target);
      }
    }
  }
  v
}

fn ctx_size_type(_ctx: &Context) -> Type {
  // `gep_index` indices are platform `size` per the original's indexing
  // convention. Built directly (not through `TypeRegistry::basic`, which
  // needs `&mut`) so this composes with `destruct_value`'s `&Context` borrow.
  std::rc::Rc::new(TypeKind::Base(BaseTag::Size))
}

/// Lower one expression (spec.md §4.6). `expected` is the type the
/// surrounding context wants, used by literal/aggregate lowering.
pub fn lower_expr<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, node: &Node, expected: Option<&Type>,
) -> Result<LowerOutcome, CoreError> {
  match node {
    Node::Atom(tok, _) => lower_atom(lcx, ctx, block, tok, expected).map(LowerOutcome::Done),
    Node::List(items, _) => lower_list(lcx, ctx, block, items, expected),
  }
}

fn lower_atom<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, tok: &Token, expected: Option<&Type>,
) -> Result<ParseResult, CoreError> {
  match tok {
    Token::Integer(n) => {
      let ty = expected.cloned().unwrap_or_else(|| ctx.types.basic(BaseTag::Int));
      let v = lcx.emitter.const_int(&ty, i128::from(*n));
      Ok(ParseResult::new(block, ty, Some(v)))
    }
    Token::Float(f) => {
      let ty = expected.cloned().unwrap_or_else(|| ctx.types.basic(BaseTag::Double));
      let v = lcx.emitter.const_float(&ty, *f);
      Ok(ParseResult::new(block, ty, Some(v)))
    }
    Token::Str(s) => {
      // String literals become globals of `array N char` and decay to
      // `p char` in value position (spec.md §4.6).
      let char_ty = ctx.types.basic(BaseTag::Char);
      let v = lcx.emitter.const_cstr(s.as_bytes());
      let ptr_ty = ctx.types.pointer(char_ty);
      Ok(ParseResult::new(block, ptr_ty, Some(v)))
    }
    Token::Symbol(s) => lower_variable_ref(lcx, ctx, block, *s),
  }
}

fn lower_variable_ref<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, name: Symbol,
) -> Result<ParseResult, CoreError> {
  if let Some((ty, ptr)) = lcx.find_local(name) {
    let ty = ty.clone();
    let v = lcx.emitter.load(ptr, &ty);
    return Ok(ParseResult::new(block, ty, Some(v)));
  }
  let Some(var) = ctx.lookup_variable(name) else {
    return Err(CoreError::NotInScope(name.to_string()));
  };
  let ty = var.ty.clone();
  let handle = var.handle;
  let Some(h) = handle else { return Err(CoreError::Internal(format!("variable `{name}` has no IR handle"))) };
  let v = lcx.emitter.load(ValueRef(h.0), &ty);
  Ok(ParseResult::new(block, ty, Some(v)))
}

fn lower_list<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node], expected: Option<&Type>,
) -> Result<LowerOutcome, CoreError> {
  let Some(head) = items.first() else { return Err(CoreError::NoEmptyLists) };
  let Some(Token::Symbol(head_sym)) = head.as_atom() else { return Err(CoreError::FirstListElementMustBeSymbol) };
  let head_name = head_sym.to_string();

  match head_name.as_str() {
    "return" => {
      let [_, e] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
      let ret_ty = lcx.func.ret.clone();
      let outcome = lower_expr(lcx, ctx, block, e, Some(&ret_ty))?;
      let LowerOutcome::Done(mut pr) = outcome else { return Ok(outcome) };
      pr.do_not_destruct = true;
      lcx.emitter.ret(pr.value);
      Ok(LowerOutcome::Done(pr))
    }
    "var" => lower_local_decl(lcx, ctx, block, items).map(LowerOutcome::Done),
    "setv" => lower_setv(lcx, ctx, block, items).map(LowerOutcome::Done),
    "setf" => lower_setf(lcx, ctx, block, items).map(LowerOutcome::Done),
    "@" => lower_deref(lcx, ctx, block, items).map(LowerOutcome::Done),
    ":@" => lower_addr_of(lcx, ctx, block, items).map(LowerOutcome::Done),
    "@:" => lower_field_access(lcx, ctx, block, items, true).map(LowerOutcome::Done),
    "@:@" => lower_field_access(lcx, ctx, block, items, false).map(LowerOutcome::Done),
    "cast" => lower_cast(lcx, ctx, block, items).map(LowerOutcome::Done),
    "array-of" if items.len() > 3 => lower_array_literal(lcx, ctx, block, items).map(LowerOutcome::Done),
    _ => {
      if let Some(s) = ctx.lookup_struct(*head_sym).cloned() {
        return lower_struct_literal(lcx, ctx, block, &s, &items[1..]).map(LowerOutcome::Done);
      }
      if ctx.lookup_enum(*head_sym).is_some() {
        return lower_enum_literal(lcx, ctx, block, *head_sym, &items[1..]);
      }
      lower_call(lcx, ctx, block, *head_sym, &items[1..], expected)
    }
  }
}

fn lower_local_decl<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(var NAME TYPE [INIT])`, the body-local counterpart of the
  // top-level `def name (var ...)` form (spec.md §4.6 "Scope close"
  // presupposes a local-declaration statement; no literal grammar for
  // it is given, so this follows C6's `var` shape minus linkage).
  if items.len() < 3 || items.len() > 4 { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) }
  let Some(Token::Symbol(name)) = items[1].as_atom() else { return Err(CoreError::UnexpectedElement) };
  let mut opts = crate::typeparser::TypeParseOptions::new();
  opts.allow_anon_structs = true;
  let ty = crate::typeparser::parse_type(ctx, &items[2], &mut opts)?;
  let ptr = lcx.emitter.alloca(&ty);
  let mut freshly_copied = false;
  if let Some(init) = items.get(3) {
    let outcome = lower_expr(lcx, ctx, block, init, Some(&ty))?;
    let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in initializer position must be expanded first".into())) };
    if !ctx.types.equal(&pr.ty, &ty, false) { return Err(CoreError::IncorrectArgType { expected: ctx.types.pretty(&ty), got: ctx.types.pretty(&pr.ty) }) }
    if let Some(v) = pr.value { lcx.emitter.store(ptr, v); }
    freshly_copied = pr.freshly_copied;
  }
  maybe_invoke_setf_copy(lcx, ctx, &ty, ptr, freshly_copied);
  lcx.declare_local(*name, ty.clone(), ptr, false);
  Ok(ParseResult::new(block, ty, Some(ptr)))
}

/// If `setf-copy` is defined for `(p T)` and the value being placed at
/// `ptr` is not already `freshly_copied`, and the enclosing function is
/// not itself a `setf` function, invoke the overridden copy (spec.md
/// §4.6 "Implicit copy on assignment / return").
fn maybe_invoke_setf_copy<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &Context, ty: &Type, ptr: ValueRef, freshly_copied: bool,
) {
  if freshly_copied || lcx.func.is_setf_fn { return }
  let ptr_ty = std::rc::Rc::new(TypeKind::Pointer(ty.clone()));
  if let Ok(m) = ctx.resolve_overload(intern("setf-copy"), &[ArgType::Typed(ptr_ty)]) {
    if !m.is_macro {
      if let Some(h) = m.function.handle { lcx.emitter.call(h, &[ptr]); }
    }
  }
}

fn lower_setv<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(setv PLACE VALUE)`: raw store, no setf-copy override (spec.md §9
  // "Core macros before user dispatch": `setv` is the non-overridable form).
  let [_, place, value] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
  let place_res = lower_place(lcx, ctx, block, place)?;
  let outcome = lower_expr(lcx, ctx, block, value, Some(&place_res.ty))?;
  let LowerOutcome::Done(val) = outcome else { return Err(CoreError::Internal("macro in value position must be expanded first".into())) };
  let Some(v) = val.value else { return Err(CoreError::UnexpectedElement) };
  let Some(ptr) = place_res.value else { return Err(CoreError::CannotTakeAddressOfNonLvalue) };
  lcx.emitter.store(ptr, v);
  Ok(ParseResult::new(block, place_res.ty, Some(v)))
}

fn lower_setf<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(setf PLACE VALUE)`: store, then invoke `setf-copy` unless the
  // value was freshly copied or we are already inside a `setf` function.
  let [_, place, value] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
  let place_res = lower_place(lcx, ctx, block, place)?;
  let outcome = lower_expr(lcx, ctx, block, value, Some(&place_res.ty))?;
  let LowerOutcome::Done(val) = outcome else { return Err(CoreError::Internal("macro in value position must be expanded first".into())) };
  let Some(v) = val.value else { return Err(CoreError::UnexpectedElement) };
  let Some(ptr) = place_res.value else { return Err(CoreError::CannotTakeAddressOfNonLvalue) };
  lcx.emitter.store(ptr, v);
  maybe_invoke_setf_copy(lcx, ctx, &place_res.ty, ptr, val.freshly_copied);
  Ok(ParseResult::new(block, place_res.ty, Some(v)))
}

/// Lower `node` in lvalue (address) position: the result's `value` is a
/// pointer to the place, `ty` is the place's value type.
fn lower_place<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, node: &Node,
) -> Result<ParseResult, CoreError> {
  if let Node::Atom(Token::Symbol(name), _) = node {
    if let Some((ty, ptr)) = lcx.find_local(*name) {
      return Ok(ParseResult::new(block, ty.clone(), Some(ptr)));
    }
    if let Some(var) = ctx.lookup_variable(*name) {
      let ty = var.ty.clone();
      let Some(h) = var.handle else { return Err(CoreError::Internal(format!("variable `{name}` has no IR handle"))) };
      return Ok(ParseResult::new(block, ty, Some(ValueRef(h.0))));
    }
    return Err(CoreError::NotInScope(name.to_string()));
  }
  if let Node::List(items, _) = node {
    if items.first().and_then(Node::as_atom) == Some(&Token::Symbol(intern("@:@"))) {
      return lower_field_access(lcx, ctx, block, items, false);
    }
  }
  Err(CoreError::CannotTakeAddressOfNonLvalue)
}

fn lower_deref<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(@ PTR-EXPR)`: dereference a pointer value.
  let [_, e] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
  let outcome = lower_expr(lcx, ctx, block, e, None)?;
  let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in operand position must be expanded first".into())) };
  let TypeKind::Pointer(inner) = &*pr.ty else { return Err(CoreError::IncorrectArgType { expected: "pointer".into(), got: ctx.types.pretty(&pr.ty) }) };
  let inner = inner.clone();
  let Some(ptr) = pr.value else { return Err(CoreError::CannotTakeAddressOfNonLvalue) };
  let v = lcx.emitter.load(ptr, &inner);
  Ok(ParseResult::new(block, inner, Some(v)))
}

fn lower_addr_of<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(:@ PLACE)`: address-of an lvalue (spec.md §7 `cannot-take-address-of-non-lvalue`).
  let [_, e] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
  let place = lower_place(lcx, ctx, block, e)?;
  let Some(ptr) = place.value else { return Err(CoreError::CannotTakeAddressOfNonLvalue) };
  let ptr_ty = ctx.types.pointer(place.ty);
  Ok(ParseResult::new(block, ptr_ty, Some(ptr)))
}

/// `(@: STRUCT-PTR-EXPR FIELD)` loads a field through a struct pointer;
/// `(@:@ STRUCT-PTR-EXPR FIELD)` returns its address instead of loading
/// it (used as a place by `setf`/`setv`/`:@`).
fn lower_field_access<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node], load: bool,
) -> Result<ParseResult, CoreError> {
  let [_, base, field] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
  let Some(Token::Symbol(field_name)) = field.as_atom() else { return Err(CoreError::UnexpectedElement) };
  let outcome = lower_expr(lcx, ctx, block, base, None)?;
  let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in operand position must be expanded first".into())) };
  let TypeKind::Pointer(inner) = &*pr.ty else { return Err(CoreError::IncorrectArgType { expected: "pointer to struct".into(), got: ctx.types.pretty(&pr.ty) }) };
  let TypeKind::Named(q) = &**inner else { return Err(CoreError::IncorrectArgType { expected: "pointer to struct".into(), got: ctx.types.pretty(inner) }) };
  let Some(s) = ctx.lookup_qualified_struct(&q.path, q.name) else { return Err(CoreError::NotInScope(q.dotted())) };
  let Some((idx, member)) = s.member(*field_name) else {
    return Err(CoreError::FieldDoesNotExistInStruct(field_name.to_string(), q.name.to_string()));
  };
  let member_ty = member.ty.clone();
  let Some(base_ptr) = pr.value else { return Err(CoreError::CannotTakeAddressOfNonLvalue) };
  let field_ptr = lcx.emitter.gep_field(base_ptr, idx as u32);
  if load {
    let v = lcx.emitter.load(field_ptr, &member_ty);
    Ok(ParseResult::new(block, member_ty, Some(v)))
  } else {
    Ok(ParseResult::new(block, member_ty, Some(field_ptr)))
  }
}

fn lower_cast<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  // `(cast VALUE TYPE)`: explicit casts allow full integer/bool/pointer
  // conversions (spec.md §4.6 "Cast").
  let [_, e, t] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
  let mut opts = crate::typeparser::TypeParseOptions::new();
  let target = crate::typeparser::parse_type(ctx, t, &mut opts)?;
  let outcome = lower_expr(lcx, ctx, block, e, None)?;
  let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in cast operand position must be expanded first".into())) };
  let Some(v) = pr.value else { return Err(CoreError::UnexpectedElement) };
  let casted = lcx.emitter.cast(v, &pr.ty, &target);
  Ok(ParseResult::new(block, target, Some(casted)))
}

/// `(array-of N T V0 ... Vk-1)` in value position (spec.md §4.6
/// "Array-literal lowering"): `N=0` infers the size from the element
/// count, otherwise `k` must equal `N`.
fn lower_array_literal<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, items: &[Node],
) -> Result<ParseResult, CoreError> {
  let Node::Atom(Token::Integer(n_lit), _) = &items[1] else {
    return Err(CoreError::CannotParseLiteral("array size".into()));
  };
  let mut opts = crate::typeparser::TypeParseOptions::new();
  let elem_ty = crate::typeparser::parse_type(ctx, &items[2], &mut opts)?;
  let elems = &items[3..];
  let n = if *n_lit == 0 { elems.len() as u64 } else {
    let n = u64::try_from(*n_lit).map_err(|_| CoreError::InvalidInteger(n_lit.to_string()))?;
    if n as usize != elems.len() { return Err(CoreError::IncorrectNumberOfArgs { expected: n as usize, got: elems.len() }) }
    n
  };
  let array_ty = ctx.types.array(elem_ty.clone(), n);
  let ptr = lcx.emitter.alloca(&array_ty);
  for (i, e) in elems.iter().enumerate() {
    let outcome = lower_expr(lcx, ctx, block, e, Some(&elem_ty))?;
    let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in array element position must be expanded first".into())) };
    if !ctx.types.equal(&pr.ty, &elem_ty, false) {
      return Err(CoreError::IncorrectArgType { expected: ctx.types.pretty(&elem_ty), got: ctx.types.pretty(&pr.ty) });
    }
    if let Some(v) = pr.value {
      let idx = lcx.emitter.const_int(&ctx.types.basic(BaseTag::Size), i as i128);
      let slot = lcx.emitter.gep_index(ptr, idx);
      lcx.emitter.store(slot, v);
    }
  }
  let loaded = lcx.emitter.load(ptr, &array_ty);
  Ok(ParseResult::new(block, array_ty, Some(loaded)))
}

/// `(STRUCT-NAME (field1 v1) ...)` (spec.md §4.6 "Struct-literal
/// lowering"): missing fields are zero-initialized; mismatched-but-both-
/// numeric field types get an implicit cast.
fn lower_struct_literal<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, s: &crate::types::entity::Struct, field_inits: &[Node],
) -> Result<ParseResult, CoreError> {
  let named_ty = ctx.types.named(QualifiedName::new(std::rc::Rc::from(Vec::<Symbol>::new()), s.name));
  let ptr = lcx.emitter.alloca(&named_ty);
  for init in field_inits {
    let pair = init.as_list().ok_or(CoreError::UnexpectedElement)?;
    let [name_node, val_node] = pair else { return Err(CoreError::UnexpectedElement) };
    let Some(Token::Symbol(field_name)) = name_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
    let Some((idx, member)) = s.member(*field_name) else {
      return Err(CoreError::FieldDoesNotExistInStruct(field_name.to_string(), s.name.to_string()));
    };
    let member_ty = member.ty.clone();
    let outcome = lower_expr(lcx, ctx, block, val_node, Some(&member_ty))?;
    let LowerOutcome::Done(pr) = outcome else { return Err(CoreError::Internal("macro in struct field position must be expanded first".into())) };
    let compatible = ctx.types.equal(&pr.ty, &member_ty, false)
      || (crate::types::ty::TypeRegistry::is_integer(&pr.ty) && crate::types::ty::TypeRegistry::is_integer(&member_ty))
      || (crate::types::ty::TypeRegistry::is_floating(&pr.ty) && crate::types::ty::TypeRegistry::is_floating(&member_ty));
    if !compatible {
      return Err(CoreError::IncorrectArgType { expected: ctx.types.pretty(&member_ty), got: ctx.types.pretty(&pr.ty) });
    }
    if let Some(v) = pr.value {
      let v = if ctx.types.equal(&pr.ty, &member_ty, false) { v } else { lcx.emitter.cast(v, &pr.ty, &member_ty) };
      let field_ptr = lcx.emitter.gep_field(ptr, idx as u32);
      lcx.emitter.store(field_ptr, v);
    }
  }
  let loaded = lcx.emitter.load(ptr, &named_ty);
  Ok(ParseResult::new(block, named_ty, Some(loaded)))
}

/// `(ENUM-NAME MEMBER)` (spec.md §4.6 "Enum-literal lowering").
fn lower_enum_literal<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, enum_name: Symbol, rest: &[Node],
) -> Result<LowerOutcome, CoreError> {
  let [member_node] = rest else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: rest.len() }) };
  let Some(Token::Symbol(member)) = member_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
  let Some(en) = ctx.lookup_enum(enum_name) else { return Err(CoreError::NotInScope(enum_name.to_string())) };
  let Some(value) = en.member_value(*member) else {
    return Err(CoreError::EnumValueDoesNotExist(member.to_string()));
  };
  let underlying = en.underlying.clone();
  let projected = ctx.types.named(QualifiedName::new(std::rc::Rc::from(Vec::<Symbol>::new()), en.projected_struct.name));
  // The projected struct has one field (the discriminant); materialize
  // it directly as that field's constant rather than building a struct
  // aggregate, since every consumer of an enum literal's `ParseResult`
  // only ever wants the discriminant value (spec.md §4.6 "Enum-literal
  // lowering"; ghosthamlet/dale's `Generator.cpp` materializes the
  // constant the same way).
  let v = lcx.emitter.const_int(&underlying, i128::from(value));
  Ok(LowerOutcome::Done(ParseResult::new(block, projected, Some(v))))
}

/// `Call` (spec.md §4.6 "Call"): each argument is lowered; a failed
/// lowering is recorded tentatively as `ArgType::PointerToNode` in case
/// the callee turns out to be a macro (spec.md §4.7 step 2). Errors from
/// failed argument lowerings are buffered on a scratch [`crate::error::ErrorReporter`]
/// by the caller in macro-argument-preparation mode; in ordinary call
/// lowering (this function) they are surfaced immediately once overload
/// resolution has run, matching spec.md §4.7 step 3's "re-emitted only if
/// the non-macro choice requires the failed argument".
fn lower_call<E: Emitter>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, block: BlockHandle, name: Symbol, arg_nodes: &[Node], expected: Option<&Type>,
) -> Result<LowerOutcome, CoreError> {
  let mut arg_types = Vec::with_capacity(arg_nodes.len());
  let mut lowered: Vec<Option<ParseResult>> = Vec::with_capacity(arg_nodes.len());
  let mut pending_errors = Vec::new();
  for a in arg_nodes {
    match lower_expr(lcx, ctx, block, a, None) {
      Ok(LowerOutcome::Done(pr)) => { arg_types.push(ArgType::Typed(pr.ty.clone())); lowered.push(Some(pr)); }
      Ok(LowerOutcome::Macro(_)) => return Err(CoreError::Internal("nested macro calls must be expanded bottom-up".into())),
      Err(e) => { pending_errors.push(e); arg_types.push(ArgType::PointerToNode); lowered.push(None); }
    }
  }

  match ctx.resolve_overload(name, &arg_types) {
    Ok(m) if m.is_macro => Ok(LowerOutcome::Macro(NeedsMacro { function: m.function, arg_nodes: arg_nodes.to_vec() })),
    Ok(m) => {
      if let Some(e) = pending_errors.into_iter().next() { return Err(e) }
      let params = m.function.user_params().to_vec();
      let required = m.function.required_arity();
      let variadic = m.function.is_variadic();
      let mut args = Vec::with_capacity(lowered.len());
      for (i, pr) in lowered.into_iter().enumerate() {
        let pr = pr.expect("non-macro match implies every argument lowered");
        let v = pr.value.expect("lowered argument always has a value");
        // Required (non-varargs) parameters get the ordinary implicit
        // cast; trailing varargs arguments (i >= required, only possible
        // for a variadic callee) have no declared parameter slot and
        // instead undergo C-style default promotion (spec.md §4.6
        // "For variadic calls, trailing arguments undergo C-style
        // promotion: float->double, integer types narrower than the
        // platform `int` widen").
        let v = if variadic && i >= required {
          variadic_promote(lcx, ctx, v, &pr.ty)
        } else {
          match params.get(i) {
            Some(param) if !ctx.types.equal(&pr.ty, &param.ty, false) => lcx.emitter.cast(v, &pr.ty, &param.ty),
            _ => v,
          }
        };
        args.push(v);
      }
      let Some(h) = m.function.handle else { return Err(CoreError::Internal(format!("function `{name}` has no IR handle"))) };
      let v = lcx.emitter.call(h, &args);
      let ret = expected.cloned().unwrap_or(m.function.ret.clone());
      Ok(LowerOutcome::Done(ParseResult::new(block, ret, Some(v))))
    }
    Err(OverloadError::NotInScope) => Err(pending_errors.into_iter().next().unwrap_or(CoreError::OverloadedFunctionOrMacroNotInScope(name.to_string()))),
    Err(OverloadError::NotInScopeWithClosest(closest)) => Err(CoreError::OverloadedFunctionOrMacroNotInScopeWithClosest(name.to_string(), closest)),
    Err(OverloadError::NoMatch) => Err(CoreError::OverloadedFunctionOrMacroNotInScope(name.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{FileSpan, Position, Span};
  use crate::testsupport::NoopEmitter;
  use crate::types::entity::{Linkage, Variable};
  use crate::types::ty::NativeTypes;
  use std::rc::Rc as StdRc;

  fn span() -> FileSpan {
    FileSpan::new(StdRc::from("t.dt"), Span::new(Position::new(1, 1), Position::new(1, 2)))
  }

  /// `(printf fmt c)` where `printf` is `extern-c int (p char) (...)` and
  /// `c` is a narrower-than-`int` signed integer: the vararg tail
  /// argument must be sign-extended to the platform `int`, not passed
  /// through untouched or cast against the `...` sentinel itself
  /// (spec.md §4.6 "For variadic calls, trailing arguments undergo
  /// C-style promotion").
  #[test]
  fn variadic_tail_argument_is_promoted_to_platform_int() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut emitter = NoopEmitter::default();
    let char_ty = ctx.types.basic(BaseTag::Char);
    let ptr_char = ctx.types.pointer(char_ty);
    let int_ty = ctx.types.basic(BaseTag::Int);
    let va = ctx.types.basic(BaseTag::Varargs);
    let f = Function {
      name: intern("printf"), ret: int_ty.clone(),
      params: vec![
        Variable::param(intern("fmt"), ptr_char, span()),
        Variable::param(Symbol::UNDER, va, span()),
      ],
      linkage: Linkage::ExternC, is_macro: false, is_setf_fn: false, cto: false,
      once_tag: None, handle: Some(emitter.declare_function("printf", &int_ty, Linkage::ExternC)),
      span: span(), mangled_name: "printf".into(),
    };
    ctx.insert_function(f).unwrap();

    let func_ty = ctx.types.basic(BaseTag::Int);
    let host = Function {
      name: intern("host"), ret: func_ty.clone(), params: Vec::new(),
      linkage: Linkage::Extern, is_macro: false, is_setf_fn: false, cto: false,
      once_tag: None, handle: None, span: span(), mangled_name: "host".into(),
    };
    let mut lcx = Lowerer::new(&mut emitter, host);
    let block = BlockHandle(0);

    let sp = Span::new(Position::new(1, 1), Position::new(1, 2));
    let fmt_node = Node::atom(Token::Str(StdRc::from("%d")), sp);
    // `(cast 7 i8)`: an explicit cast is the only surface-syntax way to
    // get a narrower-than-`int` value, since a bare integer literal
    // already defaults to the platform `int`.
    let narrow_node = Node::list(vec![
      Node::atom(Token::Symbol(intern("cast")), sp),
      Node::atom(Token::Integer(7), sp),
      Node::atom(Token::Symbol(intern("i8")), sp),
    ], sp);
    let call = vec![
      Node::atom(Token::Symbol(intern("printf")), sp),
      fmt_node,
      narrow_node,
    ];
    let outcome = lower_list(&mut lcx, &mut ctx, block, &call, None).unwrap();
    assert!(matches!(outcome, LowerOutcome::Done(_)));
    assert!(lcx.emitter.casts.iter().any(|(from, to)| {
      !matches!(&**from, TypeKind::Base(BaseTag::Int)) && matches!(&**to, TypeKind::Base(BaseTag::Int))
    }));
  }

  #[test]
  fn parse_result_defaults_are_all_false() {
    let pr = ParseResult::new(BlockHandle(0), std::rc::Rc::new(TypeKind::Base(BaseTag::Void)), None);
    assert!(!pr.do_not_destruct);
    assert!(!pr.do_not_copy_with_setf);
    assert!(!pr.freshly_copied);
  }
}
