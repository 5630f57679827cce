//! Declaration Forms (C6, spec.md §4.5): `def name (fn|var|struct|enum|macro ...)`.
//!
//! Each declaration is built, registered in the current namespace (C3),
//! and — for `fn`/`macro` — has its body lowered by C7 and emitted
//! through the [`Emitter`].

use std::rc::Rc;
use crate::context::Context;
use crate::emit::Emitter;
use crate::error::CoreError;
use crate::lower::{LowerOutcome, Lowerer};
use crate::macros::MacroRuntime;
use crate::node::{Node, Token};
use crate::span::FileSpan;
use crate::symbol::{intern, Symbol};
use crate::typeparser::{parse_type, TypeParseOptions};
use crate::types::entity::{Enum, EnumMember, Function, Linkage, Struct, StructMember, Variable};
use crate::types::ty::{BaseTag, Type};

/// `def NAME FORM`: dispatch on `FORM`'s head (spec.md §4.5). `runtime`
/// and `filename` are only ever consulted for `fn`/`macro` bodies, where
/// a body expression may resolve to a macro call (spec.md §4.7).
pub fn declare<E: Emitter, R: MacroRuntime<E>>(
  ctx: &mut Context, emitter: &mut E, runtime: &mut R, filename: &Rc<str>,
  name: Symbol, form: &Node, span: &FileSpan,
) -> Result<(), CoreError> {
  let items = form.as_list().ok_or(CoreError::UnexpectedElement)?;
  let Some(head) = items.first() else { return Err(CoreError::NoEmptyLists) };
  let Some(Token::Symbol(kind)) = head.as_atom() else { return Err(CoreError::FirstListElementMustBeSymbol) };
  match kind.to_string().as_str() {
    "fn" => declare_fn(ctx, emitter, runtime, filename, name, items, span, false),
    "macro" => declare_fn(ctx, emitter, runtime, filename, name, items, span, true),
    "var" => declare_var(ctx, emitter, name, items, span),
    "struct" => declare_struct(ctx, name, items, span),
    "enum" => declare_enum(ctx, name, items, span),
    other => Err(CoreError::InvalidAttribute(other.to_owned())),
  }
}

fn parse_linkage(node: &Node) -> Result<Linkage, CoreError> {
  let Some(Token::Symbol(s)) = node.as_atom() else { return Err(CoreError::UnexpectedElement) };
  Linkage::from_keyword(&s.to_string()).ok_or_else(|| CoreError::InvalidAttribute(s.to_string()))
}

/// Parameters: a single `void` atom means no parameters; `...` may
/// appear only last; otherwise each item is `(NAME TYPE)` (spec.md §4.5
/// "Parameters are parsed with the rules...").
fn parse_params(ctx: &mut Context, params_node: &Node, span: &FileSpan) -> Result<Vec<Variable>, CoreError> {
  let items = params_node.as_list().ok_or(CoreError::UnexpectedElement)?;
  if let [one] = items {
    if one.as_atom() == Some(&Token::Symbol(intern("void"))) {
      return Ok(Vec::new());
    }
  }
  let mut out = Vec::with_capacity(items.len());
  for (i, item) in items.iter().enumerate() {
    if item.as_atom() == Some(&Token::Symbol(intern("..."))) {
      if i + 1 != items.len() { return Err(CoreError::VarargsMustBeLast) }
      let va = ctx.types.basic(BaseTag::Varargs);
      out.push(Variable::param(Symbol::UNDER, va, span.clone()));
      continue;
    }
    let pair = item.as_list().ok_or(CoreError::UnexpectedElement)?;
    let [name_node, ty_node] = pair else { return Err(CoreError::UnexpectedElement) };
    let Some(Token::Symbol(pname)) = name_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
    if *pname == intern("void") { return Err(CoreError::VoidMustBeOnlyParameter) }
    let mut opts = TypeParseOptions::new();
    opts.allow_anon_structs = true;
    let ty = parse_type(ctx, ty_node, &mut opts)?;
    out.push(Variable::param(*pname, ty, span.clone()));
  }
  Ok(out)
}

/// The mangled IR symbol name for a function overload: `extern-c`
/// linkage keeps the bare name (so it matches the C ABI it interoperates
/// with); anything else is qualified by namespace path and the
/// function-type encoding so overloads don't collide (spec.md §4.1
/// `encode`, used here "for symbol mangling" as that section describes).
fn mangle_function(ctx: &Context, name: Symbol, fn_ty: &Type, linkage: Linkage) -> String {
  if linkage == Linkage::ExternC { return name.to_string() }
  format!("{}__{}", ctx.qualify(name).dotted(), ctx.types.encode(fn_ty))
}

fn declare_fn<E: Emitter, R: MacroRuntime<E>>(
  ctx: &mut Context, emitter: &mut E, runtime: &mut R, filename: &Rc<str>,
  name: Symbol, items: &[Node], span: &FileSpan, is_macro: bool,
) -> Result<(), CoreError> {
  let [_, linkage_node, ret_node, params_node, body @ ..] = items else {
    return Err(CoreError::IncorrectMinimumNumberOfArgs { expected: 3, got: items.len() - 1 });
  };
  let linkage = parse_linkage(linkage_node)?;
  let mut ret_opts = TypeParseOptions::new();
  let ret = parse_type(ctx, ret_node, &mut ret_opts)?;
  let mut params = parse_params(ctx, params_node, span)?;

  // A macro's declared parameters are each typed `(p Node)`; a leading
  // implicit macro-context parameter of type `(p Node)` is prepended,
  // and `user_params()` on the resulting `Function` skips it again
  // (spec.md §4.5 "the macro's declared parameters are each typed as a
  // pointer to the parser's Node type ... leading implicit macro-context
  // parameter").
  if is_macro {
    let node_ptr = ctx.node_pointer_type();
    for p in &mut params { p.ty = node_ptr.clone(); }
    let mc_ty = ctx.node_pointer_type();
    params.insert(0, Variable::param(intern("mc"), mc_ty, span.clone()));
  }

  let param_types: Vec<Type> = params.iter().map(|p| p.ty.clone()).collect();
  let fn_ty = ctx.types.function(ret.clone(), param_types);
  let mangled_name = mangle_function(ctx, name, &fn_ty, linkage);

  let is_setf_fn = name == intern("setf-copy");
  let mut f = Function {
    name, ret: ret.clone(), params, linkage, is_macro, is_setf_fn, cto: is_macro,
    once_tag: None, handle: None, span: span.clone(), mangled_name: mangled_name.clone(),
  };

  let handle = emitter.declare_function(&mangled_name, &fn_ty, linkage);
  f.handle = Some(handle);

  ctx.insert_function(f.clone())
    .map_err(|_| if is_macro { CoreError::RedeclarationOfMacro(name.to_string()) } else { CoreError::RedeclarationOfFunction(name.to_string()) })?;

  // An `extern` declaration with no body is a forward declaration; only
  // lower a body when one was supplied.
  if body.is_empty() { return Ok(()) }

  let entry = emitter.entry_block(handle);
  let mut lcx = Lowerer::new(emitter, f);
  for (i, p) in lcx.func.params.clone().iter().enumerate() {
    let ptr = lcx.emitter.alloca(&p.ty);
    let incoming = lcx.emitter.param(handle, i as u32);
    lcx.emitter.store(ptr, incoming);
    lcx.declare_param(p.name, p.ty.clone(), ptr);
  }
  let mut block = entry;
  for form in body {
    block = lower_form_expanding_macros(&mut lcx, ctx, runtime, filename, block, form)?;
  }
  lcx.pop_scope(ctx, block);
  if matches!(&*ret, crate::types::ty::TypeKind::Base(BaseTag::Void)) {
    lcx.emitter.ret(None);
  }
  Ok(())
}

/// Lower one top-of-body form, re-entering the macro engine (spec.md
/// §4.7) each time lowering reports a macro call and splicing its
/// result back in place of `form`, until a form lowers without needing
/// expansion. This is the single point `declare_fn`'s body loop bubbles
/// a [`LowerOutcome::Macro`] to; nested expression positions still treat
/// one as an error (see `lower.rs`).
fn lower_form_expanding_macros<E: Emitter, R: MacroRuntime<E>>(
  lcx: &mut Lowerer<'_, E>, ctx: &mut Context, runtime: &mut R, filename: &Rc<str>,
  block: crate::emit::BlockHandle, form: &Node,
) -> Result<crate::emit::BlockHandle, CoreError> {
  let mut current = form.clone();
  loop {
    match crate::lower::lower_expr(lcx, ctx, block, &current, None)? {
      LowerOutcome::Done(pr) => return Ok(pr.block),
      LowerOutcome::Macro(needs) => {
        let call_site = current.pos().reported();
        current = crate::macros::invoke_macro(lcx.emitter, runtime, filename, call_site, &needs)?;
      }
    }
  }
}

fn declare_var<E: Emitter>(
  ctx: &mut Context, emitter: &mut E, name: Symbol, items: &[Node], span: &FileSpan,
) -> Result<(), CoreError> {
  // `def name (var LINKAGE T [INIT])` (spec.md §4.5).
  let (linkage_node, ty_node, init) = match items {
    [_, l, t] => (l, t, None),
    [_, l, t, init] => (l, t, Some(init)),
    _ => return Err(CoreError::IncorrectMinimumNumberOfArgs { expected: 2, got: items.len() - 1 }),
  };
  let linkage = parse_linkage(linkage_node)?;
  let mut opts = TypeParseOptions::new();
  opts.allow_anon_structs = true;
  let ty = parse_type(ctx, ty_node, &mut opts)?;
  let handle = emitter.declare_global(&name.to_string(), &ty, linkage);
  if let Some(init_node) = init {
    lower_const_literal(emitter, &ty, init_node)?;
  } else {
    emitter.const_int(&ty, 0);
  }
  let v = Variable { name, ty, linkage, handle: Some(handle), once_tag: None, span: span.clone() };
  ctx.insert_variable(v).map_err(|_| CoreError::RedeclarationOfFunction(name.to_string()))
}

/// Evaluate `node` as a constant literal for a global's initializer
/// (spec.md §4.5 "evaluates INIT as a constant, see literal lowering").
/// Only the literal forms C7 itself treats as constants are accepted
/// here; anything requiring control flow or a call is out of scope for
/// a global initializer.
fn lower_const_literal<E: Emitter>(emitter: &mut E, ty: &Type, node: &Node) -> Result<(), CoreError> {
  match node {
    Node::Atom(Token::Integer(n), _) => { emitter.const_int(ty, i128::from(*n)); Ok(()) }
    Node::Atom(Token::Float(f), _) => { emitter.const_float(ty, *f); Ok(()) }
    Node::Atom(Token::Str(s), _) => { emitter.const_cstr(s.as_bytes()); Ok(()) }
    _ => Err(CoreError::CannotParseLiteral("global initializer".to_owned())),
  }
}

fn declare_struct(ctx: &mut Context, name: Symbol, items: &[Node], span: &FileSpan) -> Result<(), CoreError> {
  // `def name (struct LINKAGE (FIELDS))` (spec.md §4.5).
  let [_, linkage_node, fields_node] = items else {
    return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 });
  };
  let linkage = parse_linkage(linkage_node)?;
  let members = parse_struct_fields(ctx, fields_node)?;
  let internal_name = ctx.qualify(name).dotted();
  let s = Struct { name, members, linkage, once_tag: None, internal_name, handle: None, span: span.clone() };
  ctx.insert_struct(s).map_err(|_| CoreError::RedeclarationOfStruct(name.to_string()))
}

fn parse_struct_fields(ctx: &mut Context, fields_node: &Node) -> Result<Vec<StructMember>, CoreError> {
  let items = fields_node.as_list().ok_or(CoreError::UnexpectedElement)?;
  let mut out = Vec::with_capacity(items.len());
  for item in items {
    let pair = item.as_list().ok_or(CoreError::UnexpectedElement)?;
    let [name_node, ty_node] = pair else { return Err(CoreError::UnexpectedElement) };
    let Some(Token::Symbol(fname)) = name_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
    let mut opts = TypeParseOptions::new();
    let ty = parse_type(ctx, ty_node, &mut opts)?;
    out.push(StructMember { name: *fname, ty });
  }
  Ok(out)
}

fn declare_enum(ctx: &mut Context, name: Symbol, items: &[Node], span: &FileSpan) -> Result<(), CoreError> {
  // `def name (enum LINKAGE UNDERLYING (MEMBERS))` (spec.md §4.5).
  let [_, linkage_node, underlying_node, members_node] = items else {
    return Err(CoreError::IncorrectNumberOfArgs { expected: 3, got: items.len() - 1 });
  };
  let linkage = parse_linkage(linkage_node)?;
  let mut opts = TypeParseOptions::new();
  let underlying = parse_type(ctx, underlying_node, &mut opts)?;
  if !crate::types::ty::TypeRegistry::is_integer(&underlying) { return Err(CoreError::EnumTypeMustBeInteger) }

  let member_nodes = members_node.as_list().ok_or(CoreError::UnexpectedElement)?;
  let mut members = Vec::with_capacity(member_nodes.len());
  let mut next_value: i64 = 0;
  let mut seen = std::collections::HashSet::new();
  for m in member_nodes {
    let (mname, value) = match m {
      Node::Atom(Token::Symbol(s), _) => (*s, next_value),
      Node::List(pair, _) => {
        let [name_node, value_node] = pair.as_slice() else { return Err(CoreError::UnexpectedElement) };
        let Some(Token::Symbol(s)) = name_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
        let Node::Atom(Token::Integer(v), _) = value_node else { return Err(CoreError::CannotParseLiteral("enum member value".into())) };
        (*s, *v)
      }
      _ => return Err(CoreError::UnexpectedElement),
    };
    if !seen.insert(mname) { return Err(CoreError::RedeclarationOfEnumElement(mname.to_string())) }
    members.push(EnumMember { name: mname, value });
    next_value = value + 1;
  }

  let discriminant_field = intern("value");
  let internal_name = ctx.qualify(name).dotted();
  let projected_struct = Enum::project_struct(name, discriminant_field, underlying.clone(), linkage, None, internal_name, span.clone());
  let en = Enum { name, underlying, members, linkage, once_tag: None, span: span.clone(), projected_struct: projected_struct.clone() };
  ctx.insert_enum(en).map_err(|_| CoreError::RedeclarationOfEnum(name.to_string()))?;
  ctx.insert_struct(projected_struct).map_err(|_| CoreError::RedeclarationOfStruct(name.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{Position, Span};
  use crate::types::ty::NativeTypes;

  fn span() -> FileSpan { FileSpan::new(std::rc::Rc::from("t.dt"), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn atom_sym(s: &str) -> Node { Node::atom(Token::Symbol(intern(s)), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn atom_int(v: i64) -> Node { Node::atom(Token::Integer(v), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn list(xs: Vec<Node>) -> Node { Node::list(xs, Span::new(Position::new(1, 1), Position::new(1, 2))) }

  #[test]
  fn struct_declaration_registers_ordered_members() {
    let mut ctx = Context::new(NativeTypes::default());
    let fields = list(vec![
      list(vec![atom_sym("x"), atom_sym("int")]),
      list(vec![atom_sym("y"), atom_sym("int")]),
    ]);
    let form = list(vec![atom_sym("struct"), atom_sym("extern"), fields]);
    declare_struct(&mut ctx, intern("Point"), form.as_list().unwrap(), &span()).unwrap();
    let s = ctx.lookup_struct(intern("Point")).unwrap();
    assert_eq!(s.members.len(), 2);
    assert_eq!(s.members[0].name, intern("x"));
  }

  #[test]
  fn enum_auto_assigns_sequential_values() {
    let mut ctx = Context::new(NativeTypes::default());
    let members = list(vec![atom_sym("Red"), atom_sym("Green"), atom_sym("Blue")]);
    let form = list(vec![atom_sym("enum"), atom_sym("extern"), atom_sym("int"), members]);
    declare_enum(&mut ctx, intern("Color"), form.as_list().unwrap(), &span()).unwrap();
    let e = ctx.lookup_enum(intern("Color")).unwrap();
    assert_eq!(e.member_value(intern("Red")), Some(0));
    assert_eq!(e.member_value(intern("Blue")), Some(2));
    assert!(ctx.lookup_struct(intern("Color")).is_some());
  }

  #[test]
  fn enum_explicit_index_resumes_auto_assignment_after() {
    let mut ctx = Context::new(NativeTypes::default());
    let members = list(vec![
      atom_sym("A"),
      list(vec![atom_sym("B"), atom_int(10)]),
      atom_sym("C"),
    ]);
    let form = list(vec![atom_sym("enum"), atom_sym("extern"), atom_sym("int"), members]);
    declare_enum(&mut ctx, intern("E"), form.as_list().unwrap(), &span()).unwrap();
    let e = ctx.lookup_enum(intern("E")).unwrap();
    assert_eq!(e.member_value(intern("A")), Some(0));
    assert_eq!(e.member_value(intern("B")), Some(10));
    assert_eq!(e.member_value(intern("C")), Some(11));
  }

  #[test]
  fn single_void_parameter_means_no_parameters() {
    let mut ctx = Context::new(NativeTypes::default());
    let params = list(vec![atom_sym("void")]);
    let out = parse_params(&mut ctx, &params, &span()).unwrap();
    assert!(out.is_empty());
  }

  #[test]
  fn varargs_must_be_last_parameter() {
    let mut ctx = Context::new(NativeTypes::default());
    let params = list(vec![atom_sym("..."), list(vec![atom_sym("n"), atom_sym("int")])]);
    let err = parse_params(&mut ctx, &params, &span()).unwrap_err();
    assert!(matches!(err, CoreError::VarargsMustBeLast));
  }
}
