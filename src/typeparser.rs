//! The Type Form Parser (C4, spec.md §4.3): maps AST fragments to
//! [`Type`]s.

use crate::context::Context;
use crate::error::CoreError;
use crate::node::{Node, Token};
use crate::symbol::Symbol;
use crate::types::ty::{BaseTag, QualifiedName, Type};

/// Per-call parsing options. `allow_anon_structs` gates the anonymous
/// `(struct (FIELDS))` production (spec.md §4.3: "permitted only in
/// contexts (function parameters, locals) that pass
/// `allow_anon_structs`"). `reduce_const` lets a caller that already has
/// C7 wired in supply constant-expression folding for array sizes that
/// are not literal integers (spec.md §4.3 "`(array-of N T)` ... an
/// integer literal or a constant expression reducible by C7"); C4 itself
/// has no dependency on C7.
pub struct TypeParseOptions<'a> {
  pub allow_anon_structs: bool,
  pub reduce_const: Option<&'a mut dyn FnMut(&Node) -> Option<u64>>,
}

impl<'a> TypeParseOptions<'a> {
  #[must_use] pub fn new() -> Self { TypeParseOptions { allow_anon_structs: false, reduce_const: None } }
}

impl<'a> Default for TypeParseOptions<'a> {
  fn default() -> Self { Self::new() }
}

/// Parse `node` as a type form (spec.md §4.3 grammar).
pub fn parse_type(ctx: &mut Context, node: &Node, opts: &mut TypeParseOptions) -> Result<Type, CoreError> {
  match node {
    Node::Atom(Token::Symbol(s), _) => parse_named(ctx, *s),
    Node::Atom(_, _) => Err(CoreError::UnexpectedElement),
    Node::List(items, _) => parse_list(ctx, items, opts),
  }
}

fn parse_named(ctx: &mut Context, sym: Symbol) -> Result<Type, CoreError> {
  let name = sym.to_string();
  if let Some(tag) = parse_base_tag(&name) {
    return Ok(ctx.types.basic(tag));
  }
  if let Some(alias) = ctx.types.typemap_entry(&name).map(str::to_owned) {
    if let Some(tag) = parse_base_tag(&alias) {
      return Ok(ctx.types.basic(tag));
    }
    return parse_named(ctx, crate::symbol::intern(&alias));
  }
  // Qualified (dot-separated) aggregate reference.
  if let Some((path, leaf)) = name.rsplit_once('.') {
    let path_syms: Vec<Symbol> = path.split('.').map(crate::symbol::intern).collect();
    let leaf_sym = crate::symbol::intern(leaf);
    if ctx.lookup_qualified_struct(&path_syms, leaf_sym).is_some()
      || ctx.lookup_qualified_enum(&path_syms, leaf_sym).is_some()
    {
      return Ok(ctx.types.named(QualifiedName::new(path_syms.into(), leaf_sym)));
    }
    return Err(CoreError::NotInScope(name));
  }
  // Bare struct/enum name, resolved in current scope (spec.md §4.3
  // "bare struct/enum name → named aggregate resolved in current scope").
  if ctx.lookup_struct(sym).is_some() || ctx.lookup_enum(sym).is_some() {
    let path: std::rc::Rc<[Symbol]> = ctx.current_path().into();
    return Ok(ctx.types.named(QualifiedName::new(path, sym)));
  }
  Err(CoreError::NotInScope(name))
}

fn parse_base_tag(name: &str) -> Option<BaseTag> {
  Some(match name {
    "void" => BaseTag::Void,
    "..." => BaseTag::Varargs,
    "i8" => BaseTag::I8, "i16" => BaseTag::I16, "i32" => BaseTag::I32, "i64" => BaseTag::I64, "i128" => BaseTag::I128,
    "u8" => BaseTag::U8, "u16" => BaseTag::U16, "u32" => BaseTag::U32, "u64" => BaseTag::U64, "u128" => BaseTag::U128,
    "int" => BaseTag::Int, "uint" => BaseTag::UInt, "size" => BaseTag::Size,
    "intptr" => BaseTag::Intptr, "ptrdiff" => BaseTag::Ptrdiff,
    "bool" => BaseTag::Bool, "char" => BaseTag::Char,
    "float" => BaseTag::Float, "double" => BaseTag::Double, "longdouble" => BaseTag::LongDouble,
    _ => return None,
  })
}

fn parse_list(ctx: &mut Context, items: &[Node], opts: &mut TypeParseOptions) -> Result<Type, CoreError> {
  let Some(head) = items.first() else { return Err(CoreError::NoEmptyLists) };
  let Some(Token::Symbol(head_sym)) = head.as_atom() else { return Err(CoreError::FirstListElementMustBeSymbol) };
  match head_sym.to_string().as_str() {
    "p" => {
      let [_, t] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
      let inner = parse_type(ctx, t, opts)?;
      Ok(ctx.types.pointer(inner))
    }
    "array-of" => {
      let [_, n, t] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
      let size = parse_array_size(n, opts)?;
      let inner = parse_type(ctx, t, opts)?;
      Ok(ctx.types.array(inner, size))
    }
    "fn" => {
      let [_, ret_node, params_node] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
      let ret = parse_type(ctx, ret_node, opts)?;
      let param_nodes = params_node.as_list().ok_or(CoreError::UnexpectedElement)?;
      let mut params = Vec::with_capacity(param_nodes.len());
      for (i, p) in param_nodes.iter().enumerate() {
        let t = parse_type(ctx, p, opts)?;
        if matches!(&*t, crate::types::ty::TypeKind::Base(BaseTag::Varargs)) && i + 1 != param_nodes.len() {
          return Err(CoreError::VarargsMustBeLast);
        }
        params.push(t);
      }
      Ok(ctx.types.function(ret, params))
    }
    "const" => {
      let [_, t] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
      let inner = parse_type(ctx, t, opts)?;
      Ok(ctx.types.constant(inner))
    }
    "bitfield" => {
      let [_, n, t] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 2, got: items.len() - 1 }) };
      let width = parse_array_size(n, opts)?;
      let inner = parse_type(ctx, t, opts)?;
      Ok(ctx.types.bitfield(inner, width as u32))
    }
    "struct" => {
      if !opts.allow_anon_structs { return Err(CoreError::UnexpectedElement) }
      let [_, fields_node] = items else { return Err(CoreError::IncorrectNumberOfArgs { expected: 1, got: items.len() - 1 }) };
      let field_nodes = fields_node.as_list().ok_or(CoreError::UnexpectedElement)?;
      let mut members = Vec::with_capacity(field_nodes.len());
      for f in field_nodes {
        let pair = f.as_list().ok_or(CoreError::UnexpectedElement)?;
        let [name_node, ty_node] = pair else { return Err(CoreError::UnexpectedElement) };
        let Some(Token::Symbol(fname)) = name_node.as_atom() else { return Err(CoreError::UnexpectedElement) };
        let fty = parse_type(ctx, ty_node, opts)?;
        members.push(crate::types::entity::StructMember { name: *fname, ty: fty });
      }
      let name = ctx.fresh_anon_name();
      let s = crate::types::entity::Struct {
        name, members,
        linkage: crate::types::entity::Linkage::Intern,
        once_tag: None,
        internal_name: name.to_string(),
        handle: None,
        span: anon_span(),
      };
      let path = ctx.current_path().to_vec();
      ctx.insert_struct(s).map_err(|_| CoreError::RedeclarationOfStruct(name.to_string()))?;
      Ok(ctx.types.named(QualifiedName::new(path.into(), name)))
    }
    other => Err(CoreError::NotInScope(other.to_owned())),
  }
}

fn parse_array_size(n: &Node, opts: &mut TypeParseOptions) -> Result<u64, CoreError> {
  if let Node::Atom(Token::Integer(v), _) = n {
    return u64::try_from(*v).map_err(|_| CoreError::InvalidInteger(v.to_string()));
  }
  if let Some(reduce) = opts.reduce_const.as_mut() {
    if let Some(v) = reduce(n) { return Ok(v) }
  }
  Err(CoreError::CannotParseLiteral("array size".to_owned()))
}

fn anon_span() -> crate::span::FileSpan {
  crate::span::FileSpan::new(
    std::rc::Rc::from("<anon-struct>"),
    crate::span::Span::new(crate::span::Position::new(0, 0), crate::span::Position::new(0, 0)),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{Position, Span};
  use crate::symbol::intern;
  use crate::types::ty::NativeTypes;

  fn atom_sym(s: &str) -> Node { Node::atom(Token::Symbol(intern(s)), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn atom_int(v: i64) -> Node { Node::atom(Token::Integer(v), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn list(xs: Vec<Node>) -> Node { Node::list(xs, Span::new(Position::new(1, 1), Position::new(1, 2))) }

  #[test]
  fn base_type_atom_resolves() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let t = parse_type(&mut ctx, &atom_sym("int"), &mut opts).unwrap();
    assert!(matches!(&*t, crate::types::ty::TypeKind::Base(BaseTag::Int)));
  }

  #[test]
  fn pointer_form_wraps_inner_type() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let n = list(vec![atom_sym("p"), atom_sym("char")]);
    let t = parse_type(&mut ctx, &n, &mut opts).unwrap();
    assert!(matches!(&*t, crate::types::ty::TypeKind::Pointer(inner) if matches!(&**inner, crate::types::ty::TypeKind::Base(BaseTag::Char))));
  }

  #[test]
  fn array_of_with_literal_size() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let n = list(vec![atom_sym("array-of"), atom_int(4), atom_sym("char")]);
    let t = parse_type(&mut ctx, &n, &mut opts).unwrap();
    assert!(matches!(&*t, crate::types::ty::TypeKind::Array(_, 4)));
  }

  #[test]
  fn array_of_non_literal_size_uses_reduce_const_callback() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut reduce = |_: &Node| Some(8u64);
    let mut opts = TypeParseOptions { allow_anon_structs: false, reduce_const: Some(&mut reduce) };
    let n = list(vec![atom_sym("array-of"), atom_sym("SOME_CONST"), atom_sym("int")]);
    let t = parse_type(&mut ctx, &n, &mut opts).unwrap();
    assert!(matches!(&*t, crate::types::ty::TypeKind::Array(_, 8)));
  }

  #[test]
  fn unknown_name_is_not_in_scope() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let err = parse_type(&mut ctx, &atom_sym("Frobnicator"), &mut opts).unwrap_err();
    assert!(matches!(err, CoreError::NotInScope(_)));
  }

  #[test]
  fn varargs_must_be_last_in_fn_type() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let n = list(vec![
      atom_sym("fn"), atom_sym("int"),
      list(vec![atom_sym("..."), atom_sym("int")]),
    ]);
    let err = parse_type(&mut ctx, &n, &mut opts).unwrap_err();
    assert!(matches!(err, CoreError::VarargsMustBeLast));
  }

  #[test]
  fn anon_struct_requires_opt_in() {
    let mut ctx = Context::new(NativeTypes::default());
    let mut opts = TypeParseOptions::new();
    let n = list(vec![atom_sym("struct"), list(vec![list(vec![atom_sym("x"), atom_sym("int")])])]);
    assert!(parse_type(&mut ctx, &n, &mut opts).is_err());
    opts.allow_anon_structs = true;
    assert!(parse_type(&mut ctx, &n, &mut opts).is_ok());
  }
}
