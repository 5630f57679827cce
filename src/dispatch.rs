//! The Form Dispatcher (C5, spec.md §4.4): routes a top-level list by
//! its head symbol to declaration forms (C6), the module packager (C9),
//! or treats it as a top-level macro call (C8).
//!
//! `include`'s file handling and `once`'s unit-stack pop are owned by
//! the driver (C10), which keeps the parser handle and the unit stack
//! this module never sees; both are reported back as a [`TopFormOutcome`]
//! rather than acted on here.

use std::rc::Rc;

use hashbrown::HashSet;

use crate::config::Config;
use crate::context::{ArgType, Context, OverloadError};
use crate::decls;
use crate::emit::{DynLoader, Emitter};
use crate::error::CoreError;
use crate::lower::NeedsMacro;
use crate::macros::{invoke_macro, MacroRuntime};
use crate::module::{self, ModuleRegistry, OnceOutcome};
use crate::node::{Node, Token};
use crate::span::{FileSpan, Span};
use crate::symbol::Symbol;
use crate::types::entity::OnceTag;

/// What the driver needs to do after a top-form finished dispatching
/// (spec.md §4.4, §4.8 `once`, §4.9 `include`).
pub enum TopFormOutcome {
  /// Nothing further required; process the next top-form.
  Continue,
  /// `include PATH` (spec.md §4.9 step 4: "Drive top-form processing
  /// via C5 until end-of-file; on EOF inside an `include`, pop the unit
  /// stack" — pushing the new unit is symmetric, and is the driver's job
  /// since it owns the parser).
  Include(String),
  /// `once TAG` re-triggered its own tag (spec.md §4.8 `once`): the
  /// driver must pop the current unit off its stack.
  PopUnit,
}

/// `module NAME [(attr ...)]`'s effect on the current unit (spec.md
/// §4.8), threaded in by the driver since it owns the `Unit`.
#[derive(Default)]
pub struct ModuleState {
  pub name: Option<String>,
  pub cto: bool,
}

fn span_of(filename: &Rc<str>, node: &Node) -> FileSpan {
  FileSpan::new(filename.clone(), node.pos().reported())
}

fn as_symbol(node: &Node) -> Result<Symbol, CoreError> {
  match node.as_atom() {
    Some(Token::Symbol(s)) => Ok(*s),
    _ => Err(CoreError::FirstListElementMustBeSymbol),
  }
}

fn as_string(node: &Node) -> Result<String, CoreError> {
  match node.as_atom() {
    Some(Token::Str(s)) => Ok(s.to_string()),
    Some(Token::Symbol(s)) => Ok(s.to_string()),
    _ => Err(CoreError::UnexpectedElement),
  }
}

/// A dotted name (`Foo.Bar`) splits into a namespace path plus leaf,
/// matching the convention `typeparser.rs` uses for qualified type
/// references (spec.md §4.3 "Qualified (dot-separated) aggregate
/// reference").
fn dotted_path(name: Symbol) -> Vec<Symbol> {
  name.to_string().split('.').map(crate::symbol::intern).collect()
}

/// Dispatch one top-level form (spec.md §4.4). `runtime`/`loader` are
/// only ever exercised by the branches that actually need them (macro
/// calls, `import`); everything else ignores them.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_top_form<E: Emitter, R: MacroRuntime<E>, L: DynLoader>(
  ctx: &mut Context,
  emitter: &mut E,
  runtime: &mut R,
  loader: &mut L,
  registry: &mut ModuleRegistry,
  config: &Config,
  once_tags: &mut HashSet<OnceTag>,
  is_last_open_unit: bool,
  module_state: &mut ModuleState,
  filename: &Rc<str>,
  form: &Node,
) -> Result<TopFormOutcome, CoreError> {
  let items = form.as_list().ok_or(CoreError::OnlyListsAtTopLevel)?;
  let Some(head) = items.first() else { return Err(CoreError::NoEmptyLists) };
  let Some(Token::Symbol(kind)) = head.as_atom() else {
    return if head.is_list() { Err(CoreError::FirstListElementMustBeAtom) } else { Err(CoreError::FirstListElementMustBeSymbol) }
  };

  match kind.to_string().as_str() {
    "do" => {
      for child in &items[1..] {
        match dispatch_top_form(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, child)? {
          TopFormOutcome::Continue => {}
          other => return Ok(other),
        }
      }
      Ok(TopFormOutcome::Continue)
    }

    "def" => {
      let [_, name_node, decl] = items else {
        return Err(CoreError::IncorrectMinimumNumberOfArgs { expected: 2, got: items.len().saturating_sub(1) });
      };
      let name = as_symbol(name_node)?;
      let span = span_of(filename, decl);
      decls::declare(ctx, emitter, runtime, filename, name, decl, &span)?;
      Ok(TopFormOutcome::Continue)
    }

    "namespace" => {
      let [_, name_node, body @ ..] = items else { return Err(CoreError::UnexpectedElement) };
      let name = as_symbol(name_node)?;
      let path = dotted_path(name);
      for &seg in &path { ctx.push_namespace(seg); }
      let outcome = dispatch_body(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, body);
      for _ in &path { ctx.pop_namespace(); }
      outcome
    }

    "using-namespace" => {
      let [_, name_node, body @ ..] = items else { return Err(CoreError::UnexpectedElement) };
      let name = as_symbol(name_node)?;
      let path: Rc<[Symbol]> = Rc::from(dotted_path(name));
      ctx.push_used_namespace(path);
      let outcome = dispatch_body(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, body);
      ctx.pop_used_namespace();
      outcome
    }

    "include" => {
      let [_, path_node] = items else { return Err(CoreError::UnexpectedElement) };
      Ok(TopFormOutcome::Include(as_string(path_node)?))
    }

    "module" => {
      let [_, name_node, attrs @ ..] = items else { return Err(CoreError::UnexpectedElement) };
      let name = as_string(name_node)?;
      module::validate_module_name(&name)?;
      for attr in attrs {
        let attr_sym = as_symbol(attr)?;
        match attr_sym.to_string().as_str() {
          "cto" => module_state.cto = true,
          other => return Err(CoreError::InvalidAttribute(other.to_owned())),
        }
      }
      module_state.name = Some(name);
      Ok(TopFormOutcome::Continue)
    }

    "import" => {
      let [_, name_node, rest @ ..] = items else { return Err(CoreError::UnexpectedElement) };
      let name = as_string(name_node)?;
      let symbols = match rest {
        [] => None,
        [syms_node] => {
          let syms = syms_node.as_list().ok_or(CoreError::UnexpectedElement)?;
          let mut out = Vec::with_capacity(syms.len());
          for s in syms { out.push(as_symbol(s)?); }
          Some(out)
        }
        _ => return Err(CoreError::UnexpectedElement),
      };
      module::import_module(ctx, loader, registry, config, once_tags, &name, symbols.as_deref())?;
      Ok(TopFormOutcome::Continue)
    }

    "once" => {
      let [_, tag_node] = items else { return Err(CoreError::UnexpectedElement) };
      let tag = as_symbol(tag_node)?;
      match module::once_form(once_tags, is_last_open_unit, tag)? {
        OnceOutcome::Continue => Ok(TopFormOutcome::Continue),
        OnceOutcome::PopUnit => Ok(TopFormOutcome::PopUnit),
      }
    }

    _ => dispatch_top_level_macro_call(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, items, form),
  }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_body<E: Emitter, R: MacroRuntime<E>, L: DynLoader>(
  ctx: &mut Context,
  emitter: &mut E,
  runtime: &mut R,
  loader: &mut L,
  registry: &mut ModuleRegistry,
  config: &Config,
  once_tags: &mut HashSet<OnceTag>,
  is_last_open_unit: bool,
  module_state: &mut ModuleState,
  filename: &Rc<str>,
  body: &[Node],
) -> Result<TopFormOutcome, CoreError> {
  for form in body {
    match dispatch_top_form(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, form)? {
      TopFormOutcome::Continue => {}
      other => return Ok(other),
    }
  }
  Ok(TopFormOutcome::Continue)
}

/// Any top-level list whose head isn't one of the core forms is
/// attempted as a macro call (spec.md §4.4). There is no enclosing
/// function to lower real argument types in, so every argument is
/// offered to overload resolution as `PointerToNode` — the same shape
/// C7 falls back to when an argument fails to lower during ordinary
/// macro-argument preparation (spec.md §4.7 step 2); a top-level macro
/// is expected to operate on its arguments unevaluated.
#[allow(clippy::too_many_arguments)]
fn dispatch_top_level_macro_call<E: Emitter, R: MacroRuntime<E>, L: DynLoader>(
  ctx: &mut Context,
  emitter: &mut E,
  runtime: &mut R,
  loader: &mut L,
  registry: &mut ModuleRegistry,
  config: &Config,
  once_tags: &mut HashSet<OnceTag>,
  is_last_open_unit: bool,
  module_state: &mut ModuleState,
  filename: &Rc<str>,
  items: &[Node],
  form: &Node,
) -> Result<TopFormOutcome, CoreError> {
  let head = as_symbol(&items[0])?;
  let args = &items[1..];
  let arg_types: Vec<ArgType> = args.iter().map(|_| ArgType::PointerToNode).collect();
  let m = ctx.resolve_overload(head, &arg_types).map_err(|e| match e {
    OverloadError::NotInScope => CoreError::MacroNotInScope(head.to_string()),
    OverloadError::NotInScopeWithClosest(close) =>
      CoreError::OverloadedFunctionOrMacroNotInScopeWithClosest(head.to_string(), close),
    OverloadError::NoMatch => CoreError::OverloadedFunctionOrMacroNotInScope(head.to_string()),
  })?;
  if !m.is_macro {
    return Err(CoreError::OverloadedFunctionOrMacroNotInScope(head.to_string()));
  }
  let call_site = form.pos().reported();
  let needs = NeedsMacro { function: m.function, arg_nodes: args.to_vec() };
  let spliced = invoke_macro(emitter, runtime, filename, call_site, &needs)?;
  dispatch_top_form(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, filename, &spliced)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{Position, Span as SpanT};
  use crate::symbol::intern;

  fn atom_sym(s: &str) -> Node { Node::atom(Token::Symbol(intern(s)), SpanT::new(Position::new(1, 1), Position::new(1, 2))) }
  fn atom_str(s: &str) -> Node { Node::atom(Token::Str(Rc::from(s)), SpanT::new(Position::new(1, 1), Position::new(1, 2))) }
  fn list(xs: Vec<Node>) -> Node { Node::list(xs, SpanT::new(Position::new(1, 1), Position::new(1, 2))) }

  #[test]
  fn include_form_reports_path_without_touching_context() {
    let form = list(vec![atom_sym("include"), atom_str("a.dt")]);
    let items = form.as_list().unwrap();
    let path = as_string(&items[1]).unwrap();
    assert_eq!(path, "a.dt");
  }

  #[test]
  fn dotted_name_splits_into_path_segments() {
    let path = dotted_path(intern("Foo.Bar.Baz"));
    assert_eq!(path, vec![intern("Foo"), intern("Bar"), intern("Baz")]);
  }

  #[test]
  fn module_name_validation_rejects_bad_chars() {
    assert!(module::validate_module_name("a/b").is_err());
    assert!(module::validate_module_name("a_b-1.2").is_ok());
  }

  fn test_config() -> Config {
    Config {
      sources: Vec::new(), bitcode_inputs: Vec::new(), output: None,
      produce: crate::config::OutputFormat::Bc, opt_level: 0, lto: false,
      module_name: None, no_common: true, no_drt: true,
      static_link: crate::config::StaticLinkSet::None, cto_modules: Vec::new(),
      include_paths: Vec::new(), module_paths: Vec::new(),
      remove_macros: false, debug: false,
      installed_lib_path: std::path::PathBuf::new(), installed_module_path: std::path::PathBuf::new(),
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn dispatch(ctx: &mut Context, emitter: &mut crate::testsupport::NoopEmitter, runtime: &mut crate::testsupport::NoopRuntime,
    loader: &mut crate::testsupport::NoopLoader, registry: &mut ModuleRegistry, config: &Config,
    once_tags: &mut HashSet<OnceTag>, is_last_open_unit: bool, module_state: &mut ModuleState, form: &Node,
  ) -> Result<TopFormOutcome, CoreError> {
    let filename: Rc<str> = Rc::from("t.dt");
    dispatch_top_form(ctx, emitter, runtime, loader, registry, config, once_tags, is_last_open_unit, module_state, &filename, form)
  }

  #[test]
  fn namespace_form_pushes_and_pops_current_path() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("namespace"), atom_sym("Foo"), list(vec![atom_sym("nothing-here")])]);
    // The body's only form is not a core form and resolves to no macro in
    // scope, so the error surfaces, but the namespace must still be popped
    // (the outer `?` in "namespace" only fires after the pop in `outcome`).
    let err = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form);
    assert!(err.is_err());
    assert!(ctx.current_path().is_empty());
  }

  #[test]
  fn using_namespace_restores_used_stack_depth() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("using-namespace"), atom_sym("Foo"), list(vec![])]);
    let outcome = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap();
    assert!(matches!(outcome, TopFormOutcome::Continue));
  }

  #[test]
  fn include_form_propagates_as_outcome_without_mutating_module_state() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("include"), atom_str("sub.dt")]);
    let outcome = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap();
    assert!(matches!(outcome, TopFormOutcome::Include(p) if p == "sub.dt"));
    assert!(module_state.name.is_none());
  }

  #[test]
  fn module_form_sets_name_and_cto_attribute() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("module"), atom_str("mymod"), atom_sym("cto")]);
    let outcome = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap();
    assert!(matches!(outcome, TopFormOutcome::Continue));
    assert_eq!(module_state.name.as_deref(), Some("mymod"));
    assert!(module_state.cto);
  }

  #[test]
  fn once_on_last_open_unit_errors_instead_of_popping() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("once"), atom_sym("TAG")]);
    let err = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap_err();
    assert!(matches!(err, CoreError::CannotOnceTheLastOpenFile));
  }

  #[test]
  fn once_inside_an_include_pops_the_unit_on_repeat() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("once"), atom_sym("TAG")]);
    let first = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, false, &mut module_state, &form).unwrap();
    assert!(matches!(first, TopFormOutcome::Continue));
    let second = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, false, &mut module_state, &form).unwrap();
    assert!(matches!(second, TopFormOutcome::PopUnit));
  }

  #[test]
  fn unknown_head_with_no_matching_function_is_not_in_scope() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![atom_sym("nowhere-at-all")]);
    let err = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap_err();
    assert!(matches!(err, CoreError::MacroNotInScope(_)));
  }

  #[test]
  fn do_form_short_circuits_on_first_non_continue_outcome() {
    let mut ctx = Context::new(crate::types::ty::NativeTypes::default());
    let mut emitter = crate::testsupport::NoopEmitter::default();
    let mut runtime = crate::testsupport::NoopRuntime::default();
    let mut loader = crate::testsupport::NoopLoader;
    let mut registry = ModuleRegistry::new();
    let config = test_config();
    let mut once_tags = HashSet::new();
    let mut module_state = ModuleState::default();

    let form = list(vec![
      atom_sym("do"),
      list(vec![atom_sym("include"), atom_str("first.dt")]),
      list(vec![atom_sym("include"), atom_str("never-reached.dt")]),
    ]);
    let outcome = dispatch(&mut ctx, &mut emitter, &mut runtime, &mut loader, &mut registry, &config, &mut once_tags, true, &mut module_state, &form).unwrap();
    assert!(matches!(outcome, TopFormOutcome::Include(p) if p == "first.dt"));
  }
}
