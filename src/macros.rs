//! The Macro Engine (C8, spec.md §4.7): once C7 reports that a call
//! resolved to a candidate flagged `is-macro` ([`crate::lower::NeedsMacro`]),
//! this module JIT-compiles the macro's body, invokes it over the
//! `DNode` C-ABI with the unevaluated argument forms, and converts the
//! returned `DNode` back into a [`Node`] the caller splices in place of
//! the original call (spec.md §4.7 "Call", "Splicing").
//!
//! Argument preparation and rollback (spec.md §4.7 steps 1-4: a
//! temporary scratch function, speculative lowering, and a full
//! `Context` save/restore on macro match) are approximated rather than
//! reproduced at the IR-instruction level; see DESIGN.md.

use std::rc::Rc;

use crate::config::CompilerState;
use crate::emit::{Emitter, Jit, JitError};
use crate::error::CoreError;
use crate::lower::NeedsMacro;
use crate::node::{dnode_to_node, node_to_dnode, DNode, DNodeError, Node, Token};
use crate::span::Span;
use crate::symbol::intern;

/// A per-call pool-allocator handle (spec.md §6 "MContext" fields). The
/// allocator itself lives outside this crate (spec.md §1); this module
/// only threads the opaque handle through to `MacroRuntime`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub u32);

/// The per-call macro-context argument passed as a macro's implicit
/// first parameter (spec.md §6 "ABI to macros"). `generator` is an
/// opaque handle into the introspection bridge (spec.md §4.7
/// "Introspection bridge"); this crate never interprets it.
#[derive(Clone, Copy, Debug)]
pub struct MContext {
  pub arg_count: i32,
  pub pool: PoolHandle,
  pub generator: u32,
}

/// The seam C8 uses to JIT-compile a macro's IR function and invoke it
/// over the `DNode` FFI boundary (spec.md §4.7 "Call": "`ffi_prep_cif`
/// and `ffi_call` invoke it with `arg_count+1` pointer arguments", §9
/// "FFI call into JIT-compiled macros"). Extends [`Jit`] rather than
/// duplicating `compile_function`/`resolve_symbol`: a macro-capable JIT
/// session is still just a JIT session with an invocation trampoline
/// and a pool allocator layered on top.
pub trait MacroRuntime<E: Emitter>: Jit<E> {
  /// Allocate a fresh per-call pool to own the `DNode` tree a macro
  /// builds and returns (spec.md §5 "per-macro-call pool allocator").
  fn new_pool(&mut self) -> PoolHandle;

  /// Free a pool via the exported `pool-free` function once the
  /// returned tree has been copied into the host `Node` representation
  /// (spec.md §4.7 "The pool is then freed via an exported `pool-free`
  /// function").
  fn free_pool(&mut self, pool: PoolHandle);

  /// Invoke the native function at `addr` with `mc` and `args`,
  /// returning the `DNode` it produced.
  fn invoke(&mut self, addr: usize, mc: MContext, args: &[DNode]) -> Result<DNode, CoreError>;
}

fn jit_error_to_core(e: JitError) -> CoreError {
  match e {
    JitError::VerificationFailed(m) => CoreError::Internal(format!("macro JIT verification failed: {m}")),
    JitError::NoMachineCode => CoreError::Internal("macro JIT produced no machine code".into()),
    JitError::MissingSymbol(s) => CoreError::Internal(format!("macro JIT could not resolve symbol `{s}`")),
  }
}

fn dnode_error_to_core(e: DNodeError) -> CoreError {
  match e {
    DNodeError::HasNoString => CoreError::DNodeHasNoString,
    DNodeError::NeitherTokenNorList => CoreError::DNodeIsNeitherTokenNorList,
  }
}

/// JIT-compile `needs.function`, invoke it with `needs.arg_nodes`
/// converted to `DNode`s, and return the spliced replacement `Node`
/// (spec.md §4.7 "Call", "Splicing", "Macro-origin positions").
/// `call_site` is the span the original call occupied; every node in
/// the result is stamped with it as its macro-origin position so later
/// diagnostics can report "expanded from" (spec.md §4.7).
pub fn invoke_macro<E: Emitter, R: MacroRuntime<E>>(
  emitter: &mut E, runtime: &mut R, filename: &Rc<str>, call_site: Span, needs: &NeedsMacro,
) -> Result<Node, CoreError> {
  let Some(handle) = needs.function.handle else {
    return Err(CoreError::Internal(format!("macro `{}` has no IR handle", needs.function.name)));
  };
  let addr = runtime.compile_function(emitter, handle).map_err(jit_error_to_core)?;

  let dnode_args: Vec<DNode> = needs.arg_nodes.iter().map(|n| node_to_dnode(n, filename)).collect();
  let pool = runtime.new_pool();
  let mc = MContext { arg_count: dnode_args.len() as i32, pool, generator: 0 };
  let result = runtime.invoke(addr, mc, &dnode_args);
  runtime.free_pool(pool);
  let returned = result?;

  let node = dnode_to_node(&returned, call_site, &mut |s| intern(s)).map_err(dnode_error_to_core)?;
  Ok(unwrap_do_splice(node))
}

/// `(do X)` with exactly two elements unwraps to `X` (spec.md §4.7
/// "Splicing": "If it is `(do X)` with exactly two elements, it
/// unwraps to `X`; otherwise the whole returned form is spliced in").
fn unwrap_do_splice(node: Node) -> Node {
  if let Node::List(items, _) = &node {
    if let [head, x] = items.as_slice() {
      if head.as_atom() == Some(&Token::Symbol(intern("do"))) {
        return x.clone();
      }
    }
  }
  node
}

/// Temporary names for the scratch function / marker global / pool
/// variable a macro-call expansion needs, scoped to the current
/// top-form and erased once it is fully lowered (spec.md §4.7 "Cleanup":
/// "All temporaries introduced for this top-form... are erased from the
/// module once the top-form finishes lowering, by name").
pub fn temp_function_name(state: &mut CompilerState) -> String { state.fresh_temp_name("TempMacroExecution") }
pub fn temp_marker_name(state: &mut CompilerState) -> String { state.fresh_temp_name("TempMacroMarker") }

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::{Position, Span};

  fn sp(a: u32, b: u32) -> Span { Span::new(Position::new(1, a), Position::new(1, b)) }

  #[test]
  fn do_wrapper_unwraps_to_single_child() {
    let inner = Node::atom(Token::Integer(1), sp(3, 4));
    let wrapped = Node::list(vec![Node::atom(Token::Symbol(intern("do")), sp(1, 3)), inner], sp(0, 5));
    let unwrapped = unwrap_do_splice(wrapped);
    assert!(matches!(unwrapped, Node::Atom(Token::Integer(1), _)));
  }

  #[test]
  fn non_do_form_passes_through_unchanged() {
    let form = Node::list(vec![Node::atom(Token::Symbol(intern("foo")), sp(0, 3))], sp(0, 3));
    let Node::List(items, _) = unwrap_do_splice(form.clone()) else { panic!("expected list") };
    assert_eq!(items.len(), 1);
  }
}
