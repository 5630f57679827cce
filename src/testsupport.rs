//! Shared test doubles for the `Emitter`/`Jit`/`MacroRuntime`/`DynLoader`
//! seam, used by `dispatch.rs` and `driver.rs` unit tests. None of this
//! models real codegen; it only tracks enough bookkeeping (declared
//! names, erased handles) to assert on control flow.

#![cfg(test)]

use std::collections::HashMap;
use std::path::Path;

use crate::emit::{BlockHandle, DynLoader, Emitter, FuncHandle, JitError, Jit, LibHandle, OutputKind, StructHandle, ValueHandle, ValueRef};
use crate::error::CoreError;
use crate::macros::{MacroRuntime, MContext, PoolHandle};
use crate::node::DNode;
use crate::types::entity::Linkage;
use crate::types::ty::Type;

#[derive(Default)]
pub struct NoopEmitter {
  next: u32,
  pub functions: HashMap<String, FuncHandle>,
  pub erased: Vec<FuncHandle>,
  /// Every `(from, to)` type pair passed to `cast`, for tests that need
  /// to observe which promotion/coercion was chosen without a real code
  /// generator backing the value.
  pub casts: Vec<(Type, Type)>,
}

impl NoopEmitter {
  fn fresh(&mut self) -> u32 { let n = self.next; self.next += 1; n }
}

impl Emitter for NoopEmitter {
  fn declare_function(&mut self, mangled_name: &str, _ty: &Type, _linkage: Linkage) -> FuncHandle {
    let h = FuncHandle(self.fresh());
    self.functions.insert(mangled_name.to_owned(), h);
    h
  }
  fn declare_global(&mut self, _mangled_name: &str, _ty: &Type, _linkage: Linkage) -> ValueHandle { ValueHandle(self.fresh()) }
  fn declare_struct(&mut self, _mangled_name: &str, _field_types: &[Type]) -> StructHandle { StructHandle(self.fresh()) }
  fn entry_block(&mut self, _f: FuncHandle) -> BlockHandle { BlockHandle(self.fresh()) }
  fn param(&mut self, _f: FuncHandle, _index: u32) -> ValueRef { ValueRef(self.fresh()) }
  fn new_block(&mut self) -> BlockHandle { BlockHandle(self.fresh()) }
  fn position_at_end(&mut self, _b: BlockHandle) {}
  fn const_int(&mut self, _ty: &Type, _bits: i128) -> ValueRef { ValueRef(self.fresh()) }
  fn const_float(&mut self, _ty: &Type, _bits: f64) -> ValueRef { ValueRef(self.fresh()) }
  fn const_cstr(&mut self, _bytes: &[u8]) -> ValueRef { ValueRef(self.fresh()) }
  fn alloca(&mut self, _ty: &Type) -> ValueRef { ValueRef(self.fresh()) }
  fn load(&mut self, _ptr: ValueRef, _ty: &Type) -> ValueRef { ValueRef(self.fresh()) }
  fn store(&mut self, _ptr: ValueRef, _val: ValueRef) {}
  fn gep_field(&mut self, _ptr: ValueRef, _index: u32) -> ValueRef { ValueRef(self.fresh()) }
  fn gep_index(&mut self, _ptr: ValueRef, _index: ValueRef) -> ValueRef { ValueRef(self.fresh()) }
  fn call(&mut self, _f: FuncHandle, _args: &[ValueRef]) -> ValueRef { ValueRef(self.fresh()) }
  fn call_indirect(&mut self, _callee: ValueRef, _fn_ty: &Type, _args: &[ValueRef]) -> ValueRef { ValueRef(self.fresh()) }
  fn cast(&mut self, val: ValueRef, from: &Type, to: &Type) -> ValueRef {
    self.casts.push((from.clone(), to.clone()));
    val
  }
  fn ret(&mut self, _val: Option<ValueRef>) {}
  fn branch(&mut self, _to: BlockHandle) {}
  fn cond_branch(&mut self, _cond: ValueRef, _then: BlockHandle, _els: BlockHandle) {}
  fn resolve_function_by_name(&self, mangled_name: &str) -> Option<FuncHandle> { self.functions.get(mangled_name).copied() }
  fn resolve_global_by_name(&self, _mangled_name: &str) -> Option<ValueHandle> { None }
  fn erase_function(&mut self, f: FuncHandle) { self.erased.push(f); }
  fn erase_global(&mut self, _g: ValueHandle) {}
  fn link_module(&mut self, other: Self) where Self: Sized { self.functions.extend(other.functions); }
  fn link_bitcode_file(&mut self, path: &Path) -> std::io::Result<()> { std::fs::read(path).map(drop) }
  fn write_bitcode(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"bc") }
  fn write_bitcode_without_macros(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"bc-nomacros") }
  fn write_shared_object(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"so") }
  fn write_output(&self, _format: OutputKind, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"out") }
  fn verify(&self) -> Result<(), String> { Ok(()) }
  fn optimize(&mut self, _opt_level: u8, _lto: bool) {}
}

/// Canned JIT/macro runtime: `invoke` returns whatever was registered
/// under the callee's mangled name via `canned`, or an atom-list `(ok)`
/// otherwise.
#[derive(Default)]
pub struct NoopRuntime {
  /// Keyed by the `FuncHandle` id `compile_function` hands back as the
  /// "address", since this double never produces real machine code.
  pub canned: HashMap<u32, DNode>,
  next_pool: u32,
}

impl Jit<NoopEmitter> for NoopRuntime {
  fn compile_function(&mut self, _emitter: &NoopEmitter, f: FuncHandle) -> Result<usize, JitError> { Ok(f.0 as usize) }
  fn resolve_symbol(&mut self, _name: &str) -> Option<usize> { None }
}

impl MacroRuntime<NoopEmitter> for NoopRuntime {
  fn new_pool(&mut self) -> PoolHandle { let n = self.next_pool; self.next_pool += 1; PoolHandle(n) }
  fn free_pool(&mut self, _pool: PoolHandle) {}
  fn invoke(&mut self, addr: usize, _mc: MContext, _args: &[DNode]) -> Result<DNode, CoreError> {
    self.canned.get(&(addr as u32)).cloned().ok_or_else(|| CoreError::Internal("no canned result".into()))
  }
}

#[derive(Default)]
pub struct NoopLoader;

impl DynLoader for NoopLoader {
  fn load_library(&mut self, _path: &Path) -> Result<LibHandle, std::io::Error> { Ok(LibHandle(0)) }
  fn find_symbol(&self, _lib: LibHandle, _name: &str) -> Option<usize> { None }
}
