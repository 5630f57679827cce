//! A reference backend for the `dalec` binary (spec.md §1 lists the IR
//! emitter/JIT and dynamic loader as external collaborators this core
//! only consumes through traits). No concrete code generator ships with
//! this crate, so this module provides a minimal implementation of
//! [`Emitter`]/[`Jit`]/[`MacroRuntime`]/[`DynLoader`] sufficient to run
//! the CLI end to end on macro-free sources and produce placeholder
//! sibling artifacts with the right names and extensions. Binding a real
//! LLVM-like backend is left to an embedder; see `DESIGN.md`.

use std::collections::HashMap;
use std::path::Path;

use crate::emit::{BlockHandle, DynLoader, Emitter, FuncHandle, Jit, JitError, LibHandle, OutputKind, StructHandle, ValueHandle, ValueRef};
use crate::error::CoreError;
use crate::macros::{MacroRuntime, MContext, PoolHandle};
use crate::node::DNode;
use crate::types::entity::Linkage;
use crate::types::ty::Type;

#[derive(Default)]
pub struct ReferenceEmitter {
  next: u32,
  functions: HashMap<String, FuncHandle>,
  globals: HashMap<String, ValueHandle>,
  erased_functions: usize,
  erased_globals: usize,
}

impl ReferenceEmitter {
  fn fresh(&mut self) -> u32 { let n = self.next; self.next += 1; n }
}

impl Emitter for ReferenceEmitter {
  fn declare_function(&mut self, mangled_name: &str, _ty: &Type, _linkage: Linkage) -> FuncHandle {
    let h = FuncHandle(self.fresh());
    self.functions.insert(mangled_name.to_owned(), h);
    h
  }
  fn declare_global(&mut self, mangled_name: &str, _ty: &Type, _linkage: Linkage) -> ValueHandle {
    let h = ValueHandle(self.fresh());
    self.globals.insert(mangled_name.to_owned(), h);
    h
  }
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
  fn cast(&mut self, val: ValueRef, _from: &Type, _to: &Type) -> ValueRef { val }
  fn ret(&mut self, _val: Option<ValueRef>) {}
  fn branch(&mut self, _to: BlockHandle) {}
  fn cond_branch(&mut self, _cond: ValueRef, _then: BlockHandle, _els: BlockHandle) {}
  fn resolve_function_by_name(&self, mangled_name: &str) -> Option<FuncHandle> { self.functions.get(mangled_name).copied() }
  fn resolve_global_by_name(&self, mangled_name: &str) -> Option<ValueHandle> { self.globals.get(mangled_name).copied() }
  fn erase_function(&mut self, _f: FuncHandle) { self.erased_functions += 1; }
  fn erase_global(&mut self, _g: ValueHandle) { self.erased_globals += 1; }
  fn link_module(&mut self, other: Self) where Self: Sized {
    self.functions.extend(other.functions);
    self.globals.extend(other.globals);
  }
  fn link_bitcode_file(&mut self, path: &Path) -> std::io::Result<()> { std::fs::metadata(path).map(drop) }
  fn write_bitcode(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"dalec-reference-bc") }
  fn write_bitcode_without_macros(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"dalec-reference-bc-nomacros") }
  fn write_shared_object(&self, path: &Path) -> std::io::Result<()> { std::fs::write(path, b"dalec-reference-so") }
  fn write_output(&self, format: OutputKind, path: &Path) -> std::io::Result<()> {
    let tag: &[u8] = match format { OutputKind::Ir => b"dalec-reference-ir", OutputKind::Asm => b"dalec-reference-asm", OutputKind::Bc => b"dalec-reference-bc" };
    std::fs::write(path, tag)
  }
  fn verify(&self) -> Result<(), String> { Ok(()) }
  fn optimize(&mut self, _opt_level: u8, _lto: bool) {}
}

#[derive(Default)]
pub struct ReferenceRuntime {
  next_pool: u32,
}

impl Jit<ReferenceEmitter> for ReferenceRuntime {
  fn compile_function(&mut self, _emitter: &ReferenceEmitter, _f: FuncHandle) -> Result<usize, JitError> {
    Err(JitError::NoMachineCode)
  }
  fn resolve_symbol(&mut self, _name: &str) -> Option<usize> { None }
}

impl MacroRuntime<ReferenceEmitter> for ReferenceRuntime {
  fn new_pool(&mut self) -> PoolHandle { let n = self.next_pool; self.next_pool += 1; PoolHandle(n) }
  fn free_pool(&mut self, _pool: PoolHandle) {}
  fn invoke(&mut self, _addr: usize, _mc: MContext, _args: &[DNode]) -> Result<DNode, CoreError> {
    Err(CoreError::Internal(
      "compile-time macro execution requires a real JIT/FFI backend; \
       the reference backend bundled with this binary cannot run macro bodies".to_owned(),
    ))
  }
}

#[derive(Default)]
pub struct ReferenceLoader;

impl DynLoader for ReferenceLoader {
  fn load_library(&mut self, _path: &Path) -> Result<LibHandle, std::io::Error> { Ok(LibHandle(0)) }
  fn find_symbol(&self, _lib: LibHandle, _name: &str) -> Option<usize> { None }
}
