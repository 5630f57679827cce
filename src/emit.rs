//! The seam between the semantic core and its external collaborators:
//! the LLVM-like IR emitter/JIT, and the dynamic loader for FFI symbol
//! resolution (spec.md §1 "Explicitly OUT of scope"). This module
//! defines only the interfaces the core consumes; no implementation of
//! an actual code generator lives here.

use crate::types::ty::Type;
use crate::types::entity::Linkage;

/// A rebindable handle to an emitted function value (spec.md §9
/// "Reget-pointers pattern": "treat every stored handle as a rebindable
/// reference keyed by symbol name").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FuncHandle(pub u32);

/// A rebindable handle to an emitted global value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueHandle(pub u32);

/// A handle to an emitted struct IR type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StructHandle(pub u32);

/// An opaque handle to a basic block within a function being built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u32);

/// An opaque handle to an emitted value (an instruction result, a
/// constant, or a reference to a global/parameter), used as the "result
/// IR value" field of a `ParseResult` (spec.md §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueRef(pub u32);

/// The interface C7 (procedure body lowering), C8 (macro JIT bodies)
/// and C10 (driver finalization) use to materialize IR. A concrete
/// implementation wraps an LLVM-like module builder; that binding is
/// outside this crate's scope (spec.md §1).
pub trait Emitter {
  /// Declare (or redeclare) a function with the given mangled name,
  /// type, and linkage, returning a handle stable for this module.
  fn declare_function(&mut self, mangled_name: &str, ty: &Type, linkage: Linkage) -> FuncHandle;

  /// Declare (or redeclare) a global variable.
  fn declare_global(&mut self, mangled_name: &str, ty: &Type, linkage: Linkage) -> ValueHandle;

  /// Register a struct IR type with the given field types, in order.
  fn declare_struct(&mut self, mangled_name: &str, field_types: &[Type]) -> StructHandle;

  /// Open a fresh entry block for `f` and position the builder there.
  fn entry_block(&mut self, f: FuncHandle) -> BlockHandle;

  /// The incoming value of parameter `index` of `f` (spec.md §4.5: a
  /// function's declared parameters are bound as locals in its body).
  fn param(&mut self, f: FuncHandle, index: u32) -> ValueRef;

  /// Append a new block, not yet wired to any predecessor.
  fn new_block(&mut self) -> BlockHandle;

  /// Position the builder's insertion point at the end of `b`.
  fn position_at_end(&mut self, b: BlockHandle);

  /// Materialize an integer constant of the given type.
  fn const_int(&mut self, ty: &Type, bits: i128) -> ValueRef;

  /// Materialize a floating-point constant of the given type.
  fn const_float(&mut self, ty: &Type, bits: f64) -> ValueRef;

  /// Materialize a global string constant, returning a pointer to its
  /// first byte (spec.md §4.6 "String literals become globals ...and
  /// decay to `p char` in value position").
  fn const_cstr(&mut self, bytes: &[u8]) -> ValueRef;

  /// Reserve stack storage for a local of type `ty`.
  fn alloca(&mut self, ty: &Type) -> ValueRef;

  /// Load the value at `ptr`.
  fn load(&mut self, ptr: ValueRef, ty: &Type) -> ValueRef;

  /// Store `val` at `ptr`.
  fn store(&mut self, ptr: ValueRef, val: ValueRef);

  /// Compute the address of field `index` of an aggregate at `ptr`.
  fn gep_field(&mut self, ptr: ValueRef, index: u32) -> ValueRef;

  /// Compute the address of element `index` of an array/pointer at `ptr`.
  fn gep_index(&mut self, ptr: ValueRef, index: ValueRef) -> ValueRef;

  /// Emit a call to `f` with `args`, returning the result (void
  /// functions return a handle the caller must not read).
  fn call(&mut self, f: FuncHandle, args: &[ValueRef]) -> ValueRef;

  /// Emit a call to a value of function-pointer type.
  fn call_indirect(&mut self, callee: ValueRef, fn_ty: &Type, args: &[ValueRef]) -> ValueRef;

  /// Emit a cast between the given value and a target type (explicit or
  /// implicit, per spec.md §4.6 "Cast").
  fn cast(&mut self, val: ValueRef, from: &Type, to: &Type) -> ValueRef;

  /// Emit a return from the current block.
  fn ret(&mut self, val: Option<ValueRef>);

  /// Emit an unconditional branch.
  fn branch(&mut self, to: BlockHandle);

  /// Emit a conditional branch.
  fn cond_branch(&mut self, cond: ValueRef, then: BlockHandle, els: BlockHandle);

  /// Resolve a function already declared in this module by its mangled
  /// name, used by the reget-pointers pass (spec.md §4.8) after a
  /// cross-module merge.
  fn resolve_function_by_name(&self, mangled_name: &str) -> Option<FuncHandle>;

  /// Resolve a global already declared in this module by its mangled name.
  fn resolve_global_by_name(&self, mangled_name: &str) -> Option<ValueHandle>;

  /// Erase a function and all its instructions from the module (used by
  /// macro-temporary cleanup, spec.md §4.7, and `--remove-macros`).
  fn erase_function(&mut self, f: FuncHandle);

  /// Erase a global from the module.
  fn erase_global(&mut self, g: ValueHandle);

  /// Link `other` into `self`, consuming it (spec.md §4.9 step 7, §4.8
  /// "Reget-pointers").
  fn link_module(&mut self, other: Self) where Self: Sized;

  /// Parse a bitcode file from disk and link it into this module
  /// (spec.md §4.9 "Optionally link bitcode files supplied on the
  /// command line").
  fn link_bitcode_file(&mut self, path: &std::path::Path) -> std::io::Result<()>;

  /// Write this module's IR as LLVM bitcode to `path` (spec.md §4.8
  /// "The IR content is written to a sibling `.bc` file").
  fn write_bitcode(&self, path: &std::path::Path) -> std::io::Result<()>;

  /// Write this module's IR with macro and CTO functions erased first,
  /// to the `-nomacros.bc` sibling (spec.md §4.8).
  fn write_bitcode_without_macros(&self, path: &std::path::Path) -> std::io::Result<()>;

  /// Write a native shared library for this module, for JIT-time symbol
  /// resolution by importers (spec.md §4.8 "a platform shared library
  /// (.so/.dylib) used at JIT time").
  fn write_shared_object(&self, path: &std::path::Path) -> std::io::Result<()>;

  /// Emit this module as human-readable IR text, assembly, or bitcode
  /// (spec.md §4.9 "emit to the requested format").
  fn write_output(&self, format: OutputKind, path: &std::path::Path) -> std::io::Result<()>;

  /// Run the module verifier; used only when `--debug` is set (spec.md
  /// §6 "`--debug` enable module verification"). A verification failure
  /// is the one `JitError::VerificationFailed`-class fatal condition
  /// spec.md §7 names explicitly.
  fn verify(&self) -> Result<(), String>;

  /// Run the configured optimization pipeline at the given `-O` level
  /// (spec.md §4.9 "optimize").
  fn optimize(&mut self, opt_level: u8, lto: bool);
}

/// The output artifact kinds `Emitter::write_output` can produce (spec.md
/// §6 `--produce {ir|asm|bc}`), kept distinct from [`crate::config::OutputFormat`]
/// so this module has no dependency on the config layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind { Ir, Asm, Bc }

/// The JIT engine interface C8 uses to materialize a native function
/// pointer for a macro body and invoke it (spec.md §4.7 "Call", §9 "FFI
/// call into JIT-compiled macros").
pub trait Jit<E: Emitter> {
  /// Ensure `f` has been compiled to native code in this JIT session and
  /// return a callable address.
  fn compile_function(&mut self, emitter: &E, f: FuncHandle) -> Result<usize, JitError>;

  /// Resolve an external symbol by name, consulting the introspection
  /// registry first (spec.md §4.7 "Introspection bridge"), then the
  /// dynamic loader, with an optional leading-underscore retry.
  fn resolve_symbol(&mut self, name: &str) -> Option<usize>;
}

/// JIT-level failures, which are fatal per spec.md §7 ("any fatal
/// engine failure... aborts after printing an 'Internal error:'
/// message").
#[derive(Debug, Clone)]
pub enum JitError {
  VerificationFailed(String),
  NoMachineCode,
  MissingSymbol(String),
}

/// The dynamic loader interface used for FFI call dispatch and shared
/// library symbol resolution (spec.md §1 "dynamic loader for shared
/// libraries and FFI call dispatch").
pub trait DynLoader {
  fn load_library(&mut self, path: &std::path::Path) -> Result<LibHandle, std::io::Error>;
  fn find_symbol(&self, lib: LibHandle, name: &str) -> Option<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LibHandle(pub u32);
