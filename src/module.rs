//! The Module / DTM Packager (C9, spec.md §4.8): serializes a compiled
//! unit's declarations (namespace tree, once-tags, required modules,
//! the `cto` flag, and the typemap) into a portable container, and
//! implements the `import`/`module`/`once` top-level forms that produce
//! and consume one.
//!
//! A DTM never stores [`crate::types::ty::Type`] handles directly — those
//! are interned per-process (spec.md §3 invariant (d)) and a freshly
//! deserialized `Rc` would not participate in that interning. Every type
//! is instead mirrored into a [`WireType`], reconstructed back into a
//! live, re-interned `Type` by [`type_of_wire`] as the DTM is imported.

use hashbrown::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::config::Config;
use crate::context::Context;
use crate::emit::{DynLoader, Emitter, LibHandle};
use crate::error::CoreError;
use crate::namespace::{NameEntry, Namespace};
use crate::span::{FileSpan, Position, Span};
use crate::symbol::Symbol;
use crate::types::entity::{Enum, Function, Linkage, OnceTag, Struct, StructMember, Variable};
use crate::types::ty::{BaseTag, QualifiedName, Type, TypeKind, TypeRegistry};

/// A non-interning mirror of [`TypeKind`], using `Box` instead of `Rc`
/// so it can round-trip through serde without going through the process
/// type interner.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum WireType {
  Base(BaseTag),
  Pointer(Box<WireType>),
  Array(Box<WireType>, u64),
  Function { ret: Box<WireType>, params: Vec<WireType> },
  Named(Vec<Symbol>, Symbol),
  Const(Box<WireType>),
  Bitfield(Box<WireType>, u32),
}

#[must_use] pub fn wire_of_type(t: &Type) -> WireType {
  match &**t {
    TypeKind::Base(b) => WireType::Base(*b),
    TypeKind::Pointer(to) => WireType::Pointer(Box::new(wire_of_type(to))),
    TypeKind::Array(elem, n) => WireType::Array(Box::new(wire_of_type(elem)), *n),
    TypeKind::Function { ret, params } => WireType::Function {
      ret: Box::new(wire_of_type(ret)),
      params: params.iter().map(wire_of_type).collect(),
    },
    TypeKind::Named(q) => WireType::Named(q.path.to_vec(), q.name),
    TypeKind::Const(inner) => WireType::Const(Box::new(wire_of_type(inner))),
    TypeKind::Bitfield(inner, w) => WireType::Bitfield(Box::new(wire_of_type(inner)), *w),
  }
}

/// Reconstruct a live, re-interned [`Type`] from its wire form.
#[must_use] pub fn type_of_wire(reg: &mut TypeRegistry, w: &WireType) -> Type {
  match w {
    WireType::Base(b) => reg.basic(*b),
    WireType::Pointer(to) => { let t = type_of_wire(reg, to); reg.pointer(t) }
    WireType::Array(elem, n) => { let t = type_of_wire(reg, elem); reg.array(t, *n) }
    WireType::Function { ret, params } => {
      let r = type_of_wire(reg, ret);
      let ps: Vec<Type> = params.iter().map(|p| type_of_wire(reg, p)).collect();
      reg.function(r, ps)
    }
    WireType::Named(path, name) => reg.named(QualifiedName::new(Rc::from(path.clone()), *name)),
    WireType::Const(inner) => { let t = type_of_wire(reg, inner); reg.constant(t) }
    WireType::Bitfield(inner, width) => { let t = type_of_wire(reg, inner); reg.bitfield(t, *width) }
  }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireVariable {
  name: Symbol,
  ty: WireType,
  linkage: Linkage,
  once_tag: Option<OnceTag>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireFunction {
  name: Symbol,
  ret: WireType,
  params: Vec<WireVariable>,
  linkage: Linkage,
  is_macro: bool,
  is_setf_fn: bool,
  cto: bool,
  once_tag: Option<OnceTag>,
  mangled_name: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireStructMember {
  name: Symbol,
  ty: WireType,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireStruct {
  name: Symbol,
  members: Vec<WireStructMember>,
  linkage: Linkage,
  once_tag: Option<OnceTag>,
  internal_name: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireEnumMember {
  name: Symbol,
  value: i64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireEnum {
  name: Symbol,
  underlying: WireType,
  members: Vec<WireEnumMember>,
  linkage: Linkage,
  once_tag: Option<OnceTag>,
  projected_struct: WireStruct,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
struct WireNameEntry {
  functions: Vec<WireFunction>,
  variable: Option<WireVariable>,
  struct_: Option<WireStruct>,
  enum_: Option<WireEnum>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct WireNamespace {
  name: Option<Symbol>,
  entries: Vec<(Symbol, WireNameEntry)>,
  children: Vec<(Symbol, WireNamespace)>,
}

/// The on-disk DTM contents (spec.md §4.8, §6 "DTM file format").
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Dtm {
  root: WireNamespace,
  once_tags: Vec<OnceTag>,
  required_modules: Vec<String>,
  cto: bool,
  typemap: Vec<(String, String)>,
}

fn placeholder_span(module_file: &Rc<str>) -> FileSpan {
  FileSpan::new(module_file.clone(), Span::new(Position::default(), Position::default()))
}

fn wire_of_variable(v: &Variable) -> WireVariable {
  WireVariable { name: v.name, ty: wire_of_type(&v.ty), linkage: v.linkage, once_tag: v.once_tag }
}

fn variable_of_wire(reg: &mut TypeRegistry, module_file: &Rc<str>, w: &WireVariable) -> Variable {
  Variable {
    name: w.name, ty: type_of_wire(reg, &w.ty), linkage: w.linkage,
    handle: None, once_tag: w.once_tag, span: placeholder_span(module_file),
  }
}

fn wire_of_function(f: &Function) -> WireFunction {
  WireFunction {
    name: f.name, ret: wire_of_type(&f.ret), params: f.params.iter().map(wire_of_variable).collect(),
    linkage: f.linkage, is_macro: f.is_macro, is_setf_fn: f.is_setf_fn, cto: f.cto,
    once_tag: f.once_tag, mangled_name: f.mangled_name.clone(),
  }
}

fn function_of_wire(reg: &mut TypeRegistry, module_file: &Rc<str>, w: &WireFunction) -> Function {
  Function {
    name: w.name, ret: type_of_wire(reg, &w.ret),
    params: w.params.iter().map(|p| variable_of_wire(reg, module_file, p)).collect(),
    linkage: w.linkage, is_macro: w.is_macro, is_setf_fn: w.is_setf_fn, cto: w.cto,
    once_tag: w.once_tag, handle: None, span: placeholder_span(module_file), mangled_name: w.mangled_name.clone(),
  }
}

fn wire_of_struct(s: &Struct) -> WireStruct {
  WireStruct {
    name: s.name,
    members: s.members.iter().map(|m| WireStructMember { name: m.name, ty: wire_of_type(&m.ty) }).collect(),
    linkage: s.linkage, once_tag: s.once_tag, internal_name: s.internal_name.clone(),
  }
}

fn struct_of_wire(reg: &mut TypeRegistry, module_file: &Rc<str>, w: &WireStruct) -> Struct {
  Struct {
    name: w.name,
    members: w.members.iter().map(|m| StructMember { name: m.name, ty: type_of_wire(reg, &m.ty) }).collect(),
    linkage: w.linkage, once_tag: w.once_tag, internal_name: w.internal_name.clone(),
    handle: None, span: placeholder_span(module_file),
  }
}

fn wire_of_enum(e: &Enum) -> WireEnum {
  WireEnum {
    name: e.name, underlying: wire_of_type(&e.underlying),
    members: e.members.iter().map(|m| WireEnumMember { name: m.name, value: m.value }).collect(),
    linkage: e.linkage, once_tag: e.once_tag, projected_struct: wire_of_struct(&e.projected_struct),
  }
}

fn enum_of_wire(reg: &mut TypeRegistry, module_file: &Rc<str>, w: &WireEnum) -> Enum {
  Enum {
    name: w.name, underlying: type_of_wire(reg, &w.underlying),
    members: w.members.iter().map(|m| crate::types::entity::EnumMember { name: m.name, value: m.value }).collect(),
    linkage: w.linkage, once_tag: w.once_tag, span: placeholder_span(module_file),
    projected_struct: struct_of_wire(reg, module_file, &w.projected_struct),
  }
}

fn wire_of_entry((name, entry): (Symbol, &NameEntry)) -> (Symbol, WireNameEntry) {
  (name, WireNameEntry {
    functions: entry.functions.iter().map(wire_of_function).collect(),
    variable: entry.variable.as_ref().map(wire_of_variable),
    struct_: entry.struct_.as_ref().map(wire_of_struct),
    enum_: entry.enum_.as_ref().map(wire_of_enum),
  })
}

fn wire_of_namespace(ns: &Namespace) -> WireNamespace {
  WireNamespace {
    name: ns.name,
    entries: ns.entries_iter().map(wire_of_entry).collect(),
    children: ns.children_iter().map(|(n, c)| (n, wire_of_namespace(c))).collect(),
  }
}

fn namespace_of_wire(reg: &mut TypeRegistry, module_file: &Rc<str>, w: &WireNamespace) -> Namespace {
  let mut ns = match w.name {
    Some(n) => Namespace::new_child(n),
    None => Namespace::root(),
  };
  for (_name, entry) in &w.entries {
    for f in &entry.functions {
      let rebuilt = function_of_wire(reg, module_file, f);
      let _ = ns.insert_function(reg, rebuilt);
    }
    if let Some(v) = &entry.variable {
      let rebuilt = variable_of_wire(reg, module_file, v);
      let _ = ns.insert_variable(rebuilt);
    }
    if let Some(s) = &entry.struct_ {
      let rebuilt = struct_of_wire(reg, module_file, s);
      let _ = ns.insert_struct(rebuilt);
    }
    if let Some(e) = &entry.enum_ {
      let rebuilt = enum_of_wire(reg, module_file, e);
      let _ = ns.insert_enum(rebuilt);
    }
  }
  for (child_name, child) in &w.children {
    let rebuilt = namespace_of_wire(reg, module_file, child);
    *ns.ensure_child(*child_name) = rebuilt;
  }
  ns
}

/// Build the DTM for the current unit (spec.md §4.8 items 1-5).
#[must_use] pub fn build_dtm(
  ctx: &Context, once_tags: &HashSet<OnceTag>, required_modules: &[String], cto: bool,
) -> Dtm {
  Dtm {
    root: wire_of_namespace(&ctx.root),
    once_tags: once_tags.iter().copied().collect(),
    required_modules: required_modules.to_vec(),
    cto,
    typemap: ctx.types.typemap_entries().map(|(k, v)| (k.to_owned(), v.to_owned())).collect(),
  }
}

/// A module name contains only alphanumerics, `-`, `_`, `.` (spec.md §6
/// "Module-name rule"); the `lib` on-disk prefix is never part of it.
pub fn validate_module_name(name: &str) -> Result<(), CoreError> {
  if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
    Ok(())
  } else {
    Err(CoreError::InvalidModuleName(name.to_owned()))
  }
}

#[must_use] pub fn dtm_path(dir: &Path, name: &str) -> PathBuf { dir.join(format!("lib{name}.dtm")) }
#[must_use] pub fn bc_path(dir: &Path, name: &str) -> PathBuf { dir.join(format!("lib{name}.bc")) }
#[must_use] pub fn nomacros_bc_path(dir: &Path, name: &str) -> PathBuf { dir.join(format!("lib{name}-nomacros.bc")) }
#[must_use] pub fn so_path(dir: &Path, name: &str) -> PathBuf { dir.join(format!("lib{name}.so")) }

/// `import NAME`'s search step (spec.md §4.8 step 1): current directory,
/// then CLI module paths in order, then the installed module directory.
fn find_module_dir(config: &Config, name: &str) -> Result<PathBuf, CoreError> {
  for dir in config.module_search_path() {
    if dtm_path(&dir, name).is_file() { return Ok(dir) }
  }
  Err(CoreError::UnableToLoadModule(name.to_owned()))
}

pub fn write_dtm(dtm: &Dtm, path: &Path) -> Result<(), CoreError> {
  let file = File::create(path).map_err(|e| CoreError::FileError(e.to_string()))?;
  bincode::serialize_into(BufWriter::new(file), dtm).map_err(|e| CoreError::FileError(e.to_string()))
}

fn read_dtm(path: &Path) -> Result<Dtm, CoreError> {
  let file = File::open(path).map_err(|e| CoreError::FileError(e.to_string()))?;
  bincode::deserialize_from(BufReader::new(file)).map_err(|e| CoreError::FileError(e.to_string()))
}

/// Tracks which modules have already been imported into this process and
/// which are compile-time-only, plus the loaded `.so` handles kept alive
/// for the lifetime of the JIT session (spec.md §4.8 steps 2, 5, 6).
#[derive(Default)]
pub struct ModuleRegistry {
  imported: HashSet<String>,
  pub cto_modules: Vec<String>,
  loaded_libs: Vec<LibHandle>,
}

impl ModuleRegistry {
  #[must_use] pub fn new() -> Self { ModuleRegistry::default() }
  #[must_use] pub fn is_imported(&self, name: &str) -> bool { self.imported.contains(name) }
}

/// `import NAME [(SYM ...)]` (spec.md §4.8). Recurses into required
/// modules before merging this one, so a transitive dependency is always
/// merged before its dependent.
pub fn import_module<L: DynLoader>(
  ctx: &mut Context, loader: &mut L, registry: &mut ModuleRegistry, config: &Config,
  once_tags: &HashSet<OnceTag>, name: &str, symbols: Option<&[Symbol]>,
) -> Result<(), CoreError> {
  validate_module_name(name)?;
  if registry.is_imported(name) { return Ok(()) }
  let dir = find_module_dir(config, name)?;
  let dtm = read_dtm(&dtm_path(&dir, name))?;
  registry.imported.insert(name.to_owned());

  for t in &dtm.typemap { ctx.types.add_typemap_entry(&t.0, &t.1); }

  for required in dtm.required_modules.clone() {
    import_module(ctx, loader, registry, config, once_tags, &required, None)?;
  }

  if dtm.cto { registry.cto_modules.push(name.to_owned()); }

  let lib = loader.load_library(&so_path(&dir, name)).map_err(|e| CoreError::FileError(e.to_string()))?;
  registry.loaded_libs.push(lib);

  let module_file: Rc<str> = Rc::from(format!("lib{name}.dtm"));
  let mut imported_ns = namespace_of_wire(&mut ctx.types, &module_file, &dtm.root);

  let mut union: HashSet<OnceTag> = once_tags.clone();
  union.extend(dtm.once_tags.iter().copied());
  imported_ns.erase_once_tagged(&union);

  if let Some(wanted) = symbols {
    let missing = restrict_to_symbols(&mut imported_ns, wanted);
    if !missing.is_empty() {
      return Err(CoreError::ModuleDoesNotProvideForms {
        module: name.to_owned(),
        missing: missing.iter().map(ToString::to_string).collect(),
      });
    }
  }

  // Imported declarations carry no IR handle yet (`function_of_wire` /
  // `variable_of_wire` always set `handle: None`): the module's own .bc
  // isn't linked into the accumulated IR module here, only its .so is
  // loaded for JIT resolution. Reget-pointers runs once, in the driver,
  // right after it links this module's bitcode in (spec.md §4.8 "Reget-
  // pointers", §4.9 step 7).
  ctx.root.merge(&ctx.types, &imported_ns).map_err(|e| CoreError::CannotLinkModules(format!("{e:?}")))?;
  Ok(())
}

/// Keep only the requested top-level names (spec.md §4.8 step 8), and
/// return any that were not found anywhere in the namespace tree.
fn restrict_to_symbols(ns: &mut Namespace, wanted: &[Symbol]) -> Vec<Symbol> {
  let mut found: HashSet<Symbol> = HashSet::new();
  retain_only(ns, wanted, &mut found);
  wanted.iter().copied().filter(|s| !found.contains(s)).collect()
}

fn retain_only(ns: &mut Namespace, wanted: &[Symbol], found: &mut HashSet<Symbol>) {
  let names: Vec<Symbol> = ns.names().collect();
  for n in names {
    if wanted.contains(&n) {
      found.insert(n);
    } else {
      ns.remove_entry(n);
    }
  }
  for (_, child) in ns.children_iter_mut() {
    retain_only(child, wanted, found);
  }
}

/// Outcome of a top-level `once TAG` form (spec.md §4.8 `once`). The
/// driver (C10), which owns the unit stack, performs the actual pop.
pub enum OnceOutcome { Continue, PopUnit }

pub fn once_form(once_tags: &mut HashSet<OnceTag>, is_last_open_unit: bool, tag: OnceTag) -> Result<OnceOutcome, CoreError> {
  if once_tags.contains(&tag) {
    if is_last_open_unit { return Err(CoreError::CannotOnceTheLastOpenFile) }
    Ok(OnceOutcome::PopUnit)
  } else {
    once_tags.insert(tag);
    Ok(OnceOutcome::Continue)
  }
}
