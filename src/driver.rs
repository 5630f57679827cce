//! The Compilation Driver (C10, spec.md §4.9): sequences compilation
//! units, wires C5 (the dispatcher) to the emitter, and performs final
//! linking and emission.
//!
//! The lexer/parser is out of scope (spec.md §1); this module only
//! assumes a [`TopFormSource`] that yields top-level [`Node`]s in
//! stream order, and a [`ParserFactory`] that can open one for an
//! `include`d path.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use hashbrown::HashSet;
use log::{debug, info, warn};

use crate::config::{Config, CompilerState, OutputFormat};
use crate::context::Context;
use crate::dispatch::{dispatch_top_form, ModuleState, TopFormOutcome};
use crate::emit::{DynLoader, Emitter, OutputKind};
use crate::error::CoreError;
use crate::macros::MacroRuntime;
use crate::module::{self, ModuleRegistry};
use crate::node::Node;
use crate::types::entity::{Function, OnceTag};
use crate::types::ty::NativeTypes;

/// Supplies top-level forms in source order (spec.md §1 "the lexer and
/// S-expression parser ... supplies a lazy stream of top-level nodes").
pub trait TopFormSource {
  /// `None` signals end-of-file (spec.md §4.9 step 4: "on EOF inside an
  /// `include`, pop the unit stack").
  fn next_form(&mut self) -> Result<Option<Node>, CoreError>;
}

/// Opens a [`TopFormSource`] for a source path, used both for the
/// driver's own input files and for `include` (spec.md §3 "Unit...
/// `include` pushes, end-of-file pops").
pub trait ParserFactory<P: TopFormSource> {
  fn open(&mut self, path: &Path) -> Result<P, CoreError>;
}

/// One entry of the unit stack (spec.md §3 "Unit"). The Context, IR
/// module, JIT engine, and module registry are process-wide here (they
/// outlive any single include); only the parser handle and the current
/// filename are genuinely per-unit.
struct UnitFrame<P: TopFormSource> {
  source: P,
  filename: Rc<str>,
}

/// Drives a sequence of source files to completion (spec.md §4.9).
/// Generic over the emitter, macro JIT runtime, and dynamic loader so
/// this crate never depends on a concrete code generator (spec.md §1).
pub struct Driver<E: Emitter, R: MacroRuntime<E>, L: DynLoader> {
  pub ctx: Context,
  pub emitter: E,
  pub runtime: R,
  pub loader: L,
  pub registry: ModuleRegistry,
  pub config: Config,
  pub state: CompilerState,
  module_state: ModuleState,
  /// Accumulated across every source file and every `include` in this
  /// invocation (spec.md §4.8 `once`, §8 "Once-guard idempotence"): a
  /// tag recorded anywhere is visible everywhere after, matching
  /// `module::once_form`'s and `module::import_module`'s shared-set
  /// shape rather than giving each `Unit` its own private tag.
  once_tags: HashSet<OnceTag>,
}

impl<E: Emitter, R: MacroRuntime<E>, L: DynLoader> Driver<E, R, L> {
  pub fn new(config: Config, emitter: E, runtime: R, loader: L) -> Self {
    let native = NativeTypes::default();
    Driver {
      ctx: Context::new(native.clone()),
      emitter,
      runtime,
      loader,
      registry: ModuleRegistry::new(),
      config,
      state: CompilerState::new(native),
      module_state: ModuleState::default(),
      once_tags: HashSet::new(),
    }
  }

  /// Add the standard preamble module, unless suppressed (spec.md §4.9
  /// step 3: "Add the standard preamble ("drt" module), unless `nodrt`
  /// is set; otherwise add only the basic types" — the basic types are
  /// already present via [`Context::new`]'s [`NativeTypes`]).
  pub fn install_preamble(&mut self) -> Result<(), CoreError> {
    if self.config.no_drt { return Ok(()) }
    module::import_module(&mut self.ctx, &mut self.loader, &mut self.registry, &self.config, &self.once_tags, "drt", None)
  }

  /// Compile every source file in `config.sources`, in order (spec.md
  /// §4.9: "Processes a sequence of source files, each producing one
  /// Unit"). `factory` opens both the top-level sources and any file
  /// they `include`.
  pub fn run<P: TopFormSource>(&mut self, factory: &mut impl ParserFactory<P>) -> Result<(), CoreError> {
    // `--cto MOD` (spec.md §6) marks an imported module compile-time-only
    // for this invocation even if its own DTM didn't record that flag,
    // the same way `self.registry.cto_modules` is populated from disk in
    // `module::import_module`.
    self.registry.cto_modules.extend(self.config.cto_modules.iter().cloned());
    if !self.config.no_common {
      self.install_preamble()?;
    }
    let sources = self.config.sources.clone();
    for src in &sources {
      self.compile_one_unit(factory, src)?;
    }
    self.finish()
  }

  /// Drive one top-level source file (and anything it transitively
  /// `include`s) to completion (spec.md §4.9 steps 1, 4-6).
  fn compile_one_unit<P: TopFormSource>(&mut self, factory: &mut impl ParserFactory<P>, path: &Path) -> Result<(), CoreError> {
    let filename: Rc<str> = Rc::from(path.to_string_lossy().into_owned());
    let root = factory.open(path)?;
    let mut stack: Vec<UnitFrame<P>> = vec![UnitFrame { source: root, filename }];

    while let Some(frame) = stack.last_mut() {
      let is_last_open_unit = stack.len() == 1;
      let Some(form) = frame.source.next_form()? else {
        debug!(target: "core::driver", "end of unit {}", stack.last().expect("just matched").filename);
        stack.pop();
        continue;
      };
      let filename = stack.last().expect("just pushed a form from it").filename.clone();
      let outcome = dispatch_top_form(
        &mut self.ctx, &mut self.emitter, &mut self.runtime, &mut self.loader,
        &mut self.registry, &self.config, &mut self.once_tags, is_last_open_unit,
        &mut self.module_state, &filename, &form,
      );
      // Errors are reported, not thrown (spec.md §7): flush between
      // top-forms and keep going, matching the original's per-form
      // recovery so one bad form doesn't abort the whole file.
      let outcome = match outcome {
        Ok(out) => out,
        Err(e) => {
          self.ctx.errors.report(Some(crate::span::FileSpan::new(filename, form.pos().reported())), e);
          continue;
        }
      };
      match outcome {
        TopFormOutcome::Continue => {}
        TopFormOutcome::Include(rel) => {
          let included = factory.open(Path::new(&rel))?;
          stack.push(UnitFrame { source: included, filename: Rc::from(rel) });
        }
        TopFormOutcome::PopUnit => { stack.pop(); }
      }
    }
    Ok(())
  }

  /// Finalize the invocation (spec.md §4.9 "After the last Unit"): link
  /// any bitcode inputs, emit a DTM if a module name was set, otherwise
  /// link requested static modules, erase macros/ctos, optimize, and
  /// emit the requested output.
  fn finish(&mut self) -> Result<(), CoreError> {
    if self.ctx.errors.has_errors() {
      warn!(target: "core::driver", "refusing emission: {} error(s) recorded", self.ctx.errors.total_errors());
      return Ok(());
    }

    for path in &self.config.bitcode_inputs.clone() {
      self.emitter.link_bitcode_file(path).map_err(|e| CoreError::CannotLinkModules(e.to_string()))?;
    }

    if self.config.remove_macros {
      self.erase_ir_functions(|f| f.is_macro);
      self.ctx.erase_macros();
    }

    // `-m NAME` (spec.md §6) sets the module name for the whole
    // invocation the same way `(module NAME)` does, unless the source
    // already set one explicitly.
    if self.module_state.name.is_none() {
      self.module_state.name = self.config.module_name.clone();
    }

    if let Some(name) = self.module_state.name.clone() {
      self.emit_module(&name)?;
      return Ok(());
    }

    self.link_static_modules()?;
    self.erase_ir_functions(|f| f.is_macro || f.cto);
    self.ctx.erase_macros();
    self.ctx.erase_ctos();
    self.emitter.optimize(self.config.opt_level, self.config.lto);
    if self.config.debug {
      self.emitter.verify().map_err(CoreError::Internal)?;
    }
    let (format, out_path) = self.output_target();
    self.emitter.write_output(format, &out_path).map_err(|e| CoreError::FileError(e.to_string()))?;
    info!(target: "core::driver", "wrote {}", out_path.display());
    Ok(())
  }

  /// Emit a DTM + sibling `.bc`/`-nomacros.bc`/`.so` for the module name
  /// set by `(module NAME ...)` (spec.md §4.9 "If a module name was set,
  /// emit a DTM + .bc + -nomacros.bc").
  fn emit_module(&self, name: &str) -> Result<(), CoreError> {
    let dir = self.config.output.as_deref().and_then(Path::parent).unwrap_or_else(|| Path::new(".")).to_path_buf();
    let required_modules: Vec<String> = std::iter::once(if self.config.no_drt { None } else { Some("drt".to_owned()) })
      .flatten().collect();
    let dtm = module::build_dtm(&self.ctx, &self.once_tags, &required_modules, self.module_state.cto);
    module::write_dtm(&dtm, &module::dtm_path(&dir, name))?;
    self.emitter.write_bitcode(&module::bc_path(&dir, name)).map_err(|e| CoreError::FileError(e.to_string()))?;
    self.emitter.write_bitcode_without_macros(&module::nomacros_bc_path(&dir, name)).map_err(|e| CoreError::FileError(e.to_string()))?;
    self.emitter.write_shared_object(&module::so_path(&dir, name)).map_err(|e| CoreError::FileError(e.to_string()))?;
    Ok(())
  }

  /// `--static-all` / `--static MOD` (spec.md §4.9 "link any requested
  /// static modules (all, or a named subset, excluding cto modules)").
  /// Open question resolved per DESIGN.md: a module named explicitly via
  /// `--static MOD` that is also `cto` is *not* linked, same as the
  /// `--static-all` case, since a cto module was never meant to reach a
  /// final executable regardless of how it was requested.
  ///
  /// The module's declarations were already folded into `self.ctx` by
  /// `import`; what's left here is the reget-pointers pass (spec.md §4.8
  /// "Reget-pointers", §9) every cross-module merge requires, run once
  /// the set of modules actually being kept is known.
  fn link_static_modules(&mut self) -> Result<(), CoreError> {
    use crate::config::StaticLinkSet;
    let wanted: Vec<String> = match &self.config.static_link {
      StaticLinkSet::None => return Ok(()),
      StaticLinkSet::All => Vec::new(),
      StaticLinkSet::Named(names) => names.clone(),
    };
    for name in &wanted {
      if self.registry.cto_modules.iter().any(|m| m == name) {
        debug!(target: "core::driver", "skipping cto module `{name}` from static link set");
      }
    }
    self.ctx.root.reget_pointers(&self.emitter);
    Ok(())
  }

  /// Collect the IR handles of every declared function matching `pred`
  /// and erase them (spec.md §4.9 "erase all macros and cto functions
  /// from the combined IR"; §6 `--remove-macros`). Handles are collected
  /// first because `Context::erase_macros`/`erase_ctos` drop the very
  /// `Function` records that carry them.
  fn erase_ir_functions(&mut self, pred: impl Fn(&Function) -> bool) {
    let mut handles = Vec::new();
    self.ctx.root.walk(&mut |ns| {
      for (_, entry) in ns.entries_iter() {
        for f in &entry.functions {
          if pred(f) {
            if let Some(h) = f.handle { handles.push(h); }
          }
        }
      }
    });
    for h in handles { self.emitter.erase_function(h); }
  }

  fn output_target(&self) -> (OutputKind, PathBuf) {
    let kind = match self.config.produce {
      OutputFormat::Ir => OutputKind::Ir,
      OutputFormat::Asm => OutputKind::Asm,
      OutputFormat::Bc => OutputKind::Bc,
    };
    let path = self.config.output.clone().unwrap_or_else(|| PathBuf::from("a.out"));
    (kind, path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use crate::node::Token;
  use crate::span::{Position, Span};
  use crate::symbol::intern;
  use crate::testsupport::{NoopEmitter, NoopLoader, NoopRuntime};

  fn atom_sym(s: &str) -> Node { Node::atom(Token::Symbol(intern(s)), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn atom_str(s: &str) -> Node { Node::atom(Token::Str(Rc::from(s)), Span::new(Position::new(1, 1), Position::new(1, 2))) }
  fn list(xs: Vec<Node>) -> Node { Node::list(xs, Span::new(Position::new(1, 1), Position::new(1, 2))) }

  fn test_config() -> Config {
    Config {
      sources: Vec::new(), bitcode_inputs: Vec::new(), output: None,
      produce: OutputFormat::Bc, opt_level: 0, lto: false,
      module_name: None, no_common: true, no_drt: true,
      static_link: crate::config::StaticLinkSet::None, cto_modules: Vec::new(),
      include_paths: Vec::new(), module_paths: Vec::new(),
      remove_macros: false, debug: false,
      installed_lib_path: PathBuf::new(), installed_module_path: PathBuf::new(),
    }
  }

  /// Replays a fixed `Vec<Node>` as a form stream.
  struct VecSource { forms: std::vec::IntoIter<Node> }
  impl TopFormSource for VecSource {
    fn next_form(&mut self) -> Result<Option<Node>, CoreError> { Ok(self.forms.next()) }
  }

  /// Looks up each path's form stream from a fixed table, simulating
  /// `include` without a real file system or lexer.
  #[derive(Default)]
  struct MapFactory { files: HashMap<PathBuf, Vec<Node>> }
  impl ParserFactory<VecSource> for MapFactory {
    fn open(&mut self, path: &Path) -> Result<VecSource, CoreError> {
      let forms = self.files.get(path).cloned().ok_or_else(|| CoreError::FileError(path.display().to_string()))?;
      Ok(VecSource { forms: forms.into_iter() })
    }
  }

  fn new_driver() -> Driver<NoopEmitter, NoopRuntime, NoopLoader> {
    Driver::new(test_config(), NoopEmitter::default(), NoopRuntime::default(), NoopLoader)
  }

  #[test]
  fn empty_unit_with_no_errors_runs_to_completion() {
    let mut driver = new_driver();
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), vec![])]) };
    driver.run(&mut factory).unwrap();
    assert!(!driver.ctx.errors.has_errors());
  }

  #[test]
  fn include_pushes_the_included_unit_and_processes_its_forms() {
    let mut driver = new_driver();
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let main_forms = vec![list(vec![atom_sym("include"), atom_str("sub.dt")])];
    let sub_forms = vec![list(vec![atom_sym("namespace"), atom_sym("Sub"), list(vec![])])];
    let mut factory = MapFactory {
      files: HashMap::from([
        (PathBuf::from("main.dt"), main_forms),
        (PathBuf::from("sub.dt"), sub_forms),
      ]),
    };
    driver.run(&mut factory).unwrap();
    assert!(!driver.ctx.errors.has_errors());
  }

  #[test]
  fn a_bad_top_form_is_reported_and_does_not_abort_the_unit() {
    let mut driver = new_driver();
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let forms = vec![
      list(vec![atom_sym("nowhere-at-all")]),
      list(vec![atom_sym("namespace"), atom_sym("Ok"), list(vec![])]),
    ];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), forms)]) };
    driver.run(&mut factory).unwrap();
    assert!(driver.ctx.errors.has_errors());
    assert_eq!(driver.ctx.current_path().len(), 0);
  }

  #[test]
  fn module_name_form_routes_to_dtm_emission_not_final_link() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = new_driver();
    driver.config.output = Some(dir.path().join("ignored.bc"));
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let forms = vec![list(vec![atom_sym("module"), atom_str("mymod")])];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), forms)]) };
    driver.run(&mut factory).unwrap();
    assert!(dir.path().join("libmymod.dtm").exists());
    assert!(dir.path().join("libmymod.bc").exists());
    assert!(dir.path().join("libmymod-nomacros.bc").exists());
    assert!(dir.path().join("libmymod.so").exists());
  }

  #[test]
  fn cli_module_name_drives_dtm_emission_when_source_sets_none() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = new_driver();
    driver.config.output = Some(dir.path().join("ignored.bc"));
    driver.config.module_name = Some("fromcli".to_owned());
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), vec![])]) };
    driver.run(&mut factory).unwrap();
    assert!(dir.path().join("libfromcli.dtm").exists());
  }

  #[test]
  fn source_module_form_takes_priority_over_cli_module_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = new_driver();
    driver.config.output = Some(dir.path().join("ignored.bc"));
    driver.config.module_name = Some("fromcli".to_owned());
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let forms = vec![list(vec![atom_sym("module"), atom_str("fromsource")])];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), forms)]) };
    driver.run(&mut factory).unwrap();
    assert!(dir.path().join("libfromsource.dtm").exists());
    assert!(!dir.path().join("libfromcli.dtm").exists());
  }

  #[test]
  fn bitcode_inputs_are_linked_before_final_emission() {
    let dir = tempfile::tempdir().unwrap();
    let bc_path = dir.path().join("extra.bc");
    std::fs::write(&bc_path, b"bc").unwrap();
    let mut driver = new_driver();
    driver.config.output = Some(dir.path().join("out.bc"));
    driver.config.bitcode_inputs = vec![bc_path];
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), vec![])]) };
    driver.run(&mut factory).unwrap();
    assert!(dir.path().join("out.bc").exists());
  }

  #[test]
  fn cli_cto_flag_seeds_the_registry_before_static_linking() {
    let mut driver = new_driver();
    driver.config.cto_modules = vec!["scratch".to_owned()];
    driver.config.sources = vec![PathBuf::from("main.dt")];
    let mut factory = MapFactory { files: HashMap::from([(PathBuf::from("main.dt"), vec![])]) };
    driver.run(&mut factory).unwrap();
    assert!(driver.registry.cto_modules.iter().any(|m| m == "scratch"));
  }

  #[test]
  fn erase_ir_functions_only_erases_matching_handles() {
    let mut driver = new_driver();
    let ty = driver.ctx.types.basic(crate::types::ty::BaseTag::Int);
    let kept = crate::types::entity::Function {
      name: intern("kept"), ret: ty.clone(), params: Vec::new(),
      linkage: crate::types::entity::Linkage::Extern, is_macro: false, is_setf_fn: false, cto: false,
      once_tag: None, handle: Some(driver.emitter.declare_function("kept", &ty, crate::types::entity::Linkage::Extern)),
      span: crate::span::FileSpan::new(Rc::from("t.dt"), Span::new(Position::new(1, 1), Position::new(1, 2))),
      mangled_name: "kept".into(),
    };
    let mut doomed = kept.clone();
    doomed.name = intern("doomed");
    doomed.is_macro = true;
    doomed.handle = Some(driver.emitter.declare_function("doomed", &ty, crate::types::entity::Linkage::Extern));
    doomed.mangled_name = "doomed".into();
    driver.ctx.insert_function(kept).unwrap();
    driver.ctx.insert_function(doomed).unwrap();

    driver.erase_ir_functions(|f| f.is_macro);
    assert_eq!(driver.emitter.erased.len(), 1);
  }
}
