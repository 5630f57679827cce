//! End-to-end scenarios (spec.md §8) driven through the real reader and
//! reference backend rather than the unit-test doubles, exercising the
//! whole `Driver::run` pipeline on actual source text.

use std::path::PathBuf;

use dalec::config::{Config, OutputFormat, StaticLinkSet};
use dalec::driver::Driver;
use dalec::reader::FileParserFactory;
use dalec::refbackend::{ReferenceEmitter, ReferenceLoader, ReferenceRuntime};

fn base_config() -> Config {
  Config {
    sources: Vec::new(),
    bitcode_inputs: Vec::new(),
    output: None,
    produce: OutputFormat::Bc,
    opt_level: 0,
    lto: false,
    module_name: None,
    no_common: true,
    no_drt: true,
    static_link: StaticLinkSet::None,
    cto_modules: Vec::new(),
    include_paths: Vec::new(),
    module_paths: Vec::new(),
    remove_macros: false,
    debug: false,
    installed_lib_path: PathBuf::new(),
    installed_module_path: PathBuf::new(),
  }
}

fn write_source(dir: &std::path::Path, name: &str, text: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, text).unwrap();
  path
}

#[test]
fn minimal_module_compile_produces_dtm_and_sibling_artifacts() {
  let dir = tempfile::tempdir().unwrap();
  let main = write_source(
    dir.path(),
    "main.dt",
    r#"
    (module "greet")
    (def identity (fn extern-c int ((a int)) (return a)))
    "#,
  );

  let mut config = base_config();
  config.output = Some(dir.path().join("ignored"));
  config.sources = vec![main];
  let mut factory = FileParserFactory::new(Vec::new());
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  driver.run(&mut factory).unwrap();

  assert!(!driver.ctx.errors.has_errors());
  assert!(dir.path().join("libgreet.dtm").exists());
  assert!(dir.path().join("libgreet.bc").exists());
  assert!(dir.path().join("libgreet-nomacros.bc").exists());
  assert!(dir.path().join("libgreet.so").exists());
}

#[test]
fn include_with_once_guard_is_idempotent() {
  let dir = tempfile::tempdir().unwrap();
  write_source(
    dir.path(),
    "guarded.dt",
    r#"
    (once GUARDED)
    (def marker (fn extern-c int (void) (return 1)))
    "#,
  );
  let main = write_source(
    dir.path(),
    "main.dt",
    r#"
    (include "guarded.dt")
    (include "guarded.dt")
    "#,
  );

  let mut config = base_config();
  config.sources = vec![main];
  config.output = Some(dir.path().join("out.bc"));
  let mut factory = FileParserFactory::new(vec![dir.path().to_path_buf()]);
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  driver.run(&mut factory).unwrap();

  assert!(!driver.ctx.errors.has_errors());
  // The second `include` is short-circuited by the once-tag: only one
  // `marker` function should ever have been declared.
  let mut count = 0;
  driver.ctx.root.walk(&mut |ns| {
    for (_, entry) in ns.entries_iter() {
      count += entry.functions.iter().filter(|f| f.name == dalec::symbol::intern("marker")).count();
    }
  });
  assert_eq!(count, 1);
}

#[test]
fn overload_resolution_picks_the_best_arity_and_type_match() {
  let dir = tempfile::tempdir().unwrap();
  let main = write_source(
    dir.path(),
    "main.dt",
    r#"
    (def f (fn extern-c int ((a int)) (return a)))
    (def f (fn extern-c int ((a int) (b int)) (return b)))
    (def caller (fn extern-c int (void) (return (f 1 2))))
    "#,
  );

  let mut config = base_config();
  config.sources = vec![main];
  config.output = Some(dir.path().join("out.bc"));
  let mut factory = FileParserFactory::new(Vec::new());
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  driver.run(&mut factory).unwrap();

  assert!(!driver.ctx.errors.has_errors(), "{:?}", driver.ctx.errors.drain());
}

#[test]
fn struct_and_enum_declarations_compile_cleanly() {
  let dir = tempfile::tempdir().unwrap();
  let main = write_source(
    dir.path(),
    "main.dt",
    r#"
    (def point (struct extern-c ((x int) (y int))))
    (def color (enum extern-c int ((red) (green) (blue))))
    (def origin (fn extern-c point (void) (return (point (x 0) (y 0)))))
    "#,
  );

  let mut config = base_config();
  config.sources = vec![main];
  config.output = Some(dir.path().join("out.bc"));
  let mut factory = FileParserFactory::new(Vec::new());
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  driver.run(&mut factory).unwrap();
  // A malformed struct literal or enum would have reported an error;
  // an unrelated new error here means the declarations themselves did
  // not register cleanly.
  assert!(!driver.ctx.errors.has_errors(), "{:?}", driver.ctx.errors.drain());
}

#[test]
fn errors_suppress_final_emission() {
  let dir = tempfile::tempdir().unwrap();
  let main = write_source(
    dir.path(),
    "main.dt",
    r#"
    (def bad (fn extern-c int (void) (return (undefined-callee 1 2))))
    "#,
  );

  let mut config = base_config();
  config.sources = vec![main];
  config.output = Some(dir.path().join("out.bc"));
  let mut factory = FileParserFactory::new(Vec::new());
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  driver.run(&mut factory).unwrap();

  assert!(driver.ctx.errors.has_errors());
  assert!(!dir.path().join("out.bc").exists());
}
