//! `dalec`: a thin CLI wrapper around [`dalec::driver::Driver`] (spec.md
//! §6 "CLI surface"). Parses the flags that section specifies, builds a
//! [`Config`], reads sources with the bundled reference reader, and
//! drives compilation through the bundled reference backend — see
//! `DESIGN.md` for why a real code-generator binding isn't included.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use dalec::config::{Config, OutputFormat, StaticLinkSet};
use dalec::driver::Driver;
use dalec::reader::FileParserFactory;
use dalec::refbackend::{ReferenceEmitter, ReferenceLoader, ReferenceRuntime};

/// Build-time installation paths (spec.md §6 "Environment/installation
/// paths"), overridable at build time via the environment so packagers
/// don't need to patch source.
const INSTALLED_LIB_PATH: &str = match option_env!("DALEC_LIB_PATH") {
  Some(p) => p,
  None => "/usr/local/lib/dalec",
};
const INSTALLED_MODULE_PATH: &str = match option_env!("DALEC_MODULE_PATH") {
  Some(p) => p,
  None => "/usr/local/lib/dalec/modules",
};

#[derive(Parser)]
#[command(name = "dalec", about = "Compiler front-end/middle-end for an S-expression systems language")]
struct Cli {
  /// Source files to compile, in order.
  sources: Vec<PathBuf>,

  /// Bitcode file to link into the final module (repeatable).
  #[arg(long = "bc")]
  bitcode: Vec<PathBuf>,

  /// Output path.
  #[arg(short = 'o', long)]
  output: Option<PathBuf>,

  /// Output artifact format.
  #[arg(long, default_value = "bc")]
  produce: String,

  /// Optimization level (spec.md §6: 3 clamps to 2, 4 remaps to 3 with LTO).
  #[arg(short = 'O', default_value_t = 0)]
  opt_level: u8,

  /// Compile as module NAME, producing DTM + .bc + -nomacros.bc + .so.
  #[arg(short = 'm', long = "module")]
  module_name: Option<String>,

  /// Suppress preamble declarations.
  #[arg(long)]
  no_common: bool,

  /// Suppress the standard runtime import.
  #[arg(long)]
  no_drt: bool,

  /// Statically link every referenced module.
  #[arg(long)]
  static_all: bool,

  /// Statically link a named module (repeatable).
  #[arg(long = "static")]
  static_mod: Vec<String>,

  /// Mark a module compile-time-only for this invocation (repeatable).
  #[arg(long)]
  cto: Vec<String>,

  /// Include search path (repeatable).
  #[arg(short = 'I')]
  include_path: Vec<PathBuf>,

  /// Module search path (repeatable).
  #[arg(short = 'L')]
  module_path: Vec<PathBuf>,

  /// Elide macro functions from the final output.
  #[arg(long)]
  remove_macros: bool,

  /// Enable module verification.
  #[arg(long)]
  debug: bool,
}

fn build_config(cli: Cli) -> Result<Config, String> {
  let produce = OutputFormat::from_str(&cli.produce).ok_or_else(|| format!("unknown --produce format `{}`", cli.produce))?;
  let (opt_level, lto) = Config::clamp_opt_level(cli.opt_level);
  let static_link = if cli.static_all {
    StaticLinkSet::All
  } else if !cli.static_mod.is_empty() {
    StaticLinkSet::Named(cli.static_mod)
  } else {
    StaticLinkSet::None
  };
  Ok(Config {
    sources: cli.sources,
    bitcode_inputs: cli.bitcode,
    output: cli.output,
    produce,
    opt_level,
    lto,
    module_name: cli.module_name,
    no_common: cli.no_common,
    no_drt: cli.no_drt,
    static_link,
    cto_modules: cli.cto,
    include_paths: cli.include_path,
    module_paths: cli.module_path,
    remove_macros: cli.remove_macros,
    debug: cli.debug,
    installed_lib_path: PathBuf::from(INSTALLED_LIB_PATH),
    installed_module_path: PathBuf::from(INSTALLED_MODULE_PATH),
  })
}

fn main() -> ExitCode {
  env_logger::init();
  let cli = Cli::parse();
  let config = match build_config(cli) {
    Ok(c) => c,
    Err(e) => { eprintln!("dalec: {e}"); return ExitCode::FAILURE }
  };

  let mut factory = FileParserFactory::new(config.module_search_path());
  let mut driver = Driver::new(config, ReferenceEmitter::default(), ReferenceRuntime::default(), ReferenceLoader::default());

  if let Err(e) = driver.run(&mut factory) {
    eprintln!("dalec: {e}");
    return ExitCode::FAILURE;
  }

  for d in driver.ctx.errors.drain() {
    match &d.span {
      Some(span) => eprintln!("{}:{}:{}: {}", span.file, span.span.begin.line, span.span.begin.column, d.kind),
      None => eprintln!("{}", d.kind),
    }
  }
  if driver.ctx.errors.exit_code() != 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
