//! The error taxonomy and `ErrorReporter` (spec.md §7).
//!
//! Errors are reported, not thrown: handlers record a [`Diagnostic`] and
//! return a sentinel. Only a genuinely unrecoverable invariant violation
//! (failed IR verification, `ffi_prep_cif` failure, a missing runtime
//! module) panics, matching the corpus's own `expect`/`panic!` usage for
//! invariants that can only be broken by an earlier-phase bug.

use crate::span::FileSpan;

/// One leaf of the error taxonomy (spec.md §7). Every variant here is a
/// *user-facing* error; see [`CoreError::Internal`] for the fatal,
/// non-recoverable case.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
  #[error("invalid module name: {0}")]
  InvalidModuleName(String),
  #[error("cannot link modules: {0}")]
  CannotLinkModules(String),
  #[error("only lists are permitted at the top level")]
  OnlyListsAtTopLevel,
  #[error("empty lists are not permitted")]
  NoEmptyLists,
  #[error("the first element of a list must be an atom")]
  FirstListElementMustBeAtom,
  #[error("the first element of a list must be a symbol")]
  FirstListElementMustBeSymbol,
  #[error("`{0}` is not in scope")]
  NotInScope(String),
  #[error("macro `{0}` is not in scope")]
  MacroNotInScope(String),
  #[error("overloaded function or macro `{0}` is not in scope")]
  OverloadedFunctionOrMacroNotInScope(String),
  #[error("overloaded function or macro `{0}` is not in scope; nearest match: `{1}`")]
  OverloadedFunctionOrMacroNotInScopeWithClosest(String, String),
  #[error("function `{0}` is not in scope")]
  FunctionNotInScope(String),
  #[error("unexpected element")]
  UnexpectedElement,
  #[error("incorrect argument type: expected `{expected}`, got `{got}`")]
  IncorrectArgType { expected: String, got: String },
  #[error("incorrect number of arguments: expected {expected}, got {got}")]
  IncorrectNumberOfArgs { expected: usize, got: usize },
  #[error("incorrect minimum number of arguments: expected at least {expected}, got {got}")]
  IncorrectMinimumNumberOfArgs { expected: usize, got: usize },
  #[error("incorrect type for the single parameter")]
  IncorrectSingleParameterType,
  #[error("`void` must be the only parameter")]
  VoidMustBeOnlyParameter,
  #[error("`...` must be the last parameter")]
  VarargsMustBeLast,
  #[error("enum value `{0}` does not exist")]
  EnumValueDoesNotExist(String),
  #[error("enum underlying type must be an integer type")]
  EnumTypeMustBeInteger,
  #[error("field `{0}` does not exist in struct `{1}`")]
  FieldDoesNotExistInStruct(String, String),
  #[error("redeclaration of function `{0}`")]
  RedeclarationOfFunction(String),
  #[error("redeclaration of macro `{0}`")]
  RedeclarationOfMacro(String),
  #[error("redeclaration of struct `{0}`")]
  RedeclarationOfStruct(String),
  #[error("redeclaration of enum `{0}`")]
  RedeclarationOfEnum(String),
  #[error("redeclaration of enum element `{0}`")]
  RedeclarationOfEnumElement(String),
  #[error("macro body has no core form name")]
  NoCoreFormNameInMacro,
  #[error("cannot parse literal `{0}`")]
  CannotParseLiteral(String),
  #[error("non-null pointer in global struct declaration")]
  NonNullPointerInGlobalStructDeclaration,
  #[error("struct contains padding")]
  StructContainsPadding,
  #[error("cannot take the address of a non-lvalue")]
  CannotTakeAddressOfNonLvalue,
  #[error("invalid attribute `{0}`")]
  InvalidAttribute(String),
  #[error("unable to load module `{0}`")]
  UnableToLoadModule(String),
  #[error("module `{module}` does not provide: {missing:?}")]
  ModuleDoesNotProvideForms { module: String, missing: Vec<String> },
  #[error("file error: {0}")]
  FileError(String),
  #[error("dnode has no string")]
  DNodeHasNoString,
  #[error("dnode is neither a token nor a list")]
  DNodeIsNeitherTokenNorList,
  #[error("cannot `once` the last open file")]
  CannotOnceTheLastOpenFile,
  #[error("unable to parse integer `{0}`")]
  UnableToParseInteger(String),
  #[error("invalid floating point number `{0}`")]
  InvalidFloatingPointNumber(String),
  #[error("invalid integer `{0}`")]
  InvalidInteger(String),
  /// Not part of the user-facing taxonomy: a fatal internal invariant
  /// violation (spec.md §7 "any fatal engine failure ... aborts").
  #[error("internal error: {0}")]
  Internal(String),
}

/// A reported error together with where it happened (spec.md §7: errors
/// carry enough context for "Diagnostic formatting", itself out of
/// scope — we keep only the span and the taxonomy leaf).
#[derive(Debug, Clone)]
pub struct Diagnostic {
  pub kind: CoreError,
  pub span: Option<FileSpan>,
}

/// Accumulates diagnostics for the current unit. Flushed between
/// top-forms and at shutdown (spec.md §5 "Suspension points").
#[derive(Default)]
pub struct ErrorReporter {
  diagnostics: Vec<Diagnostic>,
  total_errors: usize,
}

impl ErrorReporter {
  #[must_use] pub fn new() -> Self { ErrorReporter::default() }

  pub fn report(&mut self, span: Option<FileSpan>, kind: CoreError) {
    log::error!(target: "core::diagnostics", "{kind}");
    self.total_errors += 1;
    self.diagnostics.push(Diagnostic { kind, span });
  }

  #[must_use] pub fn has_errors(&self) -> bool { !self.diagnostics.is_empty() }
  #[must_use] pub fn total_errors(&self) -> usize { self.total_errors }

  /// Take the currently buffered diagnostics, e.g. to hand them to the
  /// driver's formatter between top-forms, without resetting the
  /// lifetime error count used for the exit code.
  pub fn drain(&mut self) -> Vec<Diagnostic> { std::mem::take(&mut self.diagnostics) }

  /// Fold another reporter's diagnostics into this one, re-emitting them
  /// (spec.md §4.7 "the buffered errors are re-emitted" case of macro
  /// argument lowering).
  pub fn absorb(&mut self, mut other: ErrorReporter) {
    for d in other.diagnostics.drain(..) { self.report(d.span, d.kind); }
  }

  /// Exit code per spec.md §7: "non-zero if any error was recorded".
  #[must_use] pub fn exit_code(&self) -> i32 { i32::from(self.total_errors > 0) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn absorb_re_emits_and_counts() {
    let mut buffered = ErrorReporter::new();
    buffered.report(None, CoreError::NotInScope("bogus".into()));
    let mut main = ErrorReporter::new();
    assert_eq!(main.exit_code(), 0);
    main.absorb(buffered);
    assert_eq!(main.exit_code(), 1);
    assert_eq!(main.total_errors(), 1);
  }

  #[test]
  fn discarding_a_buffer_never_touches_the_main_reporter() {
    let mut buffered = ErrorReporter::new();
    buffered.report(None, CoreError::NotInScope("bogus".into()));
    let main = ErrorReporter::new();
    drop(buffered);
    assert_eq!(main.exit_code(), 0);
  }
}
