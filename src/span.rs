//! Source positions and the macro-origin tracking described in spec.md
//! §3 (Node) and §4.7 (macro-origin positions).

use std::rc::Rc;

/// A 1-based line/column pair, matching the original Dale compiler's
/// (line, column) position pairs (`examples/original_source`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
  pub line: u32,
  pub column: u32,
}

impl Position {
  #[must_use] pub fn new(line: u32, column: u32) -> Self { Position { line, column } }
}

/// A half-open begin/end position pair within one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Span {
  pub begin: Position,
  pub end: Position,
}

impl Span {
  #[must_use] pub fn new(begin: Position, end: Position) -> Self { Span { begin, end } }
}

/// A position anchored to a source file, the unit carried by declarations
/// (spec.md §3: "Every Function, Variable, and Struct carries an origin
/// once-tag" alongside its defining span) and by diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSpan {
  pub file: Rc<str>,
  pub span: Span,
}

impl FileSpan {
  #[must_use] pub fn new(file: Rc<str>, span: Span) -> Self { FileSpan { file, span } }
}

/// The two position pairs a [`crate::node::Node`] carries: where it was
/// written, and — if it reached its current position via macro
/// expansion — where the macro was invoked. `macro_origin` is `None` for
/// nodes that were never touched by a splice.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NodePos {
  pub text: Span,
  pub macro_origin: Option<Span>,
}

impl NodePos {
  #[must_use] pub fn new(text: Span) -> Self { NodePos { text, macro_origin: None } }

  /// The position diagnostics should point at: the macro call site if
  /// this node originated from a splice, otherwise its own text position.
  #[must_use] pub fn reported(&self) -> Span { self.macro_origin.unwrap_or(self.text) }

  /// Stamp `origin` as the macro-origin position of this node, as step 5
  /// of spec.md §4.7 ("Macro-origin positions") requires for every node
  /// reachable from a macro's return value.
  pub fn set_macro_origin(&mut self, origin: Span) { self.macro_origin = Some(origin); }
}

/// A value paired with the [`FileSpan`] where it was declared, mirroring
/// the `Spanned<T>` wrapper used throughout the teacher crate's `entity`
/// module for declarations that carry diagnostic provenance.
#[derive(Clone, Debug)]
pub struct Spanned<T> {
  pub span: FileSpan,
  pub k: T,
}

impl<T> Spanned<T> {
  #[must_use] pub fn new(span: FileSpan, k: T) -> Self { Spanned { span, k } }
}
