//! Compiler core for an S-expression systems language with compile-time
//! macros: type registry and namespace tree (C1-C3), type-form parser and
//! form dispatcher (C4-C5), declaration forms and procedure-body lowering
//! (C6-C7), the macro JIT/FFI engine (C8), module packaging (C9), and the
//! compilation driver that sequences it all (C10).
//!
//! The lexer/parser and the concrete IR backend are out of scope; this
//! crate only depends on the [`emit::Emitter`]/[`emit::Jit`]/
//! [`emit::DynLoader`] trait seam and the [`driver::TopFormSource`]/
//! [`driver::ParserFactory`] trait seam to stay backend-agnostic.

pub mod config;
pub mod context;
pub mod decls;
pub mod dispatch;
pub mod driver;
pub mod emit;
pub mod error;
pub mod lower;
pub mod macros;
pub mod module;
pub mod namespace;
pub mod node;
pub mod reader;
pub mod refbackend;
pub mod span;
pub mod symbol;
pub mod typeparser;
pub mod types;

#[cfg(test)]
mod testsupport;
