//! A minimal S-expression reader (spec.md §1 lists "the lexer and
//! S-expression parser" as an external collaborator this core only
//! consumes through [`crate::driver::TopFormSource`]/
//! [`crate::driver::ParserFactory`]). This module provides a small,
//! literal reader sufficient to drive the CLI binary end-to-end without
//! pulling in a real production parser: parens, atoms, double-quoted
//! strings with `\"`/`\\` escapes, and `;`-to-end-of-line comments.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::driver::{ParserFactory, TopFormSource};
use crate::error::CoreError;
use crate::node::{Node, Token};
use crate::span::{Position, Span};
use crate::symbol::intern;

/// A single source file tokenized eagerly into top-level forms, handed
/// out one at a time (spec.md §1 "a lazy stream of top-level nodes" —
/// eager here since reading the whole unit up front is simpler and this
/// reader is not a performance-sensitive component).
pub struct FileSource {
  forms: std::vec::IntoIter<Node>,
}

impl TopFormSource for FileSource {
  fn next_form(&mut self) -> Result<Option<Node>, CoreError> { Ok(self.forms.next()) }
}

/// Opens [`FileSource`]s by resolving a path against the configured
/// include search path (spec.md §6 `-I`), used both for top-level
/// sources and `include` targets.
pub struct FileParserFactory {
  pub include_paths: Vec<PathBuf>,
}

impl FileParserFactory {
  #[must_use] pub fn new(include_paths: Vec<PathBuf>) -> Self { FileParserFactory { include_paths } }

  fn resolve(&self, path: &Path) -> Option<PathBuf> {
    if path.is_absolute() || path.exists() { return Some(path.to_path_buf()) }
    for dir in &self.include_paths {
      let candidate = dir.join(path);
      if candidate.exists() { return Some(candidate) }
    }
    None
  }
}

impl ParserFactory<FileSource> for FileParserFactory {
  fn open(&mut self, path: &Path) -> Result<FileSource, CoreError> {
    let resolved = self.resolve(path).ok_or_else(|| CoreError::FileError(path.display().to_string()))?;
    let text = fs::read_to_string(&resolved).map_err(|e| CoreError::FileError(format!("{}: {e}", resolved.display())))?;
    let forms = read_top_forms(&text)?;
    Ok(FileSource { forms: forms.into_iter() })
  }
}

/// Read every top-level form out of `text`.
pub fn read_top_forms(text: &str) -> Result<Vec<Node>, CoreError> {
  let mut r = Reader::new(text);
  let mut out = Vec::new();
  r.skip_trivia();
  while r.peek().is_some() {
    out.push(r.read_node()?);
    r.skip_trivia();
  }
  Ok(out)
}

struct Reader<'a> {
  bytes: &'a [u8],
  pos: usize,
  line: u32,
  col: u32,
}

impl<'a> Reader<'a> {
  fn new(text: &'a str) -> Self { Reader { bytes: text.as_bytes(), pos: 0, line: 1, col: 1 } }

  fn peek(&self) -> Option<u8> { self.bytes.get(self.pos).copied() }

  fn position(&self) -> Position { Position::new(self.line, self.col) }

  fn advance(&mut self) -> Option<u8> {
    let b = self.peek()?;
    self.pos += 1;
    if b == b'\n' { self.line += 1; self.col = 1 } else { self.col += 1 }
    Some(b)
  }

  fn skip_trivia(&mut self) {
    loop {
      match self.peek() {
        Some(b) if b.is_ascii_whitespace() => { self.advance(); }
        Some(b';') => { while !matches!(self.peek(), None | Some(b'\n')) { self.advance(); } }
        _ => break,
      }
    }
  }

  fn read_node(&mut self) -> Result<Node, CoreError> {
    let begin = self.position();
    match self.peek() {
      Some(b'(') => {
        self.advance();
        let mut items = Vec::new();
        loop {
          self.skip_trivia();
          match self.peek() {
            Some(b')') => { self.advance(); break }
            None => return Err(CoreError::FileError("unterminated list".to_owned())),
            Some(_) => items.push(self.read_node()?),
          }
        }
        Ok(Node::list(items, Span::new(begin, self.position())))
      }
      Some(b')') => Err(CoreError::FileError("unexpected `)`".to_owned())),
      Some(b'"') => self.read_string(begin),
      Some(_) => self.read_atom(begin),
      None => Err(CoreError::FileError("unexpected end of input".to_owned())),
    }
  }

  fn read_string(&mut self, begin: Position) -> Result<Node, CoreError> {
    self.advance();
    let mut s = String::new();
    loop {
      match self.advance() {
        Some(b'"') => break,
        Some(b'\\') => match self.advance() {
          Some(b'n') => s.push('\n'),
          Some(b't') => s.push('\t'),
          Some(b'"') => s.push('"'),
          Some(b'\\') => s.push('\\'),
          Some(other) => s.push(other as char),
          None => return Err(CoreError::FileError("unterminated string escape".to_owned())),
        },
        Some(b) => s.push(b as char),
        None => return Err(CoreError::FileError("unterminated string literal".to_owned())),
      }
    }
    Ok(Node::atom(Token::Str(Rc::from(s.as_str())), Span::new(begin, self.position())))
  }

  fn read_atom(&mut self, begin: Position) -> Result<Node, CoreError> {
    let start = self.pos;
    while let Some(b) = self.peek() {
      if b.is_ascii_whitespace() || b == b'(' || b == b')' || b == b';' { break }
      self.advance();
    }
    let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("source is valid utf8");
    let tok = if let Ok(n) = text.parse::<i64>() {
      Token::Integer(n)
    } else if text.len() > 1 && (text.contains('.') || text.contains('e') || text.contains('E'))
      && text.parse::<f64>().is_ok()
    {
      Token::Float(text.parse().expect("checked parseable above"))
    } else {
      Token::Symbol(intern(text))
    };
    Ok(Node::atom(tok, Span::new(begin, self.position())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_nested_lists_and_atoms() {
    let forms = read_top_forms("(def f (fn extern-c int (void) (return 0)))").unwrap();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].head_symbol(), Some(intern("def")));
  }

  #[test]
  fn reads_strings_with_escapes() {
    let forms = read_top_forms(r#"(include "a\"b.dt")"#).unwrap();
    let items = forms[0].as_list().unwrap();
    assert_eq!(items[1].as_atom(), Some(&Token::Str(Rc::from("a\"b.dt"))));
  }

  #[test]
  fn comments_are_ignored() {
    let forms = read_top_forms("; a comment\n(once TAG) ; trailing\n").unwrap();
    assert_eq!(forms.len(), 1);
  }

  #[test]
  fn multiple_top_forms_in_sequence() {
    let forms = read_top_forms("(once A) (once B)").unwrap();
    assert_eq!(forms.len(), 2);
  }

  #[test]
  fn unterminated_list_is_an_error() {
    assert!(read_top_forms("(def f").is_err());
  }
}
