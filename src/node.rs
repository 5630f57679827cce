//! The AST model (C2): a list-or-atom tree with source positions.
//!
//! The parser itself is out of scope (spec.md §1); this module defines
//! the `Node` shape the parser is assumed to hand the rest of the
//! compiler, plus the `DNode` C-ABI view macros receive (spec.md §4.7,
//! §6 "ABI to macros").

use std::rc::Rc;
use crate::span::{NodePos, Position, Span};
use crate::symbol::Symbol;

/// A leaf token: the atomic values the parser can produce.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
  Symbol(Symbol),
  Integer(i64),
  Float(f64),
  Str(Rc<str>),
}

impl Token {
  /// The textual form of this token, used both for diagnostics and for
  /// `DNode::token_str` (spec.md §6: "null when list").
  #[must_use] pub fn as_text(&self) -> String {
    match self {
      Token::Symbol(s) => s.to_string(),
      Token::Integer(n) => n.to_string(),
      Token::Float(f) => f.to_string(),
      Token::Str(s) => s.to_string(),
    }
  }
}

/// An AST node: either an atom (a token) or a list owning its children.
/// (spec.md §3 "Node (C2)": "Lists own their children".)
#[derive(Clone, Debug)]
pub enum Node {
  Atom(Token, NodePos),
  List(Vec<Node>, NodePos),
}

impl Node {
  #[must_use] pub fn atom(tok: Token, span: Span) -> Self { Node::Atom(tok, NodePos::new(span)) }
  #[must_use] pub fn list(children: Vec<Node>, span: Span) -> Self { Node::List(children, NodePos::new(span)) }

  #[must_use] pub fn pos(&self) -> &NodePos {
    match self { Node::Atom(_, p) | Node::List(_, p) => p }
  }

  #[must_use] pub fn pos_mut(&mut self) -> &mut NodePos {
    match self { Node::Atom(_, p) | Node::List(_, p) => p }
  }

  #[must_use] pub fn is_list(&self) -> bool { matches!(self, Node::List(..)) }

  #[must_use] pub fn as_list(&self) -> Option<&[Node]> {
    if let Node::List(xs, _) = self { Some(xs) } else { None }
  }

  #[must_use] pub fn as_atom(&self) -> Option<&Token> {
    if let Node::Atom(t, _) = self { Some(t) } else { None }
  }

  /// The head symbol of a list node, e.g. `def` in `(def f ...)`, used
  /// pervasively by the form dispatcher (spec.md §4.4).
  #[must_use] pub fn head_symbol(&self) -> Option<Symbol> {
    match self {
      Node::List(xs, _) => match xs.first()?.as_atom()? {
        Token::Symbol(s) => Some(*s),
        _ => None,
      }
      Node::Atom(..) => None,
    }
  }

  /// Recursively stamp `origin` as the macro-origin position of this node
  /// and every node it owns (spec.md §4.7, step labelled "Macro-origin
  /// positions": "Every Node reachable from the returned DNode").
  pub fn stamp_macro_origin(&mut self, origin: Span) {
    self.pos_mut().set_macro_origin(origin);
    if let Node::List(xs, _) = self {
      for x in xs { x.stamp_macro_origin(origin); }
    }
  }
}

/// The C-ABI view of a [`Node`] exposed to macros (spec.md §6 "ABI to
/// macros"). A `DNode` is a linked structure: `list_node` is the first
/// child and subsequent children are reached by walking `next_node`,
/// matching a C `struct DNode *` intrusive list rather than a Rust slice,
/// because that is the shape the FFI boundary actually has to cross.
#[derive(Clone, Debug)]
pub struct DNode {
  pub is_list: bool,
  pub token_str: Option<Rc<str>>,
  pub list_node: Option<Box<DNode>>,
  pub next_node: Option<Box<DNode>>,
  pub begin: Position,
  pub end: Position,
  pub macro_begin: Position,
  pub macro_end: Position,
  pub filename: Rc<str>,
}

/// Convert a [`Node`] tree into its `DNode` C-ABI view, preserving both
/// position pairs.
#[must_use] pub fn node_to_dnode(n: &Node, filename: &Rc<str>) -> DNode {
  let pos = n.pos();
  let reported = pos.macro_origin.unwrap_or(pos.text);
  match n {
    Node::Atom(tok, _) => DNode {
      is_list: false,
      token_str: Some(Rc::from(tok.as_text())),
      list_node: None,
      next_node: None,
      begin: pos.text.begin,
      end: pos.text.end,
      macro_begin: reported.begin,
      macro_end: reported.end,
      filename: filename.clone(),
    },
    Node::List(children, _) => {
      let mut head = None;
      for child in children.iter().rev() {
        let mut d = node_to_dnode(child, filename);
        d.next_node = head.take();
        head = Some(Box::new(d));
      }
      DNode {
        is_list: true,
        token_str: None,
        list_node: head,
        next_node: None,
        begin: pos.text.begin,
        end: pos.text.end,
        macro_begin: reported.begin,
        macro_end: reported.end,
        filename: filename.clone(),
      }
    }
  }
}

/// Error produced while converting a `DNode` returned by a macro back
/// into a [`Node`] (spec.md §7 `dnode-has-no-string`,
/// `dnode-is-neither-token-nor-list`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DNodeError {
  HasNoString,
  NeitherTokenNorList,
}

/// Convert a `DNode` (as returned by a JIT-compiled macro) back into a
/// [`Node`], stamping the macro's call-site span as the macro-origin
/// position on every node produced (spec.md §4.7). This is the
/// conversion the "macro splice round-trip" testable property (spec.md
/// §8) quantifies over.
pub fn dnode_to_node(d: &DNode, call_site: Span, intern: &mut dyn FnMut(&str) -> Symbol)
  -> Result<Node, DNodeError>
{
  let text = Span::new(d.begin, d.end);
  let mut pos = NodePos::new(text);
  pos.set_macro_origin(call_site);
  if d.is_list {
    let mut children = Vec::new();
    let mut cur = d.list_node.as_deref();
    while let Some(c) = cur {
      children.push(dnode_to_node(c, call_site, intern)?);
      cur = c.next_node.as_deref();
    }
    Ok(Node::List(children, pos))
  } else {
    let s = d.token_str.as_ref().ok_or(DNodeError::HasNoString)?;
    let tok = parse_atom_token(s, intern);
    Ok(Node::Atom(tok, pos))
  }
}

/// Classify a raw atom string into the most specific [`Token`] variant,
/// used both by the parser's atom production and by `dnode_to_node`.
fn parse_atom_token(s: &str, intern: &mut dyn FnMut(&str) -> Symbol) -> Token {
  if let Ok(n) = s.parse::<i64>() { return Token::Integer(n) }
  if let Ok(f) = s.parse::<f64>() {
    if s.contains('.') || s.contains('e') || s.contains('E') { return Token::Float(f) }
  }
  if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
    return Token::Str(Rc::from(&s[1..s.len() - 1]))
  }
  Token::Symbol(intern(s))
}
