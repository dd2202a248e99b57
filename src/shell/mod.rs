//! Shell command text handling: tokenizing and path translation.

pub mod lexer;
pub mod translate;

pub use lexer::{Segment, Token, TokenKind, segments, tokenize};
pub use translate::{Direction, PathTranslator};
