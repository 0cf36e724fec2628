//! The beat-code compiler.
//!
//! Pipeline: [`parser::strip_comments`] → [`parser::parse`] →
//! [`compile::compile`] (reference resolution, group expansion, cell
//! evaluation). [`expr`] is the shared duration-expression evaluator; its
//! [`expr::simplify`] is also the canonicalizer editors use to normalize
//! pattern text.

pub mod ast;
pub mod compile;
pub mod error;
pub mod expr;
pub mod parser;

pub use compile::{compile, CompiledLayer, RefContext};
pub use error::{CompileError, ErrorKind};
