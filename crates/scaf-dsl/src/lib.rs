#![doc = include_str!("../README.md")]

pub mod ast;
pub mod dialect;
pub mod errors;
pub mod lexer;
pub mod parser;

pub use dialect::{analyzer_for, CypherAnalyzer, QueryAnalyzer, QueryMetadata};
pub use errors::ParseError;
pub use lexer::{tokenize, Keyword, Token, TokenKind};
pub use parser::{parse, parse_with_recovery, ParseOutput};

/// Standard extension of scaf source files.
pub const FILE_EXTENSION: &str = "scaf";
