//! Core value model, scope/extension machinery, expression evaluator, and
//! dual-mode bytecode generator for the Covariant Script language.
//!
//! This crate is the language *core*: the dynamic [`value::Value`] type, the
//! lexical [`domain::DomainManager`] scope stack, the [`extension`] registry
//! member/arrow dispatch goes through, a tree-walking [`eval::Evaluator`],
//! the single-pass AST [`optimizer`], and a [`bytecode`] generator that
//! lowers the same AST to a stack-based IR. The lexer/parser that produces
//! the AST, the VM that would execute the bytecode, and a CLI/REPL around
//! either backend are all out of scope - this crate only fixes the surface
//! between them.

pub mod ast;
pub mod bytecode;
pub mod domain;
pub mod error;
pub mod eval;
pub mod ext;
pub mod optimizer;
pub mod resource;
pub mod statement;
pub mod trace;
pub mod value;

pub use error::{CsError, CsResult, LookupScope, RunResult, RuntimeError};
pub use eval::Evaluator;
pub use value::Value;
