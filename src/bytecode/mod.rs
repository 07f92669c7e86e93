//! Bytecode backend: a second, independent lowering of the same AST
//! the tree-walker in [`crate::eval`] consumes, targeting a stack-based IR
//! instead of interpreting directly. The VM that would execute this IR is
//! out of scope () - this module only defines the opcode vocabulary, the
//! per-function builder state, and the generator that walks statements and
//! expressions into basic blocks.

pub mod builder;
pub mod codegen;
pub mod opcode;

pub use builder::{FunctionCode, GlobalRegistry, LastEmission};
pub use codegen::Codegen;
pub use opcode::{BlockId, Opcode};
