//! The opcode vocabulary the generator emits (/). A basic block is an
//! ordered instruction list terminated by `Return`, `Branch`, or
//! `ConditionalBranch`; the VM that executes these is out of scope () - this
//! enum only fixes the surface the two sides agree on, serialized bit-exact
//! on opcode name per the external VM's `ToJson` contract.
//!
//! **Stack convention** (a generator-side choice, since the VM itself is
//! unspecified): `Get*`/`Load*` push a value; `Set*` pop their addressing
//! operands *and* the value to store, pushing nothing back. Where an
//! assignment needs to surface the stored value as its own expression result
//! (`=` "return lhs"), the generator `Dup`s before the store rather than
//! relying on `Set*` to re-push.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type BlockId = usize;

/// One IR instruction. Variant names match the opcode vocabulary in
/// verbatim; `#[serde(tag = "op")]` makes that name the wire discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Opcode {
    LoadInt { value: i64 },
    LoadFloat { value: f64 },
    LoadBool { value: bool },
    LoadString { value: String },
    LoadNull,
    /// Pushes the enclosing closure/scope frame object ("Identifier emission").
    LoadThis,

    GetLocal { id: u32 },
    SetLocal { id: u32 },
    /// Reserves `count` local slots; the first instruction of every prologue block.
    InitLocal { count: u32 },

    /// Pops `key`, `obj`; pushes `obj[key]` (field/member read).
    GetField,
    /// Pops `key`, `obj`, `value`; stores `obj[key] = value`. Pushes nothing.
    SetField,
    /// Pops `index`, `obj`; pushes the element. A post-pass lowers this into a
    /// `CallField` on `__get__` ("GetArrayElement, SetArrayElement").
    GetArrayElement,
    /// Pops `index`, `obj`, `value`; stores the element. Pushes nothing.
    /// Lowered the same way, onto `__set__`.
    SetArrayElement,

    GetArgument { index: u32 },

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    /// Fast-path integer add/sub, chosen by the generator when both operand
    /// types are known to be integers at compile time (mirrors `binary_arith`'s
    /// `both_int` branch in the tree-walker).
    IntAdd,
    IntSub,

    TestEq,
    TestNe,
    TestLt,
    TestLe,
    TestGt,
    TestGe,

    And,
    Or,
    Not,
    /// Pops a value, pushes its boolean coercion; used ahead of
    /// `ConditionalBranch`, which always consumes a `Bool`.
    CastToBool,
    /// Pops a value, pushes its `typeid` (an int). Structural, not
    /// extension-dispatched, so it gets its own opcode rather than a
    /// `CallField` on a method no type is required to implement.
    TypeId,
    /// Pops a pointer, pushes the pointee (unary `*`). `Unsupported` at
    /// runtime on a null pointer, same as the tree-walker.
    Dereference,

    Dup,
    Pop,
    /// Swaps the top two stack elements.
    Rotate2,
    /// Cyclically rotates the top three stack elements so the element three
    /// from the top becomes the new top (`[a, b, c] -> [b, c, a]`, `c` was top).
    Rotate3,
    /// Reverses the order of the top `count` stack elements.
    RotateReverse { count: u32 },

    /// Pops `argc` arguments (left-to-right push order, so the last arg is on
    /// top), then the callee; pushes the result.
    Call { argc: u32 },
    /// Pops `argc` arguments, then `key`, then `obj`; calls `obj[key](args)`
    /// and pushes the result ("Arrays / maps" `push_back` calls).
    CallField { argc: u32 },
    /// Pops the return value and exits the function.
    Return,

    Branch { target: BlockId },
    /// Pops a bool; branches to `then_block` if true, `else_block` otherwise.
    ConditionalBranch { then_block: BlockId, else_block: BlockId },
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `serde`'s tag name is the canonical spelling ("bit-exact on opcode names").
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => {
                write!(f, "{}", map.get("op").and_then(|v| v.as_str()).unwrap_or("?"))
            }
            _ => write!(f, "?"),
        }
    }
}

impl Opcode {
    /// Whether this opcode unconditionally ends its basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Return | Opcode::Branch { .. } | Opcode::ConditionalBranch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_json_tag_matches_variant_name() {
        let json = serde_json::to_string(&Opcode::GetLocal { id: 3 }).unwrap();
        assert_eq!(json, r#"{"op":"GetLocal","id":3}"#);
    }

    #[test]
    fn load_null_has_no_payload_fields() {
        let json = serde_json::to_string(&Opcode::LoadNull).unwrap();
        assert_eq!(json, r#"{"op":"LoadNull"}"#);
    }
}
